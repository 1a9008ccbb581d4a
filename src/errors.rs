//! Error types for the crash wagering engine
//!
//! One root error wraps the per-concern enums so service code can use `?` across
//! component boundaries while callers still match on the precise failure.

use crate::games::types::{Phase, PlayerId, RoundId};
use thiserror::Error;

/// Root error type for all engine operations
#[derive(Debug, Error)]
pub enum CrashError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Bet error: {0}")]
    Bet(#[from] BetError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),
}

/// Configuration and validation errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// Rejections of player actions against the bet registry.
///
/// All of these are recovered locally: the action is refused with an
/// acknowledgement event and the round keeps running.
#[derive(Debug, Error)]
pub enum BetError {
    #[error("Action not allowed during {actual} phase (requires {expected})")]
    Phase { expected: Phase, actual: Phase },

    #[error("Player {0} already has an active bet this round")]
    DuplicateBet(PlayerId),

    #[error("Player {0} has no active bet this round")]
    NoActiveBet(PlayerId),

    #[error("Bet for player {0} is already settled")]
    AlreadySettled(PlayerId),

    #[error("Insufficient balance for player {player}: stake {stake}")]
    InsufficientBalance { player: PlayerId, stake: f64 },

    #[error("Invalid bet: {0}")]
    InvalidBet(String),

    #[error("Ledger unavailable: {0}")]
    Ledger(String),
}

impl BetError {
    /// Stable machine-readable code used in acknowledgement events
    pub fn code(&self) -> &'static str {
        match self {
            BetError::Phase { .. } => "phase_error",
            BetError::DuplicateBet(_) => "duplicate_bet",
            BetError::NoActiveBet(_) => "no_active_bet",
            BetError::AlreadySettled(_) => "already_settled",
            BetError::InsufficientBalance { .. } => "insufficient_balance",
            BetError::InvalidBet(_) => "invalid_bet",
            BetError::Ledger(_) => "ledger_unavailable",
        }
    }
}

/// Errors reported by the external balance ledger
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: f64, requested: f64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

/// Persistence errors from the round/wager store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database open failed: {0}")]
    DatabaseOpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),
}

/// Settlement failures. `Exhausted` is fatal and halts new rounds.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("Settlement of round {round_id} exhausted {attempts} attempts at {step}: {reason}")]
    Exhausted {
        round_id: RoundId,
        step: String,
        attempts: u32,
        reason: String,
    },

    #[error("No halted settlement to resume")]
    NotHalted,
}

/// Failures pushing a message to one connection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Send queue full")]
    QueueFull,

    #[error("Unknown connection")]
    UnknownConnection,
}

/// Payment notification failures
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Invalid payment notification: {0}")]
    InvalidNotification(String),

    #[error("Payment log unavailable: {0}")]
    Log(#[from] StoreError),

    #[error("Credit failed: {0}")]
    Credit(#[from] LedgerError),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::WriteFailed(e.to_string())
    }
}

impl From<rocksdb::Error> for CrashError {
    fn from(e: rocksdb::Error) -> Self {
        CrashError::Store(e.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::CorruptedData(e.to_string())
    }
}

impl From<std::io::Error> for CrashError {
    fn from(e: std::io::Error) -> Self {
        CrashError::Configuration(ConfigurationError::LoadFailed(e.to_string()))
    }
}

// Convenience type alias for Results
pub type CrashResult<T> = Result<T, CrashError>;
