//! Balance ledger collaborator
//!
//! The engine never caches balances. Every stake and payout is a call through
//! [`Ledger`], keyed by a reason string so retried calls apply at most once.

use crate::errors::LedgerError;
use crate::games::types::{round_amount, PlayerId, WagerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// External balance service
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn balance(&self, player: PlayerId, currency: &str) -> Result<f64, LedgerError>;

    /// Atomic check-and-debit. Fails with `InsufficientBalance` without mutating.
    async fn debit(
        &self,
        player: PlayerId,
        currency: &str,
        amount: f64,
        reason_key: &str,
    ) -> Result<(), LedgerError>;

    /// Idempotent per `reason_key`
    async fn credit(
        &self,
        player: PlayerId,
        currency: &str,
        amount: f64,
        reason_key: &str,
    ) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementKind {
    Debit,
    Credit,
}

/// One applied balance mutation
#[derive(Debug, Clone, Serialize)]
pub struct LedgerMovement {
    pub player: PlayerId,
    pub currency: String,
    pub amount: f64,
    pub kind: MovementKind,
    pub reason_key: String,
    pub applied_at: DateTime<Utc>,
}

/// In-process ledger for development and tests
#[derive(Default)]
pub struct InMemoryLedger {
    balances: DashMap<(PlayerId, String), f64>,
    applied: DashMap<String, LedgerMovement>,
    journal: Mutex<Vec<LedgerMovement>>,
    failing_credits: AtomicU32,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a balance directly (account provisioning)
    pub fn set_balance(&self, player: PlayerId, currency: &str, amount: f64) {
        self.balances
            .insert((player, currency.to_string()), round_amount(amount));
    }

    /// Make the next `n` credit calls fail with `Unavailable`
    pub fn fail_next_credits(&self, n: u32) {
        self.failing_credits.store(n, Ordering::SeqCst);
    }

    /// Every applied mutation in order
    pub fn journal(&self) -> Vec<LedgerMovement> {
        self.journal
            .lock()
            .map(|journal| journal.clone())
            .unwrap_or_default()
    }

    /// Movements whose reason keys belong to the given wagers
    pub fn movements_for_round(
        &self,
        wagers: impl IntoIterator<Item = WagerId>,
    ) -> Vec<LedgerMovement> {
        let ids: HashSet<String> = wagers.into_iter().map(|id| id.0.to_string()).collect();
        self.journal()
            .into_iter()
            .filter(|m| {
                m.reason_key
                    .split(':')
                    .next()
                    .map(|id| ids.contains(id))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Number of applied movements carrying this reason key (0 or 1)
    pub fn applied_count(&self, reason_key: &str) -> usize {
        usize::from(self.applied.contains_key(reason_key))
    }

    fn record(&self, movement: LedgerMovement) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(movement);
        }
    }

    fn movement(
        player: PlayerId,
        currency: &str,
        amount: f64,
        kind: MovementKind,
        reason_key: &str,
    ) -> LedgerMovement {
        LedgerMovement {
            player,
            currency: currency.to_string(),
            amount,
            kind,
            reason_key: reason_key.to_string(),
            applied_at: Utc::now(),
        }
    }
}

fn check_amount(amount: f64) -> Result<f64, LedgerError> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(round_amount(amount))
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn balance(&self, player: PlayerId, currency: &str) -> Result<f64, LedgerError> {
        Ok(self
            .balances
            .get(&(player, currency.to_string()))
            .map(|b| *b)
            .unwrap_or(0.0))
    }

    async fn debit(
        &self,
        player: PlayerId,
        currency: &str,
        amount: f64,
        reason_key: &str,
    ) -> Result<(), LedgerError> {
        let amount = check_amount(amount)?;

        // Lock order: reason key, then balance
        let slot = match self.applied.entry(reason_key.to_string()) {
            Entry::Occupied(_) => return Ok(()),
            Entry::Vacant(slot) => slot,
        };

        {
            let mut balance = self
                .balances
                .entry((player, currency.to_string()))
                .or_insert(0.0);
            if *balance + 1e-9 < amount {
                return Err(LedgerError::InsufficientBalance {
                    available: *balance,
                    requested: amount,
                });
            }
            *balance = round_amount(*balance - amount);
        }

        let movement = Self::movement(player, currency, amount, MovementKind::Debit, reason_key);
        slot.insert(movement.clone());
        self.record(movement);
        Ok(())
    }

    async fn credit(
        &self,
        player: PlayerId,
        currency: &str,
        amount: f64,
        reason_key: &str,
    ) -> Result<(), LedgerError> {
        let amount = check_amount(amount)?;

        if self
            .failing_credits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LedgerError::Unavailable("injected credit failure".to_string()));
        }

        let slot = match self.applied.entry(reason_key.to_string()) {
            Entry::Occupied(_) => return Ok(()),
            Entry::Vacant(slot) => slot,
        };

        {
            let mut balance = self
                .balances
                .entry((player, currency.to_string()))
                .or_insert(0.0);
            *balance = round_amount(*balance + amount);
        }

        let movement = Self::movement(player, currency, amount, MovementKind::Credit, reason_key);
        slot.insert(movement.clone());
        self.record(movement);
        Ok(())
    }
}
