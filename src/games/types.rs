use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Monotonically increasing round number
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct RoundId(pub u64);

impl RoundId {
    pub fn next(self) -> Self {
        RoundId(self.0 + 1)
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Player identity as issued by the account collaborator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct PlayerId(pub i64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct WagerId(pub Uuid);

impl WagerId {
    pub fn new() -> Self {
        WagerId(Uuid::new_v4())
    }

    /// Ledger reason key for the stake debit
    pub fn stake_key(&self) -> String {
        format!("{}:stake", self.0)
    }

    /// Ledger reason key for the payout credit
    pub fn payout_key(&self) -> String {
        format!("{}:payout", self.0)
    }
}

impl Default for WagerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Round phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Betting,
    Flying,
    Crashed,
}

impl Phase {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Phase::Betting => 0,
            Phase::Flying => 1,
            Phase::Crashed => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Betting,
            1 => Phase::Flying,
            _ => Phase::Crashed,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Betting => write!(f, "betting"),
            Phase::Flying => write!(f, "flying"),
            Phase::Crashed => write!(f, "crashed"),
        }
    }
}

/// Wager outcome. Leaves `Pending` exactly once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WagerStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "won")]
    CashedOut,
    #[serde(rename = "lost")]
    Lost,
    /// Round aborted by the operator, stake returned
    #[serde(rename = "refunded")]
    Refunded,
}

impl WagerStatus {
    pub fn is_settled(self) -> bool {
        !matches!(self, WagerStatus::Pending)
    }
}

/// A live wager inside the bet registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wager {
    pub id: WagerId,
    pub round_id: RoundId,
    pub player_id: PlayerId,
    /// 1-based placement order within the round
    pub bet_number: u32,
    pub stake: f64,
    pub auto_cashout: Option<f64>,
    pub placed_at: DateTime<Utc>,
    pub status: WagerStatus,
    pub cashout_multiplier: Option<f64>,
    pub payout: f64,
    /// Cashed out by the threshold sweep rather than a player message
    pub auto: bool,
    /// Payout has been credited through the ledger
    pub credited: bool,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Wager {
    pub fn new(
        round_id: RoundId,
        player_id: PlayerId,
        bet_number: u32,
        stake: f64,
        auto_cashout: Option<f64>,
    ) -> Self {
        Self {
            id: WagerId::new(),
            round_id,
            player_id,
            bet_number,
            stake,
            auto_cashout,
            placed_at: Utc::now(),
            status: WagerStatus::Pending,
            cashout_multiplier: None,
            payout: 0.0,
            auto: false,
            credited: false,
            ended_at: None,
        }
    }

    /// Payout owed but not yet credited
    pub fn needs_credit(&self) -> bool {
        self.payout > 0.0 && !self.credited
    }
}

/// Frozen bet registry handed to settlement
#[derive(Debug, Clone)]
pub struct RoundSnapshot {
    pub round_id: RoundId,
    pub wagers: Vec<Wager>,
    pub aborted: bool,
}

impl RoundSnapshot {
    pub fn total_staked(&self) -> f64 {
        round_amount(self.wagers.iter().map(|w| w.stake).sum())
    }

    pub fn total_paid_out(&self) -> f64 {
        round_amount(self.wagers.iter().map(|w| w.payout).sum())
    }
}

/// VRF proof bundle for a provably fair crash point
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FairnessProof {
    /// Input message signed by the server key
    pub input_message: String,
    /// Hex-encoded VRF output (32 bytes)
    pub vrf_output: String,
    /// Hex-encoded schnorrkel signature
    pub vrf_proof: String,
    /// Hex-encoded public key (32 bytes)
    pub public_key: String,
}

/// Immutable per-wager settlement record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WagerRecord {
    pub id: WagerId,
    pub round_id: RoundId,
    pub bet_number: u32,
    pub player_id: PlayerId,
    pub amount: f64,
    /// Terminal multiplier of the round
    pub coefficient: f64,
    pub cashout_multiplier: Option<f64>,
    pub auto_cashout: Option<f64>,
    pub win_amount: f64,
    pub status: WagerStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl WagerRecord {
    pub fn from_wager(wager: &Wager, coefficient: f64, ended_at: DateTime<Utc>) -> Self {
        Self {
            id: wager.id,
            round_id: wager.round_id,
            bet_number: wager.bet_number,
            player_id: wager.player_id,
            amount: wager.stake,
            coefficient,
            cashout_multiplier: wager.cashout_multiplier,
            auto_cashout: wager.auto_cashout,
            win_amount: wager.payout,
            status: wager.status,
            created_at: wager.placed_at,
            ended_at: wager.ended_at.unwrap_or(ended_at),
        }
    }
}

/// Immutable round result record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundRecord {
    pub round_id: RoundId,
    pub multiplier: f64,
    pub crashed_at: f64,
    pub total_players: u32,
    pub total_bet: f64,
    pub total_payout: f64,
    pub aborted: bool,
    pub started_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fairness: Option<FairnessProof>,
}

/// Public view of the round in progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundView {
    pub game_id: RoundId,
    pub phase: Phase,
    pub multiplier: f64,
    pub time_remaining: u64,
    pub players: u32,
    pub total_wagered: f64,
    /// Only revealed once the round has crashed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash_point: Option<f64>,
    pub halted: bool,
}

/// Round a currency amount to cents
pub fn round_amount(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Floor a multiplier to two decimals, tolerating float noise just below a cent
pub fn floor_multiplier(value: f64) -> f64 {
    ((value * 100.0) + 1e-9).floor() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_rounding() {
        assert_eq!(round_amount(10.0 * 2.0), 20.0);
        assert_eq!(round_amount(0.1 + 0.2), 0.3);
        assert_eq!(round_amount(3.14159), 3.14);
    }

    #[test]
    fn test_multiplier_floor() {
        assert_eq!(floor_multiplier(1.999), 1.99);
        assert_eq!(floor_multiplier(2.0), 2.0);
        // 1.15 * 100 = 114.99999999999999
        assert_eq!(floor_multiplier(1.15), 1.15);
    }

    #[test]
    fn test_wager_status_serialization() {
        assert_eq!(
            serde_json::to_string(&WagerStatus::CashedOut).unwrap(),
            "\"won\""
        );
        assert_eq!(
            serde_json::to_string(&WagerStatus::Refunded).unwrap(),
            "\"refunded\""
        );
        assert!(!WagerStatus::Pending.is_settled());
        assert!(WagerStatus::Lost.is_settled());
    }

    #[test]
    fn test_phase_roundtrip_through_flag() {
        for phase in [Phase::Betting, Phase::Flying, Phase::Crashed] {
            assert_eq!(Phase::from_u8(phase.as_u8()), phase);
        }
        assert_eq!(Phase::Flying.to_string(), "flying");
    }

    #[test]
    fn test_reason_keys() {
        let id = WagerId::new();
        assert!(id.stake_key().ends_with(":stake"));
        assert!(id.payout_key().ends_with(":payout"));
        assert_ne!(id.stake_key(), id.payout_key());
    }
}
