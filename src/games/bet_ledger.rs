//! Round-scoped registry of wagers
//!
//! Every player owns one slot guarded by an async mutex, so operations for the
//! same player are serialized while different players proceed in parallel. An
//! atomic phase flag is checked after the slot lock is taken. Phase changes
//! store the new phase first and then lock every slot once, which waits out any
//! operation that passed the check under the old phase.

use crate::errors::{BetError, LedgerError};
use crate::games::types::{
    round_amount, Phase, PlayerId, RoundId, RoundSnapshot, Wager, WagerStatus,
};
use crate::ledger::Ledger;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

type Slot = Arc<Mutex<Option<Wager>>>;

/// Stake and threshold bounds applied on placement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BetLimits {
    pub min_bet: f64,
    pub max_bet: f64,
    pub min_auto_cashout: f64,
    pub max_multiplier: f64,
}

impl Default for BetLimits {
    fn default() -> Self {
        Self {
            min_bet: 1.0,
            max_bet: 100_000.0,
            min_auto_cashout: 1.01,
            max_multiplier: 1000.0,
        }
    }
}

/// How still-pending wagers are resolved when the round closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Lose,
    Refund,
}

pub struct BetLedger {
    round_id: RoundId,
    phase: AtomicU8,
    slots: DashMap<PlayerId, Slot>,
    // Pending auto cash-out thresholds, checked on every tick
    auto_thresholds: DashMap<PlayerId, f64>,
    bet_counter: AtomicU32,
    players: AtomicU32,
    wagered_cents: AtomicU64,
    ledger: Arc<dyn Ledger>,
    currency: String,
    limits: BetLimits,
}

impl BetLedger {
    /// Fresh registry in the Betting phase
    pub fn new(
        round_id: RoundId,
        ledger: Arc<dyn Ledger>,
        currency: impl Into<String>,
        limits: BetLimits,
    ) -> Self {
        Self {
            round_id,
            phase: AtomicU8::new(Phase::Betting.as_u8()),
            slots: DashMap::new(),
            auto_thresholds: DashMap::new(),
            bet_counter: AtomicU32::new(0),
            players: AtomicU32::new(0),
            wagered_cents: AtomicU64::new(0),
            ledger,
            currency: currency.into(),
            limits,
        }
    }

    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn player_count(&self) -> u32 {
        self.players.load(Ordering::SeqCst)
    }

    pub fn total_wagered(&self) -> f64 {
        self.wagered_cents.load(Ordering::SeqCst) as f64 / 100.0
    }

    fn require(&self, expected: Phase) -> Result<(), BetError> {
        let actual = self.phase();
        if actual != expected {
            return Err(BetError::Phase { expected, actual });
        }
        Ok(())
    }

    fn slot(&self, player: PlayerId) -> Slot {
        self.slots
            .entry(player)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn validate(&self, stake: f64, auto_cashout: Option<f64>) -> Result<f64, BetError> {
        if !stake.is_finite() || stake < self.limits.min_bet || stake > self.limits.max_bet {
            return Err(BetError::InvalidBet(format!(
                "stake must be between {} and {}",
                self.limits.min_bet, self.limits.max_bet
            )));
        }
        if let Some(threshold) = auto_cashout {
            if !threshold.is_finite()
                || threshold < self.limits.min_auto_cashout
                || threshold > self.limits.max_multiplier
            {
                return Err(BetError::InvalidBet(format!(
                    "auto cash-out must be between {} and {}",
                    self.limits.min_auto_cashout, self.limits.max_multiplier
                )));
            }
        }
        Ok(round_amount(stake))
    }

    /// Place a wager for the Betting phase, debiting the stake
    pub async fn place(
        &self,
        player: PlayerId,
        stake: f64,
        auto_cashout: Option<f64>,
    ) -> Result<Wager, BetError> {
        self.require(Phase::Betting)?;
        let stake = self.validate(stake, auto_cashout)?;

        let slot = self.slot(player);
        let mut guard = slot.lock().await;
        self.require(Phase::Betting)?;

        // Affordability first, so a repeated request that the balance cannot
        // cover reports the balance rather than the duplicate
        let balance = self
            .ledger
            .balance(player, &self.currency)
            .await
            .map_err(|e| BetError::Ledger(e.to_string()))?;
        if balance + 1e-9 < stake {
            return Err(BetError::InsufficientBalance { player, stake });
        }
        if guard.is_some() {
            return Err(BetError::DuplicateBet(player));
        }

        let mut wager = Wager::new(self.round_id, player, 0, stake, auto_cashout);
        self.ledger
            .debit(player, &self.currency, stake, &wager.id.stake_key())
            .await
            .map_err(|e| match e {
                LedgerError::InsufficientBalance { .. } => {
                    BetError::InsufficientBalance { player, stake }
                }
                other => BetError::Ledger(other.to_string()),
            })?;

        wager.bet_number = self.bet_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.players.fetch_add(1, Ordering::SeqCst);
        self.wagered_cents
            .fetch_add((stake * 100.0).round() as u64, Ordering::SeqCst);
        if let Some(threshold) = auto_cashout {
            self.auto_thresholds.insert(player, threshold);
        }

        debug!(
            round_id = %self.round_id,
            player_id = %player,
            wager_id = %wager.id,
            stake,
            "Wager placed"
        );
        *guard = Some(wager.clone());
        Ok(wager)
    }

    /// Cash out at the engine's current multiplier
    pub async fn cash_out(&self, player: PlayerId, multiplier: f64) -> Result<Wager, BetError> {
        let Some(slot) = self.slots.get(&player).map(|s| s.clone()) else {
            self.require(Phase::Flying)?;
            return Err(BetError::NoActiveBet(player));
        };

        let mut guard = slot.lock().await;
        self.require(Phase::Flying)?;
        let wager = guard.as_mut().ok_or(BetError::NoActiveBet(player))?;
        if wager.status.is_settled() {
            return Err(BetError::AlreadySettled(player));
        }

        self.settle_cash_out(wager, multiplier, false).await;
        Ok(wager.clone())
    }

    /// Cash out every pending wager whose threshold is at or below `multiplier`.
    ///
    /// Wagers pay at their own threshold. Returns the wagers cashed out.
    pub async fn auto_cashout_sweep(&self, multiplier: f64) -> Vec<Wager> {
        let due: Vec<(PlayerId, f64)> = self
            .auto_thresholds
            .iter()
            .filter(|entry| *entry.value() <= multiplier + 1e-9)
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        let mut cashed = Vec::with_capacity(due.len());
        for (player, threshold) in due {
            self.auto_thresholds.remove(&player);
            let Some(slot) = self.slots.get(&player).map(|s| s.clone()) else {
                continue;
            };
            let mut guard = slot.lock().await;
            if self.phase() != Phase::Flying {
                break;
            }
            let Some(wager) = guard.as_mut() else {
                continue;
            };
            if wager.status.is_settled() {
                continue;
            }
            self.settle_cash_out(wager, threshold, true).await;
            cashed.push(wager.clone());
        }
        cashed
    }

    async fn settle_cash_out(&self, wager: &mut Wager, multiplier: f64, auto: bool) {
        wager.status = WagerStatus::CashedOut;
        wager.cashout_multiplier = Some(multiplier);
        wager.payout = round_amount(wager.stake * multiplier);
        wager.auto = auto;
        wager.ended_at = Some(Utc::now());
        self.auto_thresholds.remove(&wager.player_id);

        match self
            .ledger
            .credit(
                wager.player_id,
                &self.currency,
                wager.payout,
                &wager.id.payout_key(),
            )
            .await
        {
            Ok(()) => wager.credited = true,
            Err(e) => warn!(
                round_id = %self.round_id,
                wager_id = %wager.id,
                error = %e,
                "Cash-out credit failed, deferring to settlement"
            ),
        }

        debug!(
            round_id = %self.round_id,
            player_id = %wager.player_id,
            multiplier,
            payout = wager.payout,
            auto,
            "Wager cashed out"
        );
    }

    /// Stop accepting bets and start accepting cash-outs
    pub async fn open_flight(&self) -> Result<(), BetError> {
        self.phase
            .compare_exchange(
                Phase::Betting.as_u8(),
                Phase::Flying.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|actual| BetError::Phase {
                expected: Phase::Betting,
                actual: Phase::from_u8(actual),
            })?;
        self.drain_in_flight().await;
        Ok(())
    }

    /// Freeze the registry; pending wagers are lost
    pub async fn close_round(&self) -> Result<RoundSnapshot, BetError> {
        self.close(Resolution::Lose).await
    }

    /// Freeze the registry; pending wagers are refunded their stake
    pub async fn close_round_with_refunds(&self) -> Result<RoundSnapshot, BetError> {
        self.close(Resolution::Refund).await
    }

    async fn close(&self, resolution: Resolution) -> Result<RoundSnapshot, BetError> {
        let previous = Phase::from_u8(self.phase.swap(Phase::Crashed.as_u8(), Ordering::SeqCst));
        if previous == Phase::Crashed {
            return Err(BetError::Phase {
                expected: Phase::Flying,
                actual: Phase::Crashed,
            });
        }
        self.auto_thresholds.clear();

        let now = Utc::now();
        let mut wagers = Vec::with_capacity(self.slots.len());
        for slot in self.all_slots() {
            let mut guard = slot.lock().await;
            let Some(wager) = guard.as_mut() else {
                continue;
            };
            if wager.status == WagerStatus::Pending {
                match resolution {
                    Resolution::Lose => {
                        wager.status = WagerStatus::Lost;
                        wager.payout = 0.0;
                    }
                    Resolution::Refund => {
                        wager.status = WagerStatus::Refunded;
                        wager.payout = wager.stake;
                    }
                }
                wager.ended_at = Some(now);
            }
            wagers.push(wager.clone());
        }
        wagers.sort_by_key(|w| w.bet_number);

        Ok(RoundSnapshot {
            round_id: self.round_id,
            wagers,
            aborted: resolution == Resolution::Refund,
        })
    }

    /// Current state of one player's wager
    pub async fn wager(&self, player: PlayerId) -> Option<Wager> {
        let slot = self.slots.get(&player).map(|s| s.clone())?;
        let guard = slot.lock().await;
        guard.clone()
    }

    fn all_slots(&self) -> Vec<Slot> {
        self.slots.iter().map(|entry| entry.value().clone()).collect()
    }

    async fn drain_in_flight(&self) {
        for slot in self.all_slots() {
            drop(slot.lock().await);
        }
    }
}
