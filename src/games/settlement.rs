//! Round settlement
//!
//! Settlement turns a closed bet registry into immutable records. Every nonzero
//! payout ends with exactly one applied ledger credit: wagers credited at
//! cash-out time are skipped, the rest are credited here under the wager's
//! payout key. Each step is retried with bounded exponential backoff; when
//! retries run out the caller receives `SettlementError::Exhausted` and must not
//! start another round.

use crate::errors::SettlementError;
use crate::game_store::GameStore;
use crate::games::types::{
    FairnessProof, RoundId, RoundRecord, RoundSnapshot, WagerRecord,
};
use crate::ledger::Ledger;
use crate::metrics::MetricsRegistry;
use chrono::{DateTime, Utc};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &crate::config::SettlementConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Everything settlement needs about a finished round
#[derive(Debug, Clone)]
pub struct SettlementInput {
    pub snapshot: RoundSnapshot,
    /// Terminal multiplier, `0.0` for an aborted round
    pub terminal_multiplier: f64,
    pub started_at: DateTime<Utc>,
    pub fairness: Option<FairnessProof>,
}

impl SettlementInput {
    pub fn round_id(&self) -> RoundId {
        self.snapshot.round_id
    }
}

/// Outcome of a completed settlement
#[derive(Debug, Clone)]
pub struct SettlementReport {
    pub round: RoundRecord,
    pub wagers: Vec<WagerRecord>,
    /// Credits applied by settlement itself
    pub credits_issued: usize,
}

pub struct SettlementEngine {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn GameStore>,
    currency: String,
    retry: RetryPolicy,
    metrics: Arc<MetricsRegistry>,
}

impl SettlementEngine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn GameStore>,
        currency: impl Into<String>,
        retry: RetryPolicy,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            ledger,
            store,
            currency: currency.into(),
            retry,
            metrics,
        }
    }

    /// Settle a closed round.
    ///
    /// Credit flags in `input` are updated as credits land, so a failed call can
    /// be repeated with the same input without reissuing applied credits.
    pub async fn settle(
        &self,
        input: &mut SettlementInput,
    ) -> Result<SettlementReport, SettlementError> {
        let round_id = input.round_id();
        let mut credits_issued = 0;

        for wager in input.snapshot.wagers.iter_mut() {
            if !wager.needs_credit() {
                continue;
            }
            let (player, payout, key) = (wager.player_id, wager.payout, wager.id.payout_key());
            self.with_retry(round_id, &format!("credit {}", wager.id), || {
                self.ledger.credit(player, &self.currency, payout, &key)
            })
            .await?;
            wager.credited = true;
            credits_issued += 1;
        }

        let ended_at = Utc::now();
        let wagers: Vec<WagerRecord> = input
            .snapshot
            .wagers
            .iter()
            .map(|w| WagerRecord::from_wager(w, input.terminal_multiplier, ended_at))
            .collect();

        for record in &wagers {
            self.with_retry(round_id, &format!("persist wager {}", record.id), || {
                self.store.persist_wager(record)
            })
            .await?;
        }

        let round = RoundRecord {
            round_id,
            multiplier: input.terminal_multiplier,
            crashed_at: input.terminal_multiplier,
            total_players: wagers.len() as u32,
            total_bet: input.snapshot.total_staked(),
            total_payout: input.snapshot.total_paid_out(),
            aborted: input.snapshot.aborted,
            started_at: input.started_at,
            timestamp: ended_at,
            fairness: input.fairness.clone(),
        };
        self.with_retry(round_id, "persist round", || self.store.persist_round(&round))
            .await?;

        self.metrics
            .record_round_totals(round.total_bet, round.total_payout);
        MetricsRegistry::incr(&self.metrics.rounds_settled);
        info!(
            round_id = %round_id,
            players = round.total_players,
            total_bet = round.total_bet,
            total_payout = round.total_payout,
            credits_issued,
            "Round settled"
        );

        Ok(SettlementReport {
            round,
            wagers,
            credits_issued,
        })
    }

    async fn with_retry<F, Fut, E>(
        &self,
        round_id: RoundId,
        step: &str,
        mut op: F,
    ) -> Result<(), SettlementError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry.max_attempts => {
                    MetricsRegistry::incr(&self.metrics.settlement_retries);
                    warn!(round_id = %round_id, step, attempt, error = %e, "Settlement step failed, retrying");
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    MetricsRegistry::incr(&self.metrics.settlement_failures);
                    error!(round_id = %round_id, step, attempt, error = %e, "Settlement exhausted retries");
                    return Err(SettlementError::Exhausted {
                        round_id,
                        step: step.to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game_store::MemoryGameStore;
    use crate::games::bet_ledger::{BetLedger, BetLimits};
    use crate::games::types::{PlayerId, WagerStatus};
    use crate::ledger::InMemoryLedger;

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        store: Arc<MemoryGameStore>,
        engine: SettlementEngine,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(MemoryGameStore::new());
        let engine = SettlementEngine::new(
            ledger.clone(),
            store.clone(),
            "STARS",
            RetryPolicy {
                max_attempts,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
            },
            Arc::new(MetricsRegistry::new()),
        );
        Fixture {
            ledger,
            store,
            engine,
        }
    }

    async fn closed_round(fx: &Fixture, abort: bool) -> SettlementInput {
        for player in 1..=3 {
            fx.ledger.set_balance(PlayerId(player), "STARS", 100.0);
        }
        let bets = BetLedger::new(RoundId(7), fx.ledger.clone(), "STARS", BetLimits::default());
        bets.place(PlayerId(1), 10.0, Some(2.0)).await.unwrap();
        bets.place(PlayerId(2), 10.0, None).await.unwrap();
        bets.place(PlayerId(3), 10.0, None).await.unwrap();
        bets.open_flight().await.unwrap();
        bets.auto_cashout_sweep(2.0).await;
        bets.cash_out(PlayerId(3), 1.5).await.unwrap();

        let snapshot = if abort {
            bets.close_round_with_refunds().await.unwrap()
        } else {
            bets.close_round().await.unwrap()
        };
        SettlementInput {
            snapshot,
            terminal_multiplier: if abort { 0.0 } else { 3.5 },
            started_at: Utc::now(),
            fairness: None,
        }
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_settle_persists_records_and_aggregates() {
        let fx = fixture(3);
        let mut input = closed_round(&fx, false).await;
        let report = fx.engine.settle(&mut input).await.unwrap();

        assert_eq!(report.credits_issued, 0);
        assert_eq!(report.round.total_players, 3);
        assert_eq!(report.round.total_bet, 30.0);
        assert_eq!(report.round.total_payout, 35.0);
        assert_eq!(report.round.crashed_at, 3.5);

        let stored = fx.store.round_wagers(RoundId(7)).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].status, WagerStatus::CashedOut);
        assert_eq!(stored[0].win_amount, 20.0);
        assert_eq!(stored[1].status, WagerStatus::Lost);
        assert_eq!(stored[1].win_amount, 0.0);
        assert_eq!(stored[1].coefficient, 3.5);

        // Net ledger flow equals staked minus paid
        assert_eq!(
            fx.ledger.balance(PlayerId(1), "STARS").await.unwrap(),
            110.0
        );
        assert_eq!(fx.ledger.balance(PlayerId(2), "STARS").await.unwrap(), 90.0);
    }

    #[tokio::test]
    async fn test_abort_refunds_pending_stakes() {
        let fx = fixture(3);
        let mut input = closed_round(&fx, true).await;
        let report = fx.engine.settle(&mut input).await.unwrap();

        assert!(report.round.aborted);
        assert_eq!(report.round.multiplier, 0.0);
        assert_eq!(report.credits_issued, 1);
        assert_eq!(fx.ledger.balance(PlayerId(2), "STARS").await.unwrap(), 100.0);
        // Cashed-out wagers keep their payout
        assert_eq!(fx.ledger.balance(PlayerId(3), "STARS").await.unwrap(), 105.0);
        assert_eq!(report.wagers[1].status, WagerStatus::Refunded);
    }

    #[tokio::test]
    async fn test_retries_transient_credit_failures() {
        let fx = fixture(5);
        let mut input = closed_round(&fx, true).await;
        fx.ledger.fail_next_credits(2);

        let report = fx.engine.settle(&mut input).await.unwrap();
        assert_eq!(report.credits_issued, 1);
        assert_eq!(fx.ledger.balance(PlayerId(2), "STARS").await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn test_exhaustion_then_resume_credits_once() {
        let fx = fixture(2);
        let mut input = closed_round(&fx, true).await;
        fx.ledger.fail_next_credits(5);

        let err = fx.engine.settle(&mut input).await.unwrap_err();
        assert!(matches!(err, SettlementError::Exhausted { attempts: 2, .. }));
        assert!(fx.store.load_round(RoundId(7)).await.unwrap().is_none());

        fx.ledger.fail_next_credits(0);
        fx.engine.settle(&mut input).await.unwrap();
        fx.engine.settle(&mut input).await.unwrap();
        assert_eq!(fx.ledger.balance(PlayerId(2), "STARS").await.unwrap(), 100.0);
        assert_eq!(fx.store.house_stats().await.unwrap().total_rounds, 1);
    }

    #[tokio::test]
    async fn test_retries_persistence_failures() {
        let fx = fixture(4);
        let mut input = closed_round(&fx, false).await;
        fx.store.fail_next_writes(3);

        fx.engine.settle(&mut input).await.unwrap();
        assert!(fx.store.load_round(RoundId(7)).await.unwrap().is_some());
    }
}
