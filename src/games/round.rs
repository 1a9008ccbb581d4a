//! Round state machine
//!
//! One machine drives the global game clock: Betting for a fixed duration,
//! Flying while the multiplier climbs on a fixed tick, then Crashed. The tick
//! loop is the only writer of the current multiplier. Settlement of a crashed
//! round finishes before the next round opens; if it cannot finish the machine
//! halts until an operator resumes it.

use crate::config::CrashConfig;
use crate::errors::{BetError, CrashResult, SettlementError};
use crate::games::bet_ledger::{BetLedger, BetLimits};
use crate::games::crash_point::{CrashDraw, CrashPointSource};
use crate::games::settlement::{SettlementEngine, SettlementInput, SettlementReport};
use crate::games::types::{Phase, PlayerId, RoundId, RoundView, Wager};
use crate::hub::messages::{self, ServerMessage};
use crate::hub::{player_channel, BroadcastHub, GAME_CHANNEL};
use crate::ledger::Ledger;
use crate::metrics::MetricsRegistry;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Sentinel terminal multiplier recorded for aborted rounds
pub const ABORT_SENTINEL: f64 = 0.0;

/// Fixed clock of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTimings {
    pub betting: Duration,
    pub countdown_interval: Duration,
    pub tick_interval: Duration,
    pub post_crash_pause: Duration,
}

impl Default for RoundTimings {
    fn default() -> Self {
        Self {
            betting: Duration::from_secs(15),
            countdown_interval: Duration::from_secs(1),
            tick_interval: Duration::from_millis(100),
            post_crash_pause: Duration::from_secs(5),
        }
    }
}

/// Static settings of the machine
#[derive(Debug, Clone)]
pub struct RoundSettings {
    pub timings: RoundTimings,
    pub limits: BetLimits,
    pub currency: String,
}

impl RoundSettings {
    pub fn from_config(config: &CrashConfig) -> Self {
        Self {
            timings: RoundTimings {
                betting: config.betting_duration(),
                countdown_interval: config.countdown_interval(),
                tick_interval: config.tick_interval(),
                post_crash_pause: config.post_crash_pause(),
            },
            limits: BetLimits {
                min_bet: config.game.min_bet,
                max_bet: config.game.max_bet,
                min_auto_cashout: config.game.min_auto_cashout,
                max_multiplier: config.game.max_multiplier,
            },
            currency: config.game.currency.clone(),
        }
    }
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            timings: RoundTimings::default(),
            limits: BetLimits::default(),
            currency: "STARS".to_string(),
        }
    }
}

/// Next multiplier on the flight curve, clamped to the terminal value.
///
/// Steps grow with the multiplier so high rounds don't take minutes.
pub fn next_multiplier(current: f64, terminal: f64) -> f64 {
    let step = match current {
        m if m < 2.0 => 0.01,
        m if m < 5.0 => 0.02,
        m if m < 10.0 => 0.05,
        m if m < 25.0 => 0.1,
        m if m < 100.0 => 0.25,
        m if m < 500.0 => 1.0,
        _ => 2.5,
    };
    let next = ((current + step) * 100.0).round() / 100.0;
    next.min(terminal)
}

struct ActiveRound {
    id: RoundId,
    bets: Arc<BetLedger>,
    started_at: DateTime<Utc>,
    betting_deadline: Instant,
    // Revealed only after the crash
    crash_point: Mutex<Option<f64>>,
    // Set once the flight outcome is fixed; aborts are refused afterwards
    decided: Mutex<bool>,
}

impl ActiveRound {
    fn set_crash_point(&self, value: f64) {
        if let Ok(mut slot) = self.crash_point.lock() {
            *slot = Some(value);
        }
    }

    fn crash_point(&self) -> Option<f64> {
        self.crash_point.lock().ok().and_then(|slot| *slot)
    }
}

enum FlightOutcome {
    Crashed { terminal: f64, draw: CrashDraw },
    Aborted { draw: Option<CrashDraw> },
}

pub struct RoundStateMachine {
    settings: RoundSettings,
    source: Mutex<Box<dyn CrashPointSource>>,
    ledger: Arc<dyn Ledger>,
    settlement: SettlementEngine,
    hub: Arc<BroadcastHub>,
    metrics: Arc<MetricsRegistry>,
    current: RwLock<Option<Arc<ActiveRound>>>,
    next_round_id: AtomicU64,
    multiplier_bits: AtomicU64,
    abort_requested: AtomicBool,
    shutdown_requested: AtomicBool,
    wake: Notify,
    halted: tokio::sync::Mutex<Option<SettlementInput>>,
    is_halted: AtomicBool,
    resumed: Notify,
}

impl RoundStateMachine {
    /// Build the machine; the first round is open for betting on return
    pub fn new(
        settings: RoundSettings,
        source: Box<dyn CrashPointSource>,
        ledger: Arc<dyn Ledger>,
        settlement: SettlementEngine,
        hub: Arc<BroadcastHub>,
        metrics: Arc<MetricsRegistry>,
        first_round_id: RoundId,
    ) -> Arc<Self> {
        let machine = Arc::new(Self {
            settings,
            source: Mutex::new(source),
            ledger,
            settlement,
            hub,
            metrics,
            current: RwLock::new(None),
            next_round_id: AtomicU64::new(first_round_id.0.max(1)),
            multiplier_bits: AtomicU64::new(1.0f64.to_bits()),
            abort_requested: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            wake: Notify::new(),
            halted: tokio::sync::Mutex::new(None),
            is_halted: AtomicBool::new(false),
            resumed: Notify::new(),
        });
        machine.open_round();
        machine
    }

    /// Drive rounds on a background task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<CrashResult<()>> {
        let machine = Arc::clone(self);
        tokio::spawn(async move { machine.run().await })
    }

    /// Current multiplier as last published by the tick loop
    pub fn current_multiplier(&self) -> f64 {
        f64::from_bits(self.multiplier_bits.load(Ordering::SeqCst))
    }

    fn publish_multiplier(&self, value: f64) {
        self.multiplier_bits.store(value.to_bits(), Ordering::SeqCst);
    }

    fn active(&self) -> Option<Arc<ActiveRound>> {
        self.current.read().ok().and_then(|current| current.clone())
    }

    pub fn is_halted(&self) -> bool {
        self.is_halted.load(Ordering::SeqCst)
    }

    fn open_round(&self) -> Arc<ActiveRound> {
        let id = RoundId(self.next_round_id.fetch_add(1, Ordering::SeqCst));
        let round = Arc::new(ActiveRound {
            id,
            bets: Arc::new(BetLedger::new(
                id,
                Arc::clone(&self.ledger),
                self.settings.currency.clone(),
                self.settings.limits,
            )),
            started_at: Utc::now(),
            betting_deadline: Instant::now() + self.settings.timings.betting,
            crash_point: Mutex::new(None),
            decided: Mutex::new(false),
        });
        self.abort_requested.store(false, Ordering::SeqCst);
        self.publish_multiplier(1.0);
        if let Ok(mut current) = self.current.write() {
            *current = Some(Arc::clone(&round));
        }
        MetricsRegistry::incr(&self.metrics.rounds_started);
        info!(round_id = %id, "Round open for betting");
        round
    }

    /// Snapshot of the round in progress
    pub fn current_round(&self) -> Option<RoundView> {
        let round = self.active()?;
        let phase = round.bets.phase();
        let time_remaining = match phase {
            Phase::Betting => ceil_secs(round.betting_deadline.saturating_duration_since(Instant::now())),
            _ => 0,
        };
        Some(RoundView {
            game_id: round.id,
            phase,
            multiplier: self.current_multiplier(),
            time_remaining,
            players: round.bets.player_count(),
            total_wagered: round.bets.total_wagered(),
            crash_point: match phase {
                Phase::Crashed => round.crash_point(),
                _ => None,
            },
            halted: self.is_halted(),
        })
    }

    /// Place a wager on the open round
    pub async fn place_bet(
        &self,
        player: PlayerId,
        amount: f64,
        auto_cashout: Option<f64>,
    ) -> Result<Wager, BetError> {
        let Some(round) = self.active() else {
            return Err(BetError::Phase {
                expected: Phase::Betting,
                actual: Phase::Crashed,
            });
        };

        match round.bets.place(player, amount, auto_cashout).await {
            Ok(wager) => {
                MetricsRegistry::incr(&self.metrics.bets_accepted);
                self.hub.broadcast(
                    GAME_CHANNEL,
                    &ServerMessage::NewBet {
                        data: messages::NewBet {
                            user_id: player,
                            amount: wager.stake,
                            timestamp: wager.placed_at,
                        },
                    },
                );
                Ok(wager)
            }
            Err(e) => {
                MetricsRegistry::incr(&self.metrics.bets_rejected);
                Err(e)
            }
        }
    }

    /// Cash out at the multiplier current when the request is processed
    pub async fn cash_out(&self, player: PlayerId) -> Result<Wager, BetError> {
        let Some(round) = self.active() else {
            return Err(BetError::Phase {
                expected: Phase::Flying,
                actual: Phase::Crashed,
            });
        };

        let multiplier = self.current_multiplier();
        match round.bets.cash_out(player, multiplier).await {
            Ok(wager) => {
                MetricsRegistry::incr(&self.metrics.manual_cashouts);
                self.announce_cash_out(&wager);
                Ok(wager)
            }
            Err(e) => {
                MetricsRegistry::incr(&self.metrics.bets_rejected);
                Err(e)
            }
        }
    }

    fn announce_cash_out(&self, wager: &Wager) {
        let message = ServerMessage::CashedOut {
            data: messages::CashedOut {
                user_id: wager.player_id,
                multiplier: wager.cashout_multiplier.unwrap_or_default(),
                payout: wager.payout,
                auto: wager.auto,
            },
        };
        self.hub.broadcast(GAME_CHANNEL, &message);
        self.hub.broadcast(&player_channel(wager.player_id), &message);
    }

    /// Operator abort of the round in progress. Pending wagers are refunded.
    pub fn abort(&self) -> Result<RoundId, BetError> {
        let round = self.active().ok_or(BetError::Phase {
            expected: Phase::Flying,
            actual: Phase::Crashed,
        })?;
        {
            let decided = round.decided.lock().unwrap_or_else(|p| p.into_inner());
            if *decided || round.bets.phase() == Phase::Crashed {
                return Err(BetError::Phase {
                    expected: Phase::Flying,
                    actual: Phase::Crashed,
                });
            }
            self.abort_requested.store(true, Ordering::SeqCst);
        }
        self.wake.notify_one();
        warn!(round_id = %round.id, "Operator abort requested");
        Ok(round.id)
    }

    /// Stop after the current round; an open round is aborted and refunded
    pub fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        let _ = self.abort();
        self.wake.notify_one();
        self.resumed.notify_one();
    }

    /// Retry the settlement that halted the machine
    pub async fn resume(&self) -> Result<SettlementReport, SettlementError> {
        let mut halted = self.halted.lock().await;
        let Some(input) = halted.as_mut() else {
            return Err(SettlementError::NotHalted);
        };
        let report = self.settlement.settle(input).await?;
        let round_id = input.round_id();
        *halted = None;
        self.is_halted.store(false, Ordering::SeqCst);
        self.resumed.notify_one();
        info!(round_id = %round_id, "Settlement resolved, resuming rounds");
        Ok(report)
    }

    fn stop_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
            || self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Sleep until `deadline`; true when interrupted by an abort or shutdown
    async fn pause_until(&self, deadline: Instant) -> bool {
        loop {
            if self.stop_requested() {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return self.stop_requested(),
                _ = self.wake.notified() => continue,
            }
        }
    }

    /// Fix the flight outcome. True when the round must be refunded.
    ///
    /// Taken under the same lock as `abort`, so an abort is either seen here
    /// or refused.
    fn conclude(&self, round: &ActiveRound, interrupted: bool) -> bool {
        let mut decided = round.decided.lock().unwrap_or_else(|p| p.into_inner());
        *decided = true;
        interrupted || self.stop_requested()
    }

    /// Main loop: one iteration per round
    pub async fn run(self: Arc<Self>) -> CrashResult<()> {
        let mut round = match self.active() {
            Some(round) if round.bets.phase() == Phase::Betting => round,
            _ => self.open_round(),
        };

        loop {
            let outcome = self.fly_round(&round).await;
            let settled = self.finish_round(&round, outcome).await;

            if !settled {
                self.wait_for_resume().await;
            }
            if self.shutdown_requested.load(Ordering::SeqCst) {
                info!("Round loop stopped");
                return Ok(());
            }

            let pause = Instant::now() + self.settings.timings.post_crash_pause;
            self.pause_until(pause).await;
            if self.shutdown_requested.load(Ordering::SeqCst) {
                info!("Round loop stopped");
                return Ok(());
            }
            round = self.open_round();
        }
    }

    async fn wait_for_resume(&self) {
        while self.is_halted() && !self.shutdown_requested.load(Ordering::SeqCst) {
            self.resumed.notified().await;
        }
    }

    fn broadcast_update(&self, round: &ActiveRound, phase: Phase, time_remaining: u64, multiplier: f64) {
        self.hub.broadcast(
            GAME_CHANNEL,
            &ServerMessage::CrashUpdate {
                data: messages::CrashUpdate {
                    game_id: round.id,
                    phase,
                    time_remaining,
                    multiplier,
                },
            },
        );
    }

    async fn fly_round(&self, round: &ActiveRound) -> FlightOutcome {
        let timings = self.settings.timings;

        // Betting countdown
        loop {
            let now = Instant::now();
            let remaining = round.betting_deadline.saturating_duration_since(now);
            self.broadcast_update(round, Phase::Betting, ceil_secs(remaining), 1.0);
            if remaining.is_zero() {
                break;
            }
            let next = (now + timings.countdown_interval).min(round.betting_deadline);
            if self.pause_until(next).await {
                self.conclude(round, true);
                return FlightOutcome::Aborted { draw: None };
            }
        }

        let draw = match self.draw_crash_point(round.id) {
            Ok(draw) => draw,
            Err(e) => {
                error!(round_id = %round.id, error = %e, "Crash point draw failed, refunding round");
                self.conclude(round, true);
                return FlightOutcome::Aborted { draw: None };
            }
        };
        let terminal = draw.multiplier;

        // Instant crash: the round never flies, so no cash-out can land
        if terminal <= 1.0 {
            if self.conclude(round, false) {
                return FlightOutcome::Aborted { draw: Some(draw) };
            }
            return FlightOutcome::Crashed { terminal, draw };
        }

        if let Err(e) = round.bets.open_flight().await {
            error!(round_id = %round.id, error = %e, "Could not open flight");
            self.conclude(round, true);
            return FlightOutcome::Aborted { draw: Some(draw) };
        }
        info!(round_id = %round.id, players = round.bets.player_count(), "Round flying");

        let mut multiplier = 1.0;
        self.publish_multiplier(multiplier);
        self.broadcast_update(round, Phase::Flying, 0, multiplier);

        let mut next_tick = Instant::now();
        while multiplier < terminal {
            next_tick += timings.tick_interval;
            if self.pause_until(next_tick).await {
                self.conclude(round, true);
                return FlightOutcome::Aborted { draw: Some(draw) };
            }

            let next = next_multiplier(multiplier, terminal);
            // Thresholds are honored before the new value becomes visible
            for wager in round.bets.auto_cashout_sweep(next).await {
                MetricsRegistry::incr(&self.metrics.auto_cashouts);
                self.announce_cash_out(&wager);
            }
            multiplier = next;
            if multiplier >= terminal {
                break;
            }
            self.publish_multiplier(multiplier);
            self.broadcast_update(round, Phase::Flying, 0, multiplier);
        }

        if self.conclude(round, false) {
            return FlightOutcome::Aborted { draw: Some(draw) };
        }
        FlightOutcome::Crashed { terminal, draw }
    }

    fn draw_crash_point(&self, round_id: RoundId) -> CrashResult<CrashDraw> {
        let mut source = self.source.lock().map_err(|_| {
            crate::errors::ConfigurationError::ValidationFailed(
                "crash point source lock poisoned".to_string(),
            )
        })?;
        source.draw(round_id)
    }

    /// Close the registry, settle and announce. False when settlement halted.
    async fn finish_round(&self, round: &ActiveRound, outcome: FlightOutcome) -> bool {
        let (snapshot, terminal, fairness) = match outcome {
            FlightOutcome::Crashed { terminal, draw } => {
                let snapshot = round.bets.close_round().await;
                (snapshot, terminal, draw.proof)
            }
            FlightOutcome::Aborted { draw } => {
                MetricsRegistry::incr(&self.metrics.rounds_aborted);
                warn!(round_id = %round.id, "Round aborted, refunding pending wagers");
                let snapshot = round.bets.close_round_with_refunds().await;
                (snapshot, ABORT_SENTINEL, draw.and_then(|d| d.proof))
            }
        };

        round.set_crash_point(terminal);
        self.publish_multiplier(terminal);

        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Only reachable if the registry was already closed
                error!(round_id = %round.id, error = %e, "Round registry already closed");
                return true;
            }
        };

        info!(round_id = %round.id, terminal, "Round crashed");
        let mut input = SettlementInput {
            snapshot,
            terminal_multiplier: terminal,
            started_at: round.started_at,
            fairness,
        };

        let result = self.settlement.settle(&mut input).await;
        self.hub.broadcast(
            GAME_CHANNEL,
            &ServerMessage::CrashResult {
                data: messages::CrashResult {
                    game_id: round.id,
                    final_multiplier: terminal,
                    crashed_at: terminal,
                    timestamp: Utc::now(),
                },
            },
        );

        match result {
            Ok(_) => true,
            Err(e) => {
                error!(round_id = %round.id, error = %e, "Settlement failed, halting new rounds");
                self.is_halted.store(true, Ordering::SeqCst);
                *self.halted.lock().await = Some(input);
                self.hub.broadcast(
                    GAME_CHANNEL,
                    &ServerMessage::RoundHalted {
                        data: messages::RoundHalted {
                            game_id: round.id,
                            reason: e.to_string(),
                        },
                    },
                );
                false
            }
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_function_is_monotone() {
        assert_eq!(next_multiplier(1.0, 1000.0), 1.01);
        assert_eq!(next_multiplier(1.99, 1000.0), 2.0);
        assert_eq!(next_multiplier(2.0, 1000.0), 2.02);
        assert_eq!(next_multiplier(5.0, 1000.0), 5.05);
        assert_eq!(next_multiplier(10.0, 1000.0), 10.1);
        assert_eq!(next_multiplier(25.0, 1000.0), 25.25);
        assert_eq!(next_multiplier(100.0, 1000.0), 101.0);
        assert_eq!(next_multiplier(500.0, 1000.0), 502.5);

        let mut m = 1.0;
        let mut ticks = 0;
        while m < 1000.0 {
            let next = next_multiplier(m, 1000.0);
            assert!(next > m);
            m = next;
            ticks += 1;
        }
        assert_eq!(m, 1000.0);
        assert!(ticks < 2000);
    }

    #[test]
    fn test_step_clamps_to_terminal() {
        assert_eq!(next_multiplier(2.36, 2.37), 2.37);
        assert_eq!(next_multiplier(2.98, 2.99), 2.99);
        assert_eq!(next_multiplier(1.0, 1.0), 1.0);
    }

    fn machine() -> Arc<RoundStateMachine> {
        use crate::game_store::MemoryGameStore;
        use crate::games::crash_point::ScriptedCrashSource;
        use crate::games::settlement::RetryPolicy;
        use crate::ledger::InMemoryLedger;

        let ledger = Arc::new(InMemoryLedger::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let hub = Arc::new(BroadcastHub::new(8, Duration::from_secs(60), metrics.clone()));
        let settlement = SettlementEngine::new(
            ledger.clone(),
            Arc::new(MemoryGameStore::new()),
            "STARS",
            RetryPolicy::default(),
            metrics.clone(),
        );
        RoundStateMachine::new(
            RoundSettings::default(),
            Box::new(ScriptedCrashSource::new([2.0])),
            ledger,
            settlement,
            hub,
            metrics,
            RoundId(1),
        )
    }

    #[tokio::test]
    async fn test_abort_refused_once_outcome_is_fixed() {
        let machine = machine();
        let round = machine.active().unwrap();

        assert!(!machine.conclude(&round, false));
        assert!(matches!(
            machine.abort(),
            Err(BetError::Phase {
                actual: Phase::Crashed,
                ..
            })
        ));
        assert!(!machine.stop_requested());
    }

    #[tokio::test]
    async fn test_abort_before_outcome_forces_refund() {
        let machine = machine();
        let round = machine.active().unwrap();

        assert_eq!(machine.abort().unwrap(), RoundId(1));
        assert!(machine.conclude(&round, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_pause() {
        let machine = machine();
        // Crashed round in its post-crash pause: abort is refused
        let round = machine.active().unwrap();
        machine.conclude(&round, false);
        let deadline = Instant::now() + Duration::from_secs(3600);
        let sleeper = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.pause_until(deadline).await })
        };
        tokio::task::yield_now().await;
        machine.shutdown();

        let interrupted = tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .expect("pause ignored shutdown")
            .unwrap();
        assert!(interrupted);
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_millis(14_001)), 15);
        assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
        assert_eq!(ceil_secs(Duration::ZERO), 0);
    }
}
