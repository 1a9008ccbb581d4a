//! Service wiring
//!
//! Builds every engine component from one `CrashConfig` and hands out shared
//! handles. Nothing runs until `start` spawns the round clock and the
//! liveness sweeper.

use crate::{
    api::AppState,
    config::{CrashConfig, StorageBackend},
    errors::CrashResult,
    game_store::{GameStore, MemoryGameStore, RocksGameStore},
    games::{
        CrashCurve, CrashPointGenerator, CrashPointSource, RetryPolicy, RoundId, RoundSettings,
        RoundStateMachine, SettlementEngine, VrfCrashSource,
    },
    hub::{BroadcastHub, InboundRouter},
    ledger::{InMemoryLedger, Ledger},
    metrics::MetricsRegistry,
    payments::{
        MemoryPaymentLog, PaymentDeduplicator, PaymentProcessor, ProcessedPaymentLog,
        RocksPaymentLog,
    },
    storage::RocksStorage,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Running background tasks
pub struct ServiceHandles {
    pub rounds: JoinHandle<CrashResult<()>>,
    pub sweeper: JoinHandle<()>,
}

pub struct ServiceContainer {
    config: CrashConfig,
    metrics: Arc<MetricsRegistry>,
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn GameStore>,
    hub: Arc<BroadcastHub>,
    machine: Arc<RoundStateMachine>,
    router: Arc<InboundRouter>,
    payments: Arc<PaymentProcessor>,
    curve: CrashCurve,
}

impl ServiceContainer {
    /// Wire the engine against the in-memory reference ledger
    pub async fn new(config: CrashConfig) -> CrashResult<Self> {
        Self::with_ledger(config, Arc::new(InMemoryLedger::new())).await
    }

    pub async fn with_ledger(config: CrashConfig, ledger: Arc<dyn Ledger>) -> CrashResult<Self> {
        config.validate()?;
        let curve = CrashCurve::new(config.game.rtp, config.game.max_multiplier);

        let (store, payment_log, rocks) = Self::create_storage(&config)?;
        let source = Self::create_crash_source(&config, curve, rocks.as_ref())?;
        Self::assemble(config, ledger, store, payment_log, source).await
    }

    /// Wire the engine from explicit collaborators
    pub async fn assemble(
        config: CrashConfig,
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn GameStore>,
        payment_log: Arc<dyn ProcessedPaymentLog>,
        source: Box<dyn CrashPointSource>,
    ) -> CrashResult<Self> {
        let curve = CrashCurve::new(config.game.rtp, config.game.max_multiplier);
        let metrics = Arc::new(MetricsRegistry::new());
        let hub = Arc::new(BroadcastHub::new(
            config.hub.send_queue_capacity,
            config.liveness_timeout(),
            metrics.clone(),
        ));

        let settlement = SettlementEngine::new(
            ledger.clone(),
            store.clone(),
            config.game.currency.clone(),
            RetryPolicy::from_config(&config.settlement),
            metrics.clone(),
        );

        // Round ids continue after the last persisted round
        let first_round_id = store
            .latest_round_id()
            .await?
            .map(RoundId::next)
            .unwrap_or(RoundId(1));

        let machine = RoundStateMachine::new(
            RoundSettings::from_config(&config),
            source,
            ledger.clone(),
            settlement,
            hub.clone(),
            metrics.clone(),
            first_round_id,
        );
        let router = Arc::new(InboundRouter::new(
            hub.clone(),
            machine.clone(),
            metrics.clone(),
        ));
        let payments = Arc::new(PaymentProcessor::new(
            PaymentDeduplicator::new(payment_log),
            ledger.clone(),
            config.game.currency.clone(),
        ));

        info!(
            first_round_id = %first_round_id,
            backend = ?config.storage.backend,
            rtp = config.game.rtp,
            "Crash engine assembled"
        );

        Ok(Self {
            config,
            metrics,
            ledger,
            store,
            hub,
            machine,
            router,
            payments,
            curve,
        })
    }

    #[allow(clippy::type_complexity)]
    fn create_storage(
        config: &CrashConfig,
    ) -> CrashResult<(
        Arc<dyn GameStore>,
        Arc<dyn ProcessedPaymentLog>,
        Option<RocksStorage>,
    )> {
        match config.storage.backend {
            StorageBackend::Memory => Ok((
                Arc::new(MemoryGameStore::new()),
                Arc::new(MemoryPaymentLog::new()),
                None,
            )),
            StorageBackend::RocksDb => {
                let storage = RocksStorage::new(&config.storage.data_dir)?;
                info!(data_dir = %config.storage.data_dir, "Opened RocksDB storage");
                Ok((
                    Arc::new(RocksGameStore::new(storage.clone())),
                    Arc::new(RocksPaymentLog::new(storage.clone())),
                    Some(storage),
                ))
            }
        }
    }

    fn create_crash_source(
        config: &CrashConfig,
        curve: CrashCurve,
        rocks: Option<&RocksStorage>,
    ) -> CrashResult<Box<dyn CrashPointSource>> {
        if !config.game.provably_fair {
            return Ok(Box::new(CrashPointGenerator::new(curve)));
        }
        let source = match rocks {
            Some(storage) => VrfCrashSource::load_or_create(storage, curve)?,
            None => VrfCrashSource::new_random(curve),
        };
        info!(public_key = %source.public_key_hex(), "Crash points are VRF-derived");
        Ok(Box::new(source))
    }

    /// Spawn the round clock and the liveness sweeper
    pub fn start(&self) -> ServiceHandles {
        ServiceHandles {
            rounds: self.machine.spawn(),
            sweeper: self
                .hub
                .spawn_liveness_sweeper(self.config.sweep_interval()),
        }
    }

    /// Shared state for the HTTP surface
    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            machine: self.machine.clone(),
            hub: self.hub.clone(),
            router: self.router.clone(),
            store: self.store.clone(),
            payments: self.payments.clone(),
            metrics: self.metrics.clone(),
            curve: self.curve,
            admin_api_key: self.config.server.admin_api_key.clone(),
            metrics_enabled: self.config.monitoring.enable_metrics,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    pub fn config(&self) -> &CrashConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        Arc::clone(&self.ledger)
    }

    pub fn store(&self) -> Arc<dyn GameStore> {
        Arc::clone(&self.store)
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        Arc::clone(&self.hub)
    }

    pub fn machine(&self) -> Arc<RoundStateMachine> {
        Arc::clone(&self.machine)
    }

    pub fn router(&self) -> Arc<InboundRouter> {
        Arc::clone(&self.router)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::Phase;

    #[tokio::test]
    async fn test_development_container_opens_first_round() {
        let services = ServiceContainer::new(CrashConfig::development())
            .await
            .unwrap();
        let view = services.machine().current_round().unwrap();
        assert_eq!(view.game_id, RoundId(1));
        assert_eq!(view.phase, Phase::Betting);
        assert_eq!(services.hub().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_round_ids_resume_after_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = CrashConfig::production();
        config.storage.data_dir = dir.path().to_string_lossy().to_string();

        {
            let services = ServiceContainer::new(config.clone()).await.unwrap();
            let record = crate::games::RoundRecord {
                round_id: RoundId(41),
                multiplier: 2.0,
                crashed_at: 2.0,
                total_players: 0,
                total_bet: 0.0,
                total_payout: 0.0,
                aborted: false,
                started_at: chrono::Utc::now(),
                timestamp: chrono::Utc::now(),
                fairness: None,
            };
            services.store().persist_round(&record).await.unwrap();
        }

        let services = ServiceContainer::new(config).await.unwrap();
        assert_eq!(services.machine().current_round().unwrap().game_id, RoundId(42));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = CrashConfig::development();
        config.game.rtp = 1.2;
        assert!(ServiceContainer::new(config).await.is_err());
    }
}
