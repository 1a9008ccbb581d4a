//! Configuration management with validation and defaults
//!
//! Settings are read from TOML, overridden by `CRASHLINE_*` environment
//! variables and validated before any service is constructed.

use crate::errors::{ConfigurationError, CrashResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Complete service configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashConfig {
    pub game: GameConfig,
    pub hub: HubConfig,
    pub settlement: SettlementConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub monitoring: MonitoringConfig,
}

/// Round timing, payout curve and bet limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Target long-run return to player, e.g. 0.95
    pub rtp: f64,
    /// Hard cap on the terminal multiplier
    pub max_multiplier: f64,
    pub betting_duration_secs: u64,
    /// Countdown broadcast cadence during Betting
    pub countdown_interval_ms: u64,
    /// Multiplier tick cadence during Flying
    pub tick_interval_ms: u64,
    /// Pause after the crash result before the next round opens
    pub post_crash_pause_secs: u64,
    pub min_bet: f64,
    pub max_bet: f64,
    pub min_auto_cashout: f64,
    pub currency: String,
    /// Derive crash points from the VRF key instead of the OS-seeded RNG
    pub provably_fair: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            rtp: 0.95,
            max_multiplier: 1000.0,
            betting_duration_secs: 15,
            countdown_interval_ms: 1000,
            tick_interval_ms: 100,
            post_crash_pause_secs: 5,
            min_bet: 1.0,
            max_bet: 100_000.0,
            min_auto_cashout: 1.01,
            currency: "STARS".to_string(),
            provably_fair: true,
        }
    }
}

/// Connection registry settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Connections silent for longer than this are evicted
    pub liveness_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Bounded outbound queue per connection
    pub send_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_secs: 60,
            sweep_interval_secs: 15,
            send_queue_capacity: 256,
        }
    }
}

/// Retry policy for settlement credits and persistence
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

/// HTTP/WebSocket listener settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub cors_origins: Vec<String>,
    /// Required in `X-API-Key` for admin and payment routes when set
    pub admin_api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            request_timeout_secs: 30,
            cors_origins: vec!["*".to_string()],
            admin_api_key: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    RocksDb,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "rocksdb" => Ok(StorageBackend::RocksDb),
            other => Err(format!("unknown storage backend '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::RocksDb,
            data_dir: "./DB/crashline_data".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            log_filter: "crashline=info,tower_http=info".to_string(),
        }
    }
}

impl CrashConfig {
    /// Short rounds and in-memory storage for local development
    pub fn development() -> Self {
        Self {
            game: GameConfig {
                betting_duration_secs: 5,
                post_crash_pause_secs: 2,
                ..Default::default()
            },
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                ..Default::default()
            },
            monitoring: MonitoringConfig {
                log_filter: "crashline=debug,tower_http=debug".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Persistent storage and default timings
    pub fn production() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::RocksDb,
                data_dir: "./DB/crashline_data".to_string(),
            },
            hub: HubConfig {
                send_queue_capacity: 512,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> CrashResult<()> {
        let game = &self.game;
        if !(0.5..=0.99).contains(&game.rtp) {
            return Err(invalid("game.rtp", game.rtp, "RTP must be within [0.5, 0.99]"));
        }
        if game.max_multiplier < 2.0 {
            return Err(invalid(
                "game.max_multiplier",
                game.max_multiplier,
                "Maximum multiplier must be at least 2",
            ));
        }
        if game.min_bet <= 0.0 {
            return Err(invalid("game.min_bet", game.min_bet, "Minimum bet must be positive"));
        }
        if game.max_bet < game.min_bet {
            return Err(invalid(
                "game.max_bet",
                game.max_bet,
                "Maximum bet cannot be below the minimum bet",
            ));
        }
        if game.min_auto_cashout <= 1.0 {
            return Err(invalid(
                "game.min_auto_cashout",
                game.min_auto_cashout,
                "Auto cash-out threshold must exceed 1.0",
            ));
        }
        if game.tick_interval_ms == 0 || game.countdown_interval_ms == 0 {
            return Err(ConfigurationError::ValidationFailed(
                "tick and countdown intervals must be > 0".to_string(),
            )
            .into());
        }
        if game.currency.is_empty() {
            return Err(ConfigurationError::MissingRequired("game.currency".to_string()).into());
        }

        if self.hub.liveness_timeout_secs == 0 {
            return Err(invalid(
                "hub.liveness_timeout_secs",
                0,
                "Liveness timeout cannot be zero",
            ));
        }
        if self.hub.send_queue_capacity == 0 {
            return Err(invalid(
                "hub.send_queue_capacity",
                0,
                "Send queue capacity cannot be zero",
            ));
        }

        if self.settlement.max_attempts == 0 {
            return Err(invalid(
                "settlement.max_attempts",
                0,
                "At least one settlement attempt is required",
            ));
        }

        if self.storage.backend == StorageBackend::RocksDb && self.storage.data_dir.is_empty() {
            return Err(ConfigurationError::MissingRequired("storage.data_dir".to_string()).into());
        }

        if self.server.port == 0 {
            return Err(invalid("server.port", 0, "Port cannot be zero"));
        }

        Ok(())
    }

    pub fn betting_duration(&self) -> Duration {
        Duration::from_secs(self.game.betting_duration_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.game.tick_interval_ms)
    }

    pub fn countdown_interval(&self) -> Duration {
        Duration::from_millis(self.game.countdown_interval_ms)
    }

    pub fn post_crash_pause(&self) -> Duration {
        Duration::from_secs(self.game.post_crash_pause_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.hub.liveness_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.hub.sweep_interval_secs.max(1))
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> crate::errors::CrashError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Configuration loader with environment variable support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file (or defaults), apply env overrides, validate
    pub fn load(&self) -> CrashResult<CrashConfig> {
        let config = match self.config_path {
            Some(ref path) => self.load_from_file(path)?,
            None => CrashConfig::default(),
        };
        self.finish(config)
    }

    /// Apply env overrides and validate an already constructed configuration
    pub fn finish(&self, mut config: CrashConfig) -> CrashResult<CrashConfig> {
        self.apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> CrashResult<CrashConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into()
        })
    }

    fn apply_env_overrides(&self, config: &mut CrashConfig) -> CrashResult<()> {
        if let Ok(host) = env::var("CRASHLINE_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = env::var("CRASHLINE_PORT") {
            config.server.port = port.parse().map_err(|_| ConfigurationError::InvalidValue {
                field: "CRASHLINE_PORT".to_string(),
                value: port,
                reason: "Invalid port number".to_string(),
            })?;
        }
        if let Ok(rtp) = env::var("CRASHLINE_RTP") {
            config.game.rtp = rtp.parse().map_err(|_| ConfigurationError::InvalidValue {
                field: "CRASHLINE_RTP".to_string(),
                value: rtp,
                reason: "Invalid decimal value".to_string(),
            })?;
        }
        if let Ok(data_dir) = env::var("CRASHLINE_DATA_DIR") {
            config.storage.data_dir = data_dir;
        }
        if let Ok(key) = env::var("CRASHLINE_ADMIN_KEY") {
            config.server.admin_api_key = if key.is_empty() { None } else { Some(key) };
        }
        if let Ok(backend) = env::var("CRASHLINE_STORAGE_BACKEND") {
            config.storage.backend =
                backend
                    .parse()
                    .map_err(|reason: String| ConfigurationError::InvalidValue {
                        field: "CRASHLINE_STORAGE_BACKEND".to_string(),
                        value: backend.clone(),
                        reason,
                    })?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, config: &CrashConfig, path: &str) -> CrashResult<()> {
        let toml_string = toml::to_string_pretty(config).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, toml_string).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into()
        })
    }
}

/// Write a sample configuration file with all defaults filled in
pub fn generate_sample_config(path: &str) -> CrashResult<()> {
    ConfigLoader::new().save(&CrashConfig::default(), path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = CrashConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.game.betting_duration_secs, 15);
        assert_eq!(config.hub.liveness_timeout_secs, 60);
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(CrashConfig::development().validate().is_ok());
        assert!(CrashConfig::production().validate().is_ok());
        assert_eq!(
            CrashConfig::development().storage.backend,
            StorageBackend::Memory
        );
    }

    #[test]
    fn test_rtp_bounds() {
        let mut config = CrashConfig::default();
        config.game.rtp = 0.995;
        assert!(config.validate().is_err());

        config.game.rtp = 0.4;
        assert!(config.validate().is_err());

        config.game.rtp = 0.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_limits() {
        let mut config = CrashConfig::default();
        config.game.max_bet = 0.5;
        assert!(config.validate().is_err());

        let mut config = CrashConfig::default();
        config.game.min_auto_cashout = 1.0;
        assert!(config.validate().is_err());

        let mut config = CrashConfig::default();
        config.settlement.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = CrashConfig::default();
        config.storage.data_dir.clear();
        assert!(config.validate().is_err());
        config.storage.backend = StorageBackend::Memory;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_conversions() {
        let config = CrashConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
        assert_eq!(config.betting_duration(), Duration::from_secs(15));
        assert_eq!(config.post_crash_pause(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: CrashConfig = toml::from_str(
            r#"
            [game]
            rtp = 0.92

            [storage]
            backend = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.game.rtp, 0.92);
        assert_eq!(config.game.tick_interval_ms, 100);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_save_and_load_config() -> CrashResult<()> {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut original = CrashConfig::development();
        original.game.rtp = 0.93;
        ConfigLoader::new().save(&original, path)?;

        let loaded = ConfigLoader::new().with_path(path).load()?;
        assert_eq!(loaded.game.betting_duration_secs, 5);
        assert_eq!(loaded.storage.backend, StorageBackend::Memory);

        Ok(())
    }

    #[test]
    fn test_missing_file_fails() {
        let result = ConfigLoader::new()
            .with_path("/nonexistent/crashline.toml")
            .load();
        assert!(result.is_err());
    }
}
