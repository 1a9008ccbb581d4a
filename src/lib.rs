//! Crashline - multiplayer crash wagering engine
//!
//! A single global round clock drives every player: wagers are accepted while
//! betting is open, the multiplier climbs until the drawn crash point, and the
//! round is settled against the external ledger before the next one opens.

pub mod api;
pub mod config;
pub mod errors;
pub mod game_store;
pub mod games;
pub mod hub;
pub mod ledger;
pub mod metrics;
pub mod payments;
pub mod services;
pub mod storage;

pub use config::{ConfigLoader, CrashConfig};
pub use errors::{CrashError, CrashResult};
pub use games::{RoundStateMachine, SettlementEngine};
pub use hub::BroadcastHub;
pub use ledger::{InMemoryLedger, Ledger};
pub use payments::{PaymentDeduplicator, PaymentProcessor};
pub use services::ServiceContainer;
