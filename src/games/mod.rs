//! Crash game engine: crash points, bet registry, round clock and settlement

pub mod bet_ledger;
pub mod crash_point;
pub mod round;
pub mod settlement;
pub mod types;
pub mod vrf_engine;

pub use bet_ledger::{BetLedger, BetLimits};
pub use crash_point::{CrashCurve, CrashDraw, CrashPointGenerator, CrashPointSource, ScriptedCrashSource};
pub use round::{RoundSettings, RoundStateMachine, RoundTimings};
pub use settlement::{RetryPolicy, SettlementEngine, SettlementInput, SettlementReport};
pub use types::*;
pub use vrf_engine::{verify_crash_point, verify_fairness_proof, VrfCrashSource};
