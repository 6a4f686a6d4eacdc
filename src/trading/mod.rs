//! Trading logic: exit policy, risk engine and wallet signal detection.

mod config;
mod exit_policy;
mod risk_engine;
mod signal_detector;

pub use config::{CacheConfig, DetectorConfig, EngineConfig, LimiterConfig, RiskConfig};
pub use exit_policy::{
    evaluate, Evaluation, ExitAction, ExitAmount, ExitMark, ExitReason, SlippageClass,
};
pub use risk_engine::{CycleReport, EngineHealth, PositionOutcome, RiskEngine};
pub use signal_detector::{PollReport, SignalDetector};
