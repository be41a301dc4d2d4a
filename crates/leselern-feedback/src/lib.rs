#![warn(clippy::unwrap_used, clippy::expect_used)]

//! Reward attribution and the recommendation engine facade.
//!
//! Impressions record which strategy produced a shown book; actions record
//! what the reader did with it. Each action is credited back to matching
//! impressions of the last week as a time-decayed reward, which trains the
//! LinUCB models of `leselern-bandits`.

mod attribution;
mod engine;
mod error;
mod log;
mod signals;
mod sqlite_log;

pub use attribution::{AttributionConfig, Credit, RecencyPolicy, RewardAttributor};
pub use engine::{
    ArmStats, AttributionReport, CreditOutcome, CreditStatus, EngineBuilder, EngineConfig,
    EngineStats, MigrationReport, RecommendationEngine, ReprocessReport,
};
pub use error::{FeedbackError, Result};
pub use log::{MemorySignalLog, SignalLog};
pub use signals::{Action, ActionType, Impression, ImpressionStatus, UnknownActionType};
pub use sqlite_log::SqliteSignalLog;
