//! Gemeinsame Typen für leselern: Lesekontext, Arme, Kontext-Encoder,
//! Uhr, Beobachter und TTL-Cache.

#![warn(clippy::unwrap_used, clippy::expect_used)]

pub mod arm;
pub mod cache;
pub mod clock;
pub mod context;
pub mod encoder;
pub mod observe;

use serde::{Deserialize, Serialize};

pub use arm::{Arm, ArmSet};
pub use cache::TtlCache;
pub use clock::{Clock, FixedClock, SystemClock};
pub use context::{Context, TimeOfDay, UserFeatures};
pub use encoder::{similarity, Block, ContextEncoder, EncodedContext, EncoderConfig, CONTEXT_DIM};
pub use observe::{EngineEvent, NoopObserver, Observer, TracingObserver};

/// Stabiler Schlüssel eines Lesers (angemeldete User-ID oder anonyme Session).
pub type Identity = String;

/// Ergebnis einer Strategiewahl, wie es nach außen gegeben wird.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyChoice {
    pub arm_id: String,
    pub predicted_reward: f64,
    pub exploration_bonus: f64,
    pub confidence: f64,
    pub explanation: String,
}
