//! Synthetic traffic against an in-memory engine.
//!
//! Every arm has one mood it serves well; readers in that mood click its
//! recommendations far more often. With enough rounds the engine should
//! prefer the matching arm per mood.

use anyhow::Result;
use leselern_bandits::MemoryBackend;
use leselern_core::{Context, FixedClock};
use leselern_feedback::{
    ActionType, EngineConfig, EngineStats, MemorySignalLog, RecommendationEngine,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::macros::datetime;
use time::Duration;

const MOODS: [&str; 5] = ["curious", "calm", "excited", "sad", "motivated"];
const HIT_RATE: f64 = 0.7;
const MISS_RATE: f64 = 0.1;

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub seed: u64,
    pub rounds: u32,
    pub identities: u32,
    pub clicks: u64,
    /// How often each arm was chosen.
    pub selections: BTreeMap<String, u64>,
    /// Arm chosen most often per mood over the last half of the run.
    pub preferred: BTreeMap<String, String>,
    pub stats: Vec<EngineStats>,
}

pub fn run(config: EngineConfig, identities: u32, rounds: u32, seed: u64) -> Result<SimulationReport> {
    let identities = identities.max(1);
    let clock = Arc::new(FixedClock::new(datetime!(2024-01-01 08:00 UTC)));
    let engine = RecommendationEngine::builder(config)
        .clock(clock.clone())
        .build(Arc::new(MemoryBackend::new()), Arc::new(MemorySignalLog::new()))?;
    let arms: Vec<String> = engine.arms().ids().map(str::to_string).collect();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut clicks = 0;
    let mut selections: BTreeMap<String, u64> = BTreeMap::new();
    let mut late: BTreeMap<(String, String), u64> = BTreeMap::new();

    for round in 0..rounds {
        let identity = format!("sim-{}", rng.gen_range(0..identities));
        let mood_idx = rng.gen_range(0..MOODS.len());
        let ctx = Context::with_mood(MOODS[mood_idx]);

        let choice = engine.select_strategy(&ctx, &identity);
        *selections.entry(choice.arm_id.clone()).or_default() += 1;
        if round >= rounds / 2 {
            *late
                .entry((MOODS[mood_idx].to_string(), choice.arm_id.clone()))
                .or_default() += 1;
        }

        let book = format!("book-{round}");
        engine.record_impression(&identity, &book, &ctx, &choice.arm_id, 1, choice.predicted_reward)?;
        clock.advance(Duration::minutes(rng.gen_range(1..30)));

        let good_arm = arms.get(mood_idx % arms.len()).map(String::as_str);
        let p = if good_arm == Some(choice.arm_id.as_str()) {
            HIT_RATE
        } else {
            MISS_RATE
        };
        if rng.gen_bool(p) {
            clicks += 1;
            let action = *[ActionType::Click, ActionType::Save]
                .choose(&mut rng)
                .unwrap_or(&ActionType::Click);
            engine.record_action(&identity, &book, action, None)?;
        }
        clock.advance(Duration::hours(1));
    }

    let mut preferred = BTreeMap::new();
    for mood in MOODS {
        let best = late
            .iter()
            .filter(|((m, _), _)| m == mood)
            .max_by_key(|(_, n)| **n)
            .map(|((_, arm), _)| arm.clone());
        if let Some(arm) = best {
            preferred.insert(mood.to_string(), arm);
        }
    }

    let stats = (0..identities)
        .map(|i| engine.get_stats(&format!("sim-{i}")))
        .collect();

    Ok(SimulationReport {
        seed,
        rounds,
        identities,
        clicks,
        selections,
        preferred,
        stats,
    })
}
