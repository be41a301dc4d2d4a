//! Example walking one reader through select, impression and action.
//!
//! Shows how a save shortly after an impression is credited to the strategy
//! that produced the recommendation and how the next selection reflects it.
//!
//! Run with: cargo run -p leselern-feedback --example reading_session

use leselern_bandits::MemoryBackend;
use leselern_core::{Context, FixedClock};
use leselern_feedback::{ActionType, EngineConfig, MemorySignalLog, RecommendationEngine};
use std::error::Error;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

fn main() -> Result<(), Box<dyn Error>> {
    println!("=== leselern: Reading Session ===\n");

    let clock = Arc::new(FixedClock::new(OffsetDateTime::now_utc()));
    let engine = RecommendationEngine::builder(EngineConfig::default())
        .clock(clock.clone())
        .build(Arc::new(MemoryBackend::new()), Arc::new(MemorySignalLog::new()))?;

    let reader = "reader-42";
    let ctx = Context::with_mood("curious");

    for round in 1..=3 {
        let choice = engine.select_strategy(&ctx, reader);
        println!(
            "Round {round}: {} (predicted {:.3}, bonus {:.3})",
            choice.arm_id, choice.predicted_reward, choice.exploration_bonus
        );
        println!("  {}", choice.explanation);

        let book = format!("book-{round}");
        engine.record_impression(reader, &book, &ctx, &choice.arm_id, 1, choice.predicted_reward)?;
        clock.advance(Duration::minutes(10));

        let report = engine.record_action(reader, &book, ActionType::Save, None)?;
        for outcome in &report.outcomes {
            println!("  → credited {:.3} to {}", outcome.reward, outcome.arm_id);
        }
        clock.advance(Duration::hours(2));
    }

    let stats = engine.get_stats(reader);
    println!("\n📈 {} interactions, best arm: {:?}", stats.total_interactions, stats.best_arm);
    for arm in stats.per_arm.iter().filter(|a| a.interactions > 0) {
        println!(
            "  {} → n={}, avg={:.3}, confidence={:.2}",
            arm.arm_id, arm.interactions, arm.average_reward, arm.confidence
        );
    }

    Ok(())
}
