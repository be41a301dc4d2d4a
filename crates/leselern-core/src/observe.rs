//! Strukturierte Diagnose-Ereignisse der Engine.
//!
//! Statt verstreuter Konsolenausgaben meldet jede Komponente ihre Ereignisse
//! an einen injizierten [`Observer`]. Der Standard ist [`TracingObserver`].

use std::fmt;

use serde::Serialize;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    ArmSelected {
        identity: String,
        arm_id: String,
        ucb: f64,
        predicted_reward: f64,
        exploration_bonus: f64,
        cold_start: bool,
    },
    /// Alle Arme sind ausgefallen; der Fallback-Arm wurde mit Konfidenz 0 gewählt.
    FallbackUsed {
        identity: String,
        arm_id: String,
        reason: String,
    },
    ModelUpdated {
        identity: String,
        arm_id: String,
        reward: f64,
        interactions: u64,
        average_reward: f64,
    },
    /// Lesefehler oder defekter Datensatz; es wurde ein frisches Modell verwendet.
    ModelLoadDegraded {
        identity: String,
        arm_id: String,
        reason: String,
    },
    ComputationFailed {
        identity: String,
        arm_id: String,
        reason: String,
    },
    PersistenceFailed {
        identity: String,
        arm_id: String,
        reason: String,
    },
    ModelReset {
        identity: String,
        arm_id: Option<String>,
    },
    ImpressionRecorded {
        identity: String,
        impression_id: String,
        book_id: String,
        arm_id: String,
    },
    RewardAttributed {
        identity: String,
        impression_id: String,
        arm_id: String,
        reward: f64,
    },
    AttributionMiss {
        identity: String,
        book_id: String,
        action_type: String,
    },
    ArmAliased {
        legacy: String,
        current: String,
    },
    UnknownArmSkipped {
        impression_id: String,
        arm_id: String,
    },
    IdentityMigrated {
        from: String,
        to: String,
        models: usize,
        signals: usize,
    },
}

pub trait Observer: Send + Sync + fmt::Debug {
    fn on_event(&self, event: &EngineEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn on_event(&self, _event: &EngineEvent) {}
}

/// Leitet Ereignisse als strukturierte `tracing`-Events weiter.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::ArmSelected {
                identity,
                arm_id,
                ucb,
                predicted_reward,
                exploration_bonus,
                cold_start,
            } => debug!(
                %identity,
                arm = %arm_id,
                ucb,
                predicted_reward,
                exploration_bonus,
                cold_start,
                "arm selected"
            ),
            EngineEvent::FallbackUsed {
                identity,
                arm_id,
                reason,
            } => warn!(%identity, arm = %arm_id, %reason, "falling back to default arm"),
            EngineEvent::ModelUpdated {
                identity,
                arm_id,
                reward,
                interactions,
                average_reward,
            } => debug!(
                %identity,
                arm = %arm_id,
                reward,
                interactions,
                average_reward,
                "model updated"
            ),
            EngineEvent::ModelLoadDegraded {
                identity,
                arm_id,
                reason,
            } => warn!(%identity, arm = %arm_id, %reason, "model load degraded to default"),
            EngineEvent::ComputationFailed {
                identity,
                arm_id,
                reason,
            } => warn!(%identity, arm = %arm_id, %reason, "bandit computation failed"),
            EngineEvent::PersistenceFailed {
                identity,
                arm_id,
                reason,
            } => error!(%identity, arm = %arm_id, %reason, "failed to persist model"),
            EngineEvent::ModelReset { identity, arm_id } => {
                info!(%identity, arm = ?arm_id, "model reset");
            }
            EngineEvent::ImpressionRecorded {
                identity,
                impression_id,
                book_id,
                arm_id,
            } => debug!(
                %identity,
                %impression_id,
                book = %book_id,
                arm = %arm_id,
                "impression recorded"
            ),
            EngineEvent::RewardAttributed {
                identity,
                impression_id,
                arm_id,
                reward,
            } => debug!(
                %identity,
                %impression_id,
                arm = %arm_id,
                reward,
                "reward attributed"
            ),
            EngineEvent::AttributionMiss {
                identity,
                book_id,
                action_type,
            } => debug!(
                %identity,
                book = %book_id,
                %action_type,
                "no impression matched action"
            ),
            EngineEvent::ArmAliased { legacy, current } => {
                debug!(%legacy, %current, "legacy arm id translated");
            }
            EngineEvent::UnknownArmSkipped {
                impression_id,
                arm_id,
            } => warn!(%impression_id, arm = %arm_id, "impression references unknown arm"),
            EngineEvent::IdentityMigrated {
                from,
                to,
                models,
                signals,
            } => info!(%from, %to, models, signals, "identity migrated"),
        }
    }
}
