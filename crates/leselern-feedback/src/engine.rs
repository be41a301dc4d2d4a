//! The engine facade: strategy selection, signal recording, attribution
//! and learning behind one type.

use std::sync::Arc;

use leselern_bandits::{
    sample_confidence, BanditConfig, BanditError, LinUcb, ModelBackend, ModelStore, StoreConfig,
    UpdateOutcome,
};
use leselern_core::{
    ArmSet, Clock, Context, ContextEncoder, EncodedContext, EncoderConfig, EngineEvent, Observer,
    StrategyChoice, SystemClock, TracingObserver,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::attribution::{AttributionConfig, RewardAttributor};
use crate::error::Result;
use crate::log::SignalLog;
use crate::signals::{new_id, Action, ActionType, Impression};

/// Complete engine configuration. Missing fields fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub encoder: EncoderConfig,
    pub bandit: BanditConfig,
    pub attribution: AttributionConfig,
    pub store: StoreConfig,
}

/// Per-arm learning summary for one identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmStats {
    pub arm_id: String,
    pub interactions: u64,
    pub average_reward: f64,
    pub confidence: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub identity: String,
    pub total_interactions: u64,
    /// Arm with the highest average reward among arms with feedback.
    pub best_arm: Option<String>,
    pub per_arm: Vec<ArmStats>,
}

/// What happened to one matched impression during attribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CreditStatus {
    Applied { interactions: u64 },
    UnknownArm,
    /// Skipped during reprocessing because the impression already has a reward.
    AlreadyAttributed,
    Failed { reason: String },
    /// The impression carries the reward but the model did not learn from it.
    RecordedNotApplied { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditOutcome {
    pub impression_id: String,
    /// Arm the reward was credited to, after alias translation.
    pub arm_id: String,
    pub reward: f64,
    #[serde(flatten)]
    pub status: CreditStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributionReport {
    pub action_id: String,
    pub outcomes: Vec<CreditOutcome>,
}

impl AttributionReport {
    pub fn applied(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, CreditStatus::Applied { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o.status,
                    CreditStatus::Failed { .. } | CreditStatus::RecordedNotApplied { .. }
                )
            })
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessReport {
    pub actions: usize,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub models: usize,
    pub signals: usize,
}

/// Builder for [`RecommendationEngine`] with injectable clock and observer.
#[derive(Debug)]
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn Observer>,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(
        self,
        backend: Arc<dyn ModelBackend>,
        signals: Arc<dyn SignalLog>,
    ) -> Result<RecommendationEngine> {
        let EngineConfig {
            encoder,
            bandit,
            attribution,
            store,
        } = self.config;
        let lambda = bandit.lambda;
        let selector = LinUcb::new(bandit)?;
        let encoder = ContextEncoder::new(encoder);
        let attributor = RewardAttributor::new(attribution, encoder.clone())?;
        let store = ModelStore::new(
            backend,
            lambda,
            &store,
            Arc::clone(&self.clock),
            Arc::clone(&self.observer),
        );
        Ok(RecommendationEngine {
            encoder,
            selector,
            attributor,
            store,
            signals,
            clock: self.clock,
            observer: self.observer,
        })
    }
}

#[derive(Debug)]
pub struct RecommendationEngine {
    encoder: ContextEncoder,
    selector: LinUcb,
    attributor: RewardAttributor,
    store: ModelStore,
    signals: Arc<dyn SignalLog>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn Observer>,
}

impl RecommendationEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            clock: Arc::new(SystemClock),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn arms(&self) -> &ArmSet {
        self.selector.arms()
    }

    pub fn signals(&self) -> &Arc<dyn SignalLog> {
        &self.signals
    }

    pub fn encode(&self, ctx: &Context, identity: &str, at: OffsetDateTime) -> EncodedContext {
        self.encoder.encode(ctx, Some(identity), None, Some(at))
    }

    /// Picks the strategy to trust for this request. Never fails: when no
    /// arm can be scored the fallback arm is returned with confidence 0.
    pub fn select_strategy(&self, ctx: &Context, identity: &str) -> StrategyChoice {
        let x = self.encode(ctx, identity, self.clock.now());
        let models = self.store.load_all(identity, self.arms());
        let Some(selection) = self.selector.select_arm(&models, x.as_slice()) else {
            let arm_id = self.arms().fallback().to_string();
            self.observer.on_event(&EngineEvent::FallbackUsed {
                identity: identity.to_string(),
                arm_id: arm_id.clone(),
                reason: "no arm could be scored".to_string(),
            });
            return StrategyChoice {
                explanation: format!("fallback to '{arm_id}': no strategy could be scored"),
                arm_id,
                predicted_reward: 0.0,
                exploration_bonus: 0.0,
                confidence: 0.0,
            };
        };

        for (arm_id, reason) in &selection.failed {
            self.observer.on_event(&EngineEvent::ComputationFailed {
                identity: identity.to_string(),
                arm_id: arm_id.clone(),
                reason: reason.clone(),
            });
        }
        let p = selection.prediction;
        self.observer.on_event(&EngineEvent::ArmSelected {
            identity: identity.to_string(),
            arm_id: selection.arm_id.clone(),
            ucb: p.ucb,
            predicted_reward: p.predicted_reward,
            exploration_bonus: p.exploration_bonus,
            cold_start: selection.cold_start,
        });

        let explanation = if selection.cold_start {
            format!(
                "no feedback yet, exploring '{}' first ({})",
                selection.arm_id,
                ctx.describe()
            )
        } else {
            format!(
                "'{}' expects reward {:.3} with exploration bonus {:.3} for {}",
                selection.arm_id,
                p.predicted_reward,
                p.exploration_bonus,
                ctx.describe()
            )
        };
        StrategyChoice {
            arm_id: selection.arm_id,
            predicted_reward: p.predicted_reward,
            exploration_bonus: p.exploration_bonus,
            confidence: selection.confidence,
            explanation,
        }
    }

    pub fn record_impression(
        &self,
        identity: &str,
        book_id: &str,
        ctx: &Context,
        arm_id: &str,
        rank: u32,
        score: f64,
    ) -> Result<String> {
        let impression = Impression {
            id: new_id(),
            identity: identity.to_string(),
            book_id: book_id.to_string(),
            context: ctx.clone(),
            arm_id: arm_id.to_string(),
            rank,
            score,
            shown_at: self.clock.now(),
            reward: None,
            attributed_at: None,
        };
        self.signals.append_impression(&impression)?;
        self.observer.on_event(&EngineEvent::ImpressionRecorded {
            identity: impression.identity,
            impression_id: impression.id.clone(),
            book_id: impression.book_id,
            arm_id: impression.arm_id,
        });
        Ok(impression.id)
    }

    /// Records an action happening now and attributes it.
    pub fn record_action(
        &self,
        identity: &str,
        book_id: &str,
        action_type: ActionType,
        value: Option<f64>,
    ) -> Result<AttributionReport> {
        self.ingest_action(Action {
            id: new_id(),
            identity: identity.to_string(),
            book_id: book_id.to_string(),
            action_type,
            value,
            timestamp: self.clock.now(),
            context: None,
        })
    }

    /// Appends a fully specified action (e.g. from an event feed) and attributes it.
    pub fn ingest_action(&self, action: Action) -> Result<AttributionReport> {
        self.signals.append_action(&action)?;
        self.attribute(&action, false)
    }

    /// Credits `action` to its matching impressions.
    ///
    /// A failed update is reported per impression and does not stop the
    /// remaining ones. With `only_unattributed`, impressions that already
    /// carry a reward are skipped; the shares of the remaining ones are
    /// still computed over all matches.
    pub fn attribute(&self, action: &Action, only_unattributed: bool) -> Result<AttributionReport> {
        let (from, to) = self.attributor.window(action);
        let impressions =
            self.signals
                .impressions_for(&action.identity, &action.book_id, from, to)?;
        let credits = self.attributor.credits(action, &impressions);
        if credits.is_empty() {
            self.observer.on_event(&EngineEvent::AttributionMiss {
                identity: action.identity.clone(),
                book_id: action.book_id.clone(),
                action_type: action.action_type.to_string(),
            });
            return Ok(AttributionReport {
                action_id: action.id.clone(),
                outcomes: Vec::new(),
            });
        }

        let mut outcomes = Vec::with_capacity(credits.len());
        for credit in credits {
            let Some(imp) = impressions.iter().find(|i| i.id == credit.impression_id) else {
                continue;
            };
            if only_unattributed && imp.reward.is_some() {
                outcomes.push(CreditOutcome {
                    impression_id: imp.id.clone(),
                    arm_id: imp.arm_id.clone(),
                    reward: credit.reward,
                    status: CreditStatus::AlreadyAttributed,
                });
                continue;
            }
            let Some(arm_id) = self.arms().resolve(&imp.arm_id).map(str::to_string) else {
                self.observer.on_event(&EngineEvent::UnknownArmSkipped {
                    impression_id: imp.id.clone(),
                    arm_id: imp.arm_id.clone(),
                });
                outcomes.push(CreditOutcome {
                    impression_id: imp.id.clone(),
                    arm_id: imp.arm_id.clone(),
                    reward: credit.reward,
                    status: CreditStatus::UnknownArm,
                });
                continue;
            };
            if arm_id != imp.arm_id {
                self.observer.on_event(&EngineEvent::ArmAliased {
                    legacy: imp.arm_id.clone(),
                    current: arm_id.clone(),
                });
            }

            let status = self.credit_impression(imp, &arm_id, credit.reward, action.timestamp);
            outcomes.push(CreditOutcome {
                impression_id: imp.id.clone(),
                arm_id,
                reward: credit.reward,
                status,
            });
        }
        Ok(AttributionReport {
            action_id: action.id.clone(),
            outcomes,
        })
    }

    /// Records the reward on the impression, then trains the model.
    ///
    /// A model never learns from an impression that stays unattributed. When
    /// the update fails the previous reward is put back, so
    /// [`RecommendationEngine::reprocess`] picks the impression up again.
    fn credit_impression(
        &self,
        imp: &Impression,
        arm_id: &str,
        reward: f64,
        at: OffsetDateTime,
    ) -> CreditStatus {
        if let Err(e) = self.signals.set_reward(&imp.id, reward, self.clock.now()) {
            return CreditStatus::Failed {
                reason: e.to_string(),
            };
        }
        let x = self.encode(&imp.context, &imp.identity, imp.shown_at);
        match self.apply_update(&imp.identity, arm_id, &x, reward, at) {
            Ok(outcome) => {
                self.observer.on_event(&EngineEvent::RewardAttributed {
                    identity: imp.identity.clone(),
                    impression_id: imp.id.clone(),
                    arm_id: arm_id.to_string(),
                    reward,
                });
                CreditStatus::Applied {
                    interactions: outcome.interactions,
                }
            }
            Err(e) => {
                let rollback = match (imp.reward, imp.attributed_at) {
                    (Some(prev), Some(prev_at)) => self.signals.set_reward(&imp.id, prev, prev_at),
                    _ => self.signals.clear_reward(&imp.id),
                };
                match rollback {
                    Ok(()) => CreditStatus::Failed {
                        reason: e.to_string(),
                    },
                    Err(rollback_err) => {
                        warn!(
                            impression_id = %imp.id,
                            arm_id,
                            error = %rollback_err,
                            "reward recorded but model update failed"
                        );
                        CreditStatus::RecordedNotApplied {
                            reason: format!("{e}; rollback failed: {rollback_err}"),
                        }
                    }
                }
            }
        }
    }

    /// Direct learning step for `arm_id` in `ctx`, encoded at the current time.
    pub fn update_model(
        &self,
        arm_id: &str,
        ctx: &Context,
        reward: f64,
        identity: &str,
    ) -> Result<UpdateOutcome> {
        let arm_id = self.resolve_arm(arm_id)?;
        let now = self.clock.now();
        let x = self.encode(ctx, identity, now);
        Ok(self.apply_update(identity, &arm_id, &x, reward, now)?)
    }

    fn apply_update(
        &self,
        identity: &str,
        arm_id: &str,
        x: &EncodedContext,
        reward: f64,
        at: OffsetDateTime,
    ) -> std::result::Result<UpdateOutcome, BanditError> {
        let res = self.store.update_with(identity, arm_id, |model| {
            self.selector.update(model, x.as_slice(), reward, at)
        });
        match &res {
            Ok(outcome) => self.observer.on_event(&EngineEvent::ModelUpdated {
                identity: identity.to_string(),
                arm_id: arm_id.to_string(),
                reward,
                interactions: outcome.interactions,
                average_reward: outcome.new_average,
            }),
            Err(BanditError::Computation(e)) => {
                self.observer.on_event(&EngineEvent::ComputationFailed {
                    identity: identity.to_string(),
                    arm_id: arm_id.to_string(),
                    reason: e.to_string(),
                });
            }
            // Persistence failures are reported by the store.
            Err(_) => {}
        }
        res
    }

    pub fn get_stats(&self, identity: &str) -> EngineStats {
        let per_arm: Vec<ArmStats> = self
            .store
            .load_all(identity, self.arms())
            .into_iter()
            .map(|m| ArmStats {
                confidence: sample_confidence(m.interaction_count),
                arm_id: m.arm_id,
                interactions: m.interaction_count,
                average_reward: m.average_reward,
                last_updated: m.last_updated,
            })
            .collect();
        let total_interactions = per_arm.iter().map(|a| a.interactions).sum();
        let best_arm = per_arm
            .iter()
            .filter(|a| a.interactions > 0)
            .fold(None::<&ArmStats>, |best, a| match best {
                Some(b) if b.average_reward >= a.average_reward => Some(b),
                _ => Some(a),
            })
            .map(|a| a.arm_id.clone());
        EngineStats {
            identity: identity.to_string(),
            total_interactions,
            best_arm,
            per_arm,
        }
    }

    /// Deletes the models of one arm, or of all arms when `arm_id` is `None`.
    pub fn reset(&self, identity: &str, arm_id: Option<&str>) -> Result<usize> {
        let arm_id = arm_id.map(|a| self.resolve_arm(a)).transpose()?;
        Ok(self.store.reset(identity, arm_id.as_deref())?)
    }

    /// Moves models and signals of an anonymous identity to an authenticated one.
    pub fn migrate_identity(&self, from: &str, to: &str) -> Result<MigrationReport> {
        if from == to {
            return Ok(MigrationReport {
                models: 0,
                signals: 0,
            });
        }
        let models = self.store.migrate_identity(from, to)?;
        let signals = self.signals.rename_identity(from, to)?;
        self.observer.on_event(&EngineEvent::IdentityMigrated {
            from: from.to_string(),
            to: to.to_string(),
            models,
            signals,
        });
        Ok(MigrationReport { models, signals })
    }

    /// Re-attributes all actions in `[from, to]` to impressions that have no
    /// reward yet. Running it again over an overlapping window credits nothing twice.
    pub fn reprocess(&self, from: OffsetDateTime, to: OffsetDateTime) -> Result<ReprocessReport> {
        let mut report = ReprocessReport::default();
        for action in self.signals.actions_between(from, to)? {
            let res = self.attribute(&action, true)?;
            report.actions += 1;
            report.applied += res.applied();
            report.failed += res.failed();
            report.skipped += res.outcomes.len() - res.applied() - res.failed();
        }
        debug!(
            actions = report.actions,
            applied = report.applied,
            failed = report.failed,
            "reprocess finished"
        );
        Ok(report)
    }

    fn resolve_arm(&self, arm_id: &str) -> Result<String> {
        self.arms()
            .resolve(arm_id)
            .map(str::to_string)
            .ok_or_else(|| BanditError::UnknownArm(arm_id.to_string()).into())
    }
}
