//! Converts reader actions into time-decayed rewards for earlier impressions.

use leselern_core::{similarity, ContextEncoder};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::{FeedbackError, Result};
use crate::signals::{Action, Impression};

/// How the recency bonus is spread over several impressions matched by one action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecencyPolicy {
    /// The most recent match is weighted by `recency_bonus`, the others by 1;
    /// weights are divided by their sum so one action never credits more
    /// than one full reward in total.
    #[default]
    Normalized,
    /// Every match is multiplied by `recency_bonus`.
    Unconditional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// How far back an action looks for impressions of the same book.
    pub lookback_hours: i64,
    /// Time constant of the exponential decay.
    pub decay_hours: f64,
    pub recency_bonus: f64,
    pub recency_policy: RecencyPolicy,
    /// Context match used when the action carries no context.
    pub default_context_match: f64,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            lookback_hours: 7 * 24,
            decay_hours: 48.0,
            recency_bonus: 1.1,
            recency_policy: RecencyPolicy::Normalized,
            default_context_match: 1.0,
        }
    }
}

impl AttributionConfig {
    pub fn lookback(&self) -> Duration {
        Duration::hours(self.lookback_hours)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lookback_hours <= 0 {
            return Err(FeedbackError::InvalidConfig(format!(
                "lookback_hours must be > 0, got {}",
                self.lookback_hours
            )));
        }
        if !self.decay_hours.is_finite() || self.decay_hours <= 0.0 {
            return Err(FeedbackError::InvalidConfig(format!(
                "decay_hours must be finite and > 0, got {}",
                self.decay_hours
            )));
        }
        if !self.recency_bonus.is_finite() || self.recency_bonus <= 0.0 {
            return Err(FeedbackError::InvalidConfig(format!(
                "recency_bonus must be finite and > 0, got {}",
                self.recency_bonus
            )));
        }
        if !(0.0..=1.0).contains(&self.default_context_match) {
            return Err(FeedbackError::InvalidConfig(format!(
                "default_context_match must lie in [0, 1], got {}",
                self.default_context_match
            )));
        }
        Ok(())
    }
}

/// Reward computed for one matched impression.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credit {
    pub impression_id: String,
    pub age_hours: f64,
    pub decay: f64,
    pub context_match: f64,
    pub recency_weight: f64,
    pub reward: f64,
}

#[derive(Debug, Clone)]
pub struct RewardAttributor {
    config: AttributionConfig,
    encoder: ContextEncoder,
}

impl RewardAttributor {
    pub fn new(config: AttributionConfig, encoder: ContextEncoder) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, encoder })
    }

    pub fn config(&self) -> &AttributionConfig {
        &self.config
    }

    /// Inclusive time range in which impressions can be credited for `action`.
    pub fn window(&self, action: &Action) -> (OffsetDateTime, OffsetDateTime) {
        (action.timestamp - self.config.lookback(), action.timestamp)
    }

    /// `base × exp(−Δh / decay_hours) × contextMatch × recencyWeight` for each
    /// impression of the same identity and book inside the window.
    pub fn credits(&self, action: &Action, impressions: &[Impression]) -> Vec<Credit> {
        let (from, to) = self.window(action);
        let matched: Vec<&Impression> = impressions
            .iter()
            .filter(|i| i.identity == action.identity && i.book_id == action.book_id)
            .filter(|i| i.shown_at >= from && i.shown_at <= to)
            .collect();
        if matched.is_empty() {
            return Vec::new();
        }

        let weights = self.recency_weights(&matched);
        let base = action.action_type.base_reward(action.value);
        matched
            .iter()
            .zip(weights)
            .map(|(imp, recency_weight)| {
                let age_hours = (action.timestamp - imp.shown_at).as_seconds_f64() / 3600.0;
                let decay = (-age_hours / self.config.decay_hours).exp();
                let context_match = self.context_match(action, imp);
                Credit {
                    impression_id: imp.id.clone(),
                    age_hours,
                    decay,
                    context_match,
                    recency_weight,
                    reward: base * decay * context_match * recency_weight,
                }
            })
            .collect()
    }

    fn recency_weights(&self, matched: &[&Impression]) -> Vec<f64> {
        let bonus = self.config.recency_bonus;
        match self.config.recency_policy {
            RecencyPolicy::Unconditional => vec![bonus; matched.len()],
            RecencyPolicy::Normalized => {
                let latest = matched
                    .iter()
                    .enumerate()
                    .fold(0, |best, (i, imp)| {
                        if imp.shown_at > matched[best].shown_at {
                            i
                        } else {
                            best
                        }
                    });
                #[allow(clippy::cast_precision_loss)]
                let total = bonus + (matched.len() - 1) as f64;
                (0..matched.len())
                    .map(|i| if i == latest { bonus / total } else { 1.0 / total })
                    .collect()
            }
        }
    }

    /// Cosine similarity of the semantic encodings, clamped to `[0, 1]`.
    ///
    /// Falls back to the configured default when the action has no context
    /// or either encoding is neutral.
    pub fn context_match(&self, action: &Action, impression: &Impression) -> f64 {
        let Some(ctx) = &action.context else {
            return self.config.default_context_match;
        };
        let a = self.encoder.encode(ctx, None, None, None);
        let b = self.encoder.encode(&impression.context, None, None, None);
        if a.is_zero() || b.is_zero() {
            return self.config.default_context_match;
        }
        similarity(a.as_slice(), b.as_slice()).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signals::ActionType;
    use leselern_core::Context;
    use time::macros::datetime;

    const SHOWN: OffsetDateTime = datetime!(2024-06-01 10:00 UTC);

    fn impression(id: &str, shown_at: OffsetDateTime, mood: &str) -> Impression {
        Impression {
            id: id.into(),
            identity: "reader".into(),
            book_id: "B1".into(),
            context: Context::with_mood(mood),
            arm_id: "mood_match".into(),
            rank: 1,
            score: 0.5,
            shown_at,
            reward: None,
            attributed_at: None,
        }
    }

    fn action(kind: ActionType, at: OffsetDateTime) -> Action {
        Action {
            id: "act".into(),
            identity: "reader".into(),
            book_id: "B1".into(),
            action_type: kind,
            value: None,
            timestamp: at,
            context: None,
        }
    }

    fn attributor(policy: RecencyPolicy) -> RewardAttributor {
        RewardAttributor::new(
            AttributionConfig {
                recency_policy: policy,
                ..AttributionConfig::default()
            },
            ContextEncoder::default(),
        )
        .expect("config")
    }

    #[test]
    fn single_click_after_one_hour_decays() {
        let credits = attributor(RecencyPolicy::Normalized).credits(
            &action(ActionType::Click, SHOWN + Duration::hours(1)),
            &[impression("i1", SHOWN, "curious")],
        );
        assert_eq!(credits.len(), 1);
        assert!((credits[0].reward - (-1.0f64 / 48.0).exp()).abs() < 1e-12);
        assert!((credits[0].age_hours - 1.0).abs() < 1e-12);
    }

    #[test]
    fn actions_outside_the_window_match_nothing() {
        let a = attributor(RecencyPolicy::Normalized);
        let imps = [impression("i1", SHOWN, "curious")];
        assert!(a
            .credits(&action(ActionType::Click, SHOWN + Duration::days(30)), &imps)
            .is_empty());
        assert!(a
            .credits(&action(ActionType::Click, SHOWN - Duration::minutes(1)), &imps)
            .is_empty());
    }

    #[test]
    fn normalized_recency_never_over_credits() {
        let at = SHOWN + Duration::hours(2);
        let imps = [
            impression("old", SHOWN, "curious"),
            impression("new", SHOWN + Duration::hours(1), "curious"),
        ];
        let credits = attributor(RecencyPolicy::Normalized).credits(&action(ActionType::Save, at), &imps);
        let weights: f64 = credits.iter().map(|c| c.recency_weight).sum();
        assert!((weights - 1.0).abs() < 1e-12);
        assert!(credits[1].recency_weight > credits[0].recency_weight);
        assert!((credits[1].recency_weight - 1.1 / 2.1).abs() < 1e-12);

        let literal = attributor(RecencyPolicy::Unconditional).credits(&action(ActionType::Save, at), &imps);
        assert!(literal.iter().all(|c| (c.recency_weight - 1.1).abs() < 1e-12));
    }

    #[test]
    fn action_context_scales_reward() {
        let a = attributor(RecencyPolicy::Normalized);
        let mut act = action(ActionType::Click, SHOWN + Duration::minutes(1));
        act.context = Some(Context::with_mood("curious"));
        let same = a.credits(&act, &[impression("i1", SHOWN, "curious")]);
        assert!((same[0].context_match - 1.0).abs() < 1e-9);

        act.context = Some(Context::with_mood("sad"));
        let other = a.credits(&act, &[impression("i1", SHOWN, "excited")]);
        assert!(other[0].context_match < 1.0);
        assert!(other[0].context_match >= 0.0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = AttributionConfig {
            decay_hours: 0.0,
            ..AttributionConfig::default()
        };
        assert!(matches!(
            RewardAttributor::new(cfg, ContextEncoder::default()),
            Err(FeedbackError::InvalidConfig(_))
        ));
    }
}
