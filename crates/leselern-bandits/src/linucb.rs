//! LinUCB-Auswahl zwischen Empfehlungsstrategien.
//!
//! Der Selektor entscheidet nur, *welcher* Strategie vertraut wird; die
//! eigentliche Bücherliste erzeugt ein nachgelagerter Scorer.

use leselern_core::{ArmSet, CONTEXT_DIM};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BanditError, Result};
use crate::linalg::{axpy, dot, LinalgError};
use crate::model::{average, BanditModel};

/// Stichprobengröße, ab der die Konfidenz eines Arms bei 1.0 liegt.
pub const CONFIDENCE_SAMPLE_SIZE_PLATEAU: f64 = 50.0;

/// Mindestabstand, ab dem ein UCB-Wert als echt größer gilt.
const TIE_EPSILON: f64 = 1e-12;

/// Globale Stellgrößen: Explorationskoeffizient α, Regularisierung λ und
/// der Armsatz in kanonischer Reihenfolge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    pub alpha: f64,
    pub lambda: f64,
    pub arms: ArmSet,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            lambda: 1.0,
            arms: ArmSet::default(),
        }
    }
}

impl BanditConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(BanditError::InvalidConfig(format!(
                "alpha must be finite and >= 0, got {}",
                self.alpha
            )));
        }
        if !self.lambda.is_finite() || self.lambda <= 0.0 {
            return Err(BanditError::InvalidConfig(format!(
                "lambda must be finite and > 0, got {}",
                self.lambda
            )));
        }
        if self.arms.is_empty() {
            return Err(BanditError::InvalidConfig("arm list is empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for id in self.arms.ids() {
            if id.trim().is_empty() {
                return Err(BanditError::InvalidConfig("arm id must not be empty".into()));
            }
            if !seen.insert(id) {
                return Err(BanditError::InvalidConfig(format!("duplicate arm id '{id}'")));
            }
        }
        for (legacy, target) in &self.arms.aliases {
            if !self.arms.contains(target) {
                return Err(BanditError::InvalidConfig(format!(
                    "alias '{legacy}' points to unknown arm '{target}'"
                )));
            }
        }
        if !self.arms.contains(self.arms.fallback()) {
            return Err(BanditError::InvalidConfig(format!(
                "fallback arm '{}' is not configured",
                self.arms.fallback()
            )));
        }
        Ok(())
    }
}

/// Vorhersage eines Arms für einen Kontext.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    /// `θ·x`
    pub predicted_reward: f64,
    /// `α·sqrt(xᵀA⁻¹x)`
    pub exploration_bonus: f64,
    pub ucb: f64,
}

/// Ergebnis von [`LinUcb::select_arm`].
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub arm_id: String,
    pub prediction: Prediction,
    /// Anteil der Unsicherheit, der für diesen Kontext bereits abgebaut ist.
    pub confidence: f64,
    /// Kein Arm hat bisher eine Interaktion gesehen.
    pub cold_start: bool,
    /// Vorhersagen aller bewertbaren Arme in kanonischer Reihenfolge.
    pub scores: Vec<(String, Prediction)>,
    /// Arme, deren Bewertung fehlschlug, mit Grund.
    pub failed: Vec<(String, String)>,
}

/// Ergebnis eines Lernschritts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub old_average: f64,
    pub new_average: f64,
    pub improvement: f64,
    pub confidence: f64,
    pub interactions: u64,
}

#[derive(Debug, Clone)]
pub struct LinUcb {
    config: BanditConfig,
}

impl LinUcb {
    pub fn new(config: BanditConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &BanditConfig {
        &self.config
    }

    pub fn arms(&self) -> &ArmSet {
        &self.config.arms
    }

    pub fn fresh_model(&self, identity: &str, arm_id: &str) -> BanditModel {
        BanditModel::fresh(identity, arm_id, self.config.lambda)
    }

    /// `predictedReward = θ·x`, `explorationBonus = α·sqrt(xᵀA⁻¹x)`.
    pub fn predict(&self, model: &BanditModel, x: &[f64]) -> Result<Prediction> {
        check_context(x)?;
        if model.dim() != x.len() || model.a_inv().dim() != x.len() {
            return Err(LinalgError::DimensionMismatch {
                expected: x.len(),
                got: model.dim(),
            }
            .into());
        }
        let predicted_reward = dot(&model.theta, x);
        let variance = model.a_inv().quad_form(x).max(0.0);
        let exploration_bonus = self.config.alpha * variance.sqrt();
        let ucb = predicted_reward + exploration_bonus;
        if !ucb.is_finite() {
            return Err(LinalgError::NonFinite("prediction").into());
        }
        Ok(Prediction {
            predicted_reward,
            exploration_bonus,
            ucb,
        })
    }

    /// Kontextbezogene Konfidenz: `1 − sqrt(xᵀA⁻¹x) / sqrt(xᵀx / λ)`.
    ///
    /// Ein frisches Modell hat Konfidenz 0, ein Nullkontext ebenfalls.
    pub fn confidence(&self, model: &BanditModel, x: &[f64]) -> f64 {
        let prior = dot(x, x) / self.config.lambda;
        if prior <= 0.0 || model.a_inv().dim() != x.len() {
            return 0.0;
        }
        let posterior = model.a_inv().quad_form(x).max(0.0);
        let c = 1.0 - (posterior / prior).sqrt();
        if c.is_finite() {
            c.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Wählt den Arm mit maximalem UCB.
    ///
    /// Arme ohne Modell in `models` gelten als frisch. Gleichstände gewinnt
    /// der in der Konfiguration zuerst gelistete Arm. Arme, deren Bewertung
    /// fehlschlägt, werden übersprungen; `None` nur wenn kein Arm bewertbar ist.
    pub fn select_arm(&self, models: &[BanditModel], x: &[f64]) -> Option<Selection> {
        let mut scores = Vec::with_capacity(self.config.arms.len());
        let mut failed = Vec::new();
        let mut best: Option<(usize, Prediction, f64)> = None;
        let mut cold_start = true;

        for arm_id in self.config.arms.ids() {
            let fresh;
            let model = match models.iter().find(|m| m.arm_id == arm_id) {
                Some(m) => m,
                None => {
                    fresh = self.fresh_model("", arm_id);
                    &fresh
                }
            };
            if !model.is_fresh() {
                cold_start = false;
            }
            match self.predict(model, x) {
                Ok(p) => {
                    let better = best
                        .as_ref()
                        .map_or(true, |(_, b, _)| p.ucb > b.ucb + TIE_EPSILON);
                    if better {
                        best = Some((scores.len(), p, self.confidence(model, x)));
                    }
                    scores.push((arm_id.to_string(), p));
                }
                Err(e) => failed.push((arm_id.to_string(), e.to_string())),
            }
        }

        let (idx, prediction, confidence) = best?;
        Some(Selection {
            arm_id: scores[idx].0.clone(),
            prediction,
            confidence,
            cold_start,
            scores,
            failed,
        })
    }

    /// Lernschritt: `A ← A + xxᵀ`, `b ← b + r·x`, `θ ← A⁻¹b`.
    ///
    /// `A⁻¹` wird per Sherman-Morrison fortgeschrieben. Schlägt die Rechnung
    /// fehl, bleibt `model` unverändert.
    pub fn update(
        &self,
        model: &mut BanditModel,
        x: &[f64],
        reward: f64,
        at: OffsetDateTime,
    ) -> Result<UpdateOutcome> {
        check_context(x)?;
        if !reward.is_finite() {
            return Err(LinalgError::NonFinite("reward").into());
        }
        if model.dim() != x.len() {
            return Err(LinalgError::DimensionMismatch {
                expected: model.dim(),
                got: x.len(),
            }
            .into());
        }

        let mut a_inv = model.a_inv.clone();
        a_inv.sherman_morrison(x)?;
        let mut b = model.b.clone();
        axpy(&mut b, reward, x);
        let theta = a_inv.mat_vec(&b);
        if !theta.iter().all(|v| v.is_finite()) {
            return Err(LinalgError::NonFinite("theta").into());
        }

        let old_average = model.average_reward;
        model.a.add_outer(x, 1.0);
        model.a_inv = a_inv;
        model.b = b;
        model.theta = theta;
        model.interaction_count = model.interaction_count.saturating_add(1);
        model.total_reward += reward;
        model.average_reward = average(model.total_reward, model.interaction_count);
        model.last_updated = Some(at);

        Ok(UpdateOutcome {
            old_average,
            new_average: model.average_reward,
            improvement: model.average_reward - old_average,
            confidence: sample_confidence(model.interaction_count),
            interactions: model.interaction_count,
        })
    }
}

/// Konfidenz aus der Stichprobengröße, unabhängig vom Kontext.
pub fn sample_confidence(interactions: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let n = interactions as f64;
    (n / CONFIDENCE_SAMPLE_SIZE_PLATEAU).min(1.0)
}

fn check_context(x: &[f64]) -> Result<()> {
    if x.len() != CONTEXT_DIM {
        return Err(LinalgError::DimensionMismatch {
            expected: CONTEXT_DIM,
            got: x.len(),
        }
        .into());
    }
    if !x.iter().all(|v| v.is_finite()) {
        return Err(LinalgError::NonFinite("context").into());
    }
    Ok(())
}
