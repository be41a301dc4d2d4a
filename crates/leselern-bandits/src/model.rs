//! Lernzustand eines Arms für eine Identität.

use leselern_core::CONTEXT_DIM;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BanditError, Result};
use crate::linalg::{axpy, Matrix};

/// LinUCB-Zustand für den Schlüssel (Identität, Arm).
///
/// Invariante: `a` ist symmetrisch positiv definit und `a_inv` ist ihre
/// Inverse. `a_inv` wird inkrementell gepflegt und mitgespeichert; fehlt sie
/// in einem Datensatz, wird sie einmalig per Cholesky aus `a` rekonstruiert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanditModel {
    pub identity: String,
    pub arm_id: String,
    pub theta: Vec<f64>,
    #[serde(rename = "A")]
    pub a: Matrix,
    #[serde(rename = "AInv", default)]
    pub(crate) a_inv: Matrix,
    pub b: Vec<f64>,
    pub interaction_count: u64,
    pub total_reward: f64,
    pub average_reward: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
}

impl BanditModel {
    /// Frisches Modell: `A = λI`, `b = 0`, `θ = 0`.
    pub fn fresh(identity: impl Into<String>, arm_id: impl Into<String>, lambda: f64) -> Self {
        Self {
            identity: identity.into(),
            arm_id: arm_id.into(),
            theta: vec![0.0; CONTEXT_DIM],
            a: Matrix::scaled_identity(CONTEXT_DIM, lambda),
            a_inv: Matrix::scaled_identity(CONTEXT_DIM, 1.0 / lambda),
            b: vec![0.0; CONTEXT_DIM],
            interaction_count: 0,
            total_reward: 0.0,
            average_reward: 0.0,
            last_updated: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.theta.len()
    }

    pub fn a_inv(&self) -> &Matrix {
        &self.a_inv
    }

    pub fn is_fresh(&self) -> bool {
        self.interaction_count == 0
    }

    /// Liest einen gespeicherten Datensatz und prüft Form und Werte.
    ///
    /// Jeder Defekt ergibt [`BanditError::Configuration`].
    pub fn from_json(record: &str) -> Result<Self> {
        let mut model: BanditModel = serde_json::from_str(record)
            .map_err(|e| BanditError::Configuration(e.to_string()))?;
        model.validate()?;
        if model.a_inv.dim() != CONTEXT_DIM || !model.a_inv.is_finite() {
            model.a_inv = model
                .a
                .cholesky_inverse()
                .map_err(|e| BanditError::Configuration(format!("A is not invertible: {e}")))?;
        }
        Ok(model)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(&self) -> Result<()> {
        let shape_ok = self.theta.len() == CONTEXT_DIM
            && self.b.len() == CONTEXT_DIM
            && self.a.dim() == CONTEXT_DIM;
        if !shape_ok {
            return Err(BanditError::Configuration(format!(
                "expected dimension {CONTEXT_DIM}, got theta={} b={} A={}",
                self.theta.len(),
                self.b.len(),
                self.a.dim()
            )));
        }
        let finite = self.theta.iter().chain(&self.b).all(|v| v.is_finite())
            && self.a.is_finite()
            && self.total_reward.is_finite()
            && self.average_reward.is_finite();
        if !finite {
            return Err(BanditError::Configuration(
                "record contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }

    /// Führt zwei Modelle desselben Arms zusammen, indem die suffizienten
    /// Statistiken addiert werden: `A = A₁ + A₂ − λI`, `b = b₁ + b₂`.
    ///
    /// Das Ergebnis entspricht einem Modell, das beide Historien gesehen hat.
    /// Identität und Arm stammen von `self`.
    pub fn merged_with(&self, other: &BanditModel, lambda: f64) -> Result<BanditModel> {
        let mut a = self.a.clone();
        a.add_scaled(&other.a, 1.0)?;
        a.add_scaled(&Matrix::scaled_identity(a.dim(), lambda), -1.0)?;
        let a_inv = a.cholesky_inverse()?;

        let mut b = self.b.clone();
        axpy(&mut b, 1.0, &other.b);
        let theta = a_inv.mat_vec(&b);

        let interaction_count = self.interaction_count + other.interaction_count;
        let total_reward = self.total_reward + other.total_reward;
        Ok(BanditModel {
            identity: self.identity.clone(),
            arm_id: self.arm_id.clone(),
            theta,
            a,
            a_inv,
            b,
            interaction_count,
            total_reward,
            average_reward: average(total_reward, interaction_count),
            last_updated: self.last_updated.max(other.last_updated),
        })
    }
}

pub(crate) fn average(total: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        {
            total / count as f64
        }
    }
}
