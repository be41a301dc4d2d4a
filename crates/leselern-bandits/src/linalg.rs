//! Dichte lineare Algebra für kleine symmetrische Matrizen (d ≈ 44).
//!
//! Matrizen werden zeilenweise in einem flachen `Vec<f64>` gehalten und als
//! verschachtelte Arrays (`[[..], ..]`) serialisiert.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Untergrenze für den Nenner der Sherman-Morrison-Formel.
const MIN_DENOMINATOR: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinalgError {
    #[error("matrix is not positive definite (pivot {pivot} = {value})")]
    NotPositiveDefinite { pivot: usize, value: f64 },
    #[error("rank-1 update is degenerate (denominator {0})")]
    DegenerateUpdate(f64),
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>", into = "Vec<Vec<f64>>")]
pub struct Matrix {
    dim: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(dim: usize) -> Self {
        Self {
            dim,
            data: vec![0.0; dim * dim],
        }
    }

    /// `scale · I`
    pub fn scaled_identity(dim: usize, scale: f64) -> Self {
        let mut m = Self::zeros(dim);
        for i in 0..dim {
            m.data[i * dim + i] = scale;
        }
        m
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.dim + j]
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    pub fn mat_vec(&self, x: &[f64]) -> Vec<f64> {
        (0..self.dim).map(|i| dot(self.row(i), x)).collect()
    }

    /// `xᵀ M x`
    pub fn quad_form(&self, x: &[f64]) -> f64 {
        dot(x, &self.mat_vec(x))
    }

    /// `M ← M + scale · x xᵀ`
    pub fn add_outer(&mut self, x: &[f64], scale: f64) {
        let d = self.dim;
        for i in 0..d {
            let xi = x[i] * scale;
            if xi == 0.0 {
                continue;
            }
            for j in 0..d {
                self.data[i * d + j] += xi * x[j];
            }
        }
    }

    /// `M ← M + scale · other`
    pub fn add_scaled(&mut self, other: &Matrix, scale: f64) -> Result<(), LinalgError> {
        if other.dim != self.dim {
            return Err(LinalgError::DimensionMismatch {
                expected: self.dim,
                got: other.dim,
            });
        }
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += scale * b;
        }
        Ok(())
    }

    /// Rang-1-Update einer inversen Matrix nach Sherman-Morrison.
    ///
    /// `self` ist `A⁻¹`; danach gilt `self = (A + x xᵀ)⁻¹`:
    /// `A⁻¹ ← A⁻¹ − (A⁻¹x)(A⁻¹x)ᵀ / (1 + xᵀA⁻¹x)`.
    /// Bei einem Fehler bleibt `self` unverändert.
    pub fn sherman_morrison(&mut self, x: &[f64]) -> Result<(), LinalgError> {
        if x.len() != self.dim {
            return Err(LinalgError::DimensionMismatch {
                expected: self.dim,
                got: x.len(),
            });
        }
        let u = self.mat_vec(x);
        let denom = 1.0 + dot(x, &u);
        if !denom.is_finite() || denom < MIN_DENOMINATOR {
            return Err(LinalgError::DegenerateUpdate(denom));
        }
        let d = self.dim;
        let mut updated = self.data.clone();
        for i in 0..d {
            let ui = u[i] / denom;
            if ui == 0.0 {
                continue;
            }
            for j in 0..d {
                updated[i * d + j] -= ui * u[j];
            }
        }
        if !updated.iter().all(|v| v.is_finite()) {
            return Err(LinalgError::NonFinite("inverse after rank-1 update"));
        }
        self.data = updated;
        Ok(())
    }

    /// Inverse einer symmetrisch positiv definiten Matrix über Cholesky.
    ///
    /// Schlägt fehl, wenn die Matrix nicht positiv definit ist.
    pub fn cholesky_inverse(&self) -> Result<Matrix, LinalgError> {
        let d = self.dim;
        if !self.is_finite() {
            return Err(LinalgError::NonFinite("matrix"));
        }
        // L Lᵀ = A
        let mut l = vec![0.0; d * d];
        for i in 0..d {
            for j in 0..=i {
                let mut s = self.data[i * d + j];
                for k in 0..j {
                    s -= l[i * d + k] * l[j * d + k];
                }
                if i == j {
                    if s.is_nan() || s <= 0.0 {
                        return Err(LinalgError::NotPositiveDefinite { pivot: i, value: s });
                    }
                    l[i * d + i] = s.sqrt();
                } else {
                    l[i * d + j] = s / l[j * d + j];
                }
            }
        }

        // Spaltenweise L y = e_c, dann Lᵀ z = y.
        let mut inv = Matrix::zeros(d);
        let mut y = vec![0.0; d];
        for c in 0..d {
            for i in 0..d {
                let mut s = if i == c { 1.0 } else { 0.0 };
                for k in 0..i {
                    s -= l[i * d + k] * y[k];
                }
                y[i] = s / l[i * d + i];
            }
            for i in (0..d).rev() {
                let mut s = y[i];
                for k in i + 1..d {
                    s -= l[k * d + i] * inv.data[k * d + c];
                }
                inv.data[i * d + c] = s / l[i * d + i];
            }
        }
        if !inv.is_finite() {
            return Err(LinalgError::NonFinite("cholesky inverse"));
        }
        Ok(inv)
    }

    pub fn max_abs_diff(&self, other: &Matrix) -> f64 {
        if self.dim != other.dim {
            return f64::INFINITY;
        }
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

impl TryFrom<Vec<Vec<f64>>> for Matrix {
    type Error = String;

    fn try_from(rows: Vec<Vec<f64>>) -> Result<Self, Self::Error> {
        let dim = rows.len();
        let mut data = Vec::with_capacity(dim * dim);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != dim {
                return Err(format!(
                    "matrix row {i} has {} entries, expected {dim}",
                    row.len()
                ));
            }
            data.extend(row);
        }
        Ok(Self { dim, data })
    }
}

impl From<Matrix> for Vec<Vec<f64>> {
    fn from(m: Matrix) -> Self {
        if m.dim == 0 {
            return Vec::new();
        }
        m.data.chunks(m.dim).map(<[f64]>::to_vec).collect()
    }
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `y ← y + a·x`
pub fn axpy(y: &mut [f64], a: f64, x: &[f64]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += a * xi;
    }
}
