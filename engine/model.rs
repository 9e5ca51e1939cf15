//! # Scoring Model
//!
//! Maps a padded sparse batch to one positive scale per instance:
//!
//! ```text
//! eta   = intercept + sum_j w[idx_j] * x_j
//!       + 0.5 * sum_f ((sum_j V[idx_j, f] x_j)^2 - sum_j (V[idx_j, f] x_j)^2)
//! scale = softplus(eta)
//! ```
//!
//! The factorized term is the usual factorization-machine identity, costing
//! `O(k * nnz)` per row. Padding slots carry value 0.0 and drop out of every sum.
//!
//! The gradient of a per-instance loss with respect to all parameters is computed
//! by [`ScoringModel::backward`]; there is no general autodiff here, only the
//! closed-form derivatives of this one function.

use crate::distribution::{Distribution, DistributionError, DistributionStrategy};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis};
use rand::Rng;
use rand_distr::{Distribution as _, Normal};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

const MIN_SCALE: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write parameter snapshot: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML parameter snapshot: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize parameter snapshot to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Snapshot names an invalid distribution: {0}")]
    Distribution(#[from] DistributionError),
    #[error(
        "Snapshot embedding matrix has {rows} rows but the linear weight vector has {expected} entries"
    )]
    EmbeddingShapeMismatch { rows: usize, expected: usize },
    #[error("Initial parameter standard deviation must be finite and non-negative, got {0}")]
    InvalidInitStddev(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringModel {
    linear: Array1<f64>,
    intercept: f64,
    /// Latent embeddings, shape `(num_features, k)`. `None` when `k == 0`.
    factors: Option<Array2<f64>>,
}

/// Forward-pass output retained for the backward pass.
#[derive(Debug, Clone)]
pub struct ScaleOutput {
    /// Pre-activation score `linear + factorized`.
    pub eta: Array1<f64>,
    pub scale: Array1<f64>,
}

/// Gradients mirroring the parameter layout of [`ScoringModel`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModelGradients {
    pub linear: Array1<f64>,
    pub intercept: f64,
    pub factors: Option<Array2<f64>>,
}

impl ModelGradients {
    pub fn global_norm(&self) -> f64 {
        let mut sum = self.linear.iter().map(|g| g * g).sum::<f64>();
        sum += self.intercept * self.intercept;
        if let Some(factors) = &self.factors {
            sum += factors.iter().map(|g| g * g).sum::<f64>();
        }
        sum.sqrt()
    }

    pub fn scale_by(&mut self, factor: f64) {
        self.linear.mapv_inplace(|g| g * factor);
        self.intercept *= factor;
        if let Some(factors) = &mut self.factors {
            factors.mapv_inplace(|g| g * factor);
        }
    }

    pub fn is_finite(&self) -> bool {
        self.intercept.is_finite()
            && self.linear.iter().all(|g| g.is_finite())
            && self
                .factors
                .as_ref()
                .is_none_or(|f| f.iter().all(|g| g.is_finite()))
    }
}

/// Mutable views over every trainable parameter, handed to the optimizer.
pub struct ParametersMut<'a> {
    pub linear: ArrayViewMut1<'a, f64>,
    pub intercept: &'a mut f64,
    pub factors: Option<ArrayViewMut2<'a, f64>>,
}

/// The persisted form of a trained model.
///
/// Scalars come first so the TOML encoder emits them before the array tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterSnapshot {
    pub distribution_name: String,
    pub distribution_shape: f64,
    pub intercept: f64,
    pub linear_weights: Array1<f64>,
    #[serde(default)]
    pub factorized_embeddings: Option<Array2<f64>>,
}

impl ParameterSnapshot {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let snapshot = toml::from_str(&toml_string)?;
        Ok(snapshot)
    }

    /// Rebuilds the scoring model and the distribution it was trained with.
    pub fn restore(&self) -> Result<(ScoringModel, Distribution), ModelError> {
        let distribution = Distribution::from_name(&self.distribution_name, self.distribution_shape)?;
        if let Some(factors) = &self.factorized_embeddings {
            if factors.nrows() != self.linear_weights.len() {
                return Err(ModelError::EmbeddingShapeMismatch {
                    rows: factors.nrows(),
                    expected: self.linear_weights.len(),
                });
            }
        }
        let model = ScoringModel {
            linear: self.linear_weights.clone(),
            intercept: self.intercept,
            factors: self
                .factorized_embeddings
                .clone()
                .filter(|f| f.ncols() > 0),
        };
        Ok((model, distribution))
    }
}

impl ScoringModel {
    /// All-zero parameters.
    pub fn zeros(num_features: usize, k: usize) -> Self {
        Self {
            linear: Array1::zeros(num_features),
            intercept: 0.0,
            factors: (k > 0).then(|| Array2::zeros((num_features, k))),
        }
    }

    /// Parameters drawn from a normal truncated at two standard deviations; the
    /// intercept starts at `stddev`.
    pub fn init_random<R: Rng + ?Sized>(
        num_features: usize,
        k: usize,
        stddev: f64,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        if !stddev.is_finite() || stddev < 0.0 {
            return Err(ModelError::InvalidInitStddev(stddev));
        }
        let normal =
            Normal::new(0.0, stddev).map_err(|_| ModelError::InvalidInitStddev(stddev))?;
        let mut draw = || loop {
            let sample: f64 = normal.sample(rng);
            if sample.abs() <= 2.0 * stddev {
                break sample;
            }
        };
        let linear = Array1::from_shape_simple_fn(num_features, &mut draw);
        let factors = (k > 0).then(|| Array2::from_shape_simple_fn((num_features, k), &mut draw));
        Ok(Self {
            linear,
            intercept: stddev,
            factors,
        })
    }

    pub fn from_parts(linear: Array1<f64>, intercept: f64, factors: Option<Array2<f64>>) -> Self {
        if let Some(f) = &factors {
            assert_eq!(f.nrows(), linear.len(), "embedding rows must match features");
        }
        Self {
            linear,
            intercept,
            factors: factors.filter(|f| f.ncols() > 0),
        }
    }

    #[inline]
    pub fn num_features(&self) -> usize {
        self.linear.len()
    }

    /// Factorization rank; 0 means a purely linear model.
    #[inline]
    pub fn k(&self) -> usize {
        self.factors.as_ref().map_or(0, |f| f.ncols())
    }

    pub fn linear_weights(&self) -> ArrayView1<'_, f64> {
        self.linear.view()
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn factors(&self) -> Option<ArrayView2<'_, f64>> {
        self.factors.as_ref().map(|f| f.view())
    }

    pub(crate) fn parameters_mut(&mut self) -> ParametersMut<'_> {
        ParametersMut {
            linear: self.linear.view_mut(),
            intercept: &mut self.intercept,
            factors: self.factors.as_mut().map(|f| f.view_mut()),
        }
    }

    pub fn snapshot(&self, distribution: &dyn DistributionStrategy) -> ParameterSnapshot {
        ParameterSnapshot {
            distribution_name: distribution.name().to_string(),
            distribution_shape: distribution.shape(),
            intercept: self.intercept,
            linear_weights: self.linear.clone(),
            factorized_embeddings: self.factors.clone(),
        }
    }

    /// `intercept + sum_j w[idx_j] * x_j` per row.
    pub fn linear_term(
        &self,
        indices: ArrayView2<'_, usize>,
        values: ArrayView2<'_, f64>,
    ) -> Array1<f64> {
        assert_eq!(indices.dim(), values.dim(), "index/value blocks differ in shape");
        indices
            .outer_iter()
            .zip(values.outer_iter())
            .map(|(idx, val)| {
                self.intercept
                    + idx
                        .iter()
                        .zip(val.iter())
                        .map(|(&j, &x)| self.linear[j] * x)
                        .sum::<f64>()
            })
            .collect()
    }

    /// Pairwise-interaction term per row; identically zero when `k == 0`.
    pub fn factorized_term(
        &self,
        indices: ArrayView2<'_, usize>,
        values: ArrayView2<'_, f64>,
    ) -> Array1<f64> {
        assert_eq!(indices.dim(), values.dim(), "index/value blocks differ in shape");
        let Some(factors) = &self.factors else {
            return Array1::zeros(indices.nrows());
        };
        let k = factors.ncols();
        let mut sums = vec![0.0; k];
        indices
            .outer_iter()
            .zip(values.outer_iter())
            .map(|(idx, val)| {
                sums.iter_mut().for_each(|s| *s = 0.0);
                let mut squares = 0.0;
                for (&j, &x) in idx.iter().zip(val.iter()) {
                    if x == 0.0 {
                        continue;
                    }
                    for (f, &v) in factors.row(j).iter().enumerate() {
                        let vx = v * x;
                        sums[f] += vx;
                        squares += vx * vx;
                    }
                }
                0.5 * (sums.iter().map(|s| s * s).sum::<f64>() - squares)
            })
            .collect()
    }

    pub fn forward(
        &self,
        indices: ArrayView2<'_, usize>,
        values: ArrayView2<'_, f64>,
    ) -> ScaleOutput {
        let mut eta = self.linear_term(indices, values);
        if self.factors.is_some() {
            eta += &self.factorized_term(indices, values);
        }
        let scale = eta.mapv(|z| softplus(z).max(MIN_SCALE));
        ScaleOutput { eta, scale }
    }

    /// Positive scale per instance.
    pub fn compute_scale(
        &self,
        indices: ArrayView2<'_, usize>,
        values: ArrayView2<'_, f64>,
    ) -> Array1<f64> {
        self.forward(indices, values).scale
    }

    /// Back-propagates `d_scale` (the derivative of the objective with respect to
    /// each instance's scale) to every parameter.
    pub fn backward(
        &self,
        indices: ArrayView2<'_, usize>,
        values: ArrayView2<'_, f64>,
        eta: ArrayView1<'_, f64>,
        d_scale: ArrayView1<'_, f64>,
    ) -> ModelGradients {
        assert_eq!(indices.nrows(), d_scale.len());
        assert_eq!(eta.len(), d_scale.len());
        let mut grads = ModelGradients {
            linear: Array1::zeros(self.linear.len()),
            intercept: 0.0,
            factors: self.factors.as_ref().map(|f| Array2::zeros(f.raw_dim())),
        };
        let k = self.k();
        let mut sums = vec![0.0; k];

        for (row, (idx, val)) in indices
            .axis_iter(Axis(0))
            .zip(values.axis_iter(Axis(0)))
            .enumerate()
        {
            let d_eta = d_scale[row] * sigmoid(eta[row]);
            if d_eta == 0.0 {
                continue;
            }
            grads.intercept += d_eta;
            for (&j, &x) in idx.iter().zip(val.iter()) {
                grads.linear[j] += d_eta * x;
            }

            if let (Some(factors), Some(d_factors)) = (&self.factors, &mut grads.factors) {
                sums.iter_mut().for_each(|s| *s = 0.0);
                for (&j, &x) in idx.iter().zip(val.iter()) {
                    for (f, &v) in factors.row(j).iter().enumerate() {
                        sums[f] += v * x;
                    }
                }
                for (&j, &x) in idx.iter().zip(val.iter()) {
                    if x == 0.0 {
                        continue;
                    }
                    for f in 0..k {
                        let v = factors[[j, f]];
                        d_factors[[j, f]] += d_eta * (x * sums[f] - v * x * x);
                    }
                }
            }
        }
        grads
    }

    /// `lambda_linear * |w|^2 + lambda_factorized * |V|^2`.
    pub fn l2_penalty(&self, lambda_linear: f64, lambda_factorized: f64) -> f64 {
        let mut penalty = lambda_linear * self.linear.iter().map(|w| w * w).sum::<f64>();
        if let Some(factors) = &self.factors {
            penalty += lambda_factorized * factors.iter().map(|v| v * v).sum::<f64>();
        }
        penalty
    }

    pub fn add_l2_gradient(
        &self,
        grads: &mut ModelGradients,
        lambda_linear: f64,
        lambda_factorized: f64,
    ) {
        if lambda_linear != 0.0 {
            grads.linear.scaled_add(2.0 * lambda_linear, &self.linear);
        }
        if let (Some(factors), Some(d_factors)) = (&self.factors, &mut grads.factors) {
            if lambda_factorized != 0.0 {
                d_factors.scaled_add(2.0 * lambda_factorized, factors);
            }
        }
    }
}

#[inline]
pub(crate) fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

#[inline]
pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}
