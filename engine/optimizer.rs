//! Adam with global-norm gradient clipping.
//!
//! Update per parameter:
//! ```text
//! m = beta1 * m + (1 - beta1) * g
//! v = beta2 * v + (1 - beta2) * g^2
//! theta -= lr * (m / (1 - beta1^t)) / (sqrt(v / (1 - beta2^t)) + epsilon)
//! ```

use crate::model::{ModelGradients, ScoringModel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl AdamConfig {
    pub fn with_learning_rate(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            ..Self::default()
        }
    }
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Moments {
    m: Vec<f64>,
    v: Vec<f64>,
}

impl Moments {
    fn ensure_len(&mut self, len: usize) {
        if self.m.len() != len {
            self.m = vec![0.0; len];
            self.v = vec![0.0; len];
        }
    }
}

/// Adam state for the three parameter blocks of a [`ScoringModel`].
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    linear: Moments,
    intercept: Moments,
    factors: Moments,
    t: u64,
}

impl Adam {
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            linear: Moments::default(),
            intercept: Moments::default(),
            factors: Moments::default(),
            t: 0,
        }
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    pub fn timestep(&self) -> u64 {
        self.t
    }

    /// Applies one update to every parameter of `model`.
    pub fn step(&mut self, model: &mut ScoringModel, grads: &ModelGradients) {
        self.t += 1;
        let bias1 = 1.0 - self.config.beta1.powi(self.t as i32);
        let bias2 = 1.0 - self.config.beta2.powi(self.t as i32);
        let config = self.config;
        let params = model.parameters_mut();

        let mut linear = params.linear;
        assert_eq!(linear.len(), grads.linear.len());
        update_block(
            &config,
            bias1,
            bias2,
            &mut self.linear,
            linear.iter_mut(),
            grads.linear.iter().copied(),
            grads.linear.len(),
        );
        update_block(
            &config,
            bias1,
            bias2,
            &mut self.intercept,
            std::iter::once(params.intercept),
            std::iter::once(grads.intercept),
            1,
        );
        if let (Some(mut factors), Some(d_factors)) = (params.factors, grads.factors.as_ref()) {
            assert_eq!(factors.dim(), d_factors.dim());
            update_block(
                &config,
                bias1,
                bias2,
                &mut self.factors,
                factors.iter_mut(),
                d_factors.iter().copied(),
                d_factors.len(),
            );
        }
    }
}

fn update_block<'a>(
    config: &AdamConfig,
    bias1: f64,
    bias2: f64,
    moments: &mut Moments,
    params: impl Iterator<Item = &'a mut f64>,
    grads: impl Iterator<Item = f64>,
    len: usize,
) {
    moments.ensure_len(len);
    for (i, (theta, g)) in params.zip(grads).enumerate() {
        moments.m[i] = config.beta1 * moments.m[i] + (1.0 - config.beta1) * g;
        moments.v[i] = config.beta2 * moments.v[i] + (1.0 - config.beta2) * g * g;
        let m_hat = moments.m[i] / bias1;
        let v_hat = moments.v[i] / bias2;
        *theta -= config.learning_rate * m_hat / (v_hat.sqrt() + config.epsilon);
    }
}

/// Rescales `grads` so their joint L2 norm is at most `clip_norm`. Returns the
/// norm before clipping.
pub fn clip_by_global_norm(grads: &mut ModelGradients, clip_norm: f64) -> f64 {
    let norm = grads.global_norm();
    if norm > clip_norm && norm.is_finite() {
        grads.scale_by(clip_norm / norm);
    }
    norm
}
