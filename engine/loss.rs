//! Censored binary likelihood.
//!
//! `event == 1` means the event happened at or before `time` (left-censored
//! observation), `event == 0` means it had not happened yet (right-censored). The
//! model's probability for the first case is `F(time; scale)`, so the likelihood
//! reduces to a binary log-loss between `event` and that probability.

use crate::distribution::DistributionStrategy;
use ndarray::{Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};

/// Probabilities are clamped into `[EPS, 1 - EPS]` before any logarithm.
pub const PROBABILITY_EPSILON: f64 = 1e-7;

/// How each instance's loss contribution is weighted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleWeighting {
    #[default]
    None,
    /// Weight each instance by its own observed `time`.
    Time,
}

impl SampleWeighting {
    #[inline]
    pub fn weight(self, time: f64) -> f64 {
        match self {
            SampleWeighting::None => 1.0,
            SampleWeighting::Time => time,
        }
    }
}

#[inline]
pub fn clamp_probability(p: f64) -> f64 {
    p.clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON)
}

/// Binary log-loss of `probability` against `label` in {0, 1}.
#[inline]
pub fn log_loss(label: f64, probability: f64) -> f64 {
    let p = clamp_probability(probability);
    -(label * p.ln() + (1.0 - label) * (1.0 - p).ln())
}

/// d log_loss / d probability, evaluated at the clamped probability.
#[inline]
pub fn log_loss_dprob(label: f64, probability: f64) -> f64 {
    let p = clamp_probability(probability);
    -(label / p) + (1.0 - label) / (1.0 - p)
}

/// Per-batch result of [`CensoredLikelihoodLoss::evaluate`].
#[derive(Debug, Clone)]
pub struct LikelihoodOutput {
    pub probability: Array1<f64>,
    pub predicted_event: Array1<u8>,
    /// Weighted per-instance losses.
    pub loss: Array1<f64>,
    pub weight: Array1<f64>,
    /// `sum(loss) / n`; zero for an empty batch.
    pub mean_loss: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct CensoredLikelihoodLoss {
    weighting: SampleWeighting,
    threshold: f64,
}

impl CensoredLikelihoodLoss {
    pub fn new(weighting: SampleWeighting, threshold: f64) -> Self {
        Self {
            weighting,
            threshold,
        }
    }

    pub fn weighting(&self) -> SampleWeighting {
        self.weighting
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn evaluate(
        &self,
        distribution: &dyn DistributionStrategy,
        scale: ArrayView1<'_, f64>,
        time: ArrayView1<'_, f64>,
        event: ArrayView1<'_, u8>,
    ) -> LikelihoodOutput {
        assert_eq!(scale.len(), time.len());
        assert_eq!(scale.len(), event.len());
        let n = scale.len();

        let probability = Zip::from(&time)
            .and(&scale)
            .map_collect(|&t, &s| distribution.left_censoring(t, s));
        let predicted_event = probability.mapv(|p| u8::from(p >= self.threshold));
        let weight = time.mapv(|t| self.weighting.weight(t));
        let loss = Zip::from(&event)
            .and(&probability)
            .and(&weight)
            .map_collect(|&e, &p, &w| w * log_loss(f64::from(e), p));
        let mean_loss = if n == 0 { 0.0 } else { loss.sum() / n as f64 };

        LikelihoodOutput {
            probability,
            predicted_event,
            loss,
            weight,
            mean_loss,
        }
    }

    /// Derivative of the batch mean loss with respect to each instance's scale.
    pub fn scale_gradient(
        &self,
        distribution: &dyn DistributionStrategy,
        scale: ArrayView1<'_, f64>,
        time: ArrayView1<'_, f64>,
        event: ArrayView1<'_, u8>,
    ) -> Array1<f64> {
        let n = scale.len();
        if n == 0 {
            return Array1::zeros(0);
        }
        let inv_n = 1.0 / n as f64;
        Zip::from(&scale)
            .and(&time)
            .and(&event)
            .map_collect(|&s, &t, &e| {
                let p = distribution.left_censoring(t, s);
                let dp = distribution.left_censoring_dscale(t, s);
                self.weighting.weight(t) * log_loss_dprob(f64::from(e), p) * dp * inv_n
            })
    }
}

/// Per-pass accumulator for mean loss and accuracy. A fresh one is created for
/// every training, validation or test pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningMetrics {
    loss_sum: f64,
    instances: usize,
    correct_weight: f64,
    total_weight: f64,
}

impl RunningMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, output: &LikelihoodOutput, event: ArrayView1<'_, u8>) {
        self.loss_sum += output.loss.sum();
        self.instances += output.loss.len();
        for ((&predicted, &actual), &w) in output
            .predicted_event
            .iter()
            .zip(event.iter())
            .zip(output.weight.iter())
        {
            if predicted == actual {
                self.correct_weight += w;
            }
            self.total_weight += w;
        }
    }

    pub fn instances(&self) -> usize {
        self.instances
    }

    pub fn mean_loss(&self) -> f64 {
        if self.instances == 0 {
            0.0
        } else {
            self.loss_sum / self.instances as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.total_weight == 0.0 {
            0.0
        } else {
            self.correct_weight / self.total_weight
        }
    }
}
