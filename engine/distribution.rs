//! Parametric censoring families.
//!
//! Every family maps an observed value and a per-instance positive scale to the
//! probability that the event has occurred at or before that value. The shape is
//! fixed at construction; the scale comes from the scoring model.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("distribution family '{0}' requires a shape parameter")]
    MissingShape(String),
    #[error("distribution shape must be finite and positive, got {0}")]
    InvalidShape(f64),
    #[error("unknown distribution family '{0}'")]
    UnknownFamily(String),
}

/// The capability the likelihood and the regularizer need from a family.
pub trait DistributionStrategy: fmt::Debug + Send + Sync {
    /// Stable family name, stored in parameter snapshots.
    fn name(&self) -> &'static str;

    fn shape(&self) -> f64;

    /// P(T <= value | scale), always within [0, 1].
    fn left_censoring(&self, value: f64, scale: f64) -> f64;

    /// Partial derivative of [`left_censoring`](Self::left_censoring) with respect
    /// to `scale`.
    fn left_censoring_dscale(&self, value: f64, scale: f64) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogLogistic {
    shape: f64,
}

impl LogLogistic {
    pub fn new(shape: f64) -> Result<Self, DistributionError> {
        Ok(Self {
            shape: checked_shape(shape)?,
        })
    }

    #[inline]
    fn logit(&self, value: f64, scale: f64) -> f64 {
        self.shape * (value.ln() - scale.ln())
    }
}

impl DistributionStrategy for LogLogistic {
    fn name(&self) -> &'static str {
        "log_logistic"
    }

    fn shape(&self) -> f64 {
        self.shape
    }

    fn left_censoring(&self, value: f64, scale: f64) -> f64 {
        if value <= 0.0 {
            return 0.0;
        }
        sigmoid(self.logit(value, scale))
    }

    fn left_censoring_dscale(&self, value: f64, scale: f64) -> f64 {
        if value <= 0.0 {
            return 0.0;
        }
        let p = sigmoid(self.logit(value, scale));
        -p * (1.0 - p) * self.shape / scale
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weibull {
    shape: f64,
}

impl Weibull {
    pub fn new(shape: f64) -> Result<Self, DistributionError> {
        Ok(Self {
            shape: checked_shape(shape)?,
        })
    }

    #[inline]
    fn cumulative_hazard(&self, value: f64, scale: f64) -> f64 {
        (self.shape * (value.ln() - scale.ln())).exp()
    }
}

impl DistributionStrategy for Weibull {
    fn name(&self) -> &'static str {
        "weibull"
    }

    fn shape(&self) -> f64 {
        self.shape
    }

    fn left_censoring(&self, value: f64, scale: f64) -> f64 {
        if value <= 0.0 {
            return 0.0;
        }
        let hazard = self.cumulative_hazard(value, scale);
        (-(-hazard).exp_m1()).clamp(0.0, 1.0)
    }

    fn left_censoring_dscale(&self, value: f64, scale: f64) -> f64 {
        if value <= 0.0 {
            return 0.0;
        }
        let hazard = self.cumulative_hazard(value, scale);
        if !hazard.is_finite() {
            return 0.0;
        }
        -(-hazard).exp() * self.shape * hazard / scale
    }
}

/// Gumbel (maximum) family with the scale acting as location and the shape as
/// spread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gumbel {
    shape: f64,
}

impl Gumbel {
    pub fn new(shape: f64) -> Result<Self, DistributionError> {
        Ok(Self {
            shape: checked_shape(shape)?,
        })
    }

    #[inline]
    fn inner(&self, value: f64, scale: f64) -> f64 {
        (-(value - scale) / self.shape).exp()
    }
}

impl DistributionStrategy for Gumbel {
    fn name(&self) -> &'static str {
        "gumbel"
    }

    fn shape(&self) -> f64 {
        self.shape
    }

    fn left_censoring(&self, value: f64, scale: f64) -> f64 {
        (-self.inner(value, scale)).exp().clamp(0.0, 1.0)
    }

    fn left_censoring_dscale(&self, value: f64, scale: f64) -> f64 {
        let w = self.inner(value, scale);
        let p = (-w).exp();
        if p == 0.0 || !w.is_finite() {
            return 0.0;
        }
        -p * w / self.shape
    }
}

/// Closed set of supported families, selected at model-construction time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distribution {
    LogLogistic(LogLogistic),
    Weibull(Weibull),
    Gumbel(Gumbel),
}

impl Distribution {
    /// Rebuilds a family from the name and shape stored in a snapshot.
    pub fn from_name(name: &str, shape: f64) -> Result<Self, DistributionError> {
        match name {
            "log_logistic" => Ok(Self::LogLogistic(LogLogistic::new(shape)?)),
            "weibull" => Ok(Self::Weibull(Weibull::new(shape)?)),
            "gumbel" => Ok(Self::Gumbel(Gumbel::new(shape)?)),
            other => Err(DistributionError::UnknownFamily(other.to_string())),
        }
    }

    fn inner(&self) -> &dyn DistributionStrategy {
        match self {
            Self::LogLogistic(d) => d,
            Self::Weibull(d) => d,
            Self::Gumbel(d) => d,
        }
    }
}

impl DistributionStrategy for Distribution {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn shape(&self) -> f64 {
        self.inner().shape()
    }

    #[inline]
    fn left_censoring(&self, value: f64, scale: f64) -> f64 {
        self.inner().left_censoring(value, scale)
    }

    #[inline]
    fn left_censoring_dscale(&self, value: f64, scale: f64) -> f64 {
        self.inner().left_censoring_dscale(value, scale)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionFamily {
    LogLogistic,
    Weibull,
    Gumbel,
}

/// Configuration-side description of a family. The shape is optional here so a
/// missing value can be reported with the family name instead of a parse error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSpec {
    pub family: DistributionFamily,
    #[serde(default)]
    pub shape: Option<f64>,
}

impl Default for DistributionSpec {
    fn default() -> Self {
        Self {
            family: DistributionFamily::LogLogistic,
            shape: Some(1.0),
        }
    }
}

impl DistributionSpec {
    pub fn family_name(&self) -> &'static str {
        match self.family {
            DistributionFamily::LogLogistic => "log_logistic",
            DistributionFamily::Weibull => "weibull",
            DistributionFamily::Gumbel => "gumbel",
        }
    }

    pub fn build(&self) -> Result<Distribution, DistributionError> {
        let name = self.family_name();
        let shape = self
            .shape
            .ok_or_else(|| DistributionError::MissingShape(name.to_string()))?;
        Distribution::from_name(name, shape)
    }
}

fn checked_shape(shape: f64) -> Result<f64, DistributionError> {
    if !shape.is_finite() || shape <= 0.0 {
        return Err(DistributionError::InvalidShape(shape));
    }
    Ok(shape)
}

#[inline]
fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}
