//! # Training Loop
//!
//! One epoch is one shuffled pass over the training minibatches with one Adam
//! step per batch. After every epoch the training and validation splits are
//! evaluated in full; whenever the validation loss drops below the best seen so
//! far, the test split is evaluated and a checkpoint (parameter snapshot plus
//! prediction exports) is kept and, if an output directory is configured,
//! written to disk.
//!
//! The objective minimised per batch is
//!
//! ```text
//! mean log-loss
//!   + lambda_adxwon  * mean win-side bid loss
//!   + lambda_adxlose * mean lose-side bid loss
//!   + lambda_linear * |w|^2 + lambda_factorized * |V|^2
//! ```

use crate::dataset::{DatasetError, Minibatch, SparseDataset};
use crate::distribution::{Distribution, DistributionError, DistributionSpec};
use crate::evaluate::{EvaluationReport, Evaluator, PassMetrics};
use crate::loss::{CensoredLikelihoodLoss, LikelihoodOutput, RunningMetrics, SampleWeighting};
use crate::model::{ModelError, ModelGradients, ParameterSnapshot, ScoringModel};
use crate::optimizer::{Adam, AdamConfig, clip_by_global_norm};
use crate::regularizer::BidRegularizer;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid training configuration: {field} {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: String,
    },
    #[error("failed to read or write training files: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML training configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to write prediction export: {0}")]
    Csv(#[from] csv::Error),
    #[error("dataset error: {0}")]
    Dataset(#[from] DatasetError),
    #[error("distribution error: {0}")]
    Distribution(#[from] DistributionError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("the {split} split has {found} features but the model expects {expected}")]
    FeatureWidthMismatch {
        split: &'static str,
        expected: usize,
        found: usize,
    },
}

/// Hyperparameters of a training run. Every field has a default, so a TOML file
/// only needs the values it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub num_epochs: usize,
    /// Factorization rank; 0 disables the pairwise term.
    pub k: usize,
    pub learning_rate: f64,
    pub lambda_linear: f64,
    pub lambda_factorized: f64,
    pub lambda_adxwon: f64,
    pub lambda_adxlose: f64,
    pub sample_weighting: SampleWeighting,
    /// Probability at or above which an instance is predicted to have had the event.
    pub decision_threshold: f64,
    pub clip_norm: f64,
    pub init_stddev: f64,
    pub seed: u64,
    pub distribution: DistributionSpec,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 2048,
            num_epochs: 30,
            k: 0,
            learning_rate: 1e-2,
            lambda_linear: 0.0,
            lambda_factorized: 0.0,
            lambda_adxwon: 0.0,
            lambda_adxlose: 0.0,
            sample_weighting: SampleWeighting::None,
            decision_threshold: 0.5,
            clip_norm: 5.0,
            init_stddev: 1e-5,
            seed: 42,
            distribution: DistributionSpec::default(),
        }
    }
}

impl TrainingConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> TrainError {
            TrainError::InvalidConfig {
                field,
                reason: reason.into(),
            }
        }

        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(invalid(
                "learning_rate",
                format!("must be positive, got {}", self.learning_rate),
            ));
        }
        for (field, value) in [
            ("lambda_linear", self.lambda_linear),
            ("lambda_factorized", self.lambda_factorized),
            ("lambda_adxwon", self.lambda_adxwon),
            ("lambda_adxlose", self.lambda_adxlose),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(invalid(field, format!("must be non-negative, got {value}")));
            }
        }
        if !(self.decision_threshold > 0.0 && self.decision_threshold < 1.0) {
            return Err(invalid(
                "decision_threshold",
                format!("must lie in (0, 1), got {}", self.decision_threshold),
            ));
        }
        if !(self.clip_norm.is_finite() && self.clip_norm > 0.0) {
            return Err(invalid(
                "clip_norm",
                format!("must be positive, got {}", self.clip_norm),
            ));
        }
        if !(self.init_stddev.is_finite() && self.init_stddev >= 0.0) {
            return Err(invalid(
                "init_stddev",
                format!("must be non-negative, got {}", self.init_stddev),
            ));
        }
        self.distribution.build()?;
        Ok(())
    }

    fn likelihood(&self) -> CensoredLikelihoodLoss {
        CensoredLikelihoodLoss::new(self.sample_weighting, self.decision_threshold)
    }

    fn regularizer(&self) -> BidRegularizer {
        BidRegularizer::new(
            self.lambda_adxwon,
            self.lambda_adxlose,
            self.sample_weighting,
        )
    }
}

/// Loss terms and gradients of one batch at the current parameters.
#[derive(Debug, Clone)]
pub struct BatchObjective {
    pub total: f64,
    pub likelihood: f64,
    pub win_regularization: f64,
    pub lose_regularization: f64,
    pub l2: f64,
    pub gradients: ModelGradients,
    /// Per-instance likelihood output at the current parameters.
    pub predictions: LikelihoodOutput,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Running mean of the likelihood loss over the epoch's training batches.
    pub train_running_loss: f64,
    pub train_running_accuracy: f64,
    pub train: PassMetrics,
    pub validation: PassMetrics,
    pub test: Option<PassMetrics>,
    pub improved: bool,
}

/// The state kept from the epoch with the lowest validation loss.
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    pub epoch: usize,
    pub validation_loss: f64,
    pub snapshot: ParameterSnapshot,
    pub validation: EvaluationReport,
    pub test: EvaluationReport,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub epochs: Vec<EpochSummary>,
    pub best: Option<BestCheckpoint>,
}

pub struct Trainer {
    config: TrainingConfig,
    model: ScoringModel,
    distribution: Distribution,
    optimizer: Adam,
    likelihood: CensoredLikelihoodLoss,
    regularizer: BidRegularizer,
    rng: StdRng,
    output_dir: Option<PathBuf>,
}

impl Trainer {
    /// Validates `config`, seeds the shuffle source and initialises the model.
    pub fn new(config: TrainingConfig, num_features: usize) -> Result<Self, TrainError> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let model = ScoringModel::init_random(num_features, config.k, config.init_stddev, &mut rng)?;
        Self::assemble(config, model, rng)
    }

    /// Starts from existing parameters, e.g. a restored snapshot.
    pub fn with_model(config: TrainingConfig, model: ScoringModel) -> Result<Self, TrainError> {
        config.validate()?;
        let rng = StdRng::seed_from_u64(config.seed);
        Self::assemble(config, model, rng)
    }

    fn assemble(
        config: TrainingConfig,
        model: ScoringModel,
        rng: StdRng,
    ) -> Result<Self, TrainError> {
        let distribution = config.distribution.build()?;
        Ok(Self {
            optimizer: Adam::new(AdamConfig::with_learning_rate(config.learning_rate)),
            likelihood: config.likelihood(),
            regularizer: config.regularizer(),
            config,
            model,
            distribution,
            rng,
            output_dir: None,
        })
    }

    /// Checkpoints are additionally written into `dir` on every improvement.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &ScoringModel {
        &self.model
    }

    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    /// Loss and gradients of `batch` without updating anything.
    pub fn objective(&self, batch: &Minibatch) -> BatchObjective {
        let indices = batch.indices.view();
        let values = batch.values.view();
        let forward = self.model.forward(indices, values);

        let likelihood = self.likelihood.evaluate(
            &self.distribution,
            forward.scale.view(),
            batch.time.view(),
            batch.event.view(),
        );
        let mut d_scale = self.likelihood.scale_gradient(
            &self.distribution,
            forward.scale.view(),
            batch.time.view(),
            batch.event.view(),
        );
        let regularization = self.regularizer.evaluate(
            &self.distribution,
            forward.scale.view(),
            batch.time.view(),
            batch.event.view(),
            &batch.min_bid,
            &batch.max_bid,
        );
        d_scale += &regularization.d_scale;

        let mut gradients =
            self.model
                .backward(indices, values, forward.eta.view(), d_scale.view());
        let l2 = self
            .model
            .l2_penalty(self.config.lambda_linear, self.config.lambda_factorized);
        self.model.add_l2_gradient(
            &mut gradients,
            self.config.lambda_linear,
            self.config.lambda_factorized,
        );

        BatchObjective {
            total: likelihood.mean_loss + regularization.total + l2,
            likelihood: likelihood.mean_loss,
            win_regularization: regularization.win_loss,
            lose_regularization: regularization.lose_loss,
            l2,
            gradients,
            predictions: likelihood,
        }
    }

    /// One clipped Adam step on `batch`. Updates `metrics` with the pre-step
    /// predictions and returns the batch objective.
    pub fn train_step(&mut self, batch: &Minibatch, metrics: &mut RunningMetrics) -> f64 {
        let mut objective = self.objective(batch);
        metrics.update(&objective.predictions, batch.event.view());
        if !objective.total.is_finite() || !objective.gradients.is_finite() {
            log::warn!(
                "Skipping update: non-finite objective {} on a batch of {} instances",
                objective.total,
                batch.len()
            );
            return objective.total;
        }
        let norm = clip_by_global_norm(&mut objective.gradients, self.config.clip_norm);
        log::debug!(
            "batch loss = {:.6} (likelihood {:.6}, adxwon {:.6}, adxlose {:.6}, l2 {:.6}), grad norm {:.4}",
            objective.total,
            objective.likelihood,
            objective.win_regularization,
            objective.lose_regularization,
            objective.l2,
            norm
        );
        self.optimizer.step(&mut self.model, &objective.gradients);
        objective.total
    }

    /// One shuffled pass over `data`, returning the running training metrics.
    pub fn train_epoch(&mut self, data: &SparseDataset) -> Result<RunningMetrics, TrainError> {
        self.check_width("train", data)?;
        let mut metrics = RunningMetrics::new();
        let batches = data.make_batches(Some(self.config.batch_size), &mut self.rng)?;
        let total = batches.len();
        for (i, batch) in batches.enumerate() {
            let loss = self.train_step(&batch, &mut metrics);
            log::trace!("batch {}/{}: loss = {:.4}", i + 1, total, loss);
        }
        Ok(metrics)
    }

    /// Full single-batch evaluation of `data` at the current parameters.
    pub fn evaluate(&self, data: &SparseDataset) -> EvaluationReport {
        Evaluator::new(&self.model, &self.distribution, self.likelihood)
            .evaluate(std::iter::once(data.full_batch()))
    }

    /// Like [`evaluate`](Self::evaluate) but without the concordance index.
    fn evaluate_training(&self, data: &SparseDataset) -> EvaluationReport {
        Evaluator::new(&self.model, &self.distribution, self.likelihood)
            .without_concordance()
            .evaluate(std::iter::once(data.full_batch()))
    }

    pub fn fit(
        &mut self,
        train: &SparseDataset,
        validation: &SparseDataset,
        test: &SparseDataset,
    ) -> Result<TrainingReport, TrainError> {
        self.check_width("train", train)?;
        self.check_width("validation", validation)?;
        self.check_width("test", test)?;

        log::info!(
            "Training on {} instances ({} features, k = {}, {} distribution) for {} epochs",
            train.num_instances(),
            train.num_features(),
            self.model.k(),
            self.config.distribution.family_name(),
            self.config.num_epochs
        );

        let mut epochs = Vec::with_capacity(self.config.num_epochs);
        let mut best: Option<BestCheckpoint> = None;

        for epoch in 1..=self.config.num_epochs {
            let running = self.train_epoch(train)?;
            let train_report = self.evaluate_training(train);
            let validation_report = self.evaluate(validation);
            log::info!(
                "Epoch {epoch}: running loss = {:.6}, running accuracy = {:.4}; train loss = {:.6}, accuracy = {:.4}; validation loss = {:.6}, accuracy = {:.4}, c-index = {:.4}",
                running.mean_loss(),
                running.accuracy(),
                train_report.loss,
                train_report.accuracy,
                validation_report.loss,
                validation_report.accuracy,
                validation_report.concordance.unwrap_or(f64::NAN)
            );

            let improved = best
                .as_ref()
                .is_none_or(|b| validation_report.loss < b.validation_loss);
            let mut test_metrics = None;
            if improved {
                let test_report = self.evaluate(test);
                log::info!(
                    "Epoch {epoch}: validation loss improved; test loss = {:.6}, accuracy = {:.4}, c-index = {:.4}",
                    test_report.loss,
                    test_report.accuracy,
                    test_report.concordance.unwrap_or(f64::NAN)
                );
                test_metrics = Some(test_report.metrics());
                let checkpoint = BestCheckpoint {
                    epoch,
                    validation_loss: validation_report.loss,
                    snapshot: self.model.snapshot(&self.distribution),
                    validation: validation_report.clone(),
                    test: test_report,
                };
                if let Some(dir) = &self.output_dir {
                    write_checkpoint(dir, &checkpoint, self.model.k())?;
                    log::info!("Checkpoint for epoch {epoch} written to {}", dir.display());
                }
                best = Some(checkpoint);
            }

            epochs.push(EpochSummary {
                epoch,
                train_running_loss: running.mean_loss(),
                train_running_accuracy: running.accuracy(),
                train: train_report.metrics(),
                validation: validation_report.metrics(),
                test: test_metrics,
                improved,
            });
        }

        Ok(TrainingReport { epochs, best })
    }

    fn check_width(&self, split: &'static str, data: &SparseDataset) -> Result<(), TrainError> {
        if data.num_features() != self.model.num_features() {
            return Err(TrainError::FeatureWidthMismatch {
                split,
                expected: self.model.num_features(),
                found: data.num_features(),
            });
        }
        Ok(())
    }
}

/// File name of the parameter snapshot for rank `k`.
pub fn snapshot_file_name(k: usize) -> String {
    format!("params_k{k}.toml")
}

/// Writes the snapshot and both prediction exports.
///
/// Every file is first written under a `.tmp` name. Nothing is renamed into place
/// until all three have been written, and the snapshot is renamed last, so a
/// snapshot on disk always sits next to the predictions of the same epoch. On
/// failure the staged files are removed.
pub fn write_checkpoint(
    dir: &Path,
    checkpoint: &BestCheckpoint,
    k: usize,
) -> Result<(), TrainError> {
    fs::create_dir_all(dir)?;

    let targets = [
        dir.join("predictions_validation.csv"),
        dir.join("predictions_test.csv"),
        dir.join(snapshot_file_name(k)),
    ];
    let staged: Vec<PathBuf> = targets.iter().map(|p| with_tmp_suffix(p)).collect();

    let written = stage_checkpoint(checkpoint, &staged);
    if let Err(e) = written {
        for tmp in &staged {
            if tmp.is_file() {
                let _ = fs::remove_file(tmp);
            }
        }
        return Err(e);
    }

    for (tmp, target) in staged.iter().zip(targets.iter()) {
        fs::rename(tmp, target)?;
    }
    Ok(())
}

fn stage_checkpoint(checkpoint: &BestCheckpoint, staged: &[PathBuf]) -> Result<(), TrainError> {
    checkpoint.validation.write_predictions(&staged[0])?;
    checkpoint.test.write_predictions(&staged[1])?;
    checkpoint.snapshot.save(&staged[2])?;
    Ok(())
}

fn with_tmp_suffix(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{InstanceBlock, SparseRow};
    use approx::assert_abs_diff_eq;

    fn tiny_dataset() -> SparseDataset {
        let mut data = SparseDataset::new(3);
        data.append(InstanceBlock {
            time: vec![1.0, 2.0, 3.0, 4.0],
            event: vec![0, 1, 0, 1],
            min_bid: Some(vec![None, Some(1.0), None, Some(3.5)]),
            max_bid: Some(vec![Some(1.5), None, Some(4.0), None]),
            rows: vec![
                SparseRow::new(vec![(0, 1.0)]),
                SparseRow::new(vec![(1, 1.0)]),
                SparseRow::new(vec![(2, 1.0)]),
                SparseRow::new(vec![(0, 1.0), (2, 0.5)]),
            ],
        })
        .unwrap();
        data
    }

    #[test]
    fn default_config_is_valid() {
        TrainingConfig::default().validate().unwrap();
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut config = TrainingConfig::default();
        config.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(TrainError::InvalidConfig { field: "batch_size", .. })
        ));

        let mut config = TrainingConfig::default();
        config.decision_threshold = 1.0;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.distribution.shape = None;
        assert!(matches!(
            config.validate(),
            Err(TrainError::Distribution(DistributionError::MissingShape(_)))
        ));
    }

    #[test]
    fn negative_k_in_toml_is_rejected() {
        assert!(toml::from_str::<TrainingConfig>("k = -1").is_err());
        let config: TrainingConfig = toml::from_str("k = 4\nbatch_size = 16").unwrap();
        assert_eq!(config.k, 4);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.clip_norm, 5.0);
    }

    #[test]
    fn objective_gradient_matches_finite_difference() {
        let config = TrainingConfig {
            k: 2,
            init_stddev: 0.3,
            lambda_linear: 0.1,
            lambda_factorized: 0.05,
            lambda_adxwon: 0.7,
            lambda_adxlose: 0.4,
            sample_weighting: SampleWeighting::Time,
            distribution: DistributionSpec {
                family: crate::distribution::DistributionFamily::LogLogistic,
                shape: Some(1.5),
            },
            ..TrainingConfig::default()
        };
        let trainer = Trainer::new(config.clone(), 3).unwrap();
        let batch = tiny_dataset().full_batch();
        let objective = trainer.objective(&batch);
        assert!(objective.win_regularization > 0.0);
        assert!(objective.lose_regularization > 0.0);

        let h = 1e-6;
        let base = trainer.model().clone();
        for j in 0..3 {
            let shift = |delta: f64| {
                let mut linear = base.linear_weights().to_owned();
                linear[j] += delta;
                let model = ScoringModel::from_parts(
                    linear,
                    base.intercept(),
                    base.factors().map(|f| f.to_owned()),
                );
                Trainer::with_model(config.clone(), model)
                    .unwrap()
                    .objective(&batch)
                    .total
            };
            let numeric = (shift(h) - shift(-h)) / (2.0 * h);
            assert_abs_diff_eq!(objective.gradients.linear[j], numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn fit_keeps_best_checkpoint_by_lowest_validation_loss() {
        let data = tiny_dataset();
        let config = TrainingConfig {
            batch_size: 2,
            num_epochs: 5,
            learning_rate: 0.05,
            ..TrainingConfig::default()
        };
        let mut trainer = Trainer::new(config, 3).unwrap();
        let report = trainer.fit(&data, &data, &data).unwrap();
        assert_eq!(report.epochs.len(), 5);
        assert!(report.epochs[0].improved);

        let best = report.best.unwrap();
        let min_val = report
            .epochs
            .iter()
            .map(|e| e.validation.loss)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(best.validation_loss, min_val);
        assert_eq!(best.test.predictions.len(), 4);
        for summary in &report.epochs {
            assert_eq!(summary.improved, summary.test.is_some());
        }
    }

    #[test]
    fn train_step_records_pre_step_likelihood() {
        let data = tiny_dataset();
        let batch = data.full_batch();
        let config = TrainingConfig {
            k: 2,
            init_stddev: 0.2,
            ..TrainingConfig::default()
        };
        let mut trainer = Trainer::new(config, 3).unwrap();
        let before = trainer.objective(&batch);
        let mut metrics = RunningMetrics::new();
        let total = trainer.train_step(&batch, &mut metrics);
        assert_eq!(total, before.total);
        assert_eq!(metrics.instances(), 4);
        assert_abs_diff_eq!(metrics.mean_loss(), before.likelihood, epsilon = 1e-12);
        assert_ne!(trainer.objective(&batch).total, before.total);
    }

    #[test]
    fn concordance_is_skipped_for_the_training_pass() {
        let data = tiny_dataset();
        let config = TrainingConfig {
            batch_size: 2,
            num_epochs: 2,
            ..TrainingConfig::default()
        };
        let mut trainer = Trainer::new(config, 3).unwrap();
        let report = trainer.fit(&data, &data, &data).unwrap();
        for summary in &report.epochs {
            assert!(summary.train.concordance.is_none());
            assert!(summary.validation.concordance.is_some());
        }
        assert!(report.epochs[0].test.unwrap().concordance.is_some());
    }

    #[test]
    fn mismatched_feature_width_is_reported() {
        let data = tiny_dataset();
        let mut trainer = Trainer::new(TrainingConfig::default(), 5).unwrap();
        assert!(matches!(
            trainer.fit(&data, &data, &data),
            Err(TrainError::FeatureWidthMismatch { split: "train", expected: 5, found: 3 })
        ));
    }
}
