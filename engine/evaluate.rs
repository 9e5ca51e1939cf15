//! Full-pass evaluation: mean log-loss, accuracy and concordance index.

use crate::dataset::Minibatch;
use crate::distribution::DistributionStrategy;
use crate::loss::{CensoredLikelihoodLoss, RunningMetrics};
use crate::model::ScoringModel;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

const RISK_TIE_TOLERANCE: f64 = 1e-12;

/// One exported row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_probability: f64,
    pub event: u8,
    pub time: f64,
}

/// Scalar summary of one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassMetrics {
    pub loss: f64,
    pub accuracy: f64,
    /// `None` for passes that skip the concordance index.
    pub concordance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub loss: f64,
    pub accuracy: f64,
    pub concordance: Option<f64>,
    pub predictions: Vec<Prediction>,
}

impl EvaluationReport {
    pub fn metrics(&self) -> PassMetrics {
        PassMetrics {
            loss: self.loss,
            accuracy: self.accuracy,
            concordance: self.concordance,
        }
    }

    /// Writes `predicted_probability,event,time` rows as CSV.
    pub fn write_predictions(&self, path: impl AsRef<Path>) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;
        for prediction in &self.predictions {
            writer.serialize(prediction)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Runs the scoring and likelihood pipeline without touching any parameter.
pub struct Evaluator<'a> {
    model: &'a ScoringModel,
    distribution: &'a dyn DistributionStrategy,
    likelihood: CensoredLikelihoodLoss,
    concordance: bool,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        model: &'a ScoringModel,
        distribution: &'a dyn DistributionStrategy,
        likelihood: CensoredLikelihoodLoss,
    ) -> Self {
        Self {
            model,
            distribution,
            likelihood,
            concordance: true,
        }
    }

    /// Skips the concordance index; used for the per-epoch training pass.
    pub fn without_concordance(mut self) -> Self {
        self.concordance = false;
        self
    }

    pub fn evaluate<I>(&self, batches: I) -> EvaluationReport
    where
        I: IntoIterator<Item = Minibatch>,
    {
        let mut metrics = RunningMetrics::new();
        let mut predictions = Vec::new();
        for batch in batches {
            let scale = self
                .model
                .compute_scale(batch.indices.view(), batch.values.view());
            let output = self.likelihood.evaluate(
                self.distribution,
                scale.view(),
                batch.time.view(),
                batch.event.view(),
            );
            metrics.update(&output, batch.event.view());
            predictions.extend(
                output
                    .probability
                    .iter()
                    .zip(batch.event.iter())
                    .zip(batch.time.iter())
                    .map(|((&p, &e), &t)| Prediction {
                        predicted_probability: p,
                        event: e,
                        time: t,
                    }),
            );
        }

        let concordance = self.concordance.then(|| {
            let risk: Vec<f64> = predictions.iter().map(|p| p.predicted_probability).collect();
            let events: Vec<u8> = predictions.iter().map(|p| p.event).collect();
            let times: Vec<f64> = predictions.iter().map(|p| p.time).collect();
            concordance_index(&risk, &events, &times)
        });

        EvaluationReport {
            loss: metrics.mean_loss(),
            accuracy: metrics.accuracy(),
            concordance,
            predictions,
        }
    }
}

/// Harrell's concordance index.
///
/// A pair `(i, j)` is comparable when instance `i` had the event and
/// `time[i] < time[j]`; it is concordant when `risk[i] > risk[j]`, and risk ties
/// count one half. Returns 0.5 when no pair is comparable.
///
/// Instances are visited in decreasing time while a Fenwick tree over risk ranks
/// holds every instance with a strictly later time, so the whole pass is
/// `O(n log n)`.
pub fn concordance_index(risk: &[f64], event: &[u8], time: &[f64]) -> f64 {
    assert_eq!(risk.len(), event.len());
    assert_eq!(risk.len(), time.len());
    let n = risk.len();
    if n < 2 {
        return 0.5;
    }

    let ranks = risk_ranks(risk);
    let num_ranks = ranks.iter().copied().max().map_or(0, |r| r + 1);

    let mut by_time: Vec<usize> = (0..n).collect();
    by_time.par_sort_unstable_by(|&a, &b| time[b].total_cmp(&time[a]));

    let mut later = FenwickTree::new(num_ranks);
    let mut concordant = 0u64;
    let mut tied = 0u64;
    let mut comparable = 0u64;

    let mut start = 0;
    while start < n {
        let t = time[by_time[start]];
        let mut end = start;
        while end < n && time[by_time[end]] == t {
            end += 1;
        }
        let group = &by_time[start..end];
        for &i in group.iter().filter(|&&i| event[i] == 1) {
            let rank = ranks[i];
            let below = later.prefix_sum(rank);
            let equal = later.prefix_sum(rank + 1) - below;
            concordant += below;
            tied += equal;
            comparable += later.total();
        }
        for &i in group {
            later.add(ranks[i]);
        }
        start = end;
    }

    if comparable == 0 {
        0.5
    } else {
        (concordant as f64 + 0.5 * tied as f64) / comparable as f64
    }
}

/// Dense ranks of `risk`; values within `RISK_TIE_TOLERANCE` of their sorted
/// predecessor share a rank.
fn risk_ranks(risk: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..risk.len()).collect();
    order.par_sort_unstable_by(|&a, &b| risk[a].total_cmp(&risk[b]));
    let mut ranks = vec![0; risk.len()];
    let mut rank = 0;
    for w in 1..order.len() {
        if risk[order[w]] - risk[order[w - 1]] > RISK_TIE_TOLERANCE {
            rank += 1;
        }
        ranks[order[w]] = rank;
    }
    ranks
}

/// Counts per rank with prefix sums.
struct FenwickTree {
    tree: Vec<u64>,
    total: u64,
}

impl FenwickTree {
    fn new(len: usize) -> Self {
        Self {
            tree: vec![0; len + 1],
            total: 0,
        }
    }

    fn add(&mut self, rank: usize) {
        let mut i = rank + 1;
        while i < self.tree.len() {
            self.tree[i] += 1;
            i += i & i.wrapping_neg();
        }
        self.total += 1;
    }

    /// Number of inserted ranks strictly below `rank`.
    fn prefix_sum(&self, rank: usize) -> u64 {
        let mut i = rank.min(self.tree.len() - 1);
        let mut sum = 0;
        while i > 0 {
            sum += self.tree[i];
            i -= i & i.wrapping_neg();
        }
        sum
    }

    fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn constant_risk_gives_one_half() {
        let risk = vec![0.3; 6];
        let event = vec![1, 0, 1, 1, 0, 1];
        let time = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_abs_diff_eq!(concordance_index(&risk, &event, &time), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn perfect_and_reversed_rankings() {
        let event = vec![1, 1, 1, 1];
        let time = vec![1.0, 2.0, 3.0, 4.0];
        let perfect = vec![0.9, 0.7, 0.5, 0.1];
        let reversed = vec![0.1, 0.5, 0.7, 0.9];
        assert_abs_diff_eq!(concordance_index(&perfect, &event, &time), 1.0);
        assert_abs_diff_eq!(concordance_index(&reversed, &event, &time), 0.0);
    }

    #[test]
    fn censored_instances_only_serve_as_later_partners() {
        // instance 1 is censored, so (1, j) is never comparable
        let event = vec![1, 0, 1];
        let time = vec![1.0, 2.0, 3.0];
        let risk = vec![0.8, 0.9, 0.1];
        // comparable: (0,1) discordant, (0,2) concordant
        assert_abs_diff_eq!(concordance_index(&risk, &event, &time), 0.5);
    }

    fn pairwise_reference(risk: &[f64], event: &[u8], time: &[f64]) -> f64 {
        let (mut score, mut comparable) = (0.0, 0.0);
        for i in 0..risk.len() {
            for j in 0..risk.len() {
                if event[i] == 1 && time[i] < time[j] {
                    comparable += 1.0;
                    if risk[i] == risk[j] {
                        score += 0.5;
                    } else if risk[i] > risk[j] {
                        score += 1.0;
                    }
                }
            }
        }
        if comparable == 0.0 { 0.5 } else { score / comparable }
    }

    #[test]
    fn matches_pairwise_count_with_tied_times_and_risks() {
        let mut rng = StdRng::seed_from_u64(19);
        for _ in 0..20 {
            let n = rng.gen_range(2..60);
            // coarse grids force ties in both time and risk
            let time: Vec<f64> = (0..n).map(|_| f64::from(rng.gen_range(0..8u8))).collect();
            let risk: Vec<f64> = (0..n).map(|_| f64::from(rng.gen_range(0..5u8)) * 0.2).collect();
            let event: Vec<u8> = (0..n).map(|_| u8::from(rng.gen_bool(0.5))).collect();
            assert_abs_diff_eq!(
                concordance_index(&risk, &event, &time),
                pairwise_reference(&risk, &event, &time),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn no_comparable_pairs_defaults_to_one_half() {
        assert_eq!(concordance_index(&[0.2, 0.4], &[0, 0], &[1.0, 2.0]), 0.5);
        assert_eq!(concordance_index(&[0.2], &[1], &[1.0]), 0.5);
    }
}
