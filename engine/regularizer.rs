//! Auxiliary regularization from observed bid bounds.
//!
//! Two disjoint subsets of a batch carry extra information about where the
//! unknown clearing point cannot be:
//!
//! * win side: `event == 0`, `max_bid` present and `time < max_bid`. The event
//!   should not have occurred by `max_bid` either, so `F(max_bid)` is pushed
//!   towards 0.
//! * lose side: `event == 1`, `min_bid` present and `min_bid < time`.
//!   `F(min_bid)` is pushed towards 0 as well.
//!
//! Each subset contributes its mean log-loss against a zero label times its own
//! coefficient. An empty subset contributes exactly 0.

use crate::distribution::DistributionStrategy;
use crate::loss::{SampleWeighting, log_loss, log_loss_dprob};
use ndarray::{Array1, ArrayView1};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BidRegularizer {
    pub lambda_adxwon: f64,
    pub lambda_adxlose: f64,
    pub weighting: SampleWeighting,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegularizationOutput {
    /// Mean unweighted-by-lambda loss of the win-side subset.
    pub win_loss: f64,
    pub lose_loss: f64,
    pub win_count: usize,
    pub lose_count: usize,
    /// `lambda_adxwon * win_loss + lambda_adxlose * lose_loss`.
    pub total: f64,
    /// Derivative of `total` with respect to each instance's scale.
    pub d_scale: Array1<f64>,
}

/// Row mask of the win-side subset.
pub fn win_side_mask(
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, u8>,
    max_bid: &[Option<f64>],
) -> Vec<bool> {
    time.iter()
        .zip(event.iter())
        .zip(max_bid.iter())
        .map(|((&t, &e), bid)| e == 0 && bid.is_some_and(|b| t < b))
        .collect()
}

/// Row mask of the lose-side subset.
pub fn lose_side_mask(
    time: ArrayView1<'_, f64>,
    event: ArrayView1<'_, u8>,
    min_bid: &[Option<f64>],
) -> Vec<bool> {
    time.iter()
        .zip(event.iter())
        .zip(min_bid.iter())
        .map(|((&t, &e), bid)| e == 1 && bid.is_some_and(|b| b < t))
        .collect()
}

struct SideTerm {
    mean_loss: f64,
    count: usize,
}

impl BidRegularizer {
    pub fn new(lambda_adxwon: f64, lambda_adxlose: f64, weighting: SampleWeighting) -> Self {
        Self {
            lambda_adxwon,
            lambda_adxlose,
            weighting,
        }
    }

    pub fn evaluate(
        &self,
        distribution: &dyn DistributionStrategy,
        scale: ArrayView1<'_, f64>,
        time: ArrayView1<'_, f64>,
        event: ArrayView1<'_, u8>,
        min_bid: &[Option<f64>],
        max_bid: &[Option<f64>],
    ) -> RegularizationOutput {
        let n = scale.len();
        assert_eq!(time.len(), n);
        assert_eq!(event.len(), n);
        assert_eq!(min_bid.len(), n);
        assert_eq!(max_bid.len(), n);

        let mut d_scale = Array1::<f64>::zeros(n);
        let win = self.side(
            distribution,
            scale,
            time,
            &win_side_mask(time, event, max_bid),
            max_bid,
            self.lambda_adxwon,
            &mut d_scale,
        );
        let lose = self.side(
            distribution,
            scale,
            time,
            &lose_side_mask(time, event, min_bid),
            min_bid,
            self.lambda_adxlose,
            &mut d_scale,
        );

        RegularizationOutput {
            win_loss: win.mean_loss,
            lose_loss: lose.mean_loss,
            win_count: win.count,
            lose_count: lose.count,
            total: self.lambda_adxwon * win.mean_loss + self.lambda_adxlose * lose.mean_loss,
            d_scale,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn side(
        &self,
        distribution: &dyn DistributionStrategy,
        scale: ArrayView1<'_, f64>,
        time: ArrayView1<'_, f64>,
        mask: &[bool],
        bids: &[Option<f64>],
        lambda: f64,
        d_scale: &mut Array1<f64>,
    ) -> SideTerm {
        let count = mask.iter().filter(|&&m| m).count();
        if count == 0 {
            return SideTerm {
                mean_loss: 0.0,
                count: 0,
            };
        }
        let inv_count = 1.0 / count as f64;
        let mut loss_sum = 0.0;
        for (i, (&selected, bid)) in mask.iter().zip(bids.iter()).enumerate() {
            let Some(bid) = bid.filter(|_| selected) else {
                continue;
            };
            let w = self.weighting.weight(time[i]);
            let p = distribution.left_censoring(bid, scale[i]);
            loss_sum += w * log_loss(0.0, p);
            if lambda != 0.0 {
                d_scale[i] += lambda
                    * w
                    * log_loss_dprob(0.0, p)
                    * distribution.left_censoring_dscale(bid, scale[i])
                    * inv_count;
            }
        }
        SideTerm {
            mean_loss: loss_sum * inv_count,
            count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::LogLogistic;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn masks_follow_censoring_and_bid_conditions() {
        let time = array![1.0, 2.0, 3.0, 4.0, 5.0];
        let event = array![0u8, 0, 1, 1, 0];
        let max_bid = [Some(1.5), Some(1.0), Some(9.0), None, None];
        let min_bid = [None, None, Some(2.0), Some(4.5), Some(1.0)];
        assert_eq!(
            win_side_mask(time.view(), event.view(), &max_bid),
            vec![true, false, false, false, false]
        );
        assert_eq!(
            lose_side_mask(time.view(), event.view(), &min_bid),
            vec![false, false, true, false, false]
        );
    }

    #[test]
    fn empty_subsets_contribute_exactly_zero() {
        let dist = LogLogistic::new(1.0).unwrap();
        let reg = BidRegularizer::new(3.0, 2.0, SampleWeighting::None);
        let scale = array![1.0, 2.0];
        let time = array![1.0, 2.0];
        let event = array![1u8, 0];
        // no max_bid above time for the event==0 row, no min_bid at all
        let out = reg.evaluate(
            &dist,
            scale.view(),
            time.view(),
            event.view(),
            &[None, None],
            &[Some(5.0), Some(1.0)],
        );
        assert_eq!(out.win_count, 0);
        assert_eq!(out.lose_count, 0);
        assert_eq!(out.total, 0.0);
        assert!(out.d_scale.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn win_side_uses_max_bid_against_zero_label() {
        let dist = LogLogistic::new(1.0).unwrap();
        let reg = BidRegularizer::new(2.0, 0.0, SampleWeighting::None);
        let scale = array![1.0, 1.0];
        let time = array![1.0, 0.5];
        let event = array![0u8, 0];
        let max_bid = [Some(3.0), Some(1.0)];
        let out = reg.evaluate(
            &dist,
            scale.view(),
            time.view(),
            event.view(),
            &[None, None],
            &max_bid,
        );
        // F(3; 1) = 0.75, F(1; 1) = 0.5
        let expected = (-(0.25f64.ln()) - 0.5f64.ln()) / 2.0;
        assert_eq!(out.win_count, 2);
        assert_abs_diff_eq!(out.win_loss, expected, epsilon = 1e-9);
        assert_abs_diff_eq!(out.total, 2.0 * expected, epsilon = 1e-9);
    }

    #[test]
    fn d_scale_matches_finite_difference() {
        let dist = LogLogistic::new(2.0).unwrap();
        let reg = BidRegularizer::new(0.7, 1.3, SampleWeighting::Time);
        let scale = array![1.2, 0.9, 2.0];
        let time = array![1.0, 2.0, 3.0];
        let event = array![0u8, 1, 1];
        let min_bid = [None, Some(1.5), Some(0.5)];
        let max_bid = [Some(2.5), None, None];
        let out = reg.evaluate(
            &dist,
            scale.view(),
            time.view(),
            event.view(),
            &min_bid,
            &max_bid,
        );
        let h = 1e-6;
        for i in 0..3 {
            let mut plus = scale.clone();
            plus[i] += h;
            let mut minus = scale.clone();
            minus[i] -= h;
            let f = |s: &Array1<f64>| {
                reg.evaluate(&dist, s.view(), time.view(), event.view(), &min_bid, &max_bid)
                    .total
            };
            let numeric = (f(&plus) - f(&minus)) / (2.0 * h);
            assert_abs_diff_eq!(out.d_scale[i], numeric, epsilon = 1e-6);
        }
    }
}
