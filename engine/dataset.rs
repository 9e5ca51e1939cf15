//! # Sparse Dataset and Minibatching
//!
//! Holds one data split (train, validation or test) as a compressed sparse row
//! matrix plus the parallel per-instance targets. Rows are never reordered in
//! place; each call to [`SparseDataset::make_batches`] draws a fresh permutation
//! and gathers rows through it, so every pass sees a new sample order while the
//! stored data stays read-only after ingestion.

use ndarray::{Array1, Array2};
use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error(
        "parallel arrays disagree in length: '{left}' has {left_len} rows but '{right}' has {right_len}"
    )]
    LengthMismatch {
        left: &'static str,
        left_len: usize,
        right: &'static str,
        right_len: usize,
    },
    #[error("row {row} references feature index {index}, but the feature space has width {num_features}")]
    FeatureOutOfRange {
        row: usize,
        index: usize,
        num_features: usize,
    },
    #[error("row {row} has event flag {event}; only 0 and 1 are allowed")]
    InvalidEventFlag { row: usize, event: u8 },
    #[error("row {row} has non-finite time {time}")]
    NonFiniteTime { row: usize, time: f64 },
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
}

/// One instance's nonzero features as `(feature_index, feature_value)` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseRow {
    pub entries: Vec<(usize, f64)>,
}

impl SparseRow {
    pub fn new(entries: Vec<(usize, f64)>) -> Self {
        Self { entries }
    }

    #[inline]
    pub fn nnz(&self) -> usize {
        self.entries.len()
    }
}

/// A block of instances produced by the upstream ingestion collaborator.
///
/// Bid columns are optional as a whole; when absent every instance is treated as
/// having no bid bound.
#[derive(Debug, Clone, Default)]
pub struct InstanceBlock {
    pub time: Vec<f64>,
    pub event: Vec<u8>,
    pub min_bid: Option<Vec<Option<f64>>>,
    pub max_bid: Option<Vec<Option<f64>>>,
    pub rows: Vec<SparseRow>,
}

/// A dense, right-padded view of a slice of the dataset.
///
/// `indices` and `values` have shape `(len, max_nonzero_len)`; entries past a
/// row's true nonzero count hold index 0 and value 0.0.
#[derive(Debug, Clone)]
pub struct Minibatch {
    pub indices: Array2<usize>,
    pub values: Array2<f64>,
    pub time: Array1<f64>,
    pub event: Array1<u8>,
    pub min_bid: Vec<Option<f64>>,
    pub max_bid: Vec<Option<f64>>,
}

impl Minibatch {
    #[inline]
    pub fn len(&self) -> usize {
        self.time.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Width of the padded feature block.
    #[inline]
    pub fn padded_width(&self) -> usize {
        self.indices.ncols()
    }
}

#[derive(Debug, Clone)]
pub struct SparseDataset {
    num_features: usize,
    // CSR storage: row `i` occupies `indices[indptr[i]..indptr[i + 1]]`.
    indptr: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<f64>,
    time: Vec<f64>,
    event: Vec<u8>,
    min_bid: Vec<Option<f64>>,
    max_bid: Vec<Option<f64>>,
    max_nonzero_len: usize,
}

impl SparseDataset {
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            indptr: vec![0],
            indices: Vec::new(),
            values: Vec::new(),
            time: Vec::new(),
            event: Vec::new(),
            min_bid: Vec::new(),
            max_bid: Vec::new(),
            max_nonzero_len: 0,
        }
    }

    #[inline]
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    #[inline]
    pub fn num_instances(&self) -> usize {
        self.time.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    #[inline]
    pub fn max_nonzero_len(&self) -> usize {
        self.max_nonzero_len
    }

    pub fn times(&self) -> &[f64] {
        &self.time
    }

    pub fn events(&self) -> &[u8] {
        &self.event
    }

    /// Returns the stored row `i` as a [`SparseRow`].
    pub fn row(&self, i: usize) -> SparseRow {
        let range = self.indptr[i]..self.indptr[i + 1];
        SparseRow::new(
            self.indices[range.clone()]
                .iter()
                .copied()
                .zip(self.values[range].iter().copied())
                .collect(),
        )
    }

    /// Appends a block of instances.
    ///
    /// The block is validated in full before anything is written, so a rejected
    /// block leaves the dataset untouched.
    pub fn append(&mut self, block: InstanceBlock) -> Result<(), DatasetError> {
        let n = block.rows.len();
        check_len("features", n, "time", block.time.len())?;
        check_len("features", n, "event", block.event.len())?;
        if let Some(min_bid) = &block.min_bid {
            check_len("features", n, "min_bid", min_bid.len())?;
        }
        if let Some(max_bid) = &block.max_bid {
            check_len("features", n, "max_bid", max_bid.len())?;
        }

        let offset = self.num_instances();
        for (i, row) in block.rows.iter().enumerate() {
            for &(index, _) in &row.entries {
                if index >= self.num_features {
                    return Err(DatasetError::FeatureOutOfRange {
                        row: offset + i,
                        index,
                        num_features: self.num_features,
                    });
                }
            }
            let event = block.event[i];
            if event > 1 {
                return Err(DatasetError::InvalidEventFlag {
                    row: offset + i,
                    event,
                });
            }
            let time = block.time[i];
            if !time.is_finite() {
                return Err(DatasetError::NonFiniteTime {
                    row: offset + i,
                    time,
                });
            }
        }

        let mut block_max = 0usize;
        for row in &block.rows {
            block_max = block_max.max(row.nnz());
            for &(index, value) in &row.entries {
                self.indices.push(index);
                self.values.push(value);
            }
            self.indptr.push(self.indices.len());
        }
        self.time.extend_from_slice(&block.time);
        self.event.extend_from_slice(&block.event);
        self.min_bid
            .extend(block.min_bid.unwrap_or_else(|| vec![None; n]));
        self.max_bid
            .extend(block.max_bid.unwrap_or_else(|| vec![None; n]));
        self.max_nonzero_len = self.max_nonzero_len.max(block_max);

        debug_assert_eq!(self.indptr.len(), self.time.len() + 1);
        debug_assert_eq!(self.event.len(), self.time.len());
        debug_assert_eq!(self.min_bid.len(), self.time.len());
        debug_assert_eq!(self.max_bid.len(), self.time.len());
        Ok(())
    }

    /// Starts a fresh shuffled pass over the dataset.
    ///
    /// With `Some(batch_size)` the pass yields consecutive slices of that size (the
    /// last may be shorter); with `None` it yields the whole dataset as one batch.
    /// Each call draws a new permutation from `rng`.
    pub fn make_batches<R: Rng + ?Sized>(
        &self,
        batch_size: Option<usize>,
        rng: &mut R,
    ) -> Result<Batches<'_>, DatasetError> {
        let batch_size = match batch_size {
            Some(0) => return Err(DatasetError::ZeroBatchSize),
            Some(size) => size,
            None => self.num_instances().max(1),
        };
        let mut order: Vec<usize> = (0..self.num_instances()).collect();
        order.shuffle(rng);
        Ok(Batches {
            dataset: self,
            order,
            batch_size,
            cursor: 0,
        })
    }

    /// The whole dataset as a single batch in storage order.
    pub fn full_batch(&self) -> Minibatch {
        let order: Vec<usize> = (0..self.num_instances()).collect();
        self.gather(&order)
    }

    fn gather(&self, rows: &[usize]) -> Minibatch {
        let width = self.max_nonzero_len;
        let mut indices = Array2::<usize>::zeros((rows.len(), width));
        let mut values = Array2::<f64>::zeros((rows.len(), width));
        let mut time = Array1::<f64>::zeros(rows.len());
        let mut event = Array1::<u8>::zeros(rows.len());
        let mut min_bid = Vec::with_capacity(rows.len());
        let mut max_bid = Vec::with_capacity(rows.len());

        for (out, &row) in rows.iter().enumerate() {
            let start = self.indptr[row];
            let end = self.indptr[row + 1];
            for (slot, pos) in (start..end).enumerate() {
                indices[[out, slot]] = self.indices[pos];
                values[[out, slot]] = self.values[pos];
            }
            time[out] = self.time[row];
            event[out] = self.event[row];
            min_bid.push(self.min_bid[row]);
            max_bid.push(self.max_bid[row]);
        }

        Minibatch {
            indices,
            values,
            time,
            event,
            min_bid,
            max_bid,
        }
    }
}

fn check_len(
    left: &'static str,
    left_len: usize,
    right: &'static str,
    right_len: usize,
) -> Result<(), DatasetError> {
    if left_len != right_len {
        return Err(DatasetError::LengthMismatch {
            left,
            left_len,
            right,
            right_len,
        });
    }
    Ok(())
}

/// One shuffled pass over a [`SparseDataset`]. Finite and not restartable; call
/// [`SparseDataset::make_batches`] again for another pass.
pub struct Batches<'a> {
    dataset: &'a SparseDataset,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl Batches<'_> {
    /// Number of batches left in this pass.
    pub fn remaining(&self) -> usize {
        (self.order.len() - self.cursor).div_ceil(self.batch_size)
    }
}

impl Iterator for Batches<'_> {
    type Item = Minibatch;

    fn next(&mut self) -> Option<Minibatch> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.dataset.gather(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn toy_block() -> InstanceBlock {
        InstanceBlock {
            time: vec![1.0, 2.0, 3.0, 4.0, 5.0],
            event: vec![0, 1, 0, 1, 1],
            min_bid: Some(vec![None, Some(1.5), None, Some(3.0), None]),
            max_bid: Some(vec![Some(2.0), None, Some(2.5), None, None]),
            rows: vec![
                SparseRow::new(vec![(0, 1.0)]),
                SparseRow::new(vec![(1, 1.0), (3, 0.5)]),
                SparseRow::new(vec![(2, 2.0)]),
                SparseRow::new(vec![]),
                SparseRow::new(vec![(1, 1.0), (2, 1.0), (4, 1.0)]),
            ],
        }
    }

    #[test]
    fn append_rejects_mismatched_lengths_and_names_arrays() {
        let mut dataset = SparseDataset::new(5);
        let mut block = toy_block();
        block.time.pop();
        let err = dataset.append(block).unwrap_err();
        match err {
            DatasetError::LengthMismatch {
                left,
                right,
                left_len,
                right_len,
            } => {
                assert_eq!(left, "features");
                assert_eq!(right, "time");
                assert_eq!(left_len, 5);
                assert_eq!(right_len, 4);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(dataset.num_instances(), 0);
    }

    #[test]
    fn append_rejects_out_of_range_feature() {
        let mut dataset = SparseDataset::new(3);
        let err = dataset.append(toy_block()).unwrap_err();
        assert!(matches!(err, DatasetError::FeatureOutOfRange { index: 3, .. }));
    }

    #[test]
    fn max_nonzero_len_is_monotonic() {
        let mut dataset = SparseDataset::new(5);
        dataset.append(toy_block()).unwrap();
        assert_eq!(dataset.max_nonzero_len(), 3);

        let small = InstanceBlock {
            time: vec![1.0],
            event: vec![1],
            min_bid: None,
            max_bid: None,
            rows: vec![SparseRow::new(vec![(0, 1.0)])],
        };
        dataset.append(small).unwrap();
        assert_eq!(dataset.max_nonzero_len(), 3);
        assert_eq!(dataset.num_instances(), 6);
    }

    #[test]
    fn batches_are_padded_to_dataset_width() {
        let mut dataset = SparseDataset::new(5);
        dataset.append(toy_block()).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for batch in dataset.make_batches(Some(2), &mut rng).unwrap() {
            assert_eq!(batch.padded_width(), 3);
            for i in 0..batch.len() {
                let row = batch.values.row(i);
                let nnz = row.iter().filter(|v| **v != 0.0).count();
                for slot in nnz..batch.padded_width() {
                    assert_eq!(batch.indices[[i, slot]], 0);
                    assert_eq!(batch.values[[i, slot]], 0.0);
                }
            }
        }
    }

    #[test]
    fn shuffled_pass_covers_every_instance_once() {
        let mut dataset = SparseDataset::new(5);
        dataset.append(toy_block()).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        for batch_size in 1..=dataset.num_instances() {
            let batches: Vec<_> = dataset
                .make_batches(Some(batch_size), &mut rng)
                .unwrap()
                .collect();
            let expected_batches = dataset.num_instances().div_ceil(batch_size);
            assert_eq!(batches.len(), expected_batches);
            let mut times: Vec<f64> = batches
                .iter()
                .flat_map(|b| b.time.iter().copied().collect::<Vec<_>>())
                .collect();
            times.sort_by(|a, b| a.partial_cmp(b).unwrap());
            assert_eq!(times, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        }
    }

    #[test]
    fn shuffle_keeps_parallel_arrays_aligned() {
        let mut dataset = SparseDataset::new(5);
        dataset.append(toy_block()).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let batch = dataset
            .make_batches(None, &mut rng)
            .unwrap()
            .next()
            .unwrap();
        assert_eq!(batch.len(), 5);
        for i in 0..batch.len() {
            // time uniquely identifies the source row in the toy block
            let source = (batch.time[i] as usize) - 1;
            let original = dataset.row(source);
            assert_eq!(batch.event[i], dataset.events()[source]);
            for (slot, &(index, value)) in original.entries.iter().enumerate() {
                assert_eq!(batch.indices[[i, slot]], index);
                assert_eq!(batch.values[[i, slot]], value);
            }
        }
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let dataset = SparseDataset::new(2);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            dataset.make_batches(Some(0), &mut rng),
            Err(DatasetError::ZeroBatchSize)
        ));
    }
}
