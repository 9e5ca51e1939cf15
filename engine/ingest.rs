//! Reads one data split from a tab-separated file.
//!
//! Expected header: `time  event  min_bid  max_bid  features`. Bid columns may be
//! empty for missing values. `features` holds space-separated `index:value`
//! pairs, e.g. `0:1 17:1 230:0.5`; an empty field is a row with no features.

use crate::dataset::{DatasetError, InstanceBlock, SparseDataset, SparseRow};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Error reading TSV input: {0}")]
    Csv(#[from] csv::Error),
    #[error("Line {line}: malformed feature entry '{entry}', expected 'index:value'")]
    MalformedFeature { line: u64, entry: String },
    #[error("Line {line}: bid column '{column}' has non-finite value {value}")]
    NonFiniteBid {
        line: u64,
        column: &'static str,
        value: f64,
    },
    #[error("Dataset rejected the ingested rows: {0}")]
    Dataset(#[from] DatasetError),
}

#[derive(Debug, Deserialize)]
struct Record {
    time: f64,
    event: u8,
    min_bid: Option<f64>,
    max_bid: Option<f64>,
    #[serde(default)]
    features: String,
}

/// Parses every row of `path` into one [`InstanceBlock`].
pub fn read_block(path: impl AsRef<Path>) -> Result<InstanceBlock, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut block = InstanceBlock {
        min_bid: Some(Vec::new()),
        max_bid: Some(Vec::new()),
        ..InstanceBlock::default()
    };
    let headers = reader.headers()?.clone();
    for result in reader.records() {
        let raw = result?;
        let line = raw.position().map_or(0, |p| p.line());
        let record: Record = raw.deserialize(Some(&headers))?;
        for (column, bid) in [("min_bid", record.min_bid), ("max_bid", record.max_bid)] {
            if let Some(value) = bid.filter(|v| !v.is_finite()) {
                return Err(IngestError::NonFiniteBid {
                    line,
                    column,
                    value,
                });
            }
        }
        block.rows.push(parse_features(&record.features, line)?);
        block.time.push(record.time);
        block.event.push(record.event);
        if let Some(min_bid) = block.min_bid.as_mut() {
            min_bid.push(record.min_bid);
        }
        if let Some(max_bid) = block.max_bid.as_mut() {
            max_bid.push(record.max_bid);
        }
    }
    Ok(block)
}

/// Builds a dataset of width `num_features` from one file.
pub fn load_split(path: impl AsRef<Path>, num_features: usize) -> Result<SparseDataset, IngestError> {
    let block = read_block(path)?;
    let mut dataset = SparseDataset::new(num_features);
    dataset.append(block)?;
    Ok(dataset)
}

fn parse_features(field: &str, line: u64) -> Result<SparseRow, IngestError> {
    let malformed = |entry: &str| IngestError::MalformedFeature {
        line,
        entry: entry.to_string(),
    };
    let entries = field
        .split_whitespace()
        .map(|entry| {
            let (index, value) = entry.split_once(':').ok_or_else(|| malformed(entry))?;
            let index = index.parse::<usize>().map_err(|_| malformed(entry))?;
            let value = value.parse::<f64>().map_err(|_| malformed(entry))?;
            Ok((index, value))
        })
        .collect::<Result<Vec<_>, IngestError>>()?;
    Ok(SparseRow::new(entries))
}
