// ========================================================================================
//
//                 BIDSURV: CENSORED-BID SURVIVAL MODELS OVER SPARSE FEATURES
//
// ========================================================================================
//
// A scoring model (linear plus optional factorization-machine term) maps each sparse
// instance to a positive scale. A parametric family turns that scale into the
// probability that the event happened by the observed time. Training minimises the
// censored log-loss, optionally regularised by the bid bounds seen at auction time.
#![deny(unused_variables)]
#![deny(unused_imports)]

pub mod dataset;
pub mod distribution;
pub mod evaluate;
pub mod ingest;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod regularizer;
pub mod train;

pub use dataset::{InstanceBlock, Minibatch, SparseDataset, SparseRow};
pub use distribution::{Distribution, DistributionStrategy};
pub use model::{ParameterSnapshot, ScoringModel};
pub use train::{Trainer, TrainingConfig, TrainingReport};
