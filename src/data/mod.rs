//! Padded graph batches and the sources that feed them to training.

mod batch;
mod source;

pub use batch::{GraphBatch, GraphSample, collate};
pub use source::{BatchSource, InMemoryBatches};
