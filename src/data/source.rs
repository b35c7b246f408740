use burn::tensor::backend::Backend;

use super::{GraphBatch, GraphSample, collate};
use crate::errors::FlowError;

/// Anything that can hand out padded graph batches.
pub trait BatchSource<B: Backend> {
    fn next_batch(&mut self) -> Result<GraphBatch<B>, FlowError>;
}

/// Prepared batches served round-robin, forever.
#[derive(Debug, Clone)]
pub struct InMemoryBatches<B: Backend> {
    batches: Vec<GraphBatch<B>>,
    cursor: usize,
}

impl<B: Backend> InMemoryBatches<B> {
    pub fn new(batches: Vec<GraphBatch<B>>) -> Result<Self, FlowError> {
        if batches.is_empty() {
            return Err(FlowError::EmptyBatch(
                "an in-memory source needs at least one batch".to_string(),
            ));
        }
        Ok(Self { batches, cursor: 0 })
    }

    /// Splits `samples` into consecutive batches of at most `batch_size` graphs.
    pub fn from_samples(
        samples: &[GraphSample],
        batch_size: usize,
        device: &B::Device,
    ) -> Result<Self, FlowError> {
        if batch_size == 0 {
            return Err(FlowError::invalid_config("batch_size must be at least 1"));
        }
        let batches = samples
            .chunks(batch_size)
            .map(|chunk| collate(chunk, device))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(batches)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

impl<B: Backend> BatchSource<B> for InMemoryBatches<B> {
    fn next_batch(&mut self) -> Result<GraphBatch<B>, FlowError> {
        let batch = self.batches[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.batches.len();
        Ok(batch)
    }
}
