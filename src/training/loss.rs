//! Loss functions for training.

use burn::tensor::{Tensor, backend::Backend};

/// Negative mean of the per-graph flow objective, the quantity Adam minimises.
pub fn negative_mean_objective<B: Backend>(objective: Tensor<B, 1>) -> Tensor<B, 1> {
    objective.mean().neg()
}
