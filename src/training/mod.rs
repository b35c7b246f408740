//! Maximum-likelihood training of a [`GraphFlow`](crate::flow::GraphFlow).
//!
//! This module provides:
//! - The training objective
//! - Training configuration
//! - A training loop driven by the Adam optimizer

mod config;
mod loss;
mod trainer;

pub use config::TrainingConfig;
pub use loss::negative_mean_objective;
pub use trainer::{TrainingResult, train};
