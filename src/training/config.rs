//! Training configuration.

use serde::{Deserialize, Serialize};

/// Configuration for flow training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of optimizer steps, one batch each.
    pub iterations: usize,
    /// Learning rate for Adam.
    pub learning_rate: f64,
    /// Log progress every this many iterations.
    pub log_every: usize,
    /// Whether to log progress during training.
    pub verbose: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            iterations: 500,
            learning_rate: 0.01,
            log_every: 10,
            verbose: true,
        }
    }
}

impl TrainingConfig {
    /// Creates a new TrainingConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of iterations.
    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Sets the learning rate.
    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Sets the logging interval.
    pub fn log_every(mut self, log_every: usize) -> Self {
        self.log_every = log_every;
        self
    }

    /// Sets whether to log progress.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub(crate) fn should_log(&self, iteration: usize) -> bool {
        self.verbose
            && (iteration % self.log_every.max(1) == 0 || iteration + 1 == self.iterations)
    }
}
