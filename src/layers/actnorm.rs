//! Activation normalization (Kingma & Dhariwal, 2018).
//!
//! `z = x * exp(log_sigma) + mu`, applied independently to every node row.

use burn::{
    module::{Module, Param},
    nn::Initializer,
    tensor::{Tensor, backend::Backend},
};
use serde::{Deserialize, Serialize};

/// Configuration for an [`ActNorm`] layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActNormConfig {
    /// Size of the feature axis.
    pub dim: usize,
}

impl ActNormConfig {
    /// Creates a new ActNormConfig.
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    /// Initializes an identity ActNorm (zero shift, zero log-scale).
    pub fn init<B: Backend>(&self, device: &B::Device) -> ActNorm<B> {
        ActNorm {
            mu: Initializer::Zeros.init([self.dim], device),
            log_sigma: Initializer::Zeros.init([self.dim], device),
            dim: self.dim,
        }
    }
}

/// Per-feature learnable affine normalization.
#[derive(Module, Debug)]
pub struct ActNorm<B: Backend> {
    mu: Param<Tensor<B, 1>>,
    log_sigma: Param<Tensor<B, 1>>,
    dim: usize,
}

impl<B: Backend> ActNorm<B> {
    /// Maps `x` `[batch, nodes, dim]` forward, returning `(z, log_det)` with
    /// `log_det = sum(log_sigma) * v` per graph.
    pub fn forward(&self, x: Tensor<B, 3>, v: Tensor<B, 1>) -> (Tensor<B, 3>, Tensor<B, 1>) {
        let log_sigma = self.log_sigma.val();
        let z = x * log_sigma.clone().exp().reshape([1, 1, self.dim])
            + self.mu.val().reshape([1, 1, self.dim]);
        let log_det = v * log_sigma.sum();
        (z, log_det)
    }

    /// Exact inverse of [`ActNorm::forward`].
    pub fn backward(&self, z: Tensor<B, 3>, v: Tensor<B, 1>) -> (Tensor<B, 3>, Tensor<B, 1>) {
        let log_sigma = self.log_sigma.val();
        let x = (z - self.mu.val().reshape([1, 1, self.dim]))
            * log_sigma.clone().neg().exp().reshape([1, 1, self.dim]);
        let log_det = v * log_sigma.sum().neg();
        (x, log_det)
    }

    /// Returns the feature dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Replaces the scale and shift, mostly useful for tests and warm starts.
    pub fn with_params(mut self, mu: Tensor<B, 1>, log_sigma: Tensor<B, 1>) -> Self {
        self.mu = Param::from_tensor(mu);
        self.log_sigma = Param::from_tensor(log_sigma);
        self
    }
}
