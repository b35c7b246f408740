//! Neural spline coupling layer for node-embedding sets.
//!
//! One layer is `ActNorm -> InvertibleLinear -> two half-splines`. The
//! embedding axis is split into a lower and an upper half; each half is
//! transformed by a spline whose parameters are predicted from the other
//! half through a masked set encoder and a shared base network.

use burn::{
    module::{Ignored, Module},
    tensor::{Bool, Tensor, backend::Backend},
};
use serde::{Deserialize, Serialize};

use crate::errors::FlowError;
use crate::layers::{
    ActNorm, ActNormConfig, AttentionConfig, InvertibleLinear, InvertibleLinearConfig, Mlp,
    MlpConfig, RationalQuadraticSpline, SetEncoder, SplineConfig, SplineParams, check_batch_size,
    masked_sum, node_mask,
};

/// Configuration for a [`CouplingLayer`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CouplingConfig {
    /// Embedding width, must be even.
    pub embedding_dim: usize,
    /// Width of the set encoder output and of the base network.
    pub hidden_dim: usize,
    pub spline: SplineConfig,
    pub attention: AttentionConfig,
}

impl CouplingConfig {
    /// Creates a config with the default spline (K = 5, B = 3) and a
    /// one-head ISAB with 16 inducing points.
    pub fn new(embedding_dim: usize) -> Self {
        Self {
            embedding_dim,
            hidden_dim: 64,
            spline: SplineConfig::default(),
            attention: AttentionConfig::default(),
        }
    }

    /// Sets the hidden width.
    pub fn with_hidden_dim(mut self, hidden_dim: usize) -> Self {
        self.hidden_dim = hidden_dim;
        self
    }

    /// Sets the spline hyperparameters.
    pub fn with_spline(mut self, spline: SplineConfig) -> Self {
        self.spline = spline;
        self
    }

    /// Sets the attention hyperparameters.
    pub fn with_attention(mut self, attention: AttentionConfig) -> Self {
        self.attention = attention;
        self
    }

    /// Checks every hyperparameter before any weight is allocated.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.embedding_dim < 2 || self.embedding_dim % 2 != 0 {
            return Err(FlowError::invalid_config(format!(
                "embedding dimension must be even and at least 2, got {}",
                self.embedding_dim
            )));
        }
        if self.hidden_dim == 0 {
            return Err(FlowError::invalid_config("hidden dimension must be positive"));
        }
        self.spline.validate()?;
        self.attention.validate(self.hidden_dim)
    }

    /// Initializes the layer.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<CouplingLayer<B>, FlowError> {
        self.validate()?;
        let half = self.embedding_dim / 2;
        log::debug!(
            "coupling layer: dim={}, hidden={}, bins={}, encoder={:?}",
            self.embedding_dim,
            self.hidden_dim,
            self.spline.num_bins,
            self.attention.encoder
        );

        Ok(CouplingLayer {
            actnorm: ActNormConfig::new(self.embedding_dim).init(device),
            mixing: InvertibleLinearConfig::new(self.embedding_dim).init(device)?,
            f1: SetEncoder::new(half, self.hidden_dim, &self.attention, device)?,
            f2: SetEncoder::new(half, self.hidden_dim, &self.attention, device)?,
            base_network: MlpConfig::new(
                self.hidden_dim,
                half * self.spline.params_per_dim(),
                self.hidden_dim,
            )
            .init(device),
            spline: Ignored(RationalQuadraticSpline::new(self.spline)),
            embedding_dim: self.embedding_dim,
        })
    }
}

/// Invertible coupling layer over masked node sets.
#[derive(Module, Debug)]
pub struct CouplingLayer<B: Backend> {
    actnorm: ActNorm<B>,
    mixing: InvertibleLinear<B>,
    /// Encodes the lower half to condition the upper half.
    f1: SetEncoder<B>,
    /// Encodes the upper half to condition the lower half.
    f2: SetEncoder<B>,
    base_network: Mlp<B>,
    spline: Ignored<RationalQuadraticSpline>,
    embedding_dim: usize,
}

impl<B: Backend> CouplingLayer<B> {
    fn check_input(&self, x: &Tensor<B, 3>, v: &Tensor<B, 1>) -> Result<(), FlowError> {
        let [batch_size, _, dim] = x.dims();
        check_batch_size(v, batch_size)?;
        if dim != self.embedding_dim {
            return Err(FlowError::ShapeMismatch {
                context: "coupling layer embedding",
                expected: self.embedding_dim,
                actual: dim,
            });
        }
        Ok(())
    }

    fn split(&self, x: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let half = self.embedding_dim / 2;
        (x.clone().narrow(2, 0, half), x.narrow(2, half, half))
    }

    fn spline_params(
        &self,
        encoder: &SetEncoder<B>,
        condition: Tensor<B, 3>,
        mask: Tensor<B, 2, Bool>,
    ) -> SplineParams<B> {
        let [batch_size, max_nodes, half] = condition.dims();
        let per_dim = self.spline.0.config().params_per_dim();
        let raw = self
            .base_network
            .forward(encoder.forward(condition, mask))
            .reshape([batch_size * max_nodes * half, per_dim]);
        SplineParams::from_raw(raw, self.spline.0.config().num_bins)
    }

    fn transform_half(
        &self,
        values: Tensor<B, 3>,
        params: &SplineParams<B>,
        inverse: bool,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let [batch_size, max_nodes, half] = values.dims();
        let flat = values.reshape([batch_size * max_nodes * half]);
        let (out, log_abs_det) = if inverse {
            self.spline.0.inverse(flat, params)
        } else {
            self.spline.0.forward(flat, params)
        };
        (
            out.reshape([batch_size, max_nodes, half]),
            log_abs_det.reshape([batch_size, max_nodes, half]),
        )
    }

    /// Maps `x` `[batch, nodes, dim]` towards the latent space.
    ///
    /// Returns the transformed tensor and the per-graph log-determinant.
    /// Padded nodes are transformed too but contribute nothing to the
    /// log-determinant and never influence valid nodes.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        v: Tensor<B, 1>,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 1>), FlowError> {
        self.check_input(&x, &v)?;
        let [_, max_nodes, _] = x.dims();
        let mask = node_mask(&v, max_nodes)?;

        let (x, log_det) = self.actnorm.forward(x, v.clone());
        let (x, ld) = self.mixing.forward(x, v);
        let mut log_det = log_det + ld;

        let (lower, upper) = self.split(x);

        let params = self.spline_params(&self.f1, lower.clone(), mask.clone());
        let (upper, ld) = self.transform_half(upper, &params, false);
        log_det = log_det + masked_sum(ld, mask.clone());

        let params = self.spline_params(&self.f2, upper.clone(), mask.clone());
        let (lower, ld) = self.transform_half(lower, &params, false);
        log_det = log_det + masked_sum(ld, mask);

        Ok((Tensor::cat(vec![lower, upper], 2), log_det))
    }

    /// Exact inverse of [`CouplingLayer::forward`].
    pub fn backward(
        &self,
        z: Tensor<B, 3>,
        v: Tensor<B, 1>,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 1>), FlowError> {
        self.check_input(&z, &v)?;
        let [_, max_nodes, _] = z.dims();
        let mask = node_mask(&v, max_nodes)?;

        let (lower, upper) = self.split(z);

        let params = self.spline_params(&self.f2, upper.clone(), mask.clone());
        let (lower, ld) = self.transform_half(lower, &params, true);
        let mut log_det = masked_sum(ld, mask.clone());

        let params = self.spline_params(&self.f1, lower.clone(), mask.clone());
        let (upper, ld) = self.transform_half(upper, &params, true);
        log_det = log_det + masked_sum(ld, mask);

        let (x, ld_mixing) = self.mixing.backward(Tensor::cat(vec![lower, upper], 2), v.clone())?;
        let (x, ld_actnorm) = self.actnorm.backward(x, v);
        Ok((x, log_det + ld_mixing + ld_actnorm))
    }

    /// Returns the embedding width.
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}
