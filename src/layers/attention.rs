//! Set-attention blocks (Lee et al., 2019) with key masking.
//!
//! All blocks take a `[batch, nodes]` boolean mask that is `true` for real
//! nodes. Masked keys receive a large negative logit before the softmax, so
//! padded rows never influence the output of a valid row.

use burn::{
    module::{Module, Param},
    nn::{Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig},
    tensor::{Bool, Tensor, activation::{relu, softmax}, backend::Backend},
};
use serde::{Deserialize, Serialize};

use crate::errors::FlowError;

/// Logit assigned to masked keys.
const MASKED_LOGIT: f64 = -1.0e9;

/// Which set encoder conditions the spline parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// Induced self-attention through learned inducing points.
    #[default]
    Isab,
    /// Full self-attention over the node set.
    Sab,
}

/// Shared attention hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub num_heads: usize,
    /// Inducing points for [`Isab`].
    pub num_inducing: usize,
    pub layer_norm: bool,
    pub encoder: EncoderKind,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            num_heads: 1,
            num_inducing: 16,
            layer_norm: false,
            encoder: EncoderKind::Isab,
        }
    }
}

impl AttentionConfig {
    /// Creates an AttentionConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of heads.
    pub fn with_num_heads(mut self, num_heads: usize) -> Self {
        self.num_heads = num_heads;
        self
    }

    /// Sets the number of inducing points.
    pub fn with_num_inducing(mut self, num_inducing: usize) -> Self {
        self.num_inducing = num_inducing;
        self
    }

    /// Enables or disables layer normalization inside each block.
    pub fn with_layer_norm(mut self, layer_norm: bool) -> Self {
        self.layer_norm = layer_norm;
        self
    }

    /// Sets the encoder kind.
    pub fn with_encoder(mut self, encoder: EncoderKind) -> Self {
        self.encoder = encoder;
        self
    }

    /// Checks that `dim_out` splits evenly across heads.
    pub fn validate(&self, dim_out: usize) -> Result<(), FlowError> {
        if self.num_heads == 0 || dim_out % self.num_heads != 0 {
            return Err(FlowError::invalid_config(format!(
                "attention width {dim_out} is not divisible by {} heads",
                self.num_heads
            )));
        }
        if self.encoder == EncoderKind::Isab && self.num_inducing == 0 {
            return Err(FlowError::invalid_config("ISAB needs at least one inducing point"));
        }
        Ok(())
    }
}

fn learned_points<B: Backend>(count: usize, dim: usize, device: &B::Device) -> Param<Tensor<B, 3>> {
    // Xavier-uniform bound.
    let bound = (6.0 / (count + dim) as f64).sqrt();
    Initializer::Uniform {
        min: -bound,
        max: bound,
    }
    .init([1, count, dim], device)
}

/// Multihead attention block `MAB(Q, K)`.
#[derive(Module, Debug)]
pub struct Mab<B: Backend> {
    fc_q: Linear<B>,
    fc_k: Linear<B>,
    fc_v: Linear<B>,
    fc_o: Linear<B>,
    ln0: Option<LayerNorm<B>>,
    ln1: Option<LayerNorm<B>>,
    num_heads: usize,
    dim_v: usize,
}

impl<B: Backend> Mab<B> {
    /// Builds a block mapping queries of width `dim_q` and keys of width
    /// `dim_k` to outputs of width `dim_v`.
    pub fn new(
        dim_q: usize,
        dim_k: usize,
        dim_v: usize,
        config: &AttentionConfig,
        device: &B::Device,
    ) -> Self {
        let norm = || config.layer_norm.then(|| LayerNormConfig::new(dim_v).init(device));
        Self {
            fc_q: LinearConfig::new(dim_q, dim_v).init(device),
            fc_k: LinearConfig::new(dim_k, dim_v).init(device),
            fc_v: LinearConfig::new(dim_k, dim_v).init(device),
            fc_o: LinearConfig::new(dim_v, dim_v).init(device),
            ln0: norm(),
            ln1: norm(),
            num_heads: config.num_heads,
            dim_v,
        }
    }

    fn split_heads(&self, x: Tensor<B, 3>) -> Tensor<B, 4> {
        let [batch_size, len, _] = x.dims();
        x.reshape([batch_size, len, self.num_heads, self.dim_v / self.num_heads])
            .swap_dims(1, 2)
    }

    /// Attends `queries` `[batch, nq, dim_q]` over `keys` `[batch, nk, dim_k]`.
    ///
    /// `key_mask` is `[batch, nk]`, `true` for keys that may be attended to.
    pub fn forward(
        &self,
        queries: Tensor<B, 3>,
        keys: Tensor<B, 3>,
        key_mask: Option<Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        let [batch_size, num_queries, _] = queries.dims();
        let [_, num_keys, _] = keys.dims();

        let q = self.fc_q.forward(queries);
        let k = self.split_heads(self.fc_k.forward(keys.clone()));
        let v = self.split_heads(self.fc_v.forward(keys));
        let q_heads = self.split_heads(q);

        let mut scores =
            q_heads.clone().matmul(k.swap_dims(2, 3)) / (self.dim_v as f64).sqrt();
        if let Some(mask) = key_mask {
            let hidden = mask
                .bool_not()
                .reshape([batch_size, 1, 1, num_keys])
                .expand([batch_size, self.num_heads, num_queries, num_keys]);
            scores = scores.mask_fill(hidden, MASKED_LOGIT);
        }
        let weights = softmax(scores, 3);

        let out = (q_heads + weights.matmul(v))
            .swap_dims(1, 2)
            .reshape([batch_size, num_queries, self.dim_v]);
        let out = match &self.ln0 {
            Some(norm) => norm.forward(out),
            None => out,
        };
        let out = out.clone() + relu(self.fc_o.forward(out));
        match &self.ln1 {
            Some(norm) => norm.forward(out),
            None => out,
        }
    }
}

/// Set attention block: self-attention over the node set.
#[derive(Module, Debug)]
pub struct Sab<B: Backend> {
    mab: Mab<B>,
}

impl<B: Backend> Sab<B> {
    pub fn new(
        dim_in: usize,
        dim_out: usize,
        config: &AttentionConfig,
        device: &B::Device,
    ) -> Self {
        Self {
            mab: Mab::new(dim_in, dim_in, dim_out, config, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, mask: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        self.mab.forward(x.clone(), x, Some(mask))
    }
}

/// Induced set attention block.
///
/// The learned inducing points first summarise the valid nodes, then every
/// node attends to that summary, so the cost is linear in the node count.
#[derive(Module, Debug)]
pub struct Isab<B: Backend> {
    inducing: Param<Tensor<B, 3>>,
    mab0: Mab<B>,
    mab1: Mab<B>,
}

impl<B: Backend> Isab<B> {
    pub fn new(
        dim_in: usize,
        dim_out: usize,
        config: &AttentionConfig,
        device: &B::Device,
    ) -> Self {
        Self {
            inducing: learned_points(config.num_inducing, dim_out, device),
            mab0: Mab::new(dim_out, dim_in, dim_out, config, device),
            mab1: Mab::new(dim_in, dim_out, dim_out, config, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, mask: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let [batch_size, _, _] = x.dims();
        let [_, num_inducing, dim_out] = self.inducing.val().dims();
        let inducing = self
            .inducing
            .val()
            .expand([batch_size, num_inducing, dim_out]);
        let summary = self.mab0.forward(inducing, x.clone(), Some(mask));
        self.mab1.forward(x, summary, None)
    }
}

/// Pooling by multihead attention onto `k` learned seed vectors.
#[derive(Module, Debug)]
pub struct Pma<B: Backend> {
    seeds: Param<Tensor<B, 3>>,
    mab: Mab<B>,
}

impl<B: Backend> Pma<B> {
    pub fn new(dim: usize, num_seeds: usize, config: &AttentionConfig, device: &B::Device) -> Self {
        Self {
            seeds: learned_points(num_seeds, dim, device),
            mab: Mab::new(dim, dim, dim, config, device),
        }
    }

    /// Pools `x` `[batch, nodes, dim]` into `[batch, num_seeds, dim]`.
    pub fn forward(&self, x: Tensor<B, 3>, mask: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let [batch_size, _, _] = x.dims();
        let [_, num_seeds, dim] = self.seeds.val().dims();
        let seeds = self.seeds.val().expand([batch_size, num_seeds, dim]);
        self.mab.forward(seeds, x, Some(mask))
    }
}

/// The per-node encoder used inside a coupling layer.
#[derive(Module, Debug)]
pub enum SetEncoder<B: Backend> {
    Isab(Isab<B>),
    Sab(Sab<B>),
}

impl<B: Backend> SetEncoder<B> {
    /// Builds the encoder selected by `config.encoder`.
    pub fn new(
        dim_in: usize,
        dim_out: usize,
        config: &AttentionConfig,
        device: &B::Device,
    ) -> Result<Self, FlowError> {
        config.validate(dim_out)?;
        Ok(match config.encoder {
            EncoderKind::Isab => Self::Isab(Isab::new(dim_in, dim_out, config, device)),
            EncoderKind::Sab => Self::Sab(Sab::new(dim_in, dim_out, config, device)),
        })
    }

    /// Encodes `[batch, nodes, dim_in]` into `[batch, nodes, dim_out]`.
    pub fn forward(&self, x: Tensor<B, 3>, mask: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        match self {
            Self::Isab(isab) => isab.forward(x, mask),
            Self::Sab(sab) => sab.forward(x, mask),
        }
    }

    pub fn kind(&self) -> EncoderKind {
        match self {
            Self::Isab(_) => EncoderKind::Isab,
            Self::Sab(_) => EncoderKind::Sab,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn valid_rows(x: Tensor<TestBackend, 3>, rows: usize) -> Tensor<TestBackend, 3> {
        let [batch_size, _, dim] = x.dims();
        x.slice([0..batch_size, 0..rows, 0..dim])
    }

    fn mask(valid: usize, total: usize) -> Tensor<TestBackend, 2, Bool> {
        let device = <TestBackend as Backend>::Device::default();
        let values: Vec<bool> = (0..total).map(|i| i < valid).collect();
        Tensor::<TestBackend, 1, Bool>::from_bool(values.as_slice().into(), &device)
            .reshape([1, total])
    }

    #[test]
    fn test_isab_output_shape() {
        let device = <TestBackend as Backend>::Device::default();
        let config = AttentionConfig::new().with_num_inducing(4);
        let isab: Isab<TestBackend> = Isab::new(3, 8, &config, &device);
        let x =
            Tensor::<TestBackend, 3>::random([1, 6, 3], Distribution::Normal(0.0, 1.0), &device);

        let out = isab.forward(x, mask(6, 6));
        assert_eq!(out.dims(), [1, 6, 8]);
    }

    #[test]
    fn test_padding_does_not_leak_into_valid_rows() {
        let device = <TestBackend as Backend>::Device::default();
        let config = AttentionConfig::new().with_num_heads(2).with_layer_norm(true);
        let x =
            Tensor::<TestBackend, 3>::random([1, 5, 4], Distribution::Normal(0.0, 1.0), &device);
        let noise =
            Tensor::<TestBackend, 3>::random([1, 2, 4], Distribution::Normal(5.0, 3.0), &device);
        let perturbed = x.clone().slice_assign([0..1, 3..5, 0..4], noise);

        let isab: Isab<TestBackend> = Isab::new(4, 8, &config, &device);
        let sab: Sab<TestBackend> = Sab::new(4, 8, &config, &device);
        let pma: Pma<TestBackend> = Pma::new(4, 1, &config, &device);

        let diff = |a: Tensor<TestBackend, 3>, b: Tensor<TestBackend, 3>| -> f32 {
            (a - b).abs().max().into_scalar()
        };

        let a = valid_rows(isab.forward(x.clone(), mask(3, 5)), 3);
        let b = valid_rows(isab.forward(perturbed.clone(), mask(3, 5)), 3);
        assert!(diff(a, b) < 1e-5);

        let a = valid_rows(sab.forward(x.clone(), mask(3, 5)), 3);
        let b = valid_rows(sab.forward(perturbed.clone(), mask(3, 5)), 3);
        assert!(diff(a, b) < 1e-5);

        let a = pma.forward(x, mask(3, 5));
        let b = pma.forward(perturbed, mask(3, 5));
        assert!(diff(a, b) < 1e-5);
    }

    #[test]
    fn test_sab_is_permutation_equivariant() {
        let device = <TestBackend as Backend>::Device::default();
        let config = AttentionConfig::new();
        let sab: Sab<TestBackend> = Sab::new(2, 4, &config, &device);
        let x = Tensor::<TestBackend, 3>::from_floats(
            [[[0.1, 0.2], [-0.3, 0.4], [0.5, -0.6]]],
            &device,
        );
        let swapped = Tensor::<TestBackend, 3>::from_floats(
            [[[0.5, -0.6], [-0.3, 0.4], [0.1, 0.2]]],
            &device,
        );

        let out: Vec<f32> = sab.forward(x, mask(3, 3)).to_data().to_vec().unwrap();
        let out_swapped: Vec<f32> = sab.forward(swapped, mask(3, 3)).to_data().to_vec().unwrap();

        // Rows 0 and 2 trade places, row 1 is unchanged.
        for j in 0..4 {
            assert!((out[j] - out_swapped[8 + j]).abs() < 1e-5);
            assert!((out[4 + j] - out_swapped[4 + j]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_validate_rejects_uneven_heads() {
        let config = AttentionConfig::new().with_num_heads(3);
        assert!(config.validate(8).is_err());
        assert!(config.validate(9).is_ok());
    }

    #[test]
    fn test_set_encoder_follows_config() {
        let device = <TestBackend as Backend>::Device::default();
        let sab_config = AttentionConfig::new().with_encoder(EncoderKind::Sab);
        let encoder = SetEncoder::<TestBackend>::new(2, 4, &sab_config, &device).unwrap();
        assert_eq!(encoder.kind(), EncoderKind::Sab);

        let encoder =
            SetEncoder::<TestBackend>::new(2, 4, &AttentionConfig::new(), &device).unwrap();
        assert_eq!(encoder.kind(), EncoderKind::Isab);

        let x = Tensor::<TestBackend, 3>::zeros([1, 3, 2], &device);
        assert_eq!(encoder.forward(x, mask(2, 3)).dims(), [1, 3, 4]);
    }
}
