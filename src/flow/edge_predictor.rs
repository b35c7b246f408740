//! Pairwise edge predictor.
//!
//! Node embeddings are contextualised with masked self-attention and a pooled
//! graph summary, then every node pair is scored from symmetric pair features
//! `[h_i * h_j, |h_i - h_j|]`, so `logit(i, j) == logit(j, i)` exactly.

use burn::{
    module::Module,
    tensor::{
        Distribution, Tensor,
        activation::{relu, sigmoid},
        backend::Backend,
    },
};
use serde::{Deserialize, Serialize};

use crate::errors::FlowError;
use crate::layers::{
    AttentionConfig, EncoderKind, Mlp, MlpConfig, Pma, Sab, check_batch_size, node_mask, pair_mask,
};

/// Configuration for an [`EdgePredictor`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgePredictorConfig {
    pub embedding_dim: usize,
    pub hidden_dim: usize,
    pub attention: AttentionConfig,
}

impl EdgePredictorConfig {
    /// Creates a config with a 64-wide, single-head encoder.
    pub fn new(embedding_dim: usize) -> Self {
        Self {
            embedding_dim,
            hidden_dim: 64,
            attention: AttentionConfig::new().with_encoder(EncoderKind::Sab),
        }
    }

    /// Sets the hidden width.
    pub fn with_hidden_dim(mut self, hidden_dim: usize) -> Self {
        self.hidden_dim = hidden_dim;
        self
    }

    /// Sets the attention hyperparameters.
    pub fn with_attention(mut self, attention: AttentionConfig) -> Self {
        self.attention = attention;
        self
    }

    /// Initializes the predictor.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<EdgePredictor<B>, FlowError> {
        if self.embedding_dim == 0 || self.hidden_dim == 0 {
            return Err(FlowError::invalid_config(
                "edge predictor dimensions must be positive",
            ));
        }
        self.attention.validate(self.hidden_dim)?;

        Ok(EdgePredictor {
            encoder: Sab::new(self.embedding_dim, self.hidden_dim, &self.attention, device),
            pool: Pma::new(self.hidden_dim, 1, &self.attention, device),
            classifier: MlpConfig::new(2 * self.hidden_dim, 1, self.hidden_dim).init(device),
            embedding_dim: self.embedding_dim,
        })
    }
}

/// Predicts one edge logit per node pair of a padded graph batch.
#[derive(Module, Debug)]
pub struct EdgePredictor<B: Backend> {
    encoder: Sab<B>,
    pool: Pma<B>,
    classifier: Mlp<B>,
    embedding_dim: usize,
}

impl<B: Backend> EdgePredictor<B> {
    /// Symmetric edge logits `[batch, nodes, nodes]`.
    ///
    /// Entries involving padded nodes are computed but meaningless; use
    /// [`pair_mask`] to select the valid unordered pairs.
    pub fn forward(&self, x: Tensor<B, 3>, v: Tensor<B, 1>) -> Result<Tensor<B, 3>, FlowError> {
        let [batch_size, max_nodes, dim] = x.dims();
        check_batch_size(&v, batch_size)?;
        if dim != self.embedding_dim {
            return Err(FlowError::ShapeMismatch {
                context: "edge predictor embedding",
                expected: self.embedding_dim,
                actual: dim,
            });
        }
        let mask = node_mask(&v, max_nodes)?;

        let h = self.encoder.forward(x, mask.clone());
        let context = self.pool.forward(h.clone(), mask);
        let h = h + context;
        let [_, _, hidden] = h.dims();

        let shape = [batch_size, max_nodes, max_nodes, hidden];
        let h_i = h.clone().reshape([batch_size, max_nodes, 1, hidden]).expand(shape);
        let h_j = h.reshape([batch_size, 1, max_nodes, hidden]).expand(shape);
        let pairs = Tensor::cat(vec![h_i.clone() * h_j.clone(), (h_i - h_j).abs()], 3);

        Ok(self
            .classifier
            .forward(pairs)
            .reshape([batch_size, max_nodes, max_nodes]))
    }

    /// Mean binary cross-entropy over the valid unordered pairs of each graph, `[batch]`.
    ///
    /// Graphs with fewer than two nodes have no pairs and a loss of zero.
    pub fn loss(
        &self,
        x: Tensor<B, 3>,
        a: Tensor<B, 3>,
        v: Tensor<B, 1>,
    ) -> Result<Tensor<B, 1>, FlowError> {
        let [batch_size, max_nodes, _] = x.dims();
        let [a_batch, a_rows, a_cols] = a.dims();
        if a_batch != batch_size {
            return Err(FlowError::ShapeMismatch {
                context: "adjacency batch",
                expected: batch_size,
                actual: a_batch,
            });
        }
        if a_rows != max_nodes || a_cols != max_nodes {
            return Err(FlowError::ShapeMismatch {
                context: "adjacency nodes",
                expected: max_nodes,
                actual: a_rows.max(a_cols),
            });
        }

        let logits = self.forward(x, v.clone())?;
        let pairs = pair_mask(&v, max_nodes)?;

        // log(1 + exp(l)) - l * a, written to stay finite for large |l|.
        let bce = relu(logits.clone()) - logits.clone() * a
            + logits.abs().neg().exp().log1p();
        let total = (bce * pairs.clone())
            .sum_dim(2)
            .sum_dim(1)
            .reshape([batch_size]);
        let count = pairs.sum_dim(2).sum_dim(1).reshape([batch_size]).clamp_min(1.0);
        Ok(total / count)
    }

    /// Edge probabilities `[batch, nodes, nodes]`.
    pub fn predict(&self, x: Tensor<B, 3>, v: Tensor<B, 1>) -> Result<Tensor<B, 3>, FlowError> {
        Ok(sigmoid(self.forward(x, v)?))
    }
}

/// Draws a symmetric 0/1 adjacency from edge probabilities.
///
/// Each valid unordered pair is an independent Bernoulli draw; the diagonal
/// and every row or column of a padded node are zero.
pub fn sample_adjacency<B: Backend>(
    probabilities: Tensor<B, 3>,
    v: Tensor<B, 1>,
) -> Result<Tensor<B, 3>, FlowError> {
    let [batch_size, max_nodes, _] = probabilities.dims();
    check_batch_size(&v, batch_size)?;
    let device = probabilities.device();
    let uniform = Tensor::<B, 3>::random(
        [batch_size, max_nodes, max_nodes],
        Distribution::Uniform(0.0, 1.0),
        &device,
    );
    let upper = uniform.lower(probabilities).float() * pair_mask(&v, max_nodes)?;
    Ok(upper.clone() + upper.swap_dims(1, 2))
}
