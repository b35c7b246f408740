//! Collation of ragged graphs into padded tensors.

use burn::tensor::{Tensor, TensorData, backend::Backend};
use serde::{Deserialize, Serialize};

use crate::errors::FlowError;

/// One graph as host data: a node embedding per row and a dense adjacency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSample {
    /// `nodes` rows of `dim` features.
    pub embeddings: Vec<Vec<f32>>,
    /// `nodes x nodes` adjacency, usually 0/1 and symmetric.
    pub adjacency: Vec<Vec<f32>>,
}

impl GraphSample {
    pub fn new(embeddings: Vec<Vec<f32>>, adjacency: Vec<Vec<f32>>) -> Self {
        Self {
            embeddings,
            adjacency,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.embeddings.len()
    }

    fn validate(&self, graph: usize, dim: usize) -> Result<(), FlowError> {
        let nodes = self.num_nodes();
        if let Some(row) = self.embeddings.iter().find(|row| row.len() != dim) {
            return Err(FlowError::Data(format!(
                "graph {graph}: embedding row has {} features, expected {dim}",
                row.len()
            )));
        }
        if self.adjacency.len() != nodes || self.adjacency.iter().any(|row| row.len() != nodes) {
            return Err(FlowError::Data(format!(
                "graph {graph}: adjacency must be {nodes}x{nodes}"
            )));
        }
        Ok(())
    }
}

/// A padded batch `(X, A, V)`.
#[derive(Debug, Clone)]
pub struct GraphBatch<B: Backend> {
    /// `[batch, max_nodes, dim]`
    pub embeddings: Tensor<B, 3>,
    /// `[batch, max_nodes, max_nodes]`
    pub adjacency: Tensor<B, 3>,
    /// `[batch]`, integer valued.
    pub node_counts: Tensor<B, 1>,
}

impl<B: Backend> GraphBatch<B> {
    pub fn batch_size(&self) -> usize {
        let [batch_size] = self.node_counts.dims();
        batch_size
    }

    pub fn max_nodes(&self) -> usize {
        let [_, max_nodes, _] = self.embeddings.dims();
        max_nodes
    }
}

/// Pads `samples` to the largest graph and stacks them into a batch.
pub fn collate<B: Backend>(
    samples: &[GraphSample],
    device: &B::Device,
) -> Result<GraphBatch<B>, FlowError> {
    let dim = samples
        .iter()
        .find_map(|sample| sample.embeddings.first().map(Vec::len))
        .ok_or_else(|| FlowError::EmptyBatch("no graph has any node".to_string()))?;
    for (graph, sample) in samples.iter().enumerate() {
        sample.validate(graph, dim)?;
    }

    let batch_size = samples.len();
    let max_nodes = samples.iter().map(GraphSample::num_nodes).max().unwrap_or(0);

    let mut embeddings = vec![0.0f32; batch_size * max_nodes * dim];
    let mut adjacency = vec![0.0f32; batch_size * max_nodes * max_nodes];
    for (graph, sample) in samples.iter().enumerate() {
        for (node, row) in sample.embeddings.iter().enumerate() {
            let start = (graph * max_nodes + node) * dim;
            embeddings[start..start + dim].copy_from_slice(row);
        }
        for (node, row) in sample.adjacency.iter().enumerate() {
            let start = (graph * max_nodes + node) * max_nodes;
            adjacency[start..start + row.len()].copy_from_slice(row);
        }
    }
    let node_counts: Vec<f32> = samples.iter().map(|s| s.num_nodes() as f32).collect();

    Ok(GraphBatch {
        embeddings: Tensor::from_data(
            TensorData::new(embeddings, [batch_size, max_nodes, dim]),
            device,
        ),
        adjacency: Tensor::from_data(
            TensorData::new(adjacency, [batch_size, max_nodes, max_nodes]),
            device,
        ),
        node_counts: Tensor::from_data(TensorData::new(node_counts, [batch_size]), device),
    })
}
