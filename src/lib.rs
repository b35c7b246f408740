//! # graphflow
//!
//! Normalizing flows over graphs, built on the Burn framework.
//!
//! A [`GraphFlow`] maps padded batches of node embeddings `(X, A, V)` to a
//! standard normal latent space through stacks of invertible coupling
//! layers, tracking exact log-determinants per graph. An edge predictor
//! reconstructs adjacency from the intermediate embeddings, so new graphs
//! can be generated by sampling the prior and inverting the flow.
//!
//! ## Features
//!
//! - **Burn Backend**: Generic over any Burn backend; WGPU aliases are
//!   provided for training and inference.
//! - **Variable-size graphs**: Padding is masked out of every attention
//!   score, log-determinant and loss.
//! - **Exact inverses**: Every layer has a closed-form `backward`, and the
//!   linear mix is inverted from its current weights on every call.
//!
//! ## Example
//!
//! ```
//! use graphflow::prelude::*;
//! use burn::backend::NdArray;
//! use burn::tensor::{Distribution, Tensor};
//!
//! type Backend = NdArray;
//!
//! let device = <Backend as burn::tensor::backend::Backend>::Device::default();
//!
//! let model: GraphFlow<Backend> = GraphFlowConfig::new(4)
//!     .with_num_flows(1)
//!     .with_hidden_dim(8)
//!     .init(&device)
//!     .expect("Failed to build model");
//!
//! let x = Tensor::<Backend, 3>::random([2, 3, 4], Distribution::Normal(0.0, 1.0), &device);
//! let a = Tensor::<Backend, 3>::zeros([2, 3, 3], &device);
//! let v = Tensor::<Backend, 1>::from_floats([3.0, 2.0], &device);
//!
//! let (z, objective) = model.forward(x, a, v).unwrap();
//! assert_eq!(z.dims(), [2, 3, 4]);
//! assert_eq!(objective.dims(), [2]);
//! ```

pub mod data;
pub mod errors;
pub mod flow;
pub mod layers;
pub mod training;

// Re-exports for convenience
pub use errors::FlowError;
pub use flow::{GraphFlow, GraphFlowConfig};
pub use training::{TrainingConfig, train};

/// Backend type alias for WGPU with autodiff support.
pub type Backend = burn::backend::Autodiff<burn::backend::Wgpu>;

/// Backend type for inference (no autodiff).
pub type InferenceBackend = burn::backend::Wgpu;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::data::{BatchSource, GraphBatch, GraphSample, InMemoryBatches, collate};
    pub use crate::errors::FlowError;
    pub use crate::flow::{
        CouplingConfig, EdgePredictorConfig, FlowOutput, GeneratedGraphs, GraphFlow,
        GraphFlowConfig,
    };
    pub use crate::layers::{AttentionConfig, EncoderKind, SplineConfig};
    pub use crate::training::{TrainingConfig, TrainingResult, train};
    pub use crate::{Backend, InferenceBackend};
}
