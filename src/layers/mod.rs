//! Neural network layers for graph flows.
//!
//! Invertible building blocks ([`ActNorm`], [`InvertibleLinear`],
//! [`RationalQuadraticSpline`]) plus the non-invertible networks that
//! parameterize them ([`SetEncoder`], [`Mlp`]).

pub mod activation;
pub mod actnorm;
pub mod attention;
pub mod dense;
pub mod inv_linear;
pub mod linalg;
pub mod mask;
pub mod spline;

pub use activation::Activation;
pub use actnorm::{ActNorm, ActNormConfig};
pub use attention::{AttentionConfig, EncoderKind, Isab, Mab, Pma, Sab, SetEncoder};
pub use dense::{Dense, DenseConfig, Mlp, MlpConfig};
pub use inv_linear::{InvertibleLinear, InvertibleLinearConfig};
pub use mask::{
    check_batch_size, masked_sum, node_mask, node_mask_float, pair_mask, to_host,
    validate_node_counts,
};
pub use spline::{RationalQuadraticSpline, SplineConfig, SplineParams};
