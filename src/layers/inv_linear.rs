//! Invertible linear mixing over the embedding axis.
//!
//! The Glow "1x1 convolution" specialised to node embeddings: every node row
//! is multiplied by the same learnable square matrix `W`. `W` is stored in
//! PLU form so `log |det W|` is a plain sum inside the autodiff graph. The
//! inverse is always rebuilt from the current parameters; nothing is cached
//! across calls, so an optimizer step can never leave a stale inverse behind.
//!
//! `P` and the diagonal signs are fixed at init but random, so they live in
//! the record as frozen parameters and a reloaded layer rebuilds the same `W`.

use burn::{
    module::{Module, Param},
    tensor::{Distribution, Tensor, TensorData, backend::Backend},
};
use serde::{Deserialize, Serialize};

use super::linalg;
use super::mask::to_host;
use crate::errors::FlowError;

/// Configuration for an [`InvertibleLinear`] layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InvertibleLinearConfig {
    /// Size of the embedding axis.
    pub dim: usize,
}

impl InvertibleLinearConfig {
    /// Creates a new InvertibleLinearConfig.
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    /// Initializes `W` as a random orthogonal matrix.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<InvertibleLinear<B>, FlowError> {
        if self.dim == 0 {
            return Err(FlowError::invalid_config("mixing dimension must be positive"));
        }
        let samples = to_host(Tensor::<B, 2>::random(
            [self.dim, self.dim],
            Distribution::Normal(0.0, 1.0),
            device,
        ))?;
        let orthogonal = linalg::orthogonal_from_samples(&samples, self.dim)?;
        let factors = linalg::plu_factors(orthogonal)?;

        let square = |values: Vec<f32>| {
            Tensor::<B, 2>::from_data(TensorData::new(values, [self.dim, self.dim]), device)
        };

        Ok(InvertibleLinear {
            lower: Param::from_tensor(square(factors.lower)),
            upper: Param::from_tensor(square(factors.upper)),
            log_s: Param::from_tensor(Tensor::from_data(
                TensorData::new(factors.log_s, [self.dim]),
                device,
            )),
            permutation: Param::from_tensor(square(factors.permutation)).set_require_grad(false),
            sign: Param::from_tensor(Tensor::from_data(
                TensorData::new(factors.sign, [self.dim]),
                device,
            ))
            .set_require_grad(false),
            dim: self.dim,
        })
    }
}

/// Learnable invertible matrix applied to the last axis.
#[derive(Module, Debug)]
pub struct InvertibleLinear<B: Backend> {
    lower: Param<Tensor<B, 2>>,
    upper: Param<Tensor<B, 2>>,
    log_s: Param<Tensor<B, 1>>,
    /// Frozen row permutation `P`.
    permutation: Param<Tensor<B, 2>>,
    /// Frozen signs of the diagonal of `U`.
    sign: Param<Tensor<B, 1>>,
    dim: usize,
}

impl<B: Backend> InvertibleLinear<B> {
    fn constant(&self, values: Vec<f32>, device: &B::Device) -> Tensor<B, 2> {
        Tensor::from_data(TensorData::new(values, [self.dim, self.dim]), device)
    }

    /// Assembles `W = P * L * (U + diag(sign * exp(log_s)))` from the current parameters.
    pub fn weight(&self) -> Tensor<B, 2> {
        let log_s = self.log_s.val();
        let device = log_s.device();
        let identity = self.constant(linalg::identity(self.dim), &device);

        let below = self.constant(linalg::strict_triangle(self.dim, true), &device);
        let above = self.constant(linalg::strict_triangle(self.dim, false), &device);

        let lower = self.lower.val() * below + identity.clone();
        let diagonal = identity * (self.sign.val() * log_s.exp()).reshape([1, self.dim]);
        let upper = self.upper.val() * above + diagonal;

        self.permutation.val().matmul(lower).matmul(upper)
    }

    /// `log |det W|`, a single-element tensor.
    pub fn log_abs_det(&self) -> Tensor<B, 1> {
        self.log_s.val().sum()
    }

    fn apply(&self, x: Tensor<B, 3>, matrix: Tensor<B, 2>) -> Tensor<B, 3> {
        let [batch_size, max_nodes, dim] = x.dims();
        x.reshape([batch_size * max_nodes, dim])
            .matmul(matrix)
            .reshape([batch_size, max_nodes, dim])
    }

    /// `z = x @ W`, with `log_det = log|det W| * v` per graph.
    pub fn forward(&self, x: Tensor<B, 3>, v: Tensor<B, 1>) -> (Tensor<B, 3>, Tensor<B, 1>) {
        let z = self.apply(x, self.weight());
        (z, v * self.log_abs_det())
    }

    /// `x = z @ W^-1` using the inverse of the current `W`.
    pub fn backward(
        &self,
        z: Tensor<B, 3>,
        v: Tensor<B, 1>,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 1>), FlowError> {
        let [_, _, dim] = z.dims();
        if dim != self.dim {
            return Err(FlowError::ShapeMismatch {
                context: "invertible linear input",
                expected: self.dim,
                actual: dim,
            });
        }
        let device = z.device();
        let inverse = linalg::invert(&to_host(self.weight())?, self.dim)?;
        let x = self.apply(z, self.constant(inverse, &device));
        Ok((x, (v * self.log_abs_det()).neg()))
    }

    /// Returns the mixing dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn layer(dim: usize) -> InvertibleLinear<TestBackend> {
        let device = <TestBackend as Backend>::Device::default();
        InvertibleLinearConfig::new(dim).init(&device).unwrap()
    }

    #[test]
    fn test_weight_is_orthogonal_at_init() {
        let layer = layer(4);
        let w = layer.weight();
        let gram = w.clone().matmul(w.transpose());
        let values: Vec<f32> = gram.to_data().to_vec().unwrap();

        for (value, expected) in values.iter().zip(linalg::identity(4).iter()) {
            assert!((value - expected).abs() < 1e-4, "W W^T is not identity");
        }
        let log_det: f32 = layer.log_abs_det().into_scalar();
        assert!(log_det.abs() < 1e-4);
    }

    #[test]
    fn test_log_det_matches_dense_determinant() {
        let device = <TestBackend as Backend>::Device::default();
        let mut layer = layer(3);
        layer.log_s = Param::from_tensor(Tensor::from_floats([0.2, -0.4, 0.9], &device));

        let dense = to_host(layer.weight()).unwrap();
        let expected = linalg::log_abs_det(&dense, 3).unwrap() as f32;
        let actual: f32 = layer.log_abs_det().into_scalar();

        assert!((expected - actual).abs() < 1e-4);
    }

    #[test]
    fn test_round_trip_and_log_det() {
        let device = <TestBackend as Backend>::Device::default();
        let layer = layer(4);
        let x =
            Tensor::<TestBackend, 3>::random([2, 5, 4], Distribution::Normal(0.0, 1.0), &device);
        let v = Tensor::<TestBackend, 1>::from_floats([5.0, 3.0], &device);

        let (z, ld_forward) = layer.forward(x.clone(), v.clone());
        let (x_back, ld_backward) = layer.backward(z, v).unwrap();

        let diff: f32 = (x_back - x).abs().max().into_scalar();
        let ld_sum: f32 = (ld_forward + ld_backward).abs().max().into_scalar();
        assert!(diff < 1e-4, "round trip error {diff}");
        assert!(ld_sum < 1e-5);
    }

    #[test]
    fn test_inverse_follows_parameter_updates() {
        let device = <TestBackend as Backend>::Device::default();
        let mut layer = layer(3);
        let x =
            Tensor::<TestBackend, 3>::random([1, 4, 3], Distribution::Normal(0.0, 1.0), &device);
        let v = Tensor::<TestBackend, 1>::from_floats([4.0], &device);

        // Invert once before the update so any stale state would show up afterwards.
        let (z, _) = layer.forward(x.clone(), v.clone());
        layer.backward(z, v.clone()).unwrap();

        layer.log_s = Param::from_tensor(Tensor::from_floats([0.5, 0.1, -0.3], &device));
        layer.upper = Param::from_tensor(layer.upper.val() + 0.25);

        let (z, _) = layer.forward(x.clone(), v.clone());
        let (x_back, _) = layer.backward(z, v).unwrap();
        let diff: f32 = (x_back - x).abs().max().into_scalar();
        assert!(diff < 1e-4, "inverse is stale: error {diff}");
    }

    #[test]
    fn test_backward_rejects_wrong_dim() {
        let device = <TestBackend as Backend>::Device::default();
        let layer = layer(4);
        let z = Tensor::<TestBackend, 3>::zeros([1, 2, 3], &device);
        let v = Tensor::<TestBackend, 1>::from_floats([2.0], &device);

        assert!(matches!(
            layer.backward(z, v),
            Err(FlowError::ShapeMismatch { expected: 4, actual: 3, .. })
        ));
    }

    #[test]
    fn test_weight_survives_record_reload() {
        let device = <TestBackend as Backend>::Device::default();
        let saved = layer(5);
        let record = saved.clone().into_record();

        let reloaded = InvertibleLinearConfig::new(5)
            .init::<TestBackend>(&device)
            .unwrap()
            .load_record(record);

        let diff: f32 = (saved.weight() - reloaded.weight())
            .abs()
            .max()
            .into_scalar();
        assert!(diff < 1e-6, "reloaded W differs by {diff}");
    }

    #[test]
    fn test_fixed_factors_are_not_trainable() {
        type AutodiffBackend = burn::backend::Autodiff<NdArray>;
        let device = <AutodiffBackend as Backend>::Device::default();
        let layer = InvertibleLinearConfig::new(3)
            .init::<AutodiffBackend>(&device)
            .unwrap();
        assert!(!layer.permutation.is_require_grad());
        assert!(!layer.sign.is_require_grad());
        assert!(layer.log_s.is_require_grad());
    }
}
