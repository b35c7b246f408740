//! Unconstrained monotonic rational-quadratic spline (Durkan et al., 2019).
//!
//! `K` bins cover `[-B, B]`; outside that interval the map is the identity.
//! The boundary knot derivatives are pinned to one so the spline joins the
//! linear tails smoothly. All tensors are flattened to `[positions, ...]`.

use burn::tensor::{
    Tensor, TensorData,
    activation::{softmax, softplus},
    backend::Backend,
};
use serde::{Deserialize, Serialize};

use crate::errors::FlowError;

/// Hyperparameters of the rational-quadratic spline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplineConfig {
    /// Number of bins `K`.
    pub num_bins: usize,
    /// Half-width `B` of the interval covered by the bins.
    pub tail_bound: f64,
    pub min_bin_width: f64,
    pub min_bin_height: f64,
    pub min_derivative: f64,
}

impl Default for SplineConfig {
    fn default() -> Self {
        Self {
            num_bins: 5,
            tail_bound: 3.0,
            min_bin_width: 1e-3,
            min_bin_height: 1e-3,
            min_derivative: 1e-3,
        }
    }
}

impl SplineConfig {
    /// Creates a SplineConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of bins.
    pub fn with_num_bins(mut self, num_bins: usize) -> Self {
        self.num_bins = num_bins;
        self
    }

    /// Sets the tail bound.
    pub fn with_tail_bound(mut self, tail_bound: f64) -> Self {
        self.tail_bound = tail_bound;
        self
    }

    /// Raw parameters needed per transformed scalar: `K` widths, `K` heights
    /// and `K - 1` interior derivatives.
    pub fn params_per_dim(&self) -> usize {
        3 * self.num_bins - 1
    }

    /// Rejects settings for which the bins cannot be normalized.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.num_bins < 2 {
            return Err(FlowError::invalid_config("spline needs at least two bins"));
        }
        if !(self.tail_bound > 0.0) {
            return Err(FlowError::invalid_config("tail bound must be positive"));
        }
        if self.min_bin_width * self.num_bins as f64 >= 1.0
            || self.min_bin_height * self.num_bins as f64 >= 1.0
        {
            return Err(FlowError::invalid_config(
                "minimal bin width/height too large for the number of bins",
            ));
        }
        if self.min_derivative <= 0.0 || self.min_derivative >= 1.0 {
            return Err(FlowError::invalid_config("min derivative must lie in (0, 1)"));
        }
        Ok(())
    }
}

/// Unnormalized spline parameters for `M` scalars.
#[derive(Debug, Clone)]
pub struct SplineParams<B: Backend> {
    /// `[M, K]`, softmax-normalized into bin widths.
    pub widths: Tensor<B, 2>,
    /// `[M, K]`, softmax-normalized into bin heights.
    pub heights: Tensor<B, 2>,
    /// `[M, K - 1]`, softplus-transformed into interior knot derivatives.
    pub derivatives: Tensor<B, 2>,
}

impl<B: Backend> SplineParams<B> {
    /// Splits a raw `[M, 3K - 1]` network output into widths, heights and derivatives.
    pub fn from_raw(raw: Tensor<B, 2>, num_bins: usize) -> Self {
        Self {
            widths: raw.clone().narrow(1, 0, num_bins),
            heights: raw.clone().narrow(1, num_bins, num_bins),
            derivatives: raw.narrow(1, 2 * num_bins, num_bins - 1),
        }
    }
}

/// Knot positions `[M, K + 1]` and bin sizes `[M, K]` along one axis.
struct Knots<B: Backend> {
    cumulative: Tensor<B, 2>,
    sizes: Tensor<B, 2>,
}

/// Bin quantities gathered at each input's bin, all `[M, 1]`.
struct Bin<B: Backend> {
    x_k: Tensor<B, 2>,
    width: Tensor<B, 2>,
    y_k: Tensor<B, 2>,
    height: Tensor<B, 2>,
    delta: Tensor<B, 2>,
    d_k: Tensor<B, 2>,
    d_k1: Tensor<B, 2>,
}

/// Stateless rational-quadratic spline transform.
#[derive(Debug, Clone, Copy)]
pub struct RationalQuadraticSpline {
    config: SplineConfig,
}

impl RationalQuadraticSpline {
    /// Creates a spline with the given hyperparameters.
    pub fn new(config: SplineConfig) -> Self {
        Self { config }
    }

    /// Returns the hyperparameters.
    pub fn config(&self) -> &SplineConfig {
        &self.config
    }

    /// Maps `inputs` `[M]` forward, returning outputs and `log |dy/dx|` per element.
    pub fn forward<B: Backend>(
        &self,
        inputs: Tensor<B, 1>,
        params: &SplineParams<B>,
    ) -> (Tensor<B, 1>, Tensor<B, 1>) {
        self.transform(inputs, params, false)
    }

    /// Inverts [`RationalQuadraticSpline::forward`], returning inputs and
    /// `log |dx/dy|` per element.
    pub fn inverse<B: Backend>(
        &self,
        outputs: Tensor<B, 1>,
        params: &SplineParams<B>,
    ) -> (Tensor<B, 1>, Tensor<B, 1>) {
        self.transform(outputs, params, true)
    }

    fn transform<B: Backend>(
        &self,
        values: Tensor<B, 1>,
        params: &SplineParams<B>,
        inverse: bool,
    ) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let bound = self.config.tail_bound;
        let [m] = values.dims();
        let outside = values.clone().abs().greater_elem(bound);
        let clamped = values.clone().clamp(-bound, bound).reshape([m, 1]);

        let widths = self.knots(params.widths.clone(), self.config.min_bin_width);
        let heights = self.knots(params.heights.clone(), self.config.min_bin_height);
        let derivatives = self.knot_derivatives(params.derivatives.clone());

        let search = if inverse { &heights } else { &widths };
        let bin = self.gather_bin(&clamped, search, &widths, &heights, derivatives);

        let (mapped, log_abs_det) = if inverse {
            Self::rqs_inverse(clamped, bin)
        } else {
            Self::rqs_forward(clamped, bin)
        };

        let mapped = mapped.reshape([m]).mask_where(outside.clone(), values);
        let log_abs_det = log_abs_det.reshape([m]).mask_fill(outside, 0.0);
        (mapped, log_abs_det)
    }

    fn knots<B: Backend>(&self, unnormalized: Tensor<B, 2>, min_size: f64) -> Knots<B> {
        let [m, k] = unnormalized.dims();
        let device = unnormalized.device();
        let bound = self.config.tail_bound;

        let sizes = softmax(unnormalized, 1) * (1.0 - min_size * k as f64) + min_size;

        // cumulative[:, j] = sum of sizes[:, i] for i < j
        let prefix: Vec<f32> = (0..k)
            .flat_map(|i| (0..=k).map(move |j| if i < j { 1.0 } else { 0.0 }))
            .collect();
        let prefix = Tensor::<B, 2>::from_data(TensorData::new(prefix, [k, k + 1]), &device);
        let cumulative = sizes.matmul(prefix).narrow(1, 0, k);
        let cumulative = Tensor::cat(vec![cumulative, Tensor::ones([m, 1], &device)], 1);
        let cumulative = cumulative * (2.0 * bound) - bound;

        let sizes = cumulative.clone().narrow(1, 1, k) - cumulative.clone().narrow(1, 0, k);
        Knots { cumulative, sizes }
    }

    fn knot_derivatives<B: Backend>(&self, interior: Tensor<B, 2>) -> Tensor<B, 2> {
        let [m, _] = interior.dims();
        let device = interior.device();
        let min_derivative = self.config.min_derivative;
        // softplus(boundary) + min_derivative == 1
        let boundary = ((1.0 - min_derivative).exp() - 1.0).ln();

        let padded = Tensor::cat(
            vec![
                Tensor::full([m, 1], boundary, &device),
                interior,
                Tensor::full([m, 1], boundary, &device),
            ],
            1,
        );
        softplus(padded, 1.0) + min_derivative
    }

    fn gather_bin<B: Backend>(
        &self,
        values: &Tensor<B, 2>,
        search: &Knots<B>,
        widths: &Knots<B>,
        heights: &Knots<B>,
        derivatives: Tensor<B, 2>,
    ) -> Bin<B> {
        let k = self.config.num_bins;
        let [m, _] = values.dims();

        let index = values
            .clone()
            .expand([m, k + 1])
            .greater_equal(search.cumulative.clone())
            .int()
            .sum_dim(1)
            .sub_scalar(1)
            .clamp(0, k as i32 - 1);

        let delta = heights.sizes.clone() / widths.sizes.clone();
        Bin {
            x_k: widths.cumulative.clone().gather(1, index.clone()),
            width: widths.sizes.clone().gather(1, index.clone()),
            y_k: heights.cumulative.clone().gather(1, index.clone()),
            height: heights.sizes.clone().gather(1, index.clone()),
            delta: delta.gather(1, index.clone()),
            d_k: derivatives.clone().gather(1, index.clone()),
            d_k1: derivatives.narrow(1, 1, k).gather(1, index),
        }
    }

    fn rqs_forward<B: Backend>(x: Tensor<B, 2>, bin: Bin<B>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let theta = (x - bin.x_k) / bin.width;
        let one_minus = theta.clone().neg() + 1.0;
        let theta_one_minus = theta.clone() * one_minus.clone();
        let slope_sum = bin.d_k.clone() + bin.d_k1.clone() - bin.delta.clone() * 2.0;

        let numerator = bin.height
            * (bin.delta.clone() * theta.clone().powf_scalar(2.0)
                + bin.d_k.clone() * theta_one_minus.clone());
        let denominator = bin.delta.clone() + slope_sum * theta_one_minus.clone();
        let y = bin.y_k + numerator / denominator.clone();

        let derivative_numerator = bin.delta.clone().powf_scalar(2.0)
            * (bin.d_k1 * theta.powf_scalar(2.0)
                + bin.delta * theta_one_minus * 2.0
                + bin.d_k * one_minus.powf_scalar(2.0));
        let log_abs_det = derivative_numerator.log() - denominator.log() * 2.0;
        (y, log_abs_det)
    }

    fn rqs_inverse<B: Backend>(y: Tensor<B, 2>, bin: Bin<B>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let offset = y - bin.y_k;
        let slope_sum = bin.d_k.clone() + bin.d_k1.clone() - bin.delta.clone() * 2.0;

        let a = bin.height.clone() * (bin.delta.clone() - bin.d_k.clone())
            + offset.clone() * slope_sum.clone();
        let b = bin.height * bin.d_k.clone() - offset.clone() * slope_sum.clone();
        let c = bin.delta.clone().neg() * offset;

        let discriminant = (b.clone().powf_scalar(2.0) - a * c.clone() * 4.0).clamp_min(0.0);
        let root = (c * 2.0) / (b.neg() - discriminant.sqrt());
        let x = root.clone() * bin.width + bin.x_k;

        let one_minus = root.clone().neg() + 1.0;
        let theta_one_minus = root.clone() * one_minus.clone();
        let denominator = bin.delta.clone() + slope_sum * theta_one_minus.clone();
        let derivative_numerator = bin.delta.clone().powf_scalar(2.0)
            * (bin.d_k1 * root.powf_scalar(2.0)
                + bin.delta * theta_one_minus * 2.0
                + bin.d_k * one_minus.powf_scalar(2.0));
        let log_abs_det = denominator.log() * 2.0 - derivative_numerator.log();
        (x, log_abs_det)
    }
}
