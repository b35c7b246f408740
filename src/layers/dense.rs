//! Dense layers and the small MLP used as a base network.

use crate::layers::Activation;
use burn::{
    module::Module,
    nn::{Linear, LinearConfig},
    tensor::{Tensor, backend::Backend},
};
use serde::{Deserialize, Serialize};

/// Configuration for a Dense layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DenseConfig {
    /// Number of input features.
    pub input_size: usize,
    /// Number of output features.
    pub output_size: usize,
    /// Activation function to apply after the linear transformation.
    pub activation: Activation,
}

impl DenseConfig {
    /// Creates a new DenseConfig.
    pub fn new(input_size: usize, output_size: usize) -> Self {
        Self {
            input_size,
            output_size,
            activation: Activation::None,
        }
    }

    /// Sets the activation function.
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Initializes the Dense layer with the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Dense<B> {
        Dense {
            linear: LinearConfig::new(self.input_size, self.output_size).init(device),
            output_size: self.output_size,
            activation_id: self.activation.to_id(),
        }
    }
}

/// A dense (fully connected) layer with optional activation, applied to the
/// last axis of a tensor of any rank.
#[derive(Module, Debug)]
pub struct Dense<B: Backend> {
    linear: Linear<B>,
    output_size: usize,
    /// Activation function ID, see [`Activation::to_id`].
    activation_id: u8,
}

impl<B: Backend> Dense<B> {
    /// Performs the forward pass.
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let output = self.linear.forward(input);
        Activation::from_id(self.activation_id).apply(output)
    }

    /// Returns the output size of this layer.
    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Returns the activation function.
    pub fn activation(&self) -> Activation {
        Activation::from_id(self.activation_id)
    }
}

/// Configuration for an [`Mlp`]: `num_hidden` activated hidden layers
/// followed by a linear output layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MlpConfig {
    pub input_size: usize,
    pub output_size: usize,
    pub hidden_size: usize,
    pub num_hidden: usize,
    pub activation: Activation,
}

impl MlpConfig {
    /// Two ReLU hidden layers of width `hidden_size`.
    pub fn new(input_size: usize, output_size: usize, hidden_size: usize) -> Self {
        Self {
            input_size,
            output_size,
            hidden_size,
            num_hidden: 2,
            activation: Activation::Relu,
        }
    }

    /// Sets the number of hidden layers.
    pub fn with_num_hidden(mut self, num_hidden: usize) -> Self {
        self.num_hidden = num_hidden;
        self
    }

    /// Sets the hidden activation.
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Initializes the network.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        let mut layers = Vec::with_capacity(self.num_hidden + 1);
        let mut input_size = self.input_size;
        for _ in 0..self.num_hidden {
            layers.push(
                DenseConfig::new(input_size, self.hidden_size)
                    .with_activation(self.activation)
                    .init(device),
            );
            input_size = self.hidden_size;
        }
        layers.push(DenseConfig::new(input_size, self.output_size).init(device));
        Mlp { layers }
    }
}

/// Feed-forward network of [`Dense`] layers.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    layers: Vec<Dense<B>>,
}

impl<B: Backend> Mlp<B> {
    /// Performs a forward pass through all layers.
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let mut x = input;
        for layer in &self.layers {
            x = layer.forward(x);
        }
        x
    }

    /// Returns the output size of the network.
    pub fn output_size(&self) -> usize {
        self.layers.last().map(|l| l.output_size()).unwrap_or(0)
    }

    /// Returns the number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}
