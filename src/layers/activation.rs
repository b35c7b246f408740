//! Hidden-layer nonlinearities for the base and classifier networks.

use burn::tensor::{Tensor, activation, backend::Backend};
use serde::{Deserialize, Serialize};

/// Elementwise nonlinearity applied after a [`Dense`](super::Dense) layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Activation {
    /// Identity, used on output layers that produce raw parameters or logits.
    #[default]
    None,
    Relu,
    Sigmoid,
    Tanh,
    Gelu,
}

impl Activation {
    /// Applies the nonlinearity to a tensor of any rank.
    pub fn apply<B: Backend, const D: usize>(&self, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::None => tensor,
            Activation::Relu => activation::relu(tensor),
            Activation::Sigmoid => activation::sigmoid(tensor),
            Activation::Tanh => activation::tanh(tensor),
            Activation::Gelu => activation::gelu(tensor),
        }
    }

    /// Compact tag stored inside modules.
    pub fn to_id(&self) -> u8 {
        *self as u8
    }

    /// Inverse of [`Activation::to_id`]; unknown tags fall back to identity.
    pub fn from_id(id: u8) -> Self {
        [
            Activation::None,
            Activation::Relu,
            Activation::Sigmoid,
            Activation::Tanh,
            Activation::Gelu,
        ]
        .get(id as usize)
        .copied()
        .unwrap_or_default()
    }
}
