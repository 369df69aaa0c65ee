use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, activation};

use super::config::StateMixerConfig;

/// Position-wise channel mixer applied after the sequence mixer. The
/// identity variant is expressed by leaving the mixer off the block.
#[derive(Module, Debug)]
pub enum StateMixer<B: Backend> {
    Mlp(Mlp<B>),
    Glu(Glu<B>),
}

impl<B: Backend> StateMixer<B> {
    pub fn new(config: &StateMixerConfig, d_model: usize, device: &B::Device) -> Option<Self> {
        match config {
            StateMixerConfig::Identity => None,
            StateMixerConfig::Mlp { expand } => Some(Self::Mlp(Mlp::new(d_model, *expand, device))),
            StateMixerConfig::Glu { expand } => Some(Self::Glu(Glu::new(d_model, *expand, device))),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match self {
            Self::Mlp(mlp) => mlp.forward(x),
            Self::Glu(glu) => glu.forward(x),
        }
    }
}

/// Squared-ReLU feedforward.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    up: Linear<B>,
    down: Linear<B>,
}

impl<B: Backend> Mlp<B> {
    fn new(d_model: usize, expand: usize, device: &B::Device) -> Self {
        assert!(expand >= 1, "feedforward expansion must not shrink the width");
        Self {
            up: LinearConfig::new(d_model, expand * d_model)
                .with_bias(false)
                .init(device),
            down: LinearConfig::new(expand * d_model, d_model)
                .with_bias(false)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = activation::relu(self.up.forward(x));
        self.down.forward(hidden.clone() * hidden)
    }
}

/// SiLU-gated linear unit.
#[derive(Module, Debug)]
pub struct Glu<B: Backend> {
    gate: Linear<B>,
    up: Linear<B>,
    down: Linear<B>,
}

impl<B: Backend> Glu<B> {
    fn new(d_model: usize, expand: usize, device: &B::Device) -> Self {
        assert!(expand >= 1, "feedforward expansion must not shrink the width");
        Self {
            gate: LinearConfig::new(d_model, expand * d_model)
                .with_bias(false)
                .init(device),
            up: LinearConfig::new(d_model, expand * d_model)
                .with_bias(false)
                .init(device),
            down: LinearConfig::new(expand * d_model, d_model)
                .with_bias(false)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let gated = activation::silu(self.gate.forward(x.clone())) * self.up.forward(x);
        self.down.forward(gated)
    }
}
