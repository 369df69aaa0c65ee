use burn::module::Module;
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig1d};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, activation};

use super::config::ConvConfig;

/// Trailing input window carried between stepwise calls, zero-filled for a
/// fresh sequence so the first positions see left padding.
#[derive(Debug, Clone)]
pub struct ConvState<B: Backend> {
    pub window: Tensor<B, 3>,
}

impl<B: Backend> ConvState<B> {
    pub fn zeros(batch: usize, channels: usize, kernel_size: usize, device: &B::Device) -> Self {
        Self {
            window: Tensor::zeros([batch, kernel_size - 1, channels], device),
        }
    }

    pub fn reset(&mut self) {
        self.window = self.window.zeros_like();
    }
}

/// Depthwise causal convolution with a multiplicative gate. A mixer with a
/// hard receptive-field cutoff, so recall beyond the window is impossible
/// for it by construction.
#[derive(Module, Debug)]
pub struct GatedConv<B: Backend> {
    gate: Linear<B>,
    conv: Conv1d<B>,
    output: Linear<B>,
    kernel_size: usize,
    channels: usize,
}

impl<B: Backend> GatedConv<B> {
    pub fn new(config: &ConvConfig, d_model: usize, device: &B::Device) -> Self {
        assert!(
            config.kernel_size >= 2,
            "convolution window must cover at least two positions"
        );

        Self {
            gate: LinearConfig::new(d_model, d_model)
                .with_bias(false)
                .init(device),
            conv: Conv1dConfig::new(d_model, d_model, config.kernel_size)
                .with_groups(d_model)
                .with_padding(PaddingConfig1d::Valid)
                .init(device),
            output: LinearConfig::new(d_model, d_model)
                .with_bias(false)
                .init(device),
            kernel_size: config.kernel_size,
            channels: d_model,
        }
    }

    pub fn init_state(&self, batch: usize, device: &B::Device) -> ConvState<B> {
        ConvState::zeros(batch, self.channels, self.kernel_size, device)
    }

    pub fn forward(&self, x: Tensor<B, 3>, state: ConvState<B>) -> (Tensor<B, 3>, ConvState<B>) {
        let [_batch, time, _channels] = x.shape().dims();
        let gate = activation::silu(self.gate.forward(x.clone()));

        // Valid padding over the carried window keeps the output causal and
        // exactly `time` positions long.
        let padded = Tensor::cat(vec![state.window, x], 1);
        let mixed = self
            .conv
            .forward(padded.clone().swap_dims(1, 2))
            .swap_dims(1, 2);

        let window_len = self.kernel_size - 1;
        let total = time + window_len;
        let window = padded.slice_dim(1, total - window_len..total);

        (self.output.forward(mixed * gate), ConvState { window })
    }
}
