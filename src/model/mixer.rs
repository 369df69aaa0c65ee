use burn::module::Module;
use burn::tensor::Tensor;
use burn::tensor::backend::Backend;

use super::attention::{Attention, AttentionState};
use super::config::MixerConfig;
use super::conv::{ConvState, GatedConv};
use super::linear_attention::{LinearAttention, LinearAttentionState};
use super::time_mix::{TimeMix, TimeMixState};

/// The sequence mixer chosen for one layer. Hybrid stacks are resolved to
/// one concrete mixer per layer before construction.
#[derive(Module, Debug)]
pub enum SequenceMixer<B: Backend> {
    TimeMix(TimeMix<B>),
    Attention(Attention<B>),
    Conv(GatedConv<B>),
    Linear(LinearAttention<B>),
}

/// Carried state matching the mixer variant of the same layer.
#[derive(Debug, Clone)]
pub enum MixerState<B: Backend> {
    TimeMix(TimeMixState<B>),
    Attention(AttentionState<B>),
    Conv(ConvState<B>),
    Linear(LinearAttentionState<B>),
}

impl<B: Backend> MixerState<B> {
    pub fn reset(&mut self) {
        match self {
            Self::TimeMix(state) => state.reset(),
            Self::Attention(state) => state.reset(),
            Self::Conv(state) => state.reset(),
            Self::Linear(state) => state.reset(),
        }
    }
}

impl<B: Backend> SequenceMixer<B> {
    pub fn new(
        config: &MixerConfig,
        d_model: usize,
        layer: usize,
        n_layer: usize,
        device: &B::Device,
    ) -> Self {
        match config {
            MixerConfig::TimeMix(cfg) => {
                Self::TimeMix(TimeMix::new(cfg, d_model, layer, n_layer, device))
            }
            MixerConfig::Attention(cfg) => Self::Attention(Attention::new(cfg, d_model, device)),
            MixerConfig::Conv(cfg) => Self::Conv(GatedConv::new(cfg, d_model, device)),
            MixerConfig::Linear(cfg) => {
                Self::Linear(LinearAttention::new(cfg, d_model, device))
            }
            MixerConfig::Hybrid(_) => {
                unreachable!("hybrid stacks resolve to one mixer per layer")
            }
        }
    }

    pub fn init_state(&self, batch: usize, device: &B::Device) -> MixerState<B> {
        match self {
            Self::TimeMix(mixer) => MixerState::TimeMix(mixer.init_state(batch, device)),
            Self::Attention(mixer) => MixerState::Attention(mixer.init_state()),
            Self::Conv(mixer) => MixerState::Conv(mixer.init_state(batch, device)),
            Self::Linear(mixer) => MixerState::Linear(mixer.init_state()),
        }
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        state: MixerState<B>,
    ) -> (Tensor<B, 3>, MixerState<B>) {
        match (self, state) {
            (Self::TimeMix(mixer), MixerState::TimeMix(state)) => {
                let (out, state) = mixer.forward(x, state);
                (out, MixerState::TimeMix(state))
            }
            (Self::Attention(mixer), MixerState::Attention(state)) => {
                let (out, state) = mixer.forward(x, state);
                (out, MixerState::Attention(state))
            }
            (Self::Conv(mixer), MixerState::Conv(state)) => {
                let (out, state) = mixer.forward(x, state);
                (out, MixerState::Conv(state))
            }
            (Self::Linear(mixer), MixerState::Linear(state)) => {
                let (out, state) = mixer.forward(x, state);
                (out, MixerState::Linear(state))
            }
            _ => panic!("mixer state variant does not match the layer"),
        }
    }
}
