use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig};
use burn::tensor::Tensor;
use burn::tensor::backend::Backend;

use super::config::{MixerConfig, ModelConfig};
use super::mixer::{MixerState, SequenceMixer};
use super::state_mix::StateMixer;

/// Pre-norm residual block: sequence mixer, then the optional channel
/// mixer. Blocks with an identity channel mixer skip the second branch
/// and its norm entirely.
#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    norm_mixer: LayerNorm<B>,
    mixer: SequenceMixer<B>,
    norm_state: Option<LayerNorm<B>>,
    state_mixer: Option<StateMixer<B>>,
    dropout: Dropout,
}

impl<B: Backend> Block<B> {
    pub fn new(
        config: &ModelConfig,
        mixer_config: &MixerConfig,
        layer: usize,
        device: &B::Device,
    ) -> Self {
        let state_mixer = StateMixer::new(&config.state_mixer, config.d_model, device);
        let norm_state = state_mixer
            .is_some()
            .then(|| LayerNormConfig::new(config.d_model).init(device));

        Self {
            norm_mixer: LayerNormConfig::new(config.d_model).init(device),
            mixer: SequenceMixer::new(
                mixer_config,
                config.d_model,
                layer,
                config.n_layer,
                device,
            ),
            norm_state,
            state_mixer,
            dropout: DropoutConfig::new(config.dropout).init(),
        }
    }

    pub fn init_state(&self, batch: usize, device: &B::Device) -> MixerState<B> {
        self.mixer.init_state(batch, device)
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        state: MixerState<B>,
    ) -> (Tensor<B, 3>, MixerState<B>) {
        let (mixed, state) = self.mixer.forward(self.norm_mixer.forward(x.clone()), state);
        let mut x = x + self.dropout.forward(mixed);

        if let Some(norm) = &self.norm_state
            && let Some(state_mixer) = &self.state_mixer
        {
            let out = state_mixer.forward(norm.forward(x.clone()));
            x = x + self.dropout.forward(out);
        }

        (x, state)
    }
}
