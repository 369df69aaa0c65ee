use burn::tensor::backend::Backend;

use super::mixer::MixerState;

/// Carried state for one batch of sequences: one mixer state per layer and
/// the absolute position of the next token. A state belongs to the batch it
/// was initialised for and must not be reused across sequences.
#[derive(Debug, Clone)]
pub struct ModelState<B: Backend> {
    pub layers: Vec<MixerState<B>>,
    pub position: usize,
}

impl<B: Backend> ModelState<B> {
    /// Zero every layer state and rewind the position, keeping the batch
    /// shape, so the next sequence starts clean.
    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.reset();
        }
        self.position = 0;
    }
}
