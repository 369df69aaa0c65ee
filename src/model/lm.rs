use burn::module::{Module, Param};
use burn::nn::{Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution as TensorDistribution, Int, Tensor};

use super::block::Block;
use super::config::{MixerConfig, ModelConfig};
use super::state::ModelState;

/// Decoder over token sequences: embedding, a stack of mixer blocks, and a
/// projection back to the vocabulary. Everything except the per-layer
/// sequence mixer is shared across architectures, so recall differences
/// come from the mixers alone.
#[derive(Module, Debug)]
pub struct LanguageModel<B: Backend> {
    embed: Embedding<B>,
    pos_embed: Option<Embedding<B>>,
    dropout: Dropout,
    blocks: Vec<Block<B>>,
    norm: LayerNorm<B>,
    head: Option<Param<Tensor<B, 2>>>,
    max_seq_len: usize,
}

impl<B: Backend> LanguageModel<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Self {
        assert!(config.vocab_size >= 1, "vocabulary must not be empty");
        assert!(config.n_layer >= 1, "model needs at least one layer");
        if let MixerConfig::Hybrid(order) = &config.mixer {
            assert!(
                !order.is_empty(),
                "hybrid mixer stack must list at least one mixer"
            );
        }

        let blocks = (0..config.n_layer)
            .map(|layer| Block::new(config, config.mixer_for_layer(layer), layer, device))
            .collect();

        let pos_embed = config
            .learned_pos
            .then(|| EmbeddingConfig::new(config.max_seq_len, config.d_model).init(device));

        // With tied weights the head reuses the embedding table transposed.
        let head = (!config.tie_weights).then(|| {
            Param::from_tensor(Tensor::random(
                [config.d_model, config.vocab_size],
                TensorDistribution::Normal(0.0, 0.02),
                device,
            ))
        });

        Self {
            embed: EmbeddingConfig::new(config.vocab_size, config.d_model).init(device),
            pos_embed,
            dropout: DropoutConfig::new(config.dropout).init(),
            blocks,
            norm: LayerNormConfig::new(config.d_model).init(device),
            head,
            max_seq_len: config.max_seq_len,
        }
    }

    /// Fresh zero state for a batch. Each sequence in the batch gets its
    /// own state slice because every state tensor carries a batch dim.
    pub fn init_state(&self, batch: usize, device: &B::Device) -> ModelState<B> {
        ModelState {
            layers: self
                .blocks
                .iter()
                .map(|block| block.init_state(batch, device))
                .collect(),
            position: 0,
        }
    }

    /// Whole-sequence forward pass. Runs on a fresh state and discards it,
    /// so two batches can never observe each other.
    pub fn forward(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [batch, _time] = tokens.shape().dims();
        let state = self.init_state(batch, &tokens.device());
        self.forward_with_state(tokens, state).0
    }

    /// Stateful forward pass over a chunk of one or more positions.
    /// Feeding a sequence token by token produces the same logits as one
    /// whole-sequence call, up to accumulation order.
    pub fn forward_with_state(
        &self,
        tokens: Tensor<B, 2, Int>,
        state: ModelState<B>,
    ) -> (Tensor<B, 3>, ModelState<B>) {
        let [_batch, time] = tokens.shape().dims();
        let device = tokens.device();
        assert_eq!(
            state.layers.len(),
            self.blocks.len(),
            "state was built for a different model depth"
        );

        let mut x = self.embed.forward(tokens);
        if let Some(pos_embed) = &self.pos_embed {
            let end = state.position + time;
            assert!(
                end <= self.max_seq_len,
                "position {end} exceeds the {} entry position table",
                self.max_seq_len
            );
            let positions =
                Tensor::<B, 1, Int>::arange(state.position as i64..end as i64, &device)
                    .reshape([1, time]);
            x = x + pos_embed.forward(positions);
        }
        x = self.dropout.forward(x);

        let mut next_layers = Vec::with_capacity(self.blocks.len());
        for (block, layer_state) in self.blocks.iter().zip(state.layers) {
            let (out, next) = block.forward(x, layer_state);
            x = out;
            next_layers.push(next);
        }

        let logits = self.project(self.norm.forward(x));
        (
            logits,
            ModelState {
                layers: next_layers,
                position: state.position + time,
            },
        )
    }

    fn project(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, time, d_model] = x.shape().dims();
        let flat = x.reshape([batch * time, d_model]);
        let logits = match &self.head {
            Some(head) => flat.matmul(head.val()),
            None => flat.matmul(self.embed.weight.val().transpose()),
        };

        let [_, vocab] = logits.shape().dims();
        logits.reshape([batch, time, vocab])
    }
}
