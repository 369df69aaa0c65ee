use std::f32::consts::PI;

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{Bool, Int, Tensor, TensorData, activation};

use super::config::AttentionConfig;

const DEFAULT_THETA: f32 = 65_536.0;

/// Rotated key/value cache carried between stepwise calls. Empty for a
/// fresh sequence, which selects the whole-sequence masked path.
#[derive(Debug, Clone)]
pub struct AttentionState<B: Backend> {
    pub cache: Option<(Tensor<B, 4>, Tensor<B, 4>)>,
}

impl<B: Backend> AttentionState<B> {
    pub fn empty() -> Self {
        Self { cache: None }
    }

    pub fn cached_len(&self) -> usize {
        self.cache
            .as_ref()
            .map(|(keys, _)| keys.shape().dims::<4>()[2])
            .unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.cache = None;
    }
}

/// Softmax attention with rotary position embeddings. Exact recall
/// reference the recurrent mixers are measured against.
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    query: Linear<B>,
    key: Linear<B>,
    value: Linear<B>,
    output: Linear<B>,
    freqs: Tensor<B, 4>,
    n_head: usize,
    head_dim: usize,
}

impl<B: Backend> Attention<B> {
    pub fn new(config: &AttentionConfig, d_model: usize, device: &B::Device) -> Self {
        assert!(config.n_head >= 1, "attention requires at least one head");
        assert!(
            d_model % config.n_head == 0,
            "model width {d_model} must be divisible by {} heads",
            config.n_head
        );
        let head_dim = d_model / config.n_head;
        assert!(head_dim % 2 == 0, "rotary embeddings need an even head width");

        let projection = || {
            LinearConfig::new(d_model, d_model)
                .with_bias(false)
                .init(device)
        };

        Self {
            query: projection(),
            key: projection(),
            value: projection(),
            output: projection(),
            freqs: Self::build_freqs(head_dim, device),
            n_head: config.n_head,
            head_dim,
        }
    }

    pub fn init_state(&self) -> AttentionState<B> {
        AttentionState::empty()
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        state: AttentionState<B>,
    ) -> (Tensor<B, 3>, AttentionState<B>) {
        let [batch, time, channels] = x.shape().dims();
        let device = x.device();
        let offset = state.cached_len();

        let heads = |t: Tensor<B, 3>| {
            t.reshape([batch, time, self.n_head, self.head_dim])
                .swap_dims(1, 2)
        };
        let query = heads(self.query.forward(x.clone()));
        let key = heads(self.key.forward(x.clone()));
        let value = heads(self.value.forward(x));

        let phases = self.phases(offset, time, &device);
        let query = self.rope(phases.clone(), query);
        let key = self.rope(phases, key);

        // Cached keys were rotated when they entered the cache, so only the
        // fresh positions need the embedding.
        let (keys, values) = match state.cache {
            Some((cached_keys, cached_values)) => (
                Tensor::cat(vec![cached_keys, key], 2),
                Tensor::cat(vec![cached_values, value], 2),
            ),
            None => (key, value),
        };
        let total = offset + time;

        let mut scores = query
            .matmul(keys.clone().swap_dims(2, 3))
            .div_scalar((self.head_dim as f32).sqrt());
        if time > 1 {
            let mask = causal_mask::<B>(time, total, offset, &device)
                .reshape([1, 1, time, total])
                .expand([batch, self.n_head, time, total]);
            scores = scores.mask_fill(mask, f32::NEG_INFINITY);
        }

        let mixed = activation::softmax(scores, 3)
            .matmul(values.clone())
            .swap_dims(1, 2)
            .reshape([batch, time, channels]);

        (
            self.output.forward(mixed),
            AttentionState {
                cache: Some((keys, values)),
            },
        )
    }

    fn phases(&self, offset: usize, time: usize, device: &B::Device) -> Tensor<B, 4> {
        let positions = Tensor::<B, 1, Int>::arange(offset as i64..(offset + time) as i64, device)
            .float()
            .reshape([1, 1, time, 1]);

        let raw = positions * self.freqs.clone();
        (raw.clone() - raw.floor()) * (2.0 * PI)
    }

    fn rope(&self, phases: Tensor<B, 4>, values: Tensor<B, 4>) -> Tensor<B, 4> {
        let cos = phases.clone().cos();
        let sin = phases.sin();

        let [b, h, t, n] = values.shape().dims();
        let pairs = values.clone().reshape([b, h, t, n / 2, 2]);

        let even = pairs.clone().slice_dim(4, 0..1).squeeze::<4>(4);
        let odd = pairs.slice_dim(4, 1..2).squeeze::<4>(4);

        let rotated = Tensor::stack::<5>(vec![odd.clone().neg(), even], 4).reshape([b, h, t, n]);

        values * cos + rotated * sin
    }

    fn build_freqs(latent: usize, device: &B::Device) -> Tensor<B, 4> {
        let mut data = Vec::with_capacity(latent);
        for idx in 0..latent {
            let quantized = (idx as f32 / 2.0).floor() * 2.0;
            let exponent = quantized / latent as f32;
            let value = 1.0 / DEFAULT_THETA.powf(exponent) / (2.0 * PI);
            data.push(value);
        }
        Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([1, 1, 1, latent])
    }
}

fn causal_mask<B: Backend>(
    time: usize,
    total: usize,
    offset: usize,
    device: &B::Device,
) -> Tensor<B, 2, Bool> {
    let mut blocked = vec![false; time * total];
    for row in 0..time {
        for col in 0..total {
            blocked[row * total + col] = col > offset + row;
        }
    }
    Tensor::from_data(TensorData::new(blocked, [time, total]), device)
}
