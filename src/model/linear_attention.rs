use std::f32::consts::SQRT_2;

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::config::LinearAttentionConfig;

/// Running feature outer product and normalizer carried between stepwise
/// calls. Empty for a fresh sequence, which selects the parallel path.
#[derive(Debug, Clone)]
pub struct LinearAttentionState<B: Backend> {
    pub accum: Option<(Tensor<B, 4>, Tensor<B, 3>)>,
}

impl<B: Backend> LinearAttentionState<B> {
    pub fn empty() -> Self {
        Self { accum: None }
    }

    pub fn reset(&mut self) {
        self.accum = None;
    }
}

/// Linear attention with a second-order Taylor expansion of the softmax
/// kernel as the feature map. The expanded feature width is 1 + f + f*f,
/// so the carried state stays fixed-size while approximating exact recall.
#[derive(Module, Debug)]
pub struct LinearAttention<B: Backend> {
    query: Linear<B>,
    key: Linear<B>,
    value: Linear<B>,
    output: Linear<B>,
    n_head: usize,
    head_dim: usize,
    feature_dim: usize,
}

impl<B: Backend> LinearAttention<B> {
    pub fn new(config: &LinearAttentionConfig, d_model: usize, device: &B::Device) -> Self {
        assert!(config.n_head >= 1, "linear attention requires at least one head");
        assert!(
            d_model % config.n_head == 0,
            "model width {d_model} must be divisible by {} heads",
            config.n_head
        );
        assert!(config.feature_dim >= 1, "feature map needs at least one input");

        Self {
            query: LinearConfig::new(d_model, config.n_head * config.feature_dim)
                .with_bias(false)
                .init(device),
            key: LinearConfig::new(d_model, config.n_head * config.feature_dim)
                .with_bias(false)
                .init(device),
            value: LinearConfig::new(d_model, d_model)
                .with_bias(false)
                .init(device),
            output: LinearConfig::new(d_model, d_model)
                .with_bias(false)
                .init(device),
            n_head: config.n_head,
            head_dim: d_model / config.n_head,
            feature_dim: config.feature_dim,
        }
    }

    pub fn init_state(&self) -> LinearAttentionState<B> {
        LinearAttentionState::empty()
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        state: LinearAttentionState<B>,
    ) -> (Tensor<B, 3>, LinearAttentionState<B>) {
        let [batch, time, channels] = x.shape().dims();
        let device = x.device();

        let query = self
            .query
            .forward(x.clone())
            .reshape([batch, time, self.n_head, self.feature_dim])
            .swap_dims(1, 2);
        let key = self
            .key
            .forward(x.clone())
            .reshape([batch, time, self.n_head, self.feature_dim])
            .swap_dims(1, 2);
        let value = self
            .value
            .forward(x)
            .reshape([batch, time, self.n_head, self.head_dim])
            .swap_dims(1, 2);

        let phi_q = self.feature_map(query);
        let phi_k = self.feature_map(key);

        let (mixed, accum, normalizer) = match state.accum {
            None => {
                let causal = Tensor::<B, 2>::ones([time, time], &device)
                    .tril(0)
                    .reshape([1, 1, time, time]);
                let scores = phi_q.clone().matmul(phi_k.clone().swap_dims(2, 3)) * causal;
                // Every score is at least 1/2, so each row sum is positive
                // and the normalisation needs no epsilon.
                let mixed = scores.clone().matmul(value.clone()).div(scores.sum_dim(3));

                let accum = phi_k.clone().swap_dims(2, 3).matmul(value);
                let normalizer = phi_k.sum_dim(2).squeeze::<3>(2);
                (mixed, accum, normalizer)
            }
            Some((mut accum, mut normalizer)) => {
                let mut outputs = Vec::with_capacity(time);
                for t in 0..time {
                    let q_t = phi_q.clone().slice_dim(2, t..t + 1);
                    let k_t = phi_k.clone().slice_dim(2, t..t + 1);
                    let v_t = value.clone().slice_dim(2, t..t + 1);

                    // The update lands before the read so the position
                    // attends to itself, matching the inclusive mask above.
                    accum = accum + k_t.clone().swap_dims(2, 3).matmul(v_t);
                    normalizer = normalizer + k_t.squeeze::<3>(2);

                    let numer = q_t.clone().matmul(accum.clone());
                    let denom = (q_t.squeeze::<3>(2) * normalizer.clone())
                        .sum_dim(2)
                        .unsqueeze_dim::<4>(3);
                    outputs.push(numer / denom);
                }
                (Tensor::cat(outputs, 2), accum, normalizer)
            }
        };

        let out = mixed.swap_dims(1, 2).reshape([batch, time, channels]);
        (
            self.output.forward(out),
            LinearAttentionState {
                accum: Some((accum, normalizer)),
            },
        )
    }

    fn feature_map(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, h, t, f] = x.shape().dims();
        let ones = Tensor::ones([b, h, t, 1], &x.device());
        let outer = (x.clone().unsqueeze_dim::<5>(4) * x.clone().unsqueeze_dim::<5>(3))
            .reshape([b, h, t, f * f])
            .div_scalar(SQRT_2);

        Tensor::cat(vec![ones, x, outer], 3)
    }
}
