use burn::module::{Module, Param};
use burn::nn::{Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution as TensorDistribution, Tensor, activation};

use crate::kernel::{decay_from_log_rate, wkv_sequence, wkv_step};

use super::config::TimeMixConfig;

const GROUP_NORM_EPS: f32 = 6.4e-4;

/// Carried state of one gated time-mixing layer: the previous position's
/// input for the token shift and the accumulated recurrence state.
#[derive(Debug, Clone)]
pub struct TimeMixState<B: Backend> {
    pub shift: Tensor<B, 2>,
    pub wkv: Tensor<B, 4>,
}

impl<B: Backend> TimeMixState<B> {
    pub fn zeros(batch: usize, channels: usize, n_head: usize, device: &B::Device) -> Self {
        let head_dim = channels / n_head;
        Self {
            shift: Tensor::zeros([batch, channels], device),
            wkv: Tensor::zeros([batch, n_head, head_dim, head_dim], device),
        }
    }

    pub fn reset(&mut self) {
        self.shift = self.shift.zeros_like();
        self.wkv = self.wkv.zeros_like();
    }
}

/// Gated recurrent time mixer: token-shift interpolation with low-rank
/// data-dependent adjustments, a data-dependent decay, and the linear
/// recurrence kernel, followed by per-head normalisation and a SiLU gate.
#[derive(Module, Debug)]
pub struct TimeMix<B: Backend> {
    time_maa_x: Param<Tensor<B, 3>>,
    time_maa_w: Param<Tensor<B, 3>>,
    time_maa_k: Param<Tensor<B, 3>>,
    time_maa_v: Param<Tensor<B, 3>>,
    time_maa_r: Param<Tensor<B, 3>>,
    time_maa_g: Param<Tensor<B, 3>>,
    mix_lora_a: Param<Tensor<B, 2>>,
    mix_lora_b: Param<Tensor<B, 3>>,
    decay_base: Param<Tensor<B, 3>>,
    decay_lora_a: Param<Tensor<B, 2>>,
    decay_lora_b: Param<Tensor<B, 2>>,
    bonus: Param<Tensor<B, 2>>,
    receptance: Linear<B>,
    key: Linear<B>,
    value: Linear<B>,
    gate: Linear<B>,
    output: Linear<B>,
    norm_weight: Param<Tensor<B, 1>>,
    norm_bias: Param<Tensor<B, 1>>,
    n_head: usize,
    head_dim: usize,
    mix_rank: usize,
    key_retention: bool,
}

impl<B: Backend> TimeMix<B> {
    pub fn new(
        config: &TimeMixConfig,
        d_model: usize,
        layer: usize,
        n_layer: usize,
        device: &B::Device,
    ) -> Self {
        assert!(config.n_head >= 1, "time mixer requires at least one head");
        assert!(
            d_model % config.n_head == 0,
            "model width {d_model} must be divisible by {} heads",
            config.n_head
        );
        let head_dim = d_model / config.n_head;

        // Interpolation coefficients and decay speeds spread with depth, so
        // early layers favour the previous position and deep layers the
        // current one.
        let depth_inv = 1.0 - layer as f32 / n_layer.max(1) as f32;
        let spread = if n_layer > 1 {
            layer as f32 / (n_layer - 1) as f32
        } else {
            0.0
        };

        let interp = |ratio: f32| {
            let data: Vec<f32> = (0..d_model)
                .map(|i| 1.0 - (i as f32 / d_model as f32).powf(ratio))
                .collect();
            Param::from_tensor(
                Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([1, 1, d_model]),
            )
        };

        let decay_data: Vec<f32> = (0..d_model)
            .map(|i| {
                let pos = if d_model > 1 {
                    i as f32 / (d_model - 1) as f32
                } else {
                    0.0
                };
                -6.0 + 5.0 * pos.powf(0.7 + 1.3 * spread)
            })
            .collect();
        let decay_base = Param::from_tensor(
            Tensor::<B, 1>::from_floats(decay_data.as_slice(), device).reshape([1, 1, d_model]),
        );

        let lora_in = |cols: usize| {
            Param::from_tensor(Tensor::<B, 2>::random(
                [d_model, cols],
                TensorDistribution::Normal(0.0, 0.02),
                device,
            ))
        };
        let projection = || LinearConfig::new(d_model, d_model).with_bias(false).init(device);

        Self {
            time_maa_x: interp(depth_inv),
            time_maa_w: interp(depth_inv),
            time_maa_k: interp(depth_inv),
            time_maa_v: interp(depth_inv),
            time_maa_r: interp(depth_inv * 0.5),
            time_maa_g: interp(depth_inv * 0.5),
            mix_lora_a: lora_in(5 * config.mix_rank),
            mix_lora_b: Param::from_tensor(Tensor::<B, 3>::zeros(
                [5, config.mix_rank, d_model],
                device,
            )),
            decay_base,
            decay_lora_a: lora_in(config.decay_rank),
            decay_lora_b: Param::from_tensor(Tensor::<B, 2>::zeros(
                [config.decay_rank, d_model],
                device,
            )),
            bonus: Param::from_tensor(Tensor::<B, 2>::zeros([config.n_head, head_dim], device)),
            receptance: projection(),
            key: projection(),
            value: projection(),
            gate: projection(),
            output: projection(),
            norm_weight: Param::from_tensor(Tensor::<B, 1>::ones([d_model], device)),
            norm_bias: Param::from_tensor(Tensor::<B, 1>::zeros([d_model], device)),
            n_head: config.n_head,
            head_dim,
            mix_rank: config.mix_rank,
            key_retention: config.key_retention,
        }
    }

    pub fn init_state(&self, batch: usize, device: &B::Device) -> TimeMixState<B> {
        TimeMixState::zeros(batch, self.n_head * self.head_dim, self.n_head, device)
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        state: TimeMixState<B>,
    ) -> (Tensor<B, 3>, TimeMixState<B>) {
        let [batch, time, channels] = x.shape().dims();

        let shifted = if time == 1 {
            state.shift.clone().unsqueeze_dim::<3>(1)
        } else {
            Tensor::cat(
                vec![
                    state.shift.clone().unsqueeze_dim::<3>(1),
                    x.clone().slice_dim(1, 0..time - 1),
                ],
                1,
            )
        };
        let next_shift = x.clone().slice_dim(1, time - 1..time).squeeze::<2>(1);

        let delta = shifted - x.clone();
        let base_mix = x.clone() + delta.clone() * self.time_maa_x.val();

        let adjust = activation::tanh(
            base_mix
                .reshape([batch * time, channels])
                .matmul(self.mix_lora_a.val()),
        )
        .reshape([batch * time, 5, self.mix_rank])
        .swap_dims(0, 1)
        .matmul(self.mix_lora_b.val())
        .reshape([5, batch, time, channels]);

        let mix_input = |idx: usize, maa: Tensor<B, 3>| {
            let adj = adjust
                .clone()
                .slice_dim(0, idx..idx + 1)
                .reshape([batch, time, channels]);
            x.clone() + delta.clone() * (maa + adj)
        };

        let w_input = mix_input(0, self.time_maa_w.val());
        let k_input = mix_input(1, self.time_maa_k.val());
        let v_input = mix_input(2, self.time_maa_v.val());
        let r_input = mix_input(3, self.time_maa_r.val());
        let g_input = mix_input(4, self.time_maa_g.val());

        let receptance = self.receptance.forward(r_input);
        let mut key = self.key.forward(k_input);
        let value = self.value.forward(v_input);
        let gate = activation::silu(self.gate.forward(g_input));

        let decay_adjust = activation::tanh(
            w_input
                .reshape([batch * time, channels])
                .matmul(self.decay_lora_a.val()),
        )
        .matmul(self.decay_lora_b.val())
        .reshape([batch, time, channels]);
        let log_rate = self.decay_base.val() + decay_adjust;

        if self.key_retention {
            let retained = decay_from_log_rate(log_rate.clone()).neg().add_scalar(1.0);
            key = key * retained;
        }

        let (wkv, next_wkv) = if time == 1 {
            let (out, next) = wkv_step(
                receptance.reshape([batch, channels]),
                key.reshape([batch, channels]),
                value.reshape([batch, channels]),
                log_rate.reshape([batch, channels]),
                self.bonus.val(),
                state.wkv,
                self.n_head,
            )
            .expect("projection widths match the head layout");
            (out.reshape([batch, 1, channels]), next)
        } else {
            wkv_sequence(
                receptance,
                key,
                value,
                log_rate,
                self.bonus.val(),
                state.wkv,
                self.n_head,
            )
            .expect("projection widths match the head layout")
        };

        let out = self.output.forward(self.head_norm(wkv) * gate);
        (
            out,
            TimeMixState {
                shift: next_shift,
                wkv: next_wkv,
            },
        )
    }

    fn head_norm(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, time, channels] = x.shape().dims();
        let grouped = x.reshape([batch, time, self.n_head, self.head_dim]);
        let (var, mean) = grouped.clone().var_mean_bias(3);
        let normed = grouped
            .sub(mean)
            .div(var.add_scalar(GROUP_NORM_EPS).sqrt())
            .reshape([batch, time, channels]);

        normed * self.norm_weight.val().reshape([1, 1, channels])
            + self.norm_bias.val().reshape([1, 1, channels])
    }
}
