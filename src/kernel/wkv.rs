use std::any::TypeId;

use burn::tensor::Tensor;
use burn::tensor::backend::Backend;
use thiserror::Error;

/// Lower clamp on `exp(w)` so the decay stays strictly below 1.0 in f32.
const MIN_RATE: f32 = 1e-6;
/// Upper clamp on `exp(w)` so `exp(-rate)` stays above the smallest normal f32.
const MAX_RATE: f32 = 87.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WkvError {
    #[error("{tensor} shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("channel count {channels} does not divide into {num_heads} heads")]
    ChannelsNotDivisible { channels: usize, num_heads: usize },
    #[error("unsupported element type {dtype}: the state accumulation requires f32 or f64")]
    UnsupportedElem { dtype: &'static str },
    #[error("input sequence is empty")]
    EmptySequence,
}

/// Map per-channel decay logits `w` to decay factors `exp(-exp(w))`.
///
/// The inner rate is clamped so the result is strictly inside `(0, 1)` for
/// every finite input, even after f32 rounding at the extremes.
pub fn decay_from_log_rate<B: Backend, const D: usize>(log_rate: Tensor<B, D>) -> Tensor<B, D> {
    log_rate.exp().clamp(MIN_RATE, MAX_RATE).neg().exp()
}

/// Evaluate the gated linear recurrence over a whole sequence.
///
/// `receptance`, `key`, `value` and `log_rate` are `[batch, time, channels]`
/// with channels split evenly into `num_heads` heads. `bonus` is the per-head
/// current-position weight `[heads, head_dim]` and `state` carries the
/// accumulated key/value outer products `[batch, heads, head_dim, head_dim]`.
///
/// For each position `t`:
///
/// ```text
/// out[t]   = r[t] . (bonus * (k[t] (x) v[t]) + state)
/// state    = (k[t] (x) v[t]) + decay[t] * state      (decay along the key dim)
/// decay[t] = exp(-exp(w[t]))
/// ```
///
/// Returns the output sequence `[batch, time, channels]` and the state after
/// the final position.
pub fn wkv_sequence<B: Backend>(
    receptance: Tensor<B, 3>,
    key: Tensor<B, 3>,
    value: Tensor<B, 3>,
    log_rate: Tensor<B, 3>,
    bonus: Tensor<B, 2>,
    state: Tensor<B, 4>,
    num_heads: usize,
) -> Result<(Tensor<B, 3>, Tensor<B, 4>), WkvError> {
    ensure_supported_elem::<B>()?;

    let dims = receptance.shape().dims::<3>();
    let [batch, time, channels] = dims;
    if time == 0 {
        return Err(WkvError::EmptySequence);
    }
    ensure_dims("key", key.shape().dims::<3>(), dims)?;
    ensure_dims("value", value.shape().dims::<3>(), dims)?;
    ensure_dims("log_rate", log_rate.shape().dims::<3>(), dims)?;
    let head_dim = split_heads(channels, num_heads)?;
    ensure_dims("bonus", bonus.shape().dims::<2>(), [num_heads, head_dim])?;
    ensure_dims(
        "state",
        state.shape().dims::<4>(),
        [batch, num_heads, head_dim, head_dim],
    )?;

    let receptance = receptance.reshape([batch, time, num_heads, head_dim]);
    let key = key.reshape([batch, time, num_heads, head_dim]);
    let value = value.reshape([batch, time, num_heads, head_dim]);
    let decay = decay_from_log_rate(log_rate).reshape([batch, time, num_heads, head_dim]);
    let bonus = bonus.reshape([1, num_heads, head_dim, 1]);

    let mut state = state;
    let mut outputs = Vec::with_capacity(time);

    for t in 0..time {
        let r_t = receptance
            .clone()
            .slice_dim(1, t..t + 1)
            .squeeze::<3>(1);
        let k_t = key.clone().slice_dim(1, t..t + 1).squeeze::<3>(1);
        let v_t = value.clone().slice_dim(1, t..t + 1).squeeze::<3>(1);
        let d_t = decay.clone().slice_dim(1, t..t + 1).squeeze::<3>(1);

        let kv = k_t
            .unsqueeze_dim::<4>(3)
            .matmul(v_t.unsqueeze_dim::<4>(2));

        let out_t = r_t
            .unsqueeze_dim::<4>(2)
            .matmul(kv.clone() * bonus.clone() + state.clone())
            .squeeze::<3>(2);
        outputs.push(out_t);

        state = kv + state * d_t.unsqueeze_dim::<4>(3);
    }

    let output = Tensor::stack::<4>(outputs, 1).reshape([batch, time, channels]);
    Ok((output, state))
}

/// Evaluate a single position of the recurrence.
///
/// Inputs are `[batch, channels]`; the state argument and result match
/// [`wkv_sequence`]. Feeding a sequence through this one position at a time
/// produces the same outputs as the whole-sequence form.
pub fn wkv_step<B: Backend>(
    receptance: Tensor<B, 2>,
    key: Tensor<B, 2>,
    value: Tensor<B, 2>,
    log_rate: Tensor<B, 2>,
    bonus: Tensor<B, 2>,
    state: Tensor<B, 4>,
    num_heads: usize,
) -> Result<(Tensor<B, 2>, Tensor<B, 4>), WkvError> {
    ensure_supported_elem::<B>()?;

    let dims = receptance.shape().dims::<2>();
    let [batch, channels] = dims;
    ensure_dims("key", key.shape().dims::<2>(), dims)?;
    ensure_dims("value", value.shape().dims::<2>(), dims)?;
    ensure_dims("log_rate", log_rate.shape().dims::<2>(), dims)?;
    let head_dim = split_heads(channels, num_heads)?;
    ensure_dims("bonus", bonus.shape().dims::<2>(), [num_heads, head_dim])?;
    ensure_dims(
        "state",
        state.shape().dims::<4>(),
        [batch, num_heads, head_dim, head_dim],
    )?;

    let r_t = receptance.reshape([batch, num_heads, head_dim]);
    let k_t = key.reshape([batch, num_heads, head_dim]);
    let v_t = value.reshape([batch, num_heads, head_dim]);
    let d_t = decay_from_log_rate(log_rate).reshape([batch, num_heads, head_dim]);
    let bonus = bonus.reshape([1, num_heads, head_dim, 1]);

    let kv = k_t
        .unsqueeze_dim::<4>(3)
        .matmul(v_t.unsqueeze_dim::<4>(2));

    let out = r_t
        .unsqueeze_dim::<4>(2)
        .matmul(kv.clone() * bonus + state.clone())
        .squeeze::<3>(2)
        .reshape([batch, channels]);

    let state = kv + state * d_t.unsqueeze_dim::<4>(3);
    Ok((out, state))
}

fn ensure_supported_elem<B: Backend>() -> Result<(), WkvError> {
    let elem = TypeId::of::<B::FloatElem>();
    if elem == TypeId::of::<f32>() || elem == TypeId::of::<f64>() {
        Ok(())
    } else {
        Err(WkvError::UnsupportedElem {
            dtype: std::any::type_name::<B::FloatElem>(),
        })
    }
}

fn ensure_dims<const D: usize>(
    tensor: &'static str,
    actual: [usize; D],
    expected: [usize; D],
) -> Result<(), WkvError> {
    if actual == expected {
        Ok(())
    } else {
        Err(WkvError::ShapeMismatch {
            tensor,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

fn split_heads(channels: usize, num_heads: usize) -> Result<usize, WkvError> {
    if num_heads == 0 || channels % num_heads != 0 {
        return Err(WkvError::ChannelsNotDivisible {
            channels,
            num_heads,
        });
    }
    Ok(channels / num_heads)
}
