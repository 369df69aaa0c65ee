use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, activation};

/// Target positions carrying this value contribute nothing to the loss or
/// the accuracy counts.
pub const IGNORE_INDEX: i64 = -100;

/// Mean cross entropy over the positions whose target is a real token.
pub fn recall_loss<B: Backend>(logits: Tensor<B, 3>, targets: Tensor<B, 2, Int>) -> Tensor<B, 1> {
    let [_batch, _time, vocab] = logits.shape().dims();

    let log_probs = activation::log_softmax(logits, 2);
    let ignored = targets.clone().equal_elem(IGNORE_INDEX);

    // The ignore marker is negative, so it must be clamped to a real class
    // before the gather and masked out afterwards.
    let class_index = targets.clamp(0, (vocab - 1) as i64).unsqueeze_dim::<3>(2);
    let token_loss = log_probs
        .gather(2, class_index)
        .squeeze::<2>(2)
        .neg()
        .mask_fill(ignored.clone(), 0.0);

    let counted = ignored.bool_not().int().sum().float();
    token_loss.sum() / counted.clamp_min(1.0)
}

/// Correct and scored totals for greedy predictions. The ignore marker is
/// never a valid class, so ignored positions drop out of the correct count
/// on their own.
pub fn recall_counts<B: Backend>(logits: Tensor<B, 3>, targets: Tensor<B, 2, Int>) -> (i64, i64) {
    let predictions = logits.argmax(2).squeeze::<2>(2);
    let correct = scalar_i64(predictions.equal(targets.clone()).int().sum());
    let total = scalar_i64(targets.equal_elem(IGNORE_INDEX).bool_not().int().sum());

    (correct, total)
}

fn scalar_i64<B: Backend>(value: Tensor<B, 1, Int>) -> i64 {
    value
        .into_data()
        .convert::<i64>()
        .into_vec::<i64>()
        .expect("count tensor converts to a vector")[0]
}
