#![recursion_limit = "512"]

use std::sync::Arc;

use burn::LearningRate;
use burn::data::dataloader::DataLoader;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::tensor::backend::Backend as BackendTrait;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_sequence_zoo::{
    LanguageModel, ModelConfig, RecallDataLoader, RecallDataset, RecallTaskConfig, recall_loss,
};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};

fn training_step_bench(c: &mut Criterion) {
    type Backend = Autodiff<NdArray<f32>>;
    <Backend as BackendTrait>::seed(24);
    let device = <Backend as BackendTrait>::Device::default();

    let model_config = ModelConfig {
        vocab_size: 1024,
        d_model: 64,
        n_layer: 2,
        max_seq_len: 64,
        ..ModelConfig::default()
    };
    let base_model = LanguageModel::<Backend>::new(&model_config, &device);

    let dataset = Arc::new(
        RecallDataset::generate(&RecallTaskConfig {
            vocab_size: 1024,
            seq_len: 64,
            num_kv_pairs: 8,
            num_examples: 8,
            ..RecallTaskConfig::default()
        })
        .expect("generate recall batch"),
    );
    let loader = RecallDataLoader::<Backend>::new(dataset, 8, None, &device);
    let batch = loader.iter().next().expect("one batch");

    let optimizer_config = AdamWConfig::new().with_weight_decay(0.1);
    let lr: LearningRate = 1e-3;

    c.bench_function("recall_single_train_step", |b| {
        b.iter_batched(
            || {
                let model = base_model.clone();
                let optimizer = optimizer_config
                    .clone()
                    .init::<Backend, LanguageModel<Backend>>();
                (model, optimizer)
            },
            |(model, mut optimizer)| {
                let logits = model.forward(batch.inputs.clone());
                let loss = recall_loss(logits, batch.targets.clone());
                let grads = GradientsParams::from_grads(loss.backward(), &model);
                optimizer.step(lr, model, grads)
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, training_step_bench);
criterion_main!(benches);
