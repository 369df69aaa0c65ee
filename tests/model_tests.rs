use burn::tensor::backend::Backend as BackendTrait;
use burn::tensor::{Int, Tensor, TensorData};
use burn_ndarray::NdArray;

use burn_sequence_zoo::model::{
    AttentionConfig, ConvConfig, LinearAttentionConfig, StateMixerConfig, TimeMixConfig,
};
use burn_sequence_zoo::{
    IGNORE_INDEX, LanguageModel, MixerConfig, ModelConfig, recall_counts, recall_loss,
};

type Backend = NdArray<f32>;

fn device() -> <Backend as BackendTrait>::Device {
    <Backend as BackendTrait>::Device::default()
}

fn base_config(mixer: MixerConfig) -> ModelConfig {
    ModelConfig {
        vocab_size: 32,
        d_model: 16,
        n_layer: 2,
        max_seq_len: 32,
        mixer,
        state_mixer: StateMixerConfig::Mlp { expand: 2 },
        learned_pos: false,
        tie_weights: true,
        dropout: 0.0,
    }
}

fn all_mixers() -> Vec<(&'static str, MixerConfig)> {
    vec![
        (
            "time_mix",
            MixerConfig::TimeMix(TimeMixConfig {
                n_head: 2,
                mix_rank: 4,
                decay_rank: 8,
                key_retention: true,
            }),
        ),
        ("attention", MixerConfig::Attention(AttentionConfig { n_head: 2 })),
        ("conv", MixerConfig::Conv(ConvConfig { kernel_size: 3 })),
        (
            "linear_attention",
            MixerConfig::Linear(LinearAttentionConfig {
                n_head: 2,
                feature_dim: 4,
            }),
        ),
        (
            "hybrid",
            MixerConfig::Hybrid(vec![
                MixerConfig::Conv(ConvConfig { kernel_size: 3 }),
                MixerConfig::Attention(AttentionConfig { n_head: 2 }),
            ]),
        ),
    ]
}

fn token_row(values: Vec<i64>) -> Tensor<Backend, 2, Int> {
    let len = values.len();
    Tensor::from_data(TensorData::new(values, [1, len]), &device())
}

fn scalar_f32(value: Tensor<Backend, 1>) -> f32 {
    value
        .into_data()
        .convert::<f32>()
        .into_vec::<f32>()
        .expect("scalar tensor converts to a vector")[0]
}

fn assert_stepwise_parity(name: &str, config: &ModelConfig) {
    let device = device();
    let model = LanguageModel::<Backend>::new(config, &device);
    let tokens = token_row(vec![3, 7, 1, 14, 7, 2, 30, 5]);

    let whole = model.forward(tokens.clone());

    let mut state = model.init_state(1, &device);
    let mut chunks = Vec::new();
    for t in 0..8 {
        let (logits, next) =
            model.forward_with_state(tokens.clone().slice_dim(1, t..t + 1), state);
        state = next;
        chunks.push(logits);
    }
    let stepped = Tensor::cat(chunks, 1);

    let gap = scalar_f32((whole - stepped).abs().max());
    assert!(gap <= 1e-3, "{name}: parity gap {gap} exceeds tolerance");
}

#[test]
fn every_mixer_produces_vocabulary_logits() {
    <Backend as BackendTrait>::seed(0);
    let device = device();

    for (name, mixer) in all_mixers() {
        let config = base_config(mixer);
        let model = LanguageModel::<Backend>::new(&config, &device);
        let tokens = Tensor::<Backend, 1, Int>::arange(0..16, &device).reshape([2, 8]);

        let logits = model.forward(tokens);
        assert_eq!(
            logits.shape().dims::<3>(),
            [2, 8, config.vocab_size],
            "{name}: unexpected logit shape"
        );
    }
}

#[test]
fn stepwise_replay_matches_the_whole_sequence() {
    <Backend as BackendTrait>::seed(1);
    for (name, mixer) in all_mixers() {
        assert_stepwise_parity(name, &base_config(mixer));
    }
}

#[test]
fn learned_positions_track_the_state_offset() {
    <Backend as BackendTrait>::seed(2);
    let config = ModelConfig {
        learned_pos: true,
        tie_weights: false,
        ..base_config(MixerConfig::Attention(AttentionConfig { n_head: 2 }))
    };
    assert_stepwise_parity("learned_pos", &config);
}

#[test]
fn reset_state_replays_like_a_fresh_one() {
    <Backend as BackendTrait>::seed(4);
    let device = device();
    let config = base_config(MixerConfig::TimeMix(TimeMixConfig {
        n_head: 2,
        mix_rank: 4,
        decay_rank: 8,
        key_retention: true,
    }));
    let model = LanguageModel::<Backend>::new(&config, &device);
    let tokens = token_row(vec![3, 7, 1, 14]);

    let mut state = model.init_state(1, &device);
    let (first, next) = model.forward_with_state(tokens.clone(), state);
    state = next;

    state.reset();
    assert_eq!(state.position, 0);
    let (second, _) = model.forward_with_state(tokens, state);

    let gap = scalar_f32((first - second).abs().max());
    assert!(gap <= 1e-6, "reset state kept history ({gap})");
}

#[test]
fn batch_rows_never_observe_each_other() {
    <Backend as BackendTrait>::seed(3);
    let device = device();
    let row = vec![3i64, 7, 1, 14, 7, 2, 30, 5];

    for (name, mixer) in all_mixers() {
        let model = LanguageModel::<Backend>::new(&base_config(mixer), &device);

        let with_first = Tensor::cat(
            vec![token_row(row.clone()), token_row(vec![9, 9, 9, 9, 9, 9, 9, 9])],
            0,
        );
        let with_second = Tensor::cat(
            vec![token_row(row.clone()), token_row(vec![4, 0, 31, 8, 8, 1, 2, 27])],
            0,
        );

        let first = model.forward(with_first).slice_dim(0, 0..1);
        let second = model.forward(with_second).slice_dim(0, 0..1);
        let gap = scalar_f32((first - second).abs().max());
        assert!(gap <= 1e-5, "{name}: neighbouring sequence leaked ({gap})");
    }
}

#[test]
#[should_panic(expected = "state was built for a different model depth")]
fn rejects_state_from_a_different_depth() {
    let device = device();
    let mixer = MixerConfig::Conv(ConvConfig { kernel_size: 3 });
    let deep = LanguageModel::<Backend>::new(&base_config(mixer.clone()), &device);
    let shallow = LanguageModel::<Backend>::new(
        &ModelConfig {
            n_layer: 1,
            ..base_config(mixer)
        },
        &device,
    );

    let state = shallow.init_state(1, &device);
    let _ = deep.forward_with_state(token_row(vec![1, 2, 3]), state);
}

#[test]
fn recall_loss_ignores_masked_positions() {
    let device = device();
    let logits = Tensor::<Backend, 3>::from_floats(
        [[
            [0.0, 0.0, 0.0, 0.0],
            [5.0, -2.0, 7.0, 0.5],
            [0.0, 0.0, 0.0, 0.0],
        ]],
        &device,
    );
    let targets = Tensor::<Backend, 2, Int>::from_data(
        TensorData::new(vec![2i64, IGNORE_INDEX, 1], [1, 3]),
        &device,
    );

    // Both scored rows are uniform, so the mean loss is exactly ln(4).
    let loss = scalar_f32(recall_loss(logits.clone(), targets.clone()));
    assert!((loss - 4.0f32.ln()).abs() < 1e-5, "loss {loss}");

    // Rewriting the masked row must not move the loss.
    let rewritten = Tensor::<Backend, 3>::from_floats(
        [[
            [0.0, 0.0, 0.0, 0.0],
            [-100.0, 3.0, 42.0, 0.0],
            [0.0, 0.0, 0.0, 0.0],
        ]],
        &device,
    );
    let moved = scalar_f32(recall_loss(rewritten, targets.clone()));
    assert!((loss - moved).abs() < 1e-6, "masked row moved the loss");

    let all_masked = Tensor::<Backend, 2, Int>::from_data(
        TensorData::new(vec![IGNORE_INDEX; 3], [1, 3]),
        &device,
    );
    let empty = scalar_f32(recall_loss(logits, all_masked));
    assert!(empty.abs() < 1e-9, "fully masked batch should cost nothing");
}

#[test]
fn recall_counts_score_only_real_targets() {
    let device = device();
    let logits = Tensor::<Backend, 3>::from_floats(
        [[
            [0.0, 9.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 9.0, 0.0],
            [9.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 9.0, 0.0, 0.0],
        ]],
        &device,
    );
    let targets = Tensor::<Backend, 2, Int>::from_data(
        TensorData::new(vec![1i64, IGNORE_INDEX, 4, 2], [1, 4]),
        &device,
    );

    let (correct, total) = recall_counts(logits, targets);
    assert_eq!(correct, 2);
    assert_eq!(total, 3);
}
