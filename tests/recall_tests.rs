use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use burn::data::dataloader::DataLoader;
use burn::tensor::backend::Backend as BackendTrait;
use burn_ndarray::NdArray;

use burn_sequence_zoo::{
    IGNORE_INDEX, RecallBatch, RecallDataLoader, RecallDataset, RecallExample, RecallTaskConfig,
};

type Backend = NdArray<f32>;

fn small_config() -> RecallTaskConfig {
    RecallTaskConfig {
        vocab_size: 64,
        seq_len: 32,
        num_kv_pairs: 4,
        num_examples: 24,
        power_a: 0.01,
        random_non_queries: false,
        seed: 3,
    }
}

fn check_example_structure(example: &RecallExample, config: &RecallTaskConfig) {
    let n = config.num_kv_pairs;
    let half = (config.vocab_size / 2) as i64;
    assert_eq!(example.tokens.len(), config.seq_len);
    assert_eq!(example.targets.len(), config.seq_len);

    let mut pairs = BTreeMap::new();
    for i in 0..n {
        let key = example.tokens[2 * i];
        let value = example.tokens[2 * i + 1];
        assert!(
            (1..half).contains(&key),
            "prefix key {key} outside the key range"
        );
        assert!(
            (half..config.vocab_size as i64).contains(&value),
            "prefix value {value} outside the value range"
        );
        assert!(pairs.insert(key, value).is_none(), "prefix key {key} repeated");
    }

    let scored: Vec<usize> = (0..config.seq_len)
        .filter(|&i| example.targets[i] != IGNORE_INDEX)
        .collect();
    assert_eq!(scored.len(), n, "expected one scored query per pair");

    let mut queried = BTreeSet::new();
    for &position in &scored {
        assert!(position >= 2 * n, "query at {position} overlaps the prefix");
        assert_eq!(position % 2, 0, "query at odd position {position}");
        let key = example.tokens[position];
        let value = example.targets[position];
        assert_eq!(
            pairs.get(&key),
            Some(&value),
            "query at {position} does not answer its pair"
        );
        assert!(queried.insert(key), "key {key} queried twice");
    }
}

fn batch_rows(batch: RecallBatch<Backend>) -> Vec<Vec<i64>> {
    let [rows, seq_len] = batch.inputs.shape().dims::<2>();
    let flat = batch
        .inputs
        .into_data()
        .convert::<i64>()
        .into_vec::<i64>()
        .expect("batch tensor converts to a vector");
    assert_eq!(flat.len(), rows * seq_len);
    flat.chunks(seq_len).map(|chunk| chunk.to_vec()).collect()
}

#[test]
fn generated_examples_follow_the_recall_layout() {
    let config = small_config();
    let dataset = RecallDataset::generate(&config).expect("generate dataset");

    assert_eq!(dataset.len(), config.num_examples);
    assert_eq!(dataset.seq_len(), config.seq_len);
    assert_eq!(dataset.vocab_size(), config.vocab_size);

    for example in dataset.examples() {
        check_example_structure(example, &config);

        // Without filler replacement every unscored slot past the prefix
        // stays zero.
        for i in 2 * config.num_kv_pairs..config.seq_len {
            if example.targets[i] == IGNORE_INDEX {
                assert_eq!(example.tokens[i], 0, "filler at {i} was rewritten");
            }
        }
    }
}

#[test]
fn filler_replacement_keeps_queries_intact() {
    let config = RecallTaskConfig {
        random_non_queries: true,
        ..small_config()
    };
    let dataset = RecallDataset::generate(&config).expect("generate dataset");

    for example in dataset.examples() {
        check_example_structure(example, &config);
    }
}

#[test]
fn generation_is_deterministic_in_the_seed() {
    let config = small_config();
    let first = RecallDataset::generate(&config).expect("first dataset");
    let second = RecallDataset::generate(&config).expect("second dataset");

    for (a, b) in first.examples().iter().zip(second.examples()) {
        assert_eq!(a.tokens, b.tokens);
        assert_eq!(a.targets, b.targets);
    }

    let reseeded = RecallDataset::generate(&RecallTaskConfig {
        seed: config.seed + 1,
        ..config
    })
    .expect("reseeded dataset");
    let differs = first
        .examples()
        .iter()
        .zip(reseeded.examples())
        .any(|(a, b)| a.tokens != b.tokens);
    assert!(differs, "changing the seed left every sequence unchanged");
}

#[test]
fn rejects_impossible_task_shapes() {
    let odd_len = RecallTaskConfig {
        seq_len: 33,
        ..small_config()
    };
    let err = RecallDataset::generate(&odd_len).expect_err("odd sequence length");
    assert!(err.to_string().contains("must be even"), "{err}");

    let crowded = RecallTaskConfig {
        seq_len: 16,
        num_kv_pairs: 8,
        ..small_config()
    };
    let err = RecallDataset::generate(&crowded).expect_err("too many pairs");
    assert!(err.to_string().contains("cannot hold"), "{err}");

    let odd_vocab = RecallTaskConfig {
        vocab_size: 65,
        ..small_config()
    };
    let err = RecallDataset::generate(&odd_vocab).expect_err("odd vocabulary");
    assert!(err.to_string().contains("split evenly"), "{err}");

    let tiny_vocab = RecallTaskConfig {
        vocab_size: 8,
        num_kv_pairs: 4,
        seq_len: 16,
        ..small_config()
    };
    let err = RecallDataset::generate(&tiny_vocab).expect_err("key range too small");
    assert!(err.to_string().contains("too small"), "{err}");

    let flat_power = RecallTaskConfig {
        power_a: 0.0,
        ..small_config()
    };
    let err = RecallDataset::generate(&flat_power).expect_err("flat power law");
    assert!(err.to_string().contains("must be positive"), "{err}");

    let empty = RecallTaskConfig {
        num_examples: 0,
        ..small_config()
    };
    let err = RecallDataset::generate(&empty).expect_err("empty dataset");
    assert!(err.to_string().contains("at least one example"), "{err}");
}

#[test]
fn loader_batches_cover_the_dataset_in_order() {
    let config = RecallTaskConfig {
        num_examples: 10,
        ..small_config()
    };
    let dataset = Arc::new(RecallDataset::generate(&config).expect("generate dataset"));
    let device = <Backend as BackendTrait>::Device::default();
    let loader = RecallDataLoader::<Backend>::new(Arc::clone(&dataset), 4, None, &device);

    assert_eq!(loader.num_items(), 10);

    let mut iter = loader.iter();
    let mut seen = Vec::new();
    let mut row_counts = Vec::new();
    while let Some(batch) = iter.next() {
        let [rows, seq_len] = batch.inputs.shape().dims::<2>();
        assert_eq!(seq_len, config.seq_len);
        assert_eq!(batch.targets.shape().dims::<2>(), [rows, seq_len]);
        row_counts.push(rows);
        seen.extend(batch_rows(batch));
    }

    assert_eq!(row_counts, vec![4, 4, 2]);
    let expected: Vec<Vec<i64>> = dataset
        .examples()
        .iter()
        .map(|example| example.tokens.clone())
        .collect();
    assert_eq!(seen, expected);
}

#[test]
fn loader_reports_progress_per_batch() {
    let config = RecallTaskConfig {
        num_examples: 10,
        ..small_config()
    };
    let dataset = Arc::new(RecallDataset::generate(&config).expect("generate dataset"));
    let device = <Backend as BackendTrait>::Device::default();
    let loader = RecallDataLoader::<Backend>::new(dataset, 4, None, &device);

    let mut iter = loader.iter();
    iter.next().expect("first batch");
    let progress = iter.progress();
    assert_eq!(progress.items_processed, 4);
    assert_eq!(progress.items_total, 10);
}

#[test]
fn shuffled_loader_walks_a_new_permutation_each_epoch() {
    let config = RecallTaskConfig {
        num_examples: 16,
        ..small_config()
    };
    let dataset = Arc::new(RecallDataset::generate(&config).expect("generate dataset"));
    let device = <Backend as BackendTrait>::Device::default();
    let loader = RecallDataLoader::<Backend>::new(Arc::clone(&dataset), 16, Some(9), &device);

    let first_epoch = batch_rows(loader.iter().next().expect("first epoch batch"));
    let second_epoch = batch_rows(loader.iter().next().expect("second epoch batch"));
    assert_ne!(first_epoch, second_epoch, "epochs reused one permutation");

    let mut expected: Vec<Vec<i64>> = dataset
        .examples()
        .iter()
        .map(|example| example.tokens.clone())
        .collect();
    expected.sort();
    for epoch in [first_epoch, second_epoch] {
        let mut sorted = epoch;
        sorted.sort();
        assert_eq!(sorted, expected, "epoch is not a permutation of the dataset");
    }
}

#[test]
fn slice_restricts_the_visible_window() {
    let config = RecallTaskConfig {
        num_examples: 10,
        ..small_config()
    };
    let dataset = Arc::new(RecallDataset::generate(&config).expect("generate dataset"));
    let device = <Backend as BackendTrait>::Device::default();
    let loader = RecallDataLoader::<Backend>::new(Arc::clone(&dataset), 4, None, &device);

    let window = loader.slice(2, 6);
    assert_eq!(window.num_items(), 4);

    let mut seen = Vec::new();
    let mut iter = window.iter();
    while let Some(batch) = iter.next() {
        seen.extend(batch_rows(batch));
    }
    let expected: Vec<Vec<i64>> = dataset.examples()[2..6]
        .iter()
        .map(|example| example.tokens.clone())
        .collect();
    assert_eq!(seen, expected);
}
