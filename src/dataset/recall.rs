use anyhow::{Context, Result, ensure};
use rand::distributions::{Distribution, WeightedIndex};
use rand::prelude::*;

use crate::model::IGNORE_INDEX;

/// Parameters of the synthetic recall task.
///
/// Token ids below half the vocabulary act as keys (zero is reserved for
/// filler), the upper half as values. Each sequence opens with an
/// interleaved key-value prefix and later repeats some keys as queries.
#[derive(Clone, Debug)]
pub struct RecallTaskConfig {
    pub vocab_size: usize,
    pub seq_len: usize,
    pub num_kv_pairs: usize,
    pub num_examples: usize,
    /// Exponent of the power law that places queries. Small values push
    /// queries far from their pair, which stresses the carried state.
    pub power_a: f64,
    /// Replace filler zeros with random tokens so models cannot key on
    /// the filler itself.
    pub random_non_queries: bool,
    pub seed: u64,
}

impl Default for RecallTaskConfig {
    fn default() -> Self {
        Self {
            vocab_size: 8192,
            seq_len: 64,
            num_kv_pairs: 8,
            num_examples: 10_000,
            power_a: 0.01,
            random_non_queries: true,
            seed: 0,
        }
    }
}

/// One generated sequence. `targets[i]` is the token expected from the
/// model after reading `tokens[..=i]`, or the ignore marker where the
/// position is not scored.
#[derive(Clone, Debug)]
pub struct RecallExample {
    pub tokens: Vec<i64>,
    pub targets: Vec<i64>,
}

/// A fully materialised split of the recall task. Generation is
/// deterministic in the seed, so splits are reproduced rather than stored.
#[derive(Debug)]
pub struct RecallDataset {
    examples: Vec<RecallExample>,
    seq_len: usize,
    vocab_size: usize,
}

impl RecallDataset {
    pub fn generate(config: &RecallTaskConfig) -> Result<Self> {
        ensure!(config.num_examples >= 1, "dataset must hold at least one example");
        ensure!(config.num_kv_pairs >= 1, "task needs at least one key-value pair");
        ensure!(
            config.seq_len % 2 == 0,
            "sequence length {} must be even",
            config.seq_len
        );
        ensure!(
            config.seq_len >= 4 * config.num_kv_pairs,
            "sequence length {} cannot hold {} pairs plus their queries",
            config.seq_len,
            config.num_kv_pairs
        );
        ensure!(
            config.vocab_size % 2 == 0,
            "vocabulary size {} must split evenly into keys and values",
            config.vocab_size
        );
        ensure!(
            config.vocab_size / 2 > config.num_kv_pairs,
            "key vocabulary of {} is too small for {} distinct pairs",
            config.vocab_size / 2 - 1,
            config.num_kv_pairs
        );
        ensure!(config.power_a > 0.0, "power-law exponent must be positive");

        let mut rng = StdRng::seed_from_u64(config.seed);
        let examples = (0..config.num_examples)
            .map(|_| Self::example(config, &mut rng))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            examples,
            seq_len: config.seq_len,
            vocab_size: config.vocab_size,
        })
    }

    pub fn examples(&self) -> &[RecallExample] {
        &self.examples
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn example(config: &RecallTaskConfig, rng: &mut StdRng) -> Result<RecallExample> {
        let n = config.num_kv_pairs;
        let half = (config.vocab_size / 2) as i64;

        let mut key_pool: Vec<i64> = (1..half).collect();
        key_pool.shuffle(rng);
        let keys = &key_pool[..n];

        let mut value_pool: Vec<i64> = (half..config.vocab_size as i64).collect();
        value_pool.shuffle(rng);
        let values = &value_pool[..n];

        let gaps = draw_gaps(config, rng)?;

        let mut tokens = vec![0i64; config.seq_len];
        let mut targets = vec![IGNORE_INDEX; config.seq_len];
        for i in 0..n {
            tokens[2 * i] = keys[i];
            tokens[2 * i + 1] = values[i];
        }
        for (i, &gap) in gaps.iter().enumerate() {
            let query = 2 * n + 2 * gap;
            tokens[query] = keys[i];
            targets[query] = values[i];
        }

        if config.random_non_queries {
            for slot in tokens.iter_mut() {
                if *slot == 0 {
                    *slot = rng.gen_range(0..config.vocab_size as i64);
                }
            }
        }

        Ok(RecallExample { tokens, targets })
    }
}

/// Draw one distinct query slot per pair, weighted by the power law over
/// the space after the prefix.
fn draw_gaps(config: &RecallTaskConfig, rng: &mut StdRng) -> Result<Vec<usize>> {
    let n = config.num_kv_pairs;
    let space = (config.seq_len - 2 * n) / 2;

    let weights: Vec<f64> = (0..space)
        .map(|gap| config.power_a * ((gap + 1) as f64).powf(config.power_a - 1.0))
        .collect();
    let mut index = WeightedIndex::new(&weights).context("building the query placement weights")?;

    let mut gaps = Vec::with_capacity(n);
    for _ in 0..n {
        let gap = index.sample(rng);
        gaps.push(gap);
        if gaps.len() < n {
            index
                .update_weights(&[(gap, &0.0)])
                .context("retiring a drawn query slot")?;
        }
    }

    Ok(gaps)
}
