use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use toml::Value;

use crate::dataset::RecallTaskConfig;
use crate::model::{
    AttentionConfig, ConvConfig, LinearAttentionConfig, MixerConfig, ModelConfig,
    StateMixerConfig, TimeMixConfig,
};

/// Task dimensions shared by every run of an experiment.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DataConfig {
    pub vocab_size: usize,
    pub seq_len: usize,
    pub num_kv_pairs: usize,
    pub num_train_examples: usize,
    pub num_test_examples: usize,
    pub batch_size: usize,
    #[serde(default = "default_power_a")]
    pub power_a: f64,
    /// Query placement exponent for the held-out split; falls back to
    /// `power_a` when unset.
    #[serde(default)]
    pub test_power_a: Option<f64>,
    #[serde(default = "default_true")]
    pub random_non_queries: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MixerKind {
    TimeMix,
    Attention,
    Conv,
    LinearAttention,
    Hybrid,
}

impl fmt::Display for MixerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TimeMix => "time_mix",
            Self::Attention => "attention",
            Self::Conv => "conv",
            Self::LinearAttention => "linear_attention",
            Self::Hybrid => "hybrid",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateMixerKind {
    Identity,
    Mlp,
    Glu,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ModelSection {
    pub d_model: usize,
    pub n_layer: usize,
    pub mixer: MixerKind,
    /// Layer order for the hybrid mixer, cycled when shorter than the stack.
    #[serde(default)]
    pub hybrid_order: Vec<MixerKind>,
    #[serde(default = "default_n_head")]
    pub n_head: usize,
    #[serde(default = "default_mix_rank")]
    pub mix_rank: usize,
    #[serde(default = "default_decay_rank")]
    pub decay_rank: usize,
    #[serde(default = "default_true")]
    pub key_retention: bool,
    #[serde(default = "default_conv_kernel")]
    pub conv_kernel: usize,
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,
    #[serde(default = "default_state_mixer")]
    pub state_mixer: StateMixerKind,
    #[serde(default = "default_ffw_expand")]
    pub ffw_expand: usize,
    #[serde(default = "default_true")]
    pub tie_weights: bool,
    #[serde(default)]
    pub learned_pos: bool,
    #[serde(default)]
    pub dropout: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LearningRateScheduleConfig {
    Constant,
    Cosine {
        #[serde(default)]
        min_lr: f64,
    },
    Linear {
        final_lr: f64,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct OptimizerSection {
    pub learning_rate: f64,
    pub weight_decay: f32,
    #[serde(default)]
    pub lr_schedule: Option<LearningRateScheduleConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TrainingSection {
    pub epochs: usize,
    pub log_frequency: usize,
    /// Stop once validation accuracy reaches this fraction.
    #[serde(default = "default_early_stop_accuracy")]
    pub early_stop_accuracy: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Grid axes for the sweep runner. Empty axes fall back to the single value
/// from the main sections.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SweepSection {
    #[serde(default)]
    pub mixers: Vec<MixerKind>,
    #[serde(default)]
    pub d_models: Vec<usize>,
    #[serde(default)]
    pub learning_rates: Vec<f64>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub name: Option<String>,
}

impl Default for SweepSection {
    fn default() -> Self {
        Self {
            mixers: Vec::new(),
            d_models: Vec::new(),
            learning_rates: Vec::new(),
            output_dir: default_output_dir(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ExperimentConfig {
    pub data: DataConfig,
    pub model: ModelSection,
    pub optimizer: OptimizerSection,
    pub training: TrainingSection,
    #[serde(default)]
    pub sweep: SweepSection,
}

impl ExperimentConfig {
    /// Resolve the model section against the task dimensions.
    pub fn model_config(&self) -> Result<ModelConfig> {
        Ok(ModelConfig {
            vocab_size: self.data.vocab_size,
            d_model: self.model.d_model,
            n_layer: self.model.n_layer,
            max_seq_len: self.data.seq_len,
            mixer: self.mixer_config(self.model.mixer)?,
            state_mixer: match self.model.state_mixer {
                StateMixerKind::Identity => StateMixerConfig::Identity,
                StateMixerKind::Mlp => StateMixerConfig::Mlp {
                    expand: self.model.ffw_expand,
                },
                StateMixerKind::Glu => StateMixerConfig::Glu {
                    expand: self.model.ffw_expand,
                },
            },
            learned_pos: self.model.learned_pos,
            tie_weights: self.model.tie_weights,
            dropout: self.model.dropout,
        })
    }

    fn mixer_config(&self, kind: MixerKind) -> Result<MixerConfig> {
        Ok(match kind {
            MixerKind::TimeMix => MixerConfig::TimeMix(TimeMixConfig {
                n_head: self.model.n_head,
                mix_rank: self.model.mix_rank,
                decay_rank: self.model.decay_rank,
                key_retention: self.model.key_retention,
            }),
            MixerKind::Attention => MixerConfig::Attention(AttentionConfig {
                n_head: self.model.n_head,
            }),
            MixerKind::Conv => MixerConfig::Conv(ConvConfig {
                kernel_size: self.model.conv_kernel,
            }),
            MixerKind::LinearAttention => MixerConfig::Linear(LinearAttentionConfig {
                n_head: self.model.n_head,
                feature_dim: self.model.feature_dim,
            }),
            MixerKind::Hybrid => {
                if self.model.hybrid_order.is_empty() {
                    return Err(anyhow!("hybrid mixer requires a non-empty hybrid_order"));
                }
                let mut order = Vec::with_capacity(self.model.hybrid_order.len());
                for entry in &self.model.hybrid_order {
                    if *entry == MixerKind::Hybrid {
                        return Err(anyhow!("hybrid_order cannot nest another hybrid"));
                    }
                    order.push(self.mixer_config(*entry)?);
                }
                MixerConfig::Hybrid(order)
            }
        })
    }

    pub fn train_task_config(&self) -> RecallTaskConfig {
        self.task_config(
            self.data.num_train_examples,
            self.training.seed,
            self.data.power_a,
        )
    }

    /// The held-out split gets its own seed and, when configured, its own
    /// query placement exponent.
    pub fn test_task_config(&self) -> RecallTaskConfig {
        self.task_config(
            self.data.num_test_examples,
            self.training.seed + 1,
            self.data.test_power_a.unwrap_or(self.data.power_a),
        )
    }

    fn task_config(&self, num_examples: usize, seed: u64, power_a: f64) -> RecallTaskConfig {
        RecallTaskConfig {
            vocab_size: self.data.vocab_size,
            seq_len: self.data.seq_len,
            num_kv_pairs: self.data.num_kv_pairs,
            num_examples,
            power_a,
            random_non_queries: self.data.random_non_queries,
            seed,
        }
    }
}

pub fn load_experiment_config(paths: &[PathBuf]) -> Result<ExperimentConfig> {
    if paths.is_empty() {
        return Err(anyhow!("at least one configuration path is required"));
    }

    let mut iter = paths.iter();
    let first_path = iter
        .next()
        .ok_or_else(|| anyhow!("configuration iterator unexpectedly empty"))?;
    let mut value = load_value(first_path)?;

    for path in iter {
        let overlay = load_value(path)?;
        merge_values(&mut value, overlay);
    }

    value
        .try_into::<ExperimentConfig>()
        .map_err(|err| anyhow!(err))
}

fn load_value(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    let table: toml::value::Table = toml::from_str(&content)
        .with_context(|| format!("failed to parse {} as TOML", path.display()))?;
    Ok(Value::Table(table))
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => {
                        base_table.insert(key, overlay_value);
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value;
        }
    }
}

fn default_power_a() -> f64 {
    0.01
}

fn default_true() -> bool {
    true
}

fn default_n_head() -> usize {
    2
}

fn default_mix_rank() -> usize {
    32
}

fn default_decay_rank() -> usize {
    64
}

fn default_conv_kernel() -> usize {
    3
}

fn default_feature_dim() -> usize {
    16
}

fn default_state_mixer() -> StateMixerKind {
    StateMixerKind::Mlp
}

fn default_ffw_expand() -> usize {
    4
}

fn default_early_stop_accuracy() -> f64 {
    0.99
}

fn default_seed() -> u64 {
    42
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("sweeps")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_config(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).expect("write config");
        path
    }

    fn base_contents() -> String {
        [
            "[data]",
            "vocab_size = 256",
            "seq_len = 64",
            "num_kv_pairs = 8",
            "num_train_examples = 1000",
            "num_test_examples = 100",
            "batch_size = 32",
            "",
            "[model]",
            "d_model = 64",
            "n_layer = 2",
            "mixer = \"time_mix\"",
            "",
            "[optimizer]",
            "learning_rate = 0.001",
            "weight_decay = 0.1",
            "",
            "[training]",
            "epochs = 20",
            "log_frequency = 50",
        ]
        .join("\n")
    }

    #[test]
    fn load_merges_in_order() {
        let dir = tempdir().expect("tempdir");
        let base = write_config(dir.path(), "base.toml", &base_contents());

        let override_contents = [
            "[model]",
            "mixer = \"attention\"",
            "n_head = 4",
            "",
            "[optimizer]",
            "learning_rate = 0.0005",
            "",
            "[optimizer.lr_schedule]",
            "kind = \"cosine\"",
            "min_lr = 0.00001",
        ]
        .join("\n");
        let overlay = write_config(dir.path(), "override.toml", &override_contents);

        let config = load_experiment_config(&[base, overlay]).expect("load config");

        assert_eq!(config.model.mixer, MixerKind::Attention);
        assert_eq!(config.model.n_head, 4);
        assert_eq!(config.model.mix_rank, 32);
        assert_eq!(config.data.seq_len, 64);
        assert!((config.optimizer.learning_rate - 0.0005).abs() < f64::EPSILON);
        assert_eq!(
            config.optimizer.lr_schedule,
            Some(LearningRateScheduleConfig::Cosine { min_lr: 0.00001 })
        );
        assert!((config.training.early_stop_accuracy - 0.99).abs() < f64::EPSILON);
        assert!(config.sweep.mixers.is_empty());
    }

    #[test]
    fn splits_differ_in_seed_and_power() {
        let dir = tempdir().expect("tempdir");
        let base = write_config(dir.path(), "base.toml", &base_contents());
        let overlay = write_config(dir.path(), "power.toml", "[data]\ntest_power_a = 0.5\n");

        let config = load_experiment_config(&[base, overlay]).expect("load config");
        let train = config.train_task_config();
        let test = config.test_task_config();

        assert_eq!(train.num_examples, 1000);
        assert_eq!(test.num_examples, 100);
        assert_eq!(test.seed, train.seed + 1);
        assert!((train.power_a - 0.01).abs() < f64::EPSILON);
        assert!((test.power_a - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn hybrid_mixer_requires_an_order() {
        let dir = tempdir().expect("tempdir");
        let base = write_config(dir.path(), "base.toml", &base_contents());
        let overlay = write_config(dir.path(), "hybrid.toml", "[model]\nmixer = \"hybrid\"\n");

        let config = load_experiment_config(&[base, overlay]).expect("load config");
        let err = config.model_config().expect_err("missing order");
        assert!(err.to_string().contains("hybrid_order"));
    }

    #[test]
    fn hybrid_order_resolves_per_layer() {
        let dir = tempdir().expect("tempdir");
        let base = write_config(dir.path(), "base.toml", &base_contents());
        let overlay = write_config(
            dir.path(),
            "hybrid.toml",
            "[model]\nmixer = \"hybrid\"\nhybrid_order = [\"conv\", \"attention\"]\n",
        );

        let config = load_experiment_config(&[base, overlay]).expect("load config");
        let model = config.model_config().expect("model config");
        let MixerConfig::Hybrid(order) = &model.mixer else {
            panic!("expected a hybrid mixer");
        };
        assert_eq!(order.len(), 2);
        assert!(matches!(model.mixer_for_layer(0), MixerConfig::Conv(_)));
        assert!(matches!(model.mixer_for_layer(1), MixerConfig::Attention(_)));
        assert!(matches!(model.mixer_for_layer(2), MixerConfig::Conv(_)));
    }
}
