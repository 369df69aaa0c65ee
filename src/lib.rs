#![recursion_limit = "512"]

pub mod config;
pub mod dataset;
pub mod harness;
pub mod kernel;
pub mod model;
pub mod report;

pub use config::{
    DataConfig, ExperimentConfig, LearningRateScheduleConfig, MixerKind, ModelSection,
    OptimizerSection, StateMixerKind, SweepSection, TrainingSection, load_experiment_config,
};
pub use dataset::{RecallBatch, RecallDataLoader, RecallDataset, RecallExample, RecallTaskConfig};
pub use harness::{RunSummary, ValidBackend, evaluate, train};
pub use kernel::{WkvError, decay_from_log_rate, wkv_sequence, wkv_step};
pub use model::{
    IGNORE_INDEX, LanguageModel, MixerConfig, ModelConfig, ModelState, recall_counts, recall_loss,
};
pub use report::{RunRecord, summary_table, write_records};
