mod attention;
mod block;
mod config;
mod conv;
mod linear_attention;
mod lm;
mod loss;
mod mixer;
mod state;
mod state_mix;
mod time_mix;

pub use attention::AttentionState;
pub use config::{
    AttentionConfig, ConvConfig, LinearAttentionConfig, MixerConfig, ModelConfig,
    StateMixerConfig, TimeMixConfig,
};
pub use conv::ConvState;
pub use linear_attention::LinearAttentionState;
pub use lm::LanguageModel;
pub use loss::{IGNORE_INDEX, recall_counts, recall_loss};
pub use mixer::MixerState;
pub use state::ModelState;
pub use time_mix::TimeMixState;
