pub mod wkv;

pub use wkv::{WkvError, decay_from_log_rate, wkv_sequence, wkv_step};
