mod loader;
mod recall;

pub use loader::{RecallBatch, RecallDataLoader};
pub use recall::{RecallDataset, RecallExample, RecallTaskConfig};
