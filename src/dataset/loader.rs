use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use burn::data::dataloader::{DataLoader, DataLoaderIterator, Progress};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rand::prelude::*;

use super::recall::RecallDataset;

/// Batched token inputs and aligned targets.
#[derive(Clone)]
pub struct RecallBatch<B: Backend> {
    pub inputs: Tensor<B, 2, Int>,
    pub targets: Tensor<B, 2, Int>,
}

/// Data loader over a materialised recall dataset. Shuffled loaders walk a
/// fresh deterministic permutation each epoch; unshuffled loaders keep
/// generation order, which evaluation relies on.
pub struct RecallDataLoader<B: Backend> {
    dataset: Arc<RecallDataset>,
    device: B::Device,
    batch_size: usize,
    shuffle: Option<u64>,
    start: usize,
    end: usize,
    epoch: Arc<AtomicUsize>,
}

impl<B: Backend> Clone for RecallDataLoader<B> {
    fn clone(&self) -> Self {
        Self {
            dataset: Arc::clone(&self.dataset),
            device: self.device.clone(),
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            start: self.start,
            end: self.end,
            epoch: Arc::clone(&self.epoch),
        }
    }
}

impl<B: Backend> RecallDataLoader<B> {
    pub fn new(
        dataset: Arc<RecallDataset>,
        batch_size: usize,
        shuffle: Option<u64>,
        device: &B::Device,
    ) -> Self {
        assert!(batch_size >= 1, "batches must hold at least one example");
        let end = dataset.len();

        Self {
            dataset,
            device: device.clone(),
            batch_size,
            shuffle,
            start: 0,
            end,
            epoch: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<B> DataLoader<B, RecallBatch<B>> for RecallDataLoader<B>
where
    B: Backend + 'static,
    B::Device: Clone,
{
    fn iter<'a>(&'a self) -> Box<dyn DataLoaderIterator<RecallBatch<B>> + 'a> {
        let mut order: Vec<usize> = (self.start..self.end).collect();
        if let Some(seed) = self.shuffle {
            let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }

        Box::new(RecallBatchIterator {
            dataset: Arc::clone(&self.dataset),
            device: self.device.clone(),
            batch_size: self.batch_size,
            order,
            cursor: 0,
        })
    }

    fn num_items(&self) -> usize {
        self.end - self.start
    }

    fn to_device(&self, device: &B::Device) -> Arc<dyn DataLoader<B, RecallBatch<B>>> {
        Arc::new(Self {
            dataset: Arc::clone(&self.dataset),
            device: device.clone(),
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            start: self.start,
            end: self.end,
            epoch: Arc::clone(&self.epoch),
        })
    }

    fn slice(&self, start: usize, end: usize) -> Arc<dyn DataLoader<B, RecallBatch<B>>> {
        let end = (self.start + end).min(self.end);
        let start = (self.start + start).min(end);

        Arc::new(Self {
            dataset: Arc::clone(&self.dataset),
            device: self.device.clone(),
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            start,
            end,
            epoch: Arc::clone(&self.epoch),
        })
    }
}

struct RecallBatchIterator<B: Backend> {
    dataset: Arc<RecallDataset>,
    device: B::Device,
    batch_size: usize,
    order: Vec<usize>,
    cursor: usize,
}

impl<B: Backend> Iterator for RecallBatchIterator<B> {
    type Item = RecallBatch<B>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let seq_len = self.dataset.seq_len();
        let rows = indices.len();
        let mut inputs = Vec::with_capacity(rows * seq_len);
        let mut targets = Vec::with_capacity(rows * seq_len);
        for &index in indices {
            let example = &self.dataset.examples()[index];
            inputs.extend_from_slice(&example.tokens);
            targets.extend_from_slice(&example.targets);
        }

        Some(RecallBatch {
            inputs: Tensor::from_data(TensorData::new(inputs, [rows, seq_len]), &self.device),
            targets: Tensor::from_data(TensorData::new(targets, [rows, seq_len]), &self.device),
        })
    }
}

impl<B: Backend> DataLoaderIterator<RecallBatch<B>> for RecallBatchIterator<B> {
    fn progress(&self) -> Progress {
        Progress::new(self.cursor, self.order.len())
    }
}
