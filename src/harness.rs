use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, ensure};
use burn::LearningRate;
use burn::data::dataloader::DataLoader;
use burn::lr_scheduler::LrScheduler;
use burn::lr_scheduler::cosine::{CosineAnnealingLrScheduler, CosineAnnealingLrSchedulerConfig};
use burn::lr_scheduler::linear::{LinearLrScheduler, LinearLrSchedulerConfig};
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::Tensor;
use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::Serialize;
use tracing::info;

use crate::config::{ExperimentConfig, LearningRateScheduleConfig, OptimizerSection};
use crate::dataset::{RecallBatch, RecallDataLoader, RecallDataset};
use crate::model::{LanguageModel, recall_counts, recall_loss};

pub type ValidBackend<B> = <B as AutodiffBackend>::InnerBackend;

/// Outcome of one training run, written alongside the checkpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub best_accuracy: f64,
    pub final_train_loss: f64,
    pub final_valid_loss: f64,
    pub final_valid_accuracy: f64,
    pub epochs_run: usize,
    pub early_stopped: bool,
}

/// Train one model on the recall task and checkpoint it whenever the
/// validation accuracy improves. Training and validation splits are
/// regenerated from their seeds, so a run is fully described by its
/// configuration.
pub fn train<B>(
    config: &ExperimentConfig,
    run_dir: &Path,
    backend_name: &str,
    device: &B::Device,
) -> Result<(LanguageModel<B>, RunSummary)>
where
    B: AutodiffBackend + 'static,
    B::Device: Clone,
{
    ensure!(config.training.epochs >= 1, "training needs at least one epoch");
    fs::create_dir_all(run_dir)
        .with_context(|| format!("creating the run directory {}", run_dir.display()))?;
    B::seed(config.training.seed);

    let model_config = config.model_config()?;
    let train_set = Arc::new(RecallDataset::generate(&config.train_task_config())?);
    let test_set = Arc::new(RecallDataset::generate(&config.test_task_config())?);

    let train_loader: Arc<dyn DataLoader<B, RecallBatch<B>>> = Arc::new(RecallDataLoader::<B>::new(
        Arc::clone(&train_set),
        config.data.batch_size,
        Some(config.training.seed),
        device,
    ));
    let valid_loader: Arc<dyn DataLoader<ValidBackend<B>, RecallBatch<ValidBackend<B>>>> =
        Arc::new(RecallDataLoader::<ValidBackend<B>>::new(
            Arc::clone(&test_set),
            config.data.batch_size,
            None,
            device,
        ));

    let iters_per_epoch = train_set.len().div_ceil(config.data.batch_size);
    let total_iters = config.training.epochs * iters_per_epoch;
    let mut scheduler = resolve_lr_scheduler(&config.optimizer, total_iters)?;

    let mut model = LanguageModel::<B>::new(&model_config, device);
    let mut optimizer = AdamWConfig::new()
        .with_weight_decay(config.optimizer.weight_decay)
        .init::<B, LanguageModel<B>>();

    info!(
        "[train:{backend_name}] {} parameters, {} train examples, {} iterations over {} epochs",
        model.num_params(),
        train_set.len(),
        total_iters,
        config.training.epochs,
    );

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let log_frequency = config.training.log_frequency.max(1);

    let mut summary = RunSummary {
        best_accuracy: 0.0,
        final_train_loss: 0.0,
        final_valid_loss: 0.0,
        final_valid_accuracy: 0.0,
        epochs_run: 0,
        early_stopped: false,
    };

    for epoch in 1..=config.training.epochs {
        let mut step = 0;
        let mut loss_sum = 0.0;
        for batch in train_loader.iter() {
            let lr = scheduler.next_lr();
            let logits = model.forward(batch.inputs);
            let loss = recall_loss(logits, batch.targets);
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(lr, model, grads);

            let loss_value = scalar_f64(loss);
            loss_sum += loss_value;
            step += 1;
            if step % log_frequency == 0 {
                info!(
                    "[train:{backend_name}] epoch {epoch} iter {step}/{iters_per_epoch} \
                     loss={loss_value:.4} lr={lr:.2e}"
                );
            }
        }
        summary.final_train_loss = loss_sum / step.max(1) as f64;

        let valid_model = model.valid();
        let (valid_loss, valid_accuracy) = evaluate(&valid_model, valid_loader.as_ref());
        info!(
            "[train:{backend_name}] epoch {epoch}: train_loss={:.4} valid_loss={valid_loss:.4} \
             valid_acc={valid_accuracy:.4}",
            summary.final_train_loss,
        );

        summary.final_valid_loss = valid_loss;
        summary.final_valid_accuracy = valid_accuracy;
        summary.epochs_run = epoch;

        if valid_accuracy > summary.best_accuracy {
            summary.best_accuracy = valid_accuracy;
            model
                .clone()
                .save_file(run_dir.join(format!("model-{epoch}")), &recorder)
                .context("saving checkpoint")?;
        }
        if valid_accuracy >= config.training.early_stop_accuracy {
            info!(
                "[train:{backend_name}] early stop at epoch {epoch}: accuracy \
                 {valid_accuracy:.4} reached {:.4}",
                config.training.early_stop_accuracy,
            );
            summary.early_stopped = true;
            break;
        }
    }

    Ok((model, summary))
}

/// Mean loss and recall accuracy of a model over one loader pass.
pub fn evaluate<B: Backend>(
    model: &LanguageModel<B>,
    loader: &dyn DataLoader<B, RecallBatch<B>>,
) -> (f64, f64) {
    let mut loss_sum = 0.0;
    let mut batches = 0;
    let mut correct = 0i64;
    let mut total = 0i64;

    for batch in loader.iter() {
        let logits = model.forward(batch.inputs);
        loss_sum += scalar_f64(recall_loss(logits.clone(), batch.targets.clone()));
        batches += 1;

        let (batch_correct, batch_total) = recall_counts(logits, batch.targets);
        correct += batch_correct;
        total += batch_total;
    }

    let loss = loss_sum / batches.max(1) as f64;
    let accuracy = if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    };
    (loss, accuracy)
}

enum ResolvedLrScheduler {
    Constant(LearningRate),
    Cosine(CosineAnnealingLrScheduler),
    Linear(LinearLrScheduler),
}

impl ResolvedLrScheduler {
    fn next_lr(&mut self) -> LearningRate {
        match self {
            Self::Constant(lr) => *lr,
            Self::Cosine(scheduler) => scheduler.step(),
            Self::Linear(scheduler) => scheduler.step(),
        }
    }
}

fn resolve_lr_scheduler(
    optimizer: &OptimizerSection,
    total_iters: usize,
) -> Result<ResolvedLrScheduler> {
    let base_lr = optimizer.learning_rate;

    let schedule = match &optimizer.lr_schedule {
        None | Some(LearningRateScheduleConfig::Constant) => {
            ResolvedLrScheduler::Constant(base_lr)
        }
        Some(LearningRateScheduleConfig::Cosine { min_lr }) => {
            let scheduler = CosineAnnealingLrSchedulerConfig::new(base_lr, total_iters.max(1))
                .with_min_lr(*min_lr)
                .init()
                .map_err(|err| anyhow!("failed to initialize cosine lr scheduler: {err}"))?;
            ResolvedLrScheduler::Cosine(scheduler)
        }
        Some(LearningRateScheduleConfig::Linear { final_lr }) => {
            let scheduler = LinearLrSchedulerConfig::new(base_lr, *final_lr, total_iters.max(1))
                .init()
                .map_err(|err| anyhow!("failed to initialize linear lr scheduler: {err}"))?;
            ResolvedLrScheduler::Linear(scheduler)
        }
    };

    Ok(schedule)
}

fn scalar_f64<B: Backend>(value: Tensor<B, 1>) -> f64 {
    value
        .into_data()
        .convert::<f64>()
        .into_vec::<f64>()
        .expect("loss tensor converts to a vector")[0]
}
