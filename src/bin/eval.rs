#![recursion_limit = "512"]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};

use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use burn_ndarray::NdArray;
use burn_wgpu::Wgpu;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "cuda")]
use burn_cuda::Cuda;

use burn_sequence_zoo::harness;
use burn_sequence_zoo::{
    ExperimentConfig, LanguageModel, RecallDataLoader, RecallDataset, load_experiment_config,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Evaluate a trained mixer checkpoint on the recall task")]
struct Args {
    /// Additional configuration files applied in order (later files override earlier ones).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: Vec<PathBuf>,
    /// Backend to run on.
    #[arg(long, value_enum, default_value_t = BackendArg::Cpu)]
    backend: BackendArg,
    /// Path to the checkpoint directory or file.
    #[arg(long, value_name = "PATH")]
    checkpoint: Option<PathBuf>,
    /// Specific checkpoint epoch to load.
    #[arg(long, value_name = "N")]
    epoch: Option<usize>,
    /// Sequences to recheck stepwise against the whole-sequence pass.
    #[arg(long, value_name = "N", default_value_t = 4)]
    parity_checks: usize,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BackendArg {
    Cpu,
    Wgpu,
    Cuda,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config_paths = vec![PathBuf::from("config/base.toml")];
    config_paths.extend(args.config.clone());
    let config = load_experiment_config(&config_paths)?;

    match args.backend {
        BackendArg::Cpu => eval_backend::<NdArray<f32>>(&config, &args, "cpu"),
        BackendArg::Wgpu => eval_backend::<Wgpu<f32>>(&config, &args, "wgpu"),
        BackendArg::Cuda => {
            #[cfg(feature = "cuda")]
            {
                eval_backend::<Cuda<f32>>(&config, &args, "cuda")
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(anyhow!(
                    "cuda backend selected but this build lacks `cuda` feature; rebuild with `--features cuda`"
                ))
            }
        }
    }
}

fn eval_backend<B>(config: &ExperimentConfig, args: &Args, backend_name: &str) -> Result<()>
where
    B: Backend + 'static,
    B::Device: Clone,
{
    B::seed(config.training.seed);
    let device = B::Device::default();

    let checkpoint_dir = args
        .checkpoint
        .clone()
        .unwrap_or_else(|| PathBuf::from("runs").join(backend_name));
    let (checkpoint_base, epoch) = resolve_checkpoint_base(&checkpoint_dir, args.epoch)?;
    let model = load_model::<B>(config, &device, &checkpoint_base)?;

    info!(
        "[eval:{backend_name}] loaded epoch {epoch} from {}",
        format_checkpoint(&checkpoint_base)
    );

    let test_set = Arc::new(RecallDataset::generate(&config.test_task_config())?);
    let loader = RecallDataLoader::<B>::new(
        Arc::clone(&test_set),
        config.data.batch_size,
        None,
        &device,
    );
    let (loss, accuracy) = harness::evaluate(&model, &loader);
    info!(
        "[eval:{backend_name}] loss={loss:.4} accuracy={accuracy:.4} over {} examples",
        test_set.len()
    );

    if args.parity_checks > 0 {
        let checked = args.parity_checks.min(test_set.len());
        let max_diff = parity_gap(&model, test_set.as_ref(), checked, &device);
        info!(
            "[eval:{backend_name}] sequence/step parity over {checked} sequences: \
             max |logit diff| = {max_diff:.3e}"
        );
    }

    Ok(())
}

fn load_model<B: Backend>(
    config: &ExperimentConfig,
    device: &B::Device,
    checkpoint_base: &Path,
) -> Result<LanguageModel<B>> {
    let model = LanguageModel::<B>::new(&config.model_config()?, device);
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let record = recorder
        .load::<<LanguageModel<B> as Module<B>>::Record>(checkpoint_base.to_path_buf(), device)
        .with_context(|| {
            format!(
                "failed to load checkpoint {}",
                format_checkpoint(checkpoint_base)
            )
        })?;
    Ok(model.load_record(record))
}

/// Replay a few sequences token by token and report the largest absolute
/// gap against the whole-sequence logits.
fn parity_gap<B: Backend>(
    model: &LanguageModel<B>,
    dataset: &RecallDataset,
    checks: usize,
    device: &B::Device,
) -> f64 {
    let seq_len = dataset.seq_len();
    let mut max_diff = 0.0f64;

    for example in dataset.examples().iter().take(checks) {
        let tokens = Tensor::<B, 2, Int>::from_data(
            TensorData::new(example.tokens.clone(), [1, seq_len]),
            device,
        );
        let whole = model.forward(tokens.clone());

        let mut state = model.init_state(1, device);
        let mut stepped = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let (logits, next) =
                model.forward_with_state(tokens.clone().slice_dim(1, t..t + 1), state);
            state = next;
            stepped.push(logits);
        }
        let stepped = Tensor::cat(stepped, 1);

        let gap = scalar_f64((whole - stepped).abs().max());
        max_diff = max_diff.max(gap);
    }

    max_diff
}

fn scalar_f64<B: Backend>(value: Tensor<B, 1>) -> f64 {
    value
        .into_data()
        .convert::<f64>()
        .into_vec::<f64>()
        .expect("scalar tensor converts to a vector")[0]
}

fn resolve_checkpoint_base(path: &Path, epoch: Option<usize>) -> Result<(PathBuf, usize)> {
    if path.is_dir() {
        let target_epoch = match epoch {
            Some(explicit) => explicit,
            None => find_latest_epoch(path)?,
        };
        let base = path.join(format!("model-{target_epoch}"));
        ensure_checkpoint_exists(&base)?;
        return Ok((base, target_epoch));
    }

    let mut base = path.to_path_buf();
    if base.extension().is_some() {
        base.set_extension("");
    }
    let detected = parse_epoch_from_stem(&base);
    let target_epoch = epoch.or(detected).ok_or_else(|| {
        anyhow!(
            "unable to infer checkpoint epoch from {}; provide --epoch",
            path.display()
        )
    })?;
    if detected != Some(target_epoch) {
        let parent = base.parent().map(Path::to_path_buf).unwrap_or_default();
        base = parent.join(format!("model-{target_epoch}"));
    }

    ensure_checkpoint_exists(&base)?;
    Ok((base, target_epoch))
}

fn ensure_checkpoint_exists(base: &Path) -> Result<()> {
    let mut candidate = base.to_path_buf();
    candidate.set_extension("bin");
    if candidate.is_file() {
        return Ok(());
    }

    Err(anyhow!("checkpoint file {}.bin not found", base.display()))
}

fn find_latest_epoch(dir: &Path) -> Result<usize> {
    let mut max_epoch = None;
    for entry in fs::read_dir(dir)
        .with_context(|| format!("failed to read checkpoint directory {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let mut base = entry.path();
        base.set_extension("");
        if let Some(epoch) = parse_epoch_from_stem(&base) {
            let updated = max_epoch
                .map(|current: usize| current.max(epoch))
                .unwrap_or(epoch);
            max_epoch = Some(updated);
        }
    }

    max_epoch.ok_or_else(|| anyhow!("no model checkpoints found in {}", dir.display()))
}

fn parse_epoch_from_stem(path: &Path) -> Option<usize> {
    let stem = path.file_name()?.to_string_lossy();
    let stem = stem.strip_suffix(".bin").unwrap_or(&stem);
    let epoch_part = stem.strip_prefix("model-")?;
    epoch_part.parse().ok()
}

fn format_checkpoint(base: &Path) -> String {
    let mut path = base.to_path_buf();
    path.set_extension("bin");
    path.display().to_string()
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "burn_sequence_zoo=info,eval=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
