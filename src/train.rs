#![recursion_limit = "512"]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};

use burn::tensor::backend::AutodiffBackend;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_wgpu::Wgpu;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "cuda")]
use burn_cuda::Cuda;

use burn_sequence_zoo::harness;
use burn_sequence_zoo::{ExperimentConfig, RunSummary, load_experiment_config};

#[derive(Parser, Debug)]
#[command(author, version, about = "Train one sequence mixer on the recall task")]
struct Args {
    /// Additional configuration files applied in order (later files override earlier ones).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: Vec<PathBuf>,
    /// Backend to run on.
    #[arg(long, value_enum, default_value_t = BackendArg::Cpu)]
    backend: BackendArg,
    /// Directory for checkpoints and the run summary.
    #[arg(long, default_value = "runs")]
    run_dir: PathBuf,
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
    config_paths.extend(args.config);
    let config = load_experiment_config(&config_paths)?;

    match args.backend {
        BackendArg::Cpu => train_backend::<Autodiff<NdArray<f32>>>(&config, &args.run_dir, "cpu"),
        BackendArg::Wgpu => train_backend::<Autodiff<Wgpu<f32>>>(&config, &args.run_dir, "wgpu"),
        BackendArg::Cuda => {
            #[cfg(feature = "cuda")]
            {
                train_backend::<Autodiff<Cuda<f32>>>(&config, &args.run_dir, "cuda")
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

fn train_backend<B>(config: &ExperimentConfig, run_dir: &Path, backend_name: &str) -> Result<()>
where
    B: AutodiffBackend + 'static,
    B::Device: Clone,
{
    let device = B::Device::default();
    let run_dir = run_dir.join(backend_name);

    let (_model, summary) = harness::train::<B>(config, &run_dir, backend_name, &device)?;
    write_summary(&run_dir, &summary)?;

    info!(
        "[train:{backend_name}] finished: best accuracy {:.4} over {} epochs{}",
        summary.best_accuracy,
        summary.epochs_run,
        if summary.early_stopped {
            " (early stop)"
        } else {
            ""
        },
    );
    Ok(())
}

fn write_summary(run_dir: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("serializing the run summary")?;
    fs::write(run_dir.join("summary.json"), json).context("writing summary.json")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "burn_sequence_zoo=info,train=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
