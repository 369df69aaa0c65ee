#![recursion_limit = "512"]

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Parser, ValueEnum};

use burn::tensor::backend::AutodiffBackend;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_wgpu::Wgpu;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "cuda")]
use burn_cuda::Cuda;

use burn_sequence_zoo::harness;
use burn_sequence_zoo::report::{self, RunRecord};
use burn_sequence_zoo::{ExperimentConfig, load_experiment_config};

#[derive(Parser, Debug)]
#[command(author, version, about = "Sweep sequence mixers over the recall task grid")]
struct Args {
    /// Additional configuration files applied in order (later files override earlier ones).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: Vec<PathBuf>,
    /// Backend to run on.
    #[arg(long, value_enum, default_value_t = BackendArg::Cpu)]
    backend: BackendArg,
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
        BackendArg::Cpu => sweep_backend::<Autodiff<NdArray<f32>>>(&config, "cpu"),
        BackendArg::Wgpu => sweep_backend::<Autodiff<Wgpu<f32>>>(&config, "wgpu"),
        BackendArg::Cuda => {
            #[cfg(feature = "cuda")]
            {
                sweep_backend::<Autodiff<Cuda<f32>>>(&config, "cuda")
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

fn sweep_backend<B>(config: &ExperimentConfig, backend_name: &str) -> Result<()>
where
    B: AutodiffBackend + 'static,
    B::Device: Clone,
{
    let device = B::Device::default();
    let sweep = &config.sweep;

    // Empty axes collapse to the single value from the main sections.
    let mixers = if sweep.mixers.is_empty() {
        vec![config.model.mixer]
    } else {
        sweep.mixers.clone()
    };
    let d_models = if sweep.d_models.is_empty() {
        vec![config.model.d_model]
    } else {
        sweep.d_models.clone()
    };
    let learning_rates = if sweep.learning_rates.is_empty() {
        vec![config.optimizer.learning_rate]
    } else {
        sweep.learning_rates.clone()
    };

    let sweep_dir = sweep
        .output_dir
        .join(sweep.name.as_deref().unwrap_or("sweep"));
    let total = mixers.len() * d_models.len() * learning_rates.len();
    info!("[sweep:{backend_name}] {total} runs into {}", sweep_dir.display());

    let mut records = Vec::with_capacity(total);
    let mut launched = 0;
    for &mixer in &mixers {
        for &d_model in &d_models {
            for &learning_rate in &learning_rates {
                let mut run_config = config.clone();
                run_config.model.mixer = mixer;
                run_config.model.d_model = d_model;
                run_config.optimizer.learning_rate = learning_rate;

                let run_id = format!("{mixer}-d{d_model}-lr{learning_rate:e}");
                let run_dir = sweep_dir.join(&run_id);
                launched += 1;
                info!("[sweep:{backend_name}] run {launched}/{total}: {run_id}");

                match harness::train::<B>(&run_config, &run_dir, backend_name, &device) {
                    Ok((_model, summary)) => records.push(RunRecord {
                        run_id,
                        mixer: mixer.to_string(),
                        d_model,
                        n_layer: run_config.model.n_layer,
                        learning_rate,
                        seq_len: config.data.seq_len,
                        num_kv_pairs: config.data.num_kv_pairs,
                        best_accuracy: summary.best_accuracy,
                        final_valid_loss: summary.final_valid_loss,
                        epochs_run: summary.epochs_run,
                        early_stopped: summary.early_stopped,
                    }),
                    Err(err) => {
                        warn!("[sweep:{backend_name}] run {run_id} failed: {err:#}");
                    }
                }
            }
        }
    }

    report::write_records(&sweep_dir, &records)?;
    println!("{}", report::summary_table(&records));
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "burn_sequence_zoo=info,sweep=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
