#![recursion_limit = "256"]

use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use burn_dav2::{
    InferenceBackend,
    config::{
        DEFAULT_BENCHMARK_RUNS, DEFAULT_INPUT_SIZE, DEFAULT_JPEG_QUALITY, DeviceSelector,
        PredictConfig, RunContext,
    },
    model::{DepthModel, Encoder},
    output::OutputFormat,
    predict,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize, Parser)]
#[command(about = "Depth Anything V2 batch depth prediction", version, long_about = None)]
struct Args {
    /// Image file, image directory, or video.
    #[arg(long, value_name = "PATH")]
    data: PathBuf,

    #[arg(long, value_name = "PATH", default_value = "run/predict")]
    save_dir: PathBuf,

    /// Defaults to `assets/model/depth_anything_v2_<encoder>.mpk`.
    #[arg(long, value_name = "PATH")]
    weights: Option<PathBuf>,

    /// `auto`, `cpu`, `cuda:<n>`, or `gpu:<n>`.
    #[arg(long, default_value = "auto")]
    device: String,

    #[arg(long, default_value_t = DEFAULT_INPUT_SIZE)]
    imgsz: usize,

    #[arg(long, value_enum, default_value_t = Encoder::Vits)]
    encoder: Encoder,

    /// `0|gray|grayscale`, `1|color`, or `2|all`.
    #[arg(long, default_value = "all")]
    format: String,

    #[arg(long, default_value_t = false)]
    benchmark: bool,

    #[arg(long, default_value_t = DEFAULT_BENCHMARK_RUNS)]
    benchmark_runs: usize,

    #[arg(long, default_value_t = false)]
    save_image: bool,

    #[arg(long, default_value_t = false)]
    save_debug: bool,

    #[arg(long, default_value_t = false)]
    use_fullpath: bool,

    #[arg(long, default_value_t = false)]
    pred_only: bool,

    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY)]
    jpeg_quality: u8,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<PredictConfig> {
        let device: DeviceSelector = self.device.parse()?;
        let format: OutputFormat = self.format.parse()?;
        let mut config = PredictConfig::new(self.data, self.encoder);
        if let Some(weights) = self.weights {
            config.weights = weights;
        }
        config.save_dir = self.save_dir;
        config.device = device;
        config.input_size = self.imgsz;
        config.format = format;
        config.benchmark = self.benchmark;
        config.benchmark_runs = self.benchmark_runs;
        config.save_image = self.save_image;
        config.save_debug = self.save_debug;
        config.use_fullpath = self.use_fullpath;
        config.pred_only = self.pred_only;
        config.jpeg_quality = self.jpeg_quality;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = args.into_config().context("invalid arguments")?;
    tracing::debug!(
        "config: {}",
        serde_json::to_string(&config).context("failed to serialize config")?
    );

    let context = RunContext::<InferenceBackend>::from_config(config).context("invalid arguments")?;
    let config = &context.config;
    let model = DepthModel::<InferenceBackend>::load(&config.weights, config.encoder, &context.device)
        .context("failed to load model")?;

    let report = predict::run(&context, &model).context("prediction failed")?;
    tracing::info!(
        frames = report.frames,
        written = report.written,
        "done"
    );
    Ok(())
}
