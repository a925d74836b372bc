use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, bail};
use burn::{
    backend::NdArray,
    module::Module,
    record::{HalfPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use burn_dav2::model::{
    Encoder,
    depth_anything_v2::{
        DepthAnythingV2, DepthAnythingV2Config, pytorch_key_remapper, with_model_load_stack,
    },
};
use burn_store::{ApplyResult, ModuleSnapshot, PytorchStore};
use clap::Parser;
use tracing_subscriber::EnvFilter;

type ImportBackend = NdArray<f32>;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Convert Depth Anything V2 PyTorch weights into Burn checkpoints"
)]
struct Args {
    #[arg(long, value_enum, default_value_t = Encoder::Vits)]
    encoder: Encoder,

    #[arg(long, value_name = "PATH")]
    checkpoint: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    dry_run: bool,

    #[arg(long, value_name = "PATH")]
    dump_template: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match import(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn import(args: Args) -> anyhow::Result<()> {
    let checkpoint = args.checkpoint.unwrap_or_else(|| {
        PathBuf::from(format!("assets/model/depth_anything_v2_{}.pth", args.encoder))
    });
    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(args.encoder.default_checkpoint()));

    let device = <ImportBackend as Backend>::Device::default();
    let mut model = DepthAnythingV2::<ImportBackend>::new(
        &device,
        DepthAnythingV2Config::from_encoder(args.encoder),
    );

    if let Some(path) = &args.dump_template {
        export_template(&model, path)?;
        if args.dry_run {
            return Ok(());
        }
    }

    if args.encoder == Encoder::Vitg {
        bail!("vitg PyTorch checkpoints use SwiGLU feed-forward layers, which this backbone does not have");
    }

    if !checkpoint.exists() {
        bail!("checkpoint `{}` not found", checkpoint.display());
    }

    let mut store = PytorchStore::from_file(&checkpoint)
        .remap(pytorch_key_remapper()?)
        .allow_partial(true);

    tracing::info!(checkpoint = %checkpoint.display(), encoder = %args.encoder, "loading");
    let result = with_model_load_stack(|| model.load_from(&mut store))
        .map_err(|err| anyhow::anyhow!("{err}"))
        .with_context(|| format!("failed to apply `{}`", checkpoint.display()))?;
    report_result(&result);

    if args.dry_run {
        tracing::info!("dry run enabled; checkpoint not written");
        return Ok(());
    }
    if !result.missing.is_empty() {
        bail!(
            "{} tensors missing from `{}`; rerun with --dry-run to inspect",
            result.missing.len(),
            checkpoint.display()
        );
    }

    if let Some(dir) = output.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create `{}`", dir.display()))?;
    }
    let recorder = NamedMpkFileRecorder::<HalfPrecisionSettings>::new();
    model
        .save_file(output.clone(), &recorder)
        .with_context(|| format!("failed to save `{}`", output.display()))?;
    tracing::info!(output = %output.display(), "saved burn checkpoint");
    Ok(())
}

fn report_result(result: &ApplyResult) {
    tracing::info!(
        applied = result.applied.len(),
        skipped = result.skipped.len(),
        missing = result.missing.len(),
        unused = result.unused.len(),
        "applied state dict"
    );
    for key in &result.missing {
        tracing::warn!("missing tensor: {key}");
    }
    for key in &result.unused {
        tracing::warn!("unused tensor: {key}");
    }
}

fn export_template<B: Backend>(model: &DepthAnythingV2<B>, path: &PathBuf) -> anyhow::Result<()> {
    let mut paths: Vec<String> = model
        .clone()
        .collect(None, None)
        .into_iter()
        .map(|snapshot| snapshot.full_path())
        .collect();
    paths.sort();
    std::fs::write(path, paths.join("\n"))
        .with_context(|| format!("failed to write `{}`", path.display()))?;
    tracing::info!(path = %path.display(), "wrote template paths");
    Ok(())
}
