use burn::prelude::Backend;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crate::{
    Error, Result,
    benchmark::{EfficiencyReport, benchmark},
    config::RunContext,
    io::{DataSource, Datapoint},
    model::{DepthMap, DepthModel},
    output::OutputWriter,
    postprocess::normalize_depth,
};

/// Running mean of tick/tock intervals.
#[derive(Clone, Debug, Default)]
pub struct LatencyTimer {
    started: Option<Instant>,
    total: Duration,
    count: u32,
}

impl LatencyTimer {
    pub fn tick(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Closes the interval opened by the last `tick`. A `tock` without a
    /// matching `tick` records nothing.
    pub fn tock(&mut self) -> Duration {
        let Some(started) = self.started.take() else {
            return Duration::ZERO;
        };
        let elapsed = started.elapsed();
        self.total += elapsed;
        self.count += 1;
        elapsed
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PredictionReport {
    pub frames: usize,
    pub average_latency: Duration,
    /// Files written across the run, artifacts and sidecars alike.
    pub written: usize,
    pub efficiency: Option<EfficiencyReport>,
}

#[derive(Debug, Serialize)]
struct DebugRecord<'a> {
    source: &'a Path,
    width: usize,
    height: usize,
    min: Option<f32>,
    max: Option<f32>,
    mean: Option<f32>,
    finite: usize,
    latency_s: f64,
}

fn debug_path(dir: &Path, source: &Path) -> Result<PathBuf> {
    let stem = source
        .file_stem()
        .ok_or_else(|| Error::Output(format!("`{}` has no file name", source.display())))?;
    let mut file_name = stem.to_os_string();
    file_name.push(".json");
    Ok(dir.join(file_name))
}

fn write_debug(dir: &Path, source: &Path, depth: &DepthMap, latency: Duration) -> Result<PathBuf> {
    let stats = depth.stats();
    let record = DebugRecord {
        source,
        width: depth.width(),
        height: depth.height(),
        min: stats.map(|s| s.min),
        max: stats.map(|s| s.max),
        mean: stats.map(|s| s.mean),
        finite: stats.map_or(0, |s| s.finite),
        latency_s: latency.as_secs_f64(),
    };
    let path = debug_path(dir, source)?;
    fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))?;
    let json = serde_json::to_vec_pretty(&record)?;
    fs::write(&path, json).map_err(|err| Error::io(&path, err))?;
    Ok(path)
}

fn progress_bar(len: Option<usize>) -> ProgressBar {
    match len {
        Some(len) => {
            let bar = ProgressBar::new(len as u64);
            let style = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
            )
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar
        }
        None => ProgressBar::new_spinner(),
    }
}

/// Runs depth prediction over every datapoint of the configured source.
///
/// Frames are processed one at a time; any failure stops the run.
pub fn run<B: Backend>(context: &RunContext<B>, model: &DepthModel<B>) -> Result<PredictionReport> {
    let config = &context.config;

    let efficiency = if config.benchmark {
        let report = benchmark(model, config.input_size, config.benchmark_runs)?;
        report.log();
        Some(report)
    } else {
        None
    };

    let source = DataSource::open(&config.data)?;
    let writer = OutputWriter::new(config, source.data_name(), source.anchor());
    let debug_dir = config.save_dir.join(source.data_name()).join("debug");
    tracing::info!(
        data = %config.data.display(),
        frames = ?source.len(),
        encoder = %model.encoder(),
        "starting prediction"
    );

    let progress = progress_bar(source.len());
    let mut timer = LatencyTimer::default();
    let mut written = 0usize;
    let mut frames = 0usize;

    let mut step = |datapoint: Result<Datapoint>| -> Result<()> {
        let Datapoint { image, path, .. } = datapoint?;

        timer.tick();
        let depth = model.infer(&image, config.input_size)?;
        let gray = normalize_depth(&depth);
        let latency = timer.tock();
        tracing::debug!(path = %path.display(), latency_s = latency.as_secs_f64(), "predicted");

        if config.save_image {
            written += writer.write(&path, &image, &gray)?.len();
        }
        if config.save_debug {
            let sidecar = write_debug(&debug_dir, &path, &depth, latency)?;
            tracing::trace!(path = %sidecar.display(), "wrote debug sidecar");
            written += 1;
        }
        Ok(())
    };

    for datapoint in source.datapoints()? {
        if let Err(err) = step(datapoint) {
            progress.abandon();
            tracing::error!(completed = frames, "prediction stopped: {err}");
            return Err(err);
        }
        frames += 1;
        progress.inc(1);
    }
    progress.finish_and_clear();

    let average_latency = timer.average();
    tracing::info!(
        frames,
        "average latency (s) = {:.4}",
        average_latency.as_secs_f64()
    );

    Ok(PredictionReport {
        frames,
        average_latency,
        written,
        efficiency,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PredictConfig, model::Encoder, output::OutputFormat};
    use burn::{backend::NdArray, module::Module};
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    type TestBackend = NdArray<f32>;

    fn write_image(path: &Path, width: u32, height: u32) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_fn(width, height, |x, y| Rgb([(x * 9) as u8, (y * 13) as u8, 90]))
            .save(path)
            .unwrap();
    }

    fn context(config: PredictConfig) -> RunContext<TestBackend> {
        RunContext::new(config, Default::default()).unwrap()
    }

    #[test]
    fn timer_averages_closed_intervals() {
        let mut timer = LatencyTimer::default();
        assert_eq!(timer.average(), Duration::ZERO);
        assert_eq!(timer.tock(), Duration::ZERO);

        timer.tick();
        std::thread::sleep(Duration::from_millis(2));
        timer.tock();
        timer.tick();
        timer.tock();

        assert_eq!(timer.count(), 2);
        assert!(timer.average() > Duration::ZERO);
    }

    #[test]
    fn directory_run_writes_flat_outputs() {
        let root = tempdir().unwrap();
        let data = root.path().join("imgs");
        write_image(&data.join("a.png"), 20, 12);
        write_image(&data.join("b.png"), 16, 16);

        let mut config = PredictConfig::new(&data, Encoder::Vits);
        config.save_dir = root.path().join("out");
        config.input_size = 28;
        config.save_image = true;
        config.format = OutputFormat::All;

        let model = DepthModel::<TestBackend>::new(Encoder::Vits, &Default::default());
        let report = run(&context(config), &model).unwrap();

        assert_eq!(report.frames, 2);
        assert_eq!(report.written, 4);
        assert!(report.average_latency > Duration::ZERO);
        assert!(report.efficiency.is_none());

        let gray = image::open(root.path().join("out/imgs/gray/a.jpg")).unwrap();
        assert_eq!((gray.width(), gray.height()), (2 * 20 + 50, 12));
        assert!(root.path().join("out/imgs/color/b.jpg").exists());
    }

    #[test]
    fn debug_sidecars_carry_depth_statistics() {
        let root = tempdir().unwrap();
        let data = root.path().join("shots");
        write_image(&data.join("frame.png"), 14, 14);

        let mut config = PredictConfig::new(&data, Encoder::Vits);
        config.save_dir = root.path().join("out");
        config.input_size = 28;
        config.save_debug = true;

        let model = DepthModel::<TestBackend>::new(Encoder::Vits, &Default::default());
        let report = run(&context(config), &model).unwrap();
        assert_eq!(report.written, 1);
        let sidecar = root.path().join("out/shots/debug/frame.json");

        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(&sidecar).unwrap()).unwrap();
        assert_eq!(json["width"], 14);
        assert_eq!(json["height"], 14);
        assert!(json["latency_s"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn benchmark_runs_before_prediction() {
        let root = tempdir().unwrap();
        let data = root.path().join("one.png");
        write_image(&data, 14, 14);

        let mut config = PredictConfig::new(&data, Encoder::Vits);
        config.save_dir = root.path().join("out");
        config.input_size = 28;
        config.benchmark = true;
        config.benchmark_runs = 1;

        let model = DepthModel::<TestBackend>::new(Encoder::Vits, &Default::default());
        let report = run(&context(config), &model).unwrap();
        assert_eq!(report.frames, 1);
        let efficiency = report.efficiency.unwrap();
        assert_eq!(efficiency.params, model.network().num_params());
        assert_eq!(report.written, 0);
    }

    #[test]
    fn undecodable_image_aborts_the_run() {
        let root = tempdir().unwrap();
        let data = root.path().join("imgs");
        write_image(&data.join("a.png"), 14, 14);
        fs::write(data.join("b.png"), b"not an image").unwrap();

        let mut config = PredictConfig::new(&data, Encoder::Vits);
        config.save_dir = root.path().join("out");
        config.input_size = 28;

        let model = DepthModel::<TestBackend>::new(Encoder::Vits, &Default::default());
        let err = run(&context(config), &model).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }
}
