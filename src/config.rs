use burn::prelude::Backend;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};

use crate::{Error, InferenceBackend, Result, model::Encoder, output::OutputFormat};

pub const DEFAULT_INPUT_SIZE: usize = 518;
pub const DEFAULT_JPEG_QUALITY: u8 = 95;
pub const DEFAULT_BENCHMARK_RUNS: usize = 100;

/// Compute device requested on the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceSelector {
    #[default]
    Auto,
    Cpu,
    Gpu(usize),
}

impl FromStr for DeviceSelector {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "auto" | "" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Gpu(0)),
            other => {
                let index = other
                    .strip_prefix("cuda:")
                    .or_else(|| other.strip_prefix("gpu:"))
                    .ok_or_else(|| {
                        Error::config(format!(
                            "unknown device `{other}`, expected auto, cpu, cuda:<n>, or gpu:<n>"
                        ))
                    })?;
                index
                    .parse()
                    .map(Self::Gpu)
                    .map_err(|_| Error::config(format!("invalid device index in `{other}`")))
            }
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Cpu => f.write_str("cpu"),
            Self::Gpu(index) => write!(f, "gpu:{index}"),
        }
    }
}

impl TryFrom<String> for DeviceSelector {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DeviceSelector> for String {
    fn from(value: DeviceSelector) -> Self {
        value.to_string()
    }
}

impl DeviceSelector {
    #[cfg(feature = "backend_cuda")]
    pub fn resolve(self) -> Result<<InferenceBackend as Backend>::Device> {
        use burn::backend::cuda::CudaDevice;
        match self {
            Self::Auto => Ok(CudaDevice::default()),
            Self::Gpu(index) => Ok(CudaDevice::new(index)),
            Self::Cpu => Err(Error::config(
                "device `cpu` is unavailable in a build with the cuda backend",
            )),
        }
    }

    #[cfg(all(feature = "backend_wgpu", not(feature = "backend_cuda")))]
    pub fn resolve(self) -> Result<<InferenceBackend as Backend>::Device> {
        use burn::backend::wgpu::WgpuDevice;
        Ok(match self {
            Self::Auto => WgpuDevice::DefaultDevice,
            Self::Cpu => WgpuDevice::Cpu,
            Self::Gpu(index) => WgpuDevice::DiscreteGpu(index),
        })
    }

    #[cfg(all(
        feature = "backend_ndarray",
        not(feature = "backend_wgpu"),
        not(feature = "backend_cuda")
    ))]
    pub fn resolve(self) -> Result<<InferenceBackend as Backend>::Device> {
        use burn::backend::ndarray::NdArrayDevice;
        match self {
            Self::Auto | Self::Cpu => Ok(NdArrayDevice::Cpu),
            Self::Gpu(_) => Err(Error::config(format!(
                "device `{self}` requires building with backend_wgpu or backend_cuda"
            ))),
        }
    }
}

/// Run parameters, fixed at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictConfig {
    pub data: PathBuf,
    pub save_dir: PathBuf,
    pub weights: PathBuf,
    pub device: DeviceSelector,
    pub input_size: usize,
    pub encoder: Encoder,
    pub format: OutputFormat,
    pub benchmark: bool,
    pub benchmark_runs: usize,
    pub save_image: bool,
    pub save_debug: bool,
    pub use_fullpath: bool,
    pub pred_only: bool,
    pub jpeg_quality: u8,
}

impl PredictConfig {
    /// Defaults for everything but the input source.
    pub fn new(data: impl Into<PathBuf>, encoder: Encoder) -> Self {
        Self {
            data: data.into(),
            save_dir: PathBuf::from("run/predict"),
            weights: PathBuf::from(encoder.default_checkpoint()),
            device: DeviceSelector::Auto,
            input_size: DEFAULT_INPUT_SIZE,
            encoder,
            format: OutputFormat::All,
            benchmark: false,
            benchmark_runs: DEFAULT_BENCHMARK_RUNS,
            save_image: false,
            save_debug: false,
            use_fullpath: false,
            pred_only: false,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            return Err(Error::config("--imgsz must be greater than zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(Error::config(format!(
                "--jpeg-quality must be within 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if self.benchmark && self.benchmark_runs == 0 {
            return Err(Error::config("--benchmark-runs must be greater than zero"));
        }
        if !self.data.exists() {
            return Err(Error::config(format!(
                "input `{}` does not exist",
                self.data.display()
            )));
        }
        Ok(())
    }
}

/// Everything the prediction loop needs besides the model itself.
#[derive(Clone, Debug)]
pub struct RunContext<B: Backend> {
    pub config: PredictConfig,
    pub device: B::Device,
}

impl<B: Backend> RunContext<B> {
    pub fn new(config: PredictConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, device })
    }
}

impl RunContext<InferenceBackend> {
    /// Validates `config` and resolves its device selector for the compiled backend.
    pub fn from_config(config: PredictConfig) -> Result<Self> {
        let device = config.device.resolve()?;
        Self::new(config, device)
    }
}
