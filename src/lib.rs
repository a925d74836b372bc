#![recursion_limit = "256"]

pub mod benchmark;
pub mod config;
pub mod error;
pub mod inference;
pub mod io;
pub mod model;
pub mod output;
pub mod postprocess;
pub mod predict;

pub use error::{Error, Result};

#[cfg(feature = "backend_cuda")]
pub type InferenceBackend = burn::backend::Cuda<f32>;

#[cfg(all(feature = "backend_wgpu", not(feature = "backend_cuda")))]
pub type InferenceBackend = burn::backend::Wgpu<f32>;

#[cfg(all(
    feature = "backend_ndarray",
    not(feature = "backend_wgpu"),
    not(feature = "backend_cuda")
))]
pub type InferenceBackend = burn::backend::NdArray<f32>;
