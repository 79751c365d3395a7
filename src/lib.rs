#![recursion_limit = "256"]

pub mod imprint;
pub mod inference;
pub mod model;

#[cfg(feature = "backend_cuda")]
pub type InferenceBackend = burn::backend::Cuda<f32>;
#[cfg(all(feature = "backend_wgpu", not(feature = "backend_cuda")))]
pub type InferenceBackend = burn::backend::Wgpu<f32>;
#[cfg(not(any(feature = "backend_wgpu", feature = "backend_cuda")))]
pub type InferenceBackend = burn::backend::NdArray<f32>;
