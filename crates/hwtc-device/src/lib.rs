#![doc = include_str!("../README.md")]

pub mod caps;
#[cfg(feature = "cuda")]
pub mod cuda_probe;
#[cfg(not(feature = "cuda"))]
#[path = "cuda_probe_stub.rs"]
pub mod cuda_probe;
pub mod probe;
pub mod select;

pub use cuda_probe::CudaProber;
pub use caps::{Codec, CodecCapabilities, EncoderLimits, GpuDeviceInfo, Profile};
pub use select::{EncodeRequirements, ScoreWeights, ScoredDevice};
