//! CPU-only stub for builds without the `cuda` feature.

use hwtc_core::error::{EngineError, Result};

use crate::caps::GpuDeviceInfo;
use crate::probe::CapabilityProber;

/// Stub CUDA prober used when the `cuda` feature is disabled.
pub struct CudaProber;

impl CudaProber {
    pub fn new(codec_tables: Vec<GpuDeviceInfo>) -> Result<Self> {
        let _ = codec_tables;
        Err(EngineError::UnsupportedFeature {
            feature: "cuda device probing".into(),
            reason: "hwtc-device built without the `cuda` feature; pass a capability table instead"
                .into(),
        })
    }
}

impl CapabilityProber for CudaProber {
    fn name(&self) -> &'static str {
        "cuda-stub"
    }

    fn probe(&self, hint: Option<u32>) -> Result<Vec<GpuDeviceInfo>> {
        let _ = hint;
        Err(EngineError::UnsupportedFeature {
            feature: "cuda device probing".into(),
            reason: "hwtc-device built without the `cuda` feature".into(),
        })
    }
}
