//! CUDA driver prober.

use cudarc::driver::CudaDevice;
use cudarc::driver::sys::CUdevice_attribute;
use tracing::{debug, warn};

use hwtc_core::error::Result;

use crate::caps::{GpuDeviceInfo, MIN_COMPUTE_CAPABILITY, cuda_cores_for};
use crate::probe::CapabilityProber;

/// Reads adapter properties through `cudarc`.
///
/// The driver does not expose encoder capabilities, so codec tables are
/// merged in from `codec_tables` by device name. Adapters without a matching
/// table enumerate with no codecs and are filtered out later with a reason.
pub struct CudaProber {
    codec_tables: Vec<GpuDeviceInfo>,
}

impl CudaProber {
    pub fn new(codec_tables: Vec<GpuDeviceInfo>) -> Result<Self> {
        Ok(Self { codec_tables })
    }
}

impl CapabilityProber for CudaProber {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn probe(&self, hint: Option<u32>) -> Result<Vec<GpuDeviceInfo>> {
        let count = CudaDevice::count()?;
        let mut devices = Vec::new();
        for ordinal in 0..count.max(0) as u32 {
            if hint.is_some_and(|id| id != ordinal) {
                continue;
            }
            let dev = CudaDevice::new(ordinal as usize)?;
            let name = dev.name()?;
            let major =
                dev.attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
            let minor =
                dev.attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;
            let sms = dev.attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?;
            let cc = (major.max(0) as u32, minor.max(0) as u32);
            if cc < MIN_COMPUTE_CAPABILITY {
                warn!(ordinal, %name, ?cc, "Skipping device below minimum compute capability");
                continue;
            }
            let codecs = self
                .codec_tables
                .iter()
                .find(|t| t.name == name)
                .map(|t| t.codecs.clone())
                .unwrap_or_default();
            debug!(ordinal, %name, ?cc, sms, codecs = codecs.len(), "CUDA device probed");
            devices.push(GpuDeviceInfo {
                id: ordinal,
                name,
                compute_capability: cc,
                cuda_cores: cuda_cores_for(cc.0, cc.1, sms.max(0) as u32),
                codecs,
            });
        }
        Ok(devices)
    }
}
