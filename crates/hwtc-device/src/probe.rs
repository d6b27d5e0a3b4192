//! Capability probers.
//!
//! A prober turns "what hardware is here" into [`GpuDeviceInfo`] tables.
//! [`TableProber`] serves a fixed table (JSON file or the built-in reference
//! device); [`CudaProber`] reads adapter properties from the CUDA driver.

use std::path::Path;

use tracing::debug;

use hwtc_core::error::{EngineError, Result};

use crate::caps::GpuDeviceInfo;

#[cfg(feature = "cuda")]
#[path = "cuda_probe.rs"]
mod cuda;
#[cfg(not(feature = "cuda"))]
#[path = "cuda_probe_stub.rs"]
mod cuda;

pub use cuda::CudaProber;

/// Source of device capability tables.
pub trait CapabilityProber: Send + Sync {
    fn name(&self) -> &'static str;

    /// Enumerate devices. With `hint`, only that device id is returned.
    fn probe(&self, hint: Option<u32>) -> Result<Vec<GpuDeviceInfo>>;
}

/// Prober backed by a static capability table.
#[derive(Clone, Debug)]
pub struct TableProber {
    devices: Vec<GpuDeviceInfo>,
}

impl TableProber {
    pub fn new(devices: Vec<GpuDeviceInfo>) -> Self {
        Self { devices }
    }

    /// One software reference device with id 0.
    pub fn reference() -> Self {
        Self::new(vec![GpuDeviceInfo::reference(0)])
    }

    /// Parse a JSON array of device tables.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let devices: Vec<GpuDeviceInfo> = serde_json::from_str(json)
            .map_err(|e| EngineError::Config(format!("capability table parse failed: {e}")))?;
        let mut ids: Vec<u32> = devices.iter().map(|d| d.id).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(EngineError::Config(
                "capability table lists the same device id twice".into(),
            ));
        }
        Ok(Self::new(devices))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!(
                "failed to read capability table {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn into_devices(self) -> Vec<GpuDeviceInfo> {
        self.devices
    }
}

impl CapabilityProber for TableProber {
    fn name(&self) -> &'static str {
        "table"
    }

    fn probe(&self, hint: Option<u32>) -> Result<Vec<GpuDeviceInfo>> {
        let devices: Vec<GpuDeviceInfo> = self
            .devices
            .iter()
            .filter(|d| hint.is_none_or(|id| d.id == id))
            .cloned()
            .collect();
        debug!(count = devices.len(), ?hint, "Capability table probed");
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_restricts_table() {
        let prober = TableProber::new(vec![
            GpuDeviceInfo::reference(0),
            GpuDeviceInfo::reference(1),
        ]);
        assert_eq!(prober.probe(None).unwrap().len(), 2);
        let only = prober.probe(Some(1)).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].id, 1);
        assert!(prober.probe(Some(7)).unwrap().is_empty());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let json = r#"[
            {"id": 0, "name": "a", "compute_capability": [7, 5], "cuda_cores": 1},
            {"id": 0, "name": "b", "compute_capability": [7, 5], "cuda_cores": 1}
        ]"#;
        let err = TableProber::from_json_str(json).expect_err("duplicate ids must fail");
        assert!(err.to_string().contains("same device id"));
    }

    #[test]
    fn malformed_table_is_config_error() {
        let err = TableProber::from_json_str("{not json").expect_err("parse must fail");
        assert!(err.is_config_error());
    }
}
