//! JSON job description.
//!
//! A job bundles everything one transcode needs: the source, the outputs,
//! device selection, encode settings, filters, timing mode, trim windows,
//! rate-control overrides and keyframe controls. Files carry a schema
//! version that is checked before the rest is parsed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hwtc_codec::buffer_pool::MAX_ENCODE_QUEUE;
use hwtc_codec::config::EncodeSettings;
use hwtc_codec::dynamic_rc::{DynamicRcRule, validate_rules};
use hwtc_core::codec_traits::FrameSource;
use hwtc_core::error::{EngineError, Result};
use hwtc_core::types::TrimList;
use hwtc_device::cuda_probe::CudaProber;
use hwtc_device::probe::{CapabilityProber, TableProber};
use hwtc_device::select::ScoreWeights;

use crate::file_sink::{OutputTarget, check_targets};
use crate::filter_chain::FilterFeatures;
use crate::pipeline::PipelineConfig;
use crate::sync::{SyncMode, SyncThresholds};
use crate::synthetic::{SyntheticSource, SyntheticSpec};

pub const JOB_SCHEMA_VERSION: u32 = 1;

/// Where source pictures come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputConfig {
    Synthetic(SyntheticSpec),
}

impl Default for InputConfig {
    fn default() -> Self {
        Self::Synthetic(SyntheticSpec::default())
    }
}

impl InputConfig {
    pub fn open(&self) -> Result<Box<dyn FrameSource>> {
        match self {
            Self::Synthetic(spec) => Ok(Box::new(SyntheticSource::new(spec.clone())?)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Pin a device id. It must still meet the encode requirements.
    pub id: Option<u32>,
    /// JSON capability table; the built-in reference device otherwise.
    pub caps_file: Option<PathBuf>,
    /// Enumerate adapters through the CUDA driver; the table above then
    /// only supplies encoder capabilities, matched by device name.
    pub cuda: bool,
    pub weights: ScoreWeights,
}

impl DeviceConfig {
    pub fn prober(&self) -> Result<Box<dyn CapabilityProber>> {
        let table = match &self.caps_file {
            Some(path) => TableProber::from_json_file(path)?,
            None => TableProber::reference(),
        };
        if self.cuda {
            return Ok(Box::new(CudaProber::new(table.into_devices())?));
        }
        Ok(Box::new(table))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub mode: SyncMode,
    pub thresholds: SyncThresholds,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyframeConfig {
    /// Frame indices, one per line, that must be coded as IDR.
    pub file: Option<PathBuf>,
    /// Force an IDR at every source chapter start.
    pub on_chapters: bool,
}

impl Default for KeyframeConfig {
    fn default() -> Self {
        Self {
            file: None,
            on_chapters: true,
        }
    }
}

/// Queue depths and watchdogs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pipeline_depth: usize,
    /// How long to keep retrying a session open that fails for lack of
    /// memory. 0 disables retry.
    pub session_retry_secs: u64,
    pub eos_timeout_ms: u64,
    pub event_timeout_ms: u64,
    pub ready_queue_wait_ms: u64,
    pub check_performance: bool,
    pub strict_invariants: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let p = PipelineConfig::default();
        Self {
            pipeline_depth: p.pipeline_depth,
            session_retry_secs: p.session_retry.as_secs(),
            eos_timeout_ms: p.eos_timeout.as_millis() as u64,
            event_timeout_ms: p.event_timeout.as_millis() as u64,
            ready_queue_wait_ms: p.ready_queue_wait.as_millis() as u64,
            check_performance: p.check_performance,
            strict_invariants: p.strict_invariants,
        }
    }
}

impl RuntimeConfig {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            pipeline_depth: self.pipeline_depth,
            session_retry: Duration::from_secs(self.session_retry_secs),
            eos_timeout: Duration::from_millis(self.eos_timeout_ms),
            event_timeout: Duration::from_millis(self.event_timeout_ms),
            ready_queue_wait: Duration::from_millis(self.ready_queue_wait_ms),
            check_performance: self.check_performance,
            strict_invariants: self.strict_invariants,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscodeJob {
    pub job_schema_version: u32,
    pub input: InputConfig,
    pub outputs: Vec<OutputTarget>,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub encode: EncodeSettings,
    #[serde(default)]
    pub filters: FilterFeatures,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub trim: TrimList,
    #[serde(default)]
    pub dynamic_rc: Vec<DynamicRcRule>,
    #[serde(default)]
    pub keyframes: KeyframeConfig,
    /// Per-frame SEI payloads keyed by source frame index.
    #[serde(default)]
    pub sei_file: Option<PathBuf>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for TranscodeJob {
    fn default() -> Self {
        Self {
            job_schema_version: JOB_SCHEMA_VERSION,
            input: InputConfig::default(),
            outputs: vec![OutputTarget::Null],
            device: DeviceConfig::default(),
            encode: EncodeSettings::default(),
            filters: FilterFeatures::default(),
            sync: SyncConfig::default(),
            trim: TrimList::default(),
            dynamic_rc: Vec::new(),
            keyframes: KeyframeConfig::default(),
            sei_file: None,
            runtime: RuntimeConfig::default(),
        }
    }
}

impl TranscodeJob {
    pub fn from_json_str(data: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|err| EngineError::Config(format!("Invalid job JSON: {err}")))?;

        let Some(version_value) = value.get("job_schema_version") else {
            return Err(EngineError::Config(format!(
                "Job schema mismatch: expected {}, got missing",
                JOB_SCHEMA_VERSION
            )));
        };
        let Some(version) = version_value.as_u64() else {
            return Err(EngineError::Config(format!(
                "Job schema mismatch: expected {}, got non-integer",
                JOB_SCHEMA_VERSION
            )));
        };
        if version != JOB_SCHEMA_VERSION as u64 {
            return Err(EngineError::Config(format!(
                "Job schema mismatch: expected {}, got {}",
                JOB_SCHEMA_VERSION, version
            )));
        }

        serde_json::from_value(value)
            .map_err(|err| EngineError::Config(format!("Invalid job JSON: {err}")))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Config(format!(
                "Failed to read job from {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&data)
    }

    /// Checks that need no source or device.
    pub fn validate(&self) -> Result<()> {
        if self.job_schema_version != JOB_SCHEMA_VERSION {
            return Err(EngineError::Config(format!(
                "Job schema mismatch: expected {}, got {}",
                JOB_SCHEMA_VERSION, self.job_schema_version
            )));
        }
        if self.outputs.is_empty() {
            return Err(EngineError::Config(
                "job validation failed: at least one output is required".into(),
            ));
        }
        check_targets(&self.outputs)?;

        let rt = &self.runtime;
        if rt.pipeline_depth == 0 || rt.pipeline_depth > MAX_ENCODE_QUEUE {
            return Err(EngineError::Config(format!(
                "job validation failed: pipeline_depth {} must be within 1..={MAX_ENCODE_QUEUE}",
                rt.pipeline_depth
            )));
        }
        for (name, ms) in [
            ("eos_timeout_ms", rt.eos_timeout_ms),
            ("event_timeout_ms", rt.event_timeout_ms),
            ("ready_queue_wait_ms", rt.ready_queue_wait_ms),
        ] {
            if ms == 0 {
                return Err(EngineError::Config(format!(
                    "job validation failed: {name} must be > 0"
                )));
            }
        }

        self.encode.validate()?;
        self.trim.validate()?;
        self.sync.thresholds.validate()?;
        self.device.weights.validate()?;
        validate_rules(self.dynamic_rc.clone())?;
        Ok(())
    }
}
