//! Job planning.
//!
//! Everything that can be decided without touching an encoder session is
//! decided here: combination rules, the filter chain, the encode
//! configuration, the device, slot count, keyframes and timing. A job that
//! fails planning has allocated nothing.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{info, warn};

use hwtc_codec::buffer_pool::{PoolSizing, pool_capacity};
use hwtc_codec::config::EncodeConfig;
use hwtc_codec::dynamic_rc::DynamicRcController;
use hwtc_codec::keyframes::{KeyframePlanner, SeiTable, read_keyframe_file};
use hwtc_codec::validate::{ValidationContext, validate_parameters};
use hwtc_core::codec_traits::{DecodePath, FrameSource, SourceInfo, UtilizationSample};
use hwtc_core::error::{EngineError, Result};
use hwtc_core::types::{MemoryLocation, PixelFormat, Rational, TrimList};
use hwtc_device::caps::{Codec, Profile};
use hwtc_device::probe::CapabilityProber;
use hwtc_device::select::{Rejection, ScoredDevice, Selection, select_device};

use crate::filter_chain::{ChainPlan, DecoderDeinterlace, FilterChainBuilder, FilterFeatures, FrameLayout};
use crate::job::TranscodeJob;
use crate::sync::{Reconciler, ReconcilerConfig, SyncMode};

/// Fully resolved job, ready to allocate.
#[derive(Debug)]
pub struct TranscodePlan {
    pub source: SourceInfo,
    pub chain: ChainPlan,
    pub encode: EncodeConfig,
    pub selection: Selection,
    pub pool_capacity: usize,
    pub pipeline_depth: usize,
    pub trim: TrimList,
    pub reconciler: Reconciler,
    pub dynamic_rc: DynamicRcController,
    pub keyframes: KeyframePlanner,
    pub sei: Option<SeiTable>,
    pub warnings: Vec<String>,
}

/// What `plan` decided, for display.
#[derive(Clone, Debug, Serialize)]
pub struct PlanSummary {
    pub device_id: u32,
    pub device_name: String,
    pub ranking: Vec<ScoredDevice>,
    pub rejected: Vec<Rejection>,
    pub stages: Vec<String>,
    pub slot_location: MemoryLocation,
    pub codec: Codec,
    pub profile: Profile,
    pub input_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: Rational,
    pub timebase: Rational,
    pub frame_duration: i64,
    pub b_frames: u32,
    pub gop_length: u32,
    pub pool_capacity: usize,
    /// Source frames that survive trimming, when the source length is known.
    pub kept_frames: Option<u64>,
    pub warnings: Vec<String>,
}

impl TranscodePlan {
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            device_id: self.selection.device.id,
            device_name: self.selection.device.name.clone(),
            ranking: self.selection.ranking.clone(),
            rejected: self.selection.rejected.clone(),
            stages: self.chain.stage_names().into_iter().map(String::from).collect(),
            slot_location: self.chain.slot_location(),
            codec: self.encode.codec,
            profile: self.encode.profile,
            input_format: self.encode.input_format,
            width: self.encode.width,
            height: self.encode.height,
            fps: self.encode.fps,
            timebase: self.encode.timebase,
            frame_duration: self.reconciler.frame_duration(),
            b_frames: self.encode.b_frames,
            gop_length: self.encode.gop_length,
            pool_capacity: self.pool_capacity,
            kept_frames: self.source.frame_count.map(|n| self.trim.kept_frames(n)),
            warnings: self.warnings.clone(),
        }
    }
}

/// Reject feature combinations the timing model cannot express.
fn check_combinations(job: &TranscodeJob, info: &SourceInfo) -> Result<()> {
    let f: &FilterFeatures = &job.filters;
    let hardware = info.decode == DecodePath::Hardware;
    if f.repeat_field || f.rff_aware() {
        let name = if f.repeat_field { "vpp-rff" } else { "afs rff" };
        if !hardware {
            return Err(EngineError::UnsupportedFeature {
                feature: name.into(),
                reason: "requires hardware decode".into(),
            });
        }
        if job.trim.is_active() {
            return Err(EngineError::Config(format!("{name} cannot be used with trim")));
        }
        if f.decoder_deinterlace != DecoderDeinterlace::Weave {
            return Err(EngineError::FilterConflict(format!(
                "{name} can only be used with weave decoder deinterlace"
            )));
        }
    }
    if f.decoder_deinterlace != DecoderDeinterlace::Weave && !hardware {
        return Err(EngineError::UnsupportedFeature {
            feature: "decoder deinterlace".into(),
            reason: "requires hardware decode".into(),
        });
    }
    Ok(())
}

/// Resolve `job` against `source` and the devices `prober` reports.
/// `samples` holds live device load, if any is known.
pub fn plan(
    job: &TranscodeJob,
    source: &dyn FrameSource,
    prober: &dyn CapabilityProber,
    samples: &HashMap<u32, UtilizationSample>,
) -> Result<TranscodePlan> {
    job.validate()?;
    let info = source.info().clone();
    check_combinations(job, &info)?;

    let input = FrameLayout {
        width: info.width,
        height: info.height,
        format: info.format,
        picstruct: info.picstruct,
        location: match info.decode {
            DecodePath::Host => MemoryLocation::Host,
            DecodePath::Hardware => MemoryLocation::Device,
        },
    };
    let encoder_format = PixelFormat::encoder_input(job.encode.bit_depth, job.encode.yuv444);
    let chain = FilterChainBuilder::new(&job.filters, input)
        .encoder_format(encoder_format)
        .plan()?;

    let config = EncodeConfig::resolve(
        &job.encode,
        chain.output.width,
        chain.output.height,
        info.fps,
        chain.rate_scale,
        chain.output.picstruct,
    )?;
    let selection = select_device(
        prober,
        job.device.id,
        &config.requirements(),
        &job.device.weights,
        samples,
    )?;
    let caps = selection.device.codec(config.codec).ok_or_else(|| {
        EngineError::InvariantViolation(format!(
            "selected device #{} has no {} encoder",
            selection.device.id,
            config.codec.label()
        ))
    })?;
    let dynamic_rc_mode_change = job.dynamic_rc.iter().any(|r| r.mode != config.rc.mode);
    let validated = validate_parameters(
        config,
        caps,
        ValidationContext {
            dynamic_rc_rules: job.dynamic_rc.len(),
            dynamic_rc_mode_change,
            force_cfr: job.sync.mode == SyncMode::ForceCfr,
            trimmed: job.trim.is_active(),
        },
    )?;
    let mut warnings = validated.warnings;
    let encode = validated.config;

    let dynamic_rc = DynamicRcController::new(job.dynamic_rc.clone(), encode.rc.clone())?;
    let capacity = pool_capacity(&PoolSizing {
        width: encode.width,
        height: encode.height,
        b_frames: encode.b_frames,
        lookahead: encode.rc.lookahead,
        pipeline_depth: job.runtime.pipeline_depth,
    })?;

    let reconciler = Reconciler::new(ReconcilerConfig {
        mode: job.sync.mode,
        thresholds: job.sync.thresholds,
        source_timebase: info.timebase,
        source_fps: info.fps,
        decode: info.decode,
        deinterlace: job.filters.decoder_deinterlace,
        repeat_field: job.filters.repeat_field,
        rff_aware: job.filters.rff_aware(),
        position_index: source.position_index(),
    })?;

    let mut keyframes = KeyframePlanner::new(reconciler.out_timebase());
    let chapters = source.chapters();
    if job.keyframes.on_chapters && !chapters.is_empty() {
        if job.trim.is_active() {
            let msg = "chapter keyframes disabled because the source is trimmed".to_string();
            warn!("{msg}");
            warnings.push(msg);
        } else {
            keyframes = keyframes.with_chapters(&chapters);
        }
    }
    if let Some(path) = &job.keyframes.file {
        keyframes = keyframes.with_keyframes(read_keyframe_file(path)?);
    }
    let sei = job
        .sei_file
        .as_deref()
        .map(SeiTable::from_json_file)
        .transpose()?;
    if sei.is_some() && encode.codec != Codec::Hevc {
        let msg = format!("SEI payloads are ignored for {}", encode.codec.label());
        warn!("{msg}");
        warnings.push(msg);
    }

    info!(
        device = selection.device.id,
        stages = chain.stages.len(),
        width = encode.width,
        height = encode.height,
        fps = %encode.fps,
        slots = capacity,
        "Transcode planned"
    );
    Ok(TranscodePlan {
        source: info,
        chain,
        encode,
        selection,
        pool_capacity: capacity,
        pipeline_depth: job.runtime.pipeline_depth,
        trim: job.trim.clone(),
        reconciler,
        dynamic_rc,
        keyframes,
        sei,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter_chain::YadifOptions;
    use crate::job::InputConfig;
    use crate::synthetic::{SyntheticSource, SyntheticSpec};
    use hwtc_core::types::{PictureStructure, TrimWindow};
    use hwtc_device::probe::TableProber;

    fn job_with(spec: SyntheticSpec) -> TranscodeJob {
        TranscodeJob {
            input: InputConfig::Synthetic(spec),
            ..TranscodeJob::default()
        }
    }

    fn plan_job(job: &TranscodeJob) -> Result<TranscodePlan> {
        let InputConfig::Synthetic(spec) = &job.input;
        let source = SyntheticSource::new(spec.clone())?;
        plan(job, &source, &TableProber::reference(), &HashMap::new())
    }

    #[test]
    fn default_job_plans_on_reference_device() {
        let p = plan_job(&TranscodeJob::default()).unwrap();
        let s = p.summary();
        assert_eq!(s.device_id, 0);
        assert_eq!((s.width, s.height), (1920, 1080));
        assert_eq!(s.timebase, Rational::new(1001, 120_000).unwrap());
        assert_eq!(s.frame_duration, 4);
        assert_eq!(s.kept_frames, Some(300));
        assert_eq!(s.stages.last().map(String::as_str), Some("encoder-format"));
    }

    #[test]
    fn trim_reduces_kept_frames() {
        let job = TranscodeJob {
            trim: TrimList::new(vec![TrimWindow { start: 50, end: 150 }], 0).unwrap(),
            ..TranscodeJob::default()
        };
        assert_eq!(plan_job(&job).unwrap().summary().kept_frames, Some(100));
    }

    #[test]
    fn repeat_field_needs_hardware_decode() {
        let mut job = TranscodeJob::default();
        job.filters.repeat_field = true;
        let err = plan_job(&job).expect_err("host decode");
        assert_eq!(err.error_code(), 101);
        assert!(err.to_string().contains("hardware decode"));
    }

    #[test]
    fn repeat_field_with_trim_rejected() {
        let mut job = job_with(SyntheticSpec {
            decode: DecodePath::Hardware,
            ..SyntheticSpec::default()
        });
        job.filters.repeat_field = true;
        job.trim = TrimList::new(vec![TrimWindow { start: 0, end: 10 }], 0).unwrap();
        let err = plan_job(&job).expect_err("rff + trim");
        assert!(err.to_string().contains("cannot be used with trim"));
    }

    #[test]
    fn double_rate_yadif_doubles_output_rate() {
        let mut job = job_with(SyntheticSpec {
            picstruct: PictureStructure::TopFieldFirst,
            ..SyntheticSpec::default()
        });
        job.filters.yadif = Some(YadifOptions { double_rate: true });
        let s = plan_job(&job).unwrap().summary();
        assert_eq!(s.fps, Rational::new(60_000, 1001).unwrap());
        assert_eq!(s.timebase, Rational::new(1001, 120_000).unwrap());
    }

    #[test]
    fn chapters_disabled_under_trim_with_warning() {
        let mut job = job_with(SyntheticSpec {
            chapters: vec![hwtc_core::types::Chapter {
                id: 1,
                start: 10,
                timebase: Rational::new(1, 1).unwrap(),
            }],
            ..SyntheticSpec::default()
        });
        job.trim = TrimList::new(vec![TrimWindow { start: 0, end: 100 }], 0).unwrap();
        let p = plan_job(&job).unwrap();
        assert!(p.keyframes.is_empty());
        assert!(p.warnings.iter().any(|w| w.contains("chapter")));
    }

    #[test]
    fn dynamic_rc_mode_switch_rejected_on_fixed_mode_device() {
        let mut dev = hwtc_device::caps::GpuDeviceInfo::reference(0);
        for c in &mut dev.codecs {
            c.limits.dyn_rc_mode_change = false;
        }
        let prober = TableProber::new(vec![dev]);
        let rule = |mode| hwtc_codec::dynamic_rc::DynamicRcRule {
            start: 30,
            end: None,
            mode,
            qp: None,
            avg_bitrate_kbps: Some(2_000),
            max_bitrate_kbps: None,
            target_quality: None,
        };
        let mut job = TranscodeJob::default();
        let InputConfig::Synthetic(spec) = &job.input;
        let source = SyntheticSource::new(spec.clone()).unwrap();

        job.dynamic_rc = vec![rule(hwtc_codec::config::RateControlMode::Vbr)];
        assert!(plan(&job, &source, &prober, &HashMap::new()).is_ok());

        job.dynamic_rc = vec![rule(hwtc_codec::config::RateControlMode::Cbr)];
        let err = plan(&job, &source, &prober, &HashMap::new()).expect_err("mode switch");
        assert_eq!(err.error_code(), 101);
        assert!(err.to_string().contains("rate-control mode"));
    }

    #[test]
    fn pinned_unknown_device_is_config_error() {
        let mut job = TranscodeJob::default();
        job.device.id = Some(7);
        let err = plan_job(&job).expect_err("no device 7");
        assert!(err.is_config_error());
    }
}
