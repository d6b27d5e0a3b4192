//! Device enumeration, requirement filtering and scoring.
//!
//! Selection runs in three steps, all before any encoder session exists:
//!
//! 1. [`enumerate`] asks a prober for devices (optionally one pinned id).
//! 2. [`filter_by_requirements`] drops devices that cannot serve the job and
//!    records a human-readable reason for each.
//! 3. [`auto_score`] ranks the survivors by hardware generation, core count
//!    and live utilization.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use hwtc_core::codec_traits::{GpuTelemetry, UtilizationSample};
use hwtc_core::error::{EngineError, Result};

use crate::caps::{Codec, GpuDeviceInfo, Profile};
use crate::probe::CapabilityProber;

/// What the job needs from an encoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodeRequirements {
    pub codec: Codec,
    pub profile: Profile,
    pub lossless: bool,
    pub yuv444: bool,
    pub bit_depth: u8,
    /// Interlaced content is encoded as fields (no deinterlacer in the chain).
    pub field_encoding: bool,
    pub b_frames: u32,
}

/// A device that failed [`filter_by_requirements`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub id: u32,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct FilterOutcome {
    pub kept: Vec<GpuDeviceInfo>,
    pub rejected: Vec<Rejection>,
}

/// Weights of the scoring terms.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub cores: f64,
    /// Compute-capability term; `gen` in job files.
    #[serde(rename = "gen")]
    pub generation: f64,
    pub gpu: f64,
    pub ve: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            cores: 0.001,
            generation: 1.0,
            gpu: 1.0,
            ve: 1.0,
        }
    }
}

impl ScoreWeights {
    pub fn validate(&self) -> Result<()> {
        for (name, w) in [
            ("cores", self.cores),
            ("gen", self.generation),
            ("gpu", self.gpu),
            ("ve", self.ve),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(EngineError::Config(format!(
                    "score weight '{name}' must be finite and non-negative, got {w}"
                )));
            }
        }
        Ok(())
    }
}

/// One ranked device.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoredDevice {
    pub id: u32,
    pub name: String,
    pub score: f64,
    pub core_score: f64,
    pub gen_score: f64,
    pub gpu_score: f64,
    pub ve_score: f64,
}

// ─── Enumerate ───────────────────────────────────────────────────────────

/// List devices with their capability tables.
///
/// An explicit `hint` that matches no device is a configuration error.
pub fn enumerate(prober: &dyn CapabilityProber, hint: Option<u32>) -> Result<Vec<GpuDeviceInfo>> {
    let devices = prober.probe(hint)?;
    if devices.is_empty() {
        return Err(match hint {
            Some(id) => EngineError::Config(format!(
                "device #{id} not found by {} prober",
                prober.name()
            )),
            None => EngineError::Config(format!("{} prober found no devices", prober.name())),
        });
    }
    for dev in &devices {
        debug!(
            id = dev.id,
            name = %dev.name,
            cc = ?dev.compute_capability,
            cores = dev.cuda_cores,
            codecs = dev.codecs.len(),
            "Enumerated device"
        );
    }
    Ok(devices)
}

// ─── Filter ──────────────────────────────────────────────────────────────

fn rejection_reason(dev: &GpuDeviceInfo, req: &EncodeRequirements) -> Option<String> {
    let tag = format!("GPU #{} ({})", dev.id, dev.name);
    let Some(codec) = dev.codec(req.codec) else {
        return Some(format!(
            "{tag} does not support {} encoding",
            req.codec.label()
        ));
    };
    if !codec.supports_profile(req.profile) {
        return Some(format!(
            "{tag} cannot encode {} {:?}",
            req.codec.label(),
            req.profile
        ));
    }
    if req.lossless && !codec.limits.lossless {
        return Some(format!("{tag} does not support lossless encoding"));
    }
    if req.yuv444 && !codec.limits.yuv444 {
        return Some(format!("{tag} does not support yuv444 encoding"));
    }
    if req.codec == Codec::Hevc && req.bit_depth > 8 && !codec.limits.ten_bit {
        return Some(format!("{tag} does not support HEVC 10bit depth encoding"));
    }
    if req.codec == Codec::H264 && req.field_encoding && !codec.limits.field_encoding {
        return Some(format!("{tag} does not support H.264 interlaced encoding"));
    }
    None
}

/// Drop devices that cannot serve `req`, recording why.
///
/// When B-frames are requested and at least one surviving device supports
/// them, devices without B-frame support are dropped as well. Fails when no
/// device survives.
pub fn filter_by_requirements(
    devices: Vec<GpuDeviceInfo>,
    req: &EncodeRequirements,
) -> Result<FilterOutcome> {
    let mut kept = Vec::with_capacity(devices.len());
    let mut rejected = Vec::new();
    for dev in devices {
        match rejection_reason(&dev, req) {
            Some(reason) => {
                debug!(id = dev.id, %reason, "Device rejected");
                rejected.push(Rejection { id: dev.id, reason });
            }
            None => {
                debug!(id = dev.id, name = %dev.name, "Device available for encode");
                kept.push(dev);
            }
        }
    }

    if kept.is_empty() {
        let reasons = rejected
            .iter()
            .map(|r| r.reason.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(EngineError::UnsupportedFeature {
            feature: format!("{} encode", req.codec.label()),
            reason: if reasons.is_empty() {
                "no devices enumerated".into()
            } else {
                reasons
            },
        });
    }

    if req.b_frames > 0 && kept.len() > 1 {
        let max_b = |d: &GpuDeviceInfo| d.codec(req.codec).map_or(0, |c| c.limits.max_bframes);
        if kept.iter().any(|d| max_b(d) > 0) {
            let (with_b, without_b): (Vec<_>, Vec<_>) =
                kept.into_iter().partition(|d| max_b(d) > 0);
            for dev in without_b {
                rejected.push(Rejection {
                    id: dev.id,
                    reason: format!(
                        "GPU #{} ({}) has no B-frame support while another device does",
                        dev.id, dev.name
                    ),
                });
            }
            kept = with_b;
        }
    }

    Ok(FilterOutcome { kept, rejected })
}

// ─── Score ───────────────────────────────────────────────────────────────

/// Score one device. Loads are fractions in `[0, 1]`; missing telemetry
/// contributes nothing to the load terms.
pub fn score_device(
    dev: &GpuDeviceInfo,
    weights: &ScoreWeights,
    sample: Option<&UtilizationSample>,
) -> ScoredDevice {
    let core_score = dev.cuda_cores as f64 * weights.cores;
    let (major, minor) = dev.compute_capability;
    let gen_score = (major as f64 * 10.0 + minor as f64) * weights.generation;
    let (gpu_score, ve_score) = match sample {
        Some(s) => {
            let gpu = s.gpu_load.clamp(0.0, 1.0);
            let ve = s.video_engine_load.clamp(0.0, 1.0);
            (
                100.0 * (1.0 - gpu.powf(1.5)) * weights.gpu,
                100.0 * (1.0 - ve) * weights.ve,
            )
        }
        None => (0.0, 0.0),
    };
    ScoredDevice {
        id: dev.id,
        name: dev.name.clone(),
        score: core_score + gen_score + gpu_score + ve_score,
        core_score,
        gen_score,
        gpu_score,
        ve_score,
    }
}

/// Rank devices by descending score, ties broken by ascending id.
///
/// A single device short-circuits without consulting telemetry.
pub fn auto_score(
    devices: &[GpuDeviceInfo],
    weights: &ScoreWeights,
    samples: &HashMap<u32, UtilizationSample>,
) -> Vec<ScoredDevice> {
    if let [only] = devices {
        return vec![ScoredDevice {
            id: only.id,
            name: only.name.clone(),
            score: 0.0,
            core_score: 0.0,
            gen_score: 0.0,
            gpu_score: 0.0,
            ve_score: 0.0,
        }];
    }
    let mut ranked: Vec<ScoredDevice> = devices
        .iter()
        .map(|d| score_device(d, weights, samples.get(&d.id)))
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
    for s in &ranked {
        debug!(
            id = s.id,
            name = %s.name,
            score = s.score,
            ve = s.ve_score,
            gpu = s.gpu_score,
            cc = s.gen_score,
            cores = s.core_score,
            "Device score"
        );
    }
    ranked
}

/// Sample utilization for every device. Devices the monitor has no data for
/// are absent from the map.
pub async fn collect_samples(
    telemetry: &dyn GpuTelemetry,
    devices: &[GpuDeviceInfo],
) -> HashMap<u32, UtilizationSample> {
    let mut samples = HashMap::with_capacity(devices.len());
    for dev in devices {
        if let Some(s) = telemetry.sample(dev.id).await {
            debug!(id = dev.id, gpu = s.gpu_load, ve = s.video_engine_load, "Device load");
            samples.insert(dev.id, s);
        }
    }
    samples
}

/// Result of the full selection sequence.
#[derive(Clone, Debug)]
pub struct Selection {
    pub device: GpuDeviceInfo,
    pub ranking: Vec<ScoredDevice>,
    pub rejected: Vec<Rejection>,
}

/// Enumerate, filter and rank; return the winner.
///
/// A pinned device (`hint`) must still satisfy the requirements.
pub fn select_device(
    prober: &dyn CapabilityProber,
    hint: Option<u32>,
    req: &EncodeRequirements,
    weights: &ScoreWeights,
    samples: &HashMap<u32, UtilizationSample>,
) -> Result<Selection> {
    weights.validate()?;
    let devices = enumerate(prober, hint)?;
    let FilterOutcome { kept, rejected } = filter_by_requirements(devices, req)?;
    let ranking = auto_score(&kept, weights, samples);
    let winner = ranking
        .first()
        .map(|s| s.id)
        .ok_or_else(|| EngineError::InvariantViolation("ranking empty after filter".into()))?;
    let device = kept
        .into_iter()
        .find(|d| d.id == winner)
        .ok_or_else(|| EngineError::InvariantViolation("ranked device vanished".into()))?;
    info!(id = device.id, name = %device.name, "Selected device");
    Ok(Selection {
        device,
        ranking,
        rejected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::CodecCapabilities;
    use crate::probe::TableProber;
    use async_trait::async_trait;

    fn device(id: u32, cc: (u32, u32), cores: u32, max_b: u32) -> GpuDeviceInfo {
        let mut hevc = CodecCapabilities::reference(Codec::Hevc);
        hevc.limits.max_bframes = max_b;
        GpuDeviceInfo {
            id,
            name: format!("gpu{id}"),
            compute_capability: cc,
            cuda_cores: cores,
            codecs: vec![hevc],
        }
    }

    fn hevc_req(b_frames: u32) -> EncodeRequirements {
        EncodeRequirements {
            codec: Codec::Hevc,
            profile: Profile::HevcMain,
            lossless: false,
            yuv444: false,
            bit_depth: 8,
            field_encoding: false,
            b_frames,
        }
    }

    #[test]
    fn missing_codec_is_rejected_with_reason() {
        let mut h264_only = device(0, (7, 5), 2560, 0);
        h264_only.codecs = vec![CodecCapabilities::reference(Codec::H264)];
        let ok = device(1, (7, 5), 2560, 0);
        let out = filter_by_requirements(vec![h264_only, ok], &hevc_req(0)).unwrap();
        assert_eq!(out.kept.len(), 1);
        assert_eq!(out.kept[0].id, 1);
        assert!(out.rejected[0].reason.contains("does not support HEVC"));
    }

    #[test]
    fn all_rejected_fails_with_every_reason() {
        let mut no10 = device(0, (6, 1), 1280, 0);
        no10.codecs[0].limits.ten_bit = false;
        let req = EncodeRequirements {
            bit_depth: 10,
            profile: Profile::HevcMain10,
            ..hevc_req(0)
        };
        let err = filter_by_requirements(vec![no10], &req).expect_err("must fail");
        assert!(err.to_string().contains("10bit"));
        assert!(err.is_config_error());
    }

    #[test]
    fn bframe_capable_devices_preferred() {
        let devices = vec![device(0, (7, 5), 2560, 0), device(1, (6, 1), 1280, 4)];
        let out = filter_by_requirements(devices.clone(), &hevc_req(3)).unwrap();
        assert_eq!(out.kept.iter().map(|d| d.id).collect::<Vec<_>>(), vec![1]);

        // No device with B-frames: nothing extra is dropped.
        let none_b = vec![device(0, (7, 5), 2560, 0), device(1, (6, 1), 1280, 0)];
        assert_eq!(filter_by_requirements(none_b, &hevc_req(3)).unwrap().kept.len(), 2);

        // Without B-frames requested the preference does not apply.
        assert_eq!(filter_by_requirements(devices, &hevc_req(0)).unwrap().kept.len(), 2);
    }

    #[test]
    fn idle_newer_device_outranks_busy_one() {
        let devices = vec![device(0, (7, 5), 2560, 2), device(1, (8, 6), 3584, 2)];
        let samples = HashMap::from([
            (
                0,
                UtilizationSample {
                    gpu_load: 0.1,
                    video_engine_load: 0.0,
                },
            ),
            (
                1,
                UtilizationSample {
                    gpu_load: 0.9,
                    video_engine_load: 0.95,
                },
            ),
        ]);
        let ranked = auto_score(&devices, &ScoreWeights::default(), &samples);
        assert_eq!(ranked[0].id, 0);

        let idle = auto_score(&devices, &ScoreWeights::default(), &HashMap::new());
        assert_eq!(idle[0].id, 1);
    }

    #[test]
    fn ties_break_by_ascending_id_deterministically() {
        let devices = vec![
            device(3, (8, 6), 3584, 2),
            device(1, (8, 6), 3584, 2),
            device(2, (8, 6), 3584, 2),
        ];
        for _ in 0..4 {
            let ids: Vec<u32> = auto_score(&devices, &ScoreWeights::default(), &HashMap::new())
                .iter()
                .map(|s| s.id)
                .collect();
            assert_eq!(ids, vec![1, 2, 3]);
        }
    }

    #[test]
    fn single_device_short_circuits() {
        let ranked = auto_score(
            &[device(5, (3, 0), 1, 0)],
            &ScoreWeights::default(),
            &HashMap::new(),
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, 5);
    }

    #[test]
    fn score_terms_follow_weights() {
        let dev = device(0, (7, 5), 2000, 0);
        let s = score_device(
            &dev,
            &ScoreWeights::default(),
            Some(&UtilizationSample {
                gpu_load: 1.0,
                video_engine_load: 0.5,
            }),
        );
        assert!((s.core_score - 2.0).abs() < 1e-9);
        assert!((s.gen_score - 75.0).abs() < 1e-9);
        assert!(s.gpu_score.abs() < 1e-9);
        assert!((s.ve_score - 50.0).abs() < 1e-9);
    }

    #[test]
    fn missing_sample_scores_like_fully_busy() {
        let dev = device(0, (7, 5), 2000, 0);
        let weights = ScoreWeights::default();
        let unsampled = score_device(&dev, &weights, None);
        let busy = score_device(
            &dev,
            &weights,
            Some(&UtilizationSample {
                gpu_load: 1.0,
                video_engine_load: 1.0,
            }),
        );
        assert_eq!(unsampled.gpu_score, 0.0);
        assert_eq!(unsampled.ve_score, 0.0);
        assert!((unsampled.score - busy.score).abs() < 1e-9);
    }

    #[test]
    fn weights_read_gen_key_from_json() {
        let w: ScoreWeights = serde_json::from_str(r#"{"gen": 2.5, "ve": 0.0}"#).unwrap();
        assert_eq!(w.generation, 2.5);
        assert_eq!(w.ve, 0.0);
        assert_eq!(w.cores, ScoreWeights::default().cores);
        let back = serde_json::to_value(w).unwrap();
        assert_eq!(back["gen"], 2.5);
    }

    #[test]
    fn negative_weight_rejected() {
        let w = ScoreWeights {
            gpu: -1.0,
            ..ScoreWeights::default()
        };
        assert!(w.validate().is_err());
    }

    #[test]
    fn pinned_missing_device_is_config_error() {
        let prober = TableProber::reference();
        let err = enumerate(&prober, Some(3)).expect_err("missing pin must fail");
        assert!(err.to_string().contains("device #3 not found"));
    }

    struct FixedTelemetry;

    #[async_trait]
    impl GpuTelemetry for FixedTelemetry {
        async fn sample(&self, device_id: u32) -> Option<UtilizationSample> {
            (device_id == 1).then_some(UtilizationSample {
                gpu_load: 0.5,
                video_engine_load: 0.25,
            })
        }
    }

    #[tokio::test]
    async fn collect_samples_skips_unmonitored_devices() {
        let devices = vec![device(0, (7, 5), 1, 0), device(1, (7, 5), 1, 0)];
        let samples = collect_samples(&FixedTelemetry, &devices).await;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[&1].video_engine_load, 0.25);
    }

    #[test]
    fn select_device_returns_top_ranked() {
        let prober = TableProber::new(vec![device(0, (6, 1), 1280, 2), device(1, (8, 6), 3584, 2)]);
        let sel = select_device(
            &prober,
            None,
            &hevc_req(2),
            &ScoreWeights::default(),
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(sel.device.id, 1);
        assert_eq!(sel.ranking.len(), 2);
    }
}
