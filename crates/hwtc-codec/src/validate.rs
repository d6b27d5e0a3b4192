//! Encode parameter validation against a device capability table.
//!
//! Hard failures return an error before any encoder resource exists. Soft
//! failures rewrite the offending field to a supported value and are
//! reported as warnings, each one logged once.

use tracing::{debug, warn};

use hwtc_core::error::{EngineError, Result};
use hwtc_device::caps::{Codec, CodecCapabilities};

use crate::config::{EncodeConfig, RateControlMode};

/// Inputs outside the encode configuration that validation must see.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValidationContext {
    /// Number of dynamic rate-control rules attached to the job.
    pub dynamic_rc_rules: usize,
    /// Whether any dynamic rule switches away from the base rate-control mode.
    pub dynamic_rc_mode_change: bool,
    /// Whether the job forces constant frame rate.
    pub force_cfr: bool,
    /// Whether the job trims the source.
    pub trimmed: bool,
}

/// Outcome of a successful validation.
#[derive(Clone, Debug)]
pub struct ValidatedConfig {
    pub config: EncodeConfig,
    pub warnings: Vec<String>,
}

impl ValidatedConfig {
    pub fn downgraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

fn unsupported(feature: impl Into<String>, reason: impl Into<String>) -> EngineError {
    EngineError::UnsupportedFeature {
        feature: feature.into(),
        reason: reason.into(),
    }
}

/// Check `config` against `caps`, downgrading soft failures in place.
pub fn validate_parameters(
    mut config: EncodeConfig,
    caps: &CodecCapabilities,
    ctx: ValidationContext,
) -> Result<ValidatedConfig> {
    let limits = &caps.limits;
    let codec = config.codec;
    if caps.codec != codec {
        return Err(EngineError::InvariantViolation(format!(
            "validating {} settings against a {} capability table",
            codec.label(),
            caps.codec.label()
        )));
    }

    // ─── Hard failures ──────────────────────────────────────────────────

    if config.width > limits.width_max || config.height > limits.height_max {
        return Err(EngineError::ResolutionOverLimit {
            width: config.width,
            height: config.height,
            max_width: limits.width_max,
            max_height: limits.height_max,
        });
    }
    let interlaced = config.picstruct.is_interlaced();
    let height_mod = if interlaced { 32 } else { 16 };
    let mb_count = u64::from(config.width.div_ceil(16)) * u64::from(config.height.div_ceil(height_mod));
    if mb_count > u64::from(limits.mb_num_max) {
        return Err(unsupported(
            "frame size",
            format!(
                "{}x{} needs {mb_count} macroblocks, device limit is {}",
                config.width, config.height, limits.mb_num_max
            ),
        ));
    }
    let (w_mod, h_mod) = if interlaced { (2, 4) } else { (2, 2) };
    if config.width % w_mod != 0 || config.height % h_mod != 0 {
        return Err(EngineError::Config(format!(
            "{}x{} must be a multiple of {w_mod}x{h_mod} for {} output",
            config.width,
            config.height,
            if interlaced { "interlaced" } else { "progressive" }
        )));
    }
    if interlaced && !limits.field_encoding {
        let reason = if codec == Codec::Hevc {
            "interlaced output is not supported for HEVC codec".to_string()
        } else {
            "device does not support field encoding".to_string()
        };
        return Err(unsupported("interlaced encoding", reason));
    }
    if !config.rc.mode.supported_by(limits.rc_modes_mask) {
        return Err(unsupported(
            format!("rate control {:?}", config.rc.mode),
            format!("device rc mask is {:#x}", limits.rc_modes_mask),
        ));
    }
    if config.lossless && !limits.lossless {
        return Err(unsupported("lossless", "device does not support lossless encode"));
    }
    if config.yuv444 && !limits.yuv444 {
        return Err(unsupported("yuv444", "device does not support 4:4:4 encode"));
    }
    if config.bit_depth > 8 && !limits.ten_bit {
        return Err(unsupported(
            format!("{} 10bit", codec.label()),
            "device does not support high bit depth encode",
        ));
    }
    if !caps.supports_preset(config.preset) {
        return Err(unsupported(
            "preset",
            format!("{:?} is not in the device preset list", config.preset),
        ));
    }
    if !caps.supports_input_format(config.input_format) {
        return Err(unsupported(
            "input format",
            format!("{:?} is not accepted by the {} encoder", config.input_format, codec.label()),
        ));
    }
    if !caps.supports_profile(config.profile) {
        return Err(unsupported(
            format!("profile {:?}", config.profile),
            "not in the device profile list",
        ));
    }
    if ctx.dynamic_rc_rules > 0 && !limits.dyn_bitrate_change {
        return Err(unsupported(
            "dynamic rate control",
            "device cannot change bitrate while encoding",
        ));
    }
    if ctx.dynamic_rc_mode_change && !limits.dyn_rc_mode_change {
        return Err(unsupported(
            "dynamic rate control",
            "device cannot change rate-control mode while encoding",
        ));
    }
    if ctx.force_cfr && ctx.trimmed {
        return Err(EngineError::Config(
            "avsync forcecfr + trim is not supported".into(),
        ));
    }

    // ─── Soft failures ──────────────────────────────────────────────────

    let mut warnings = Vec::new();
    let mut downgrade = |msg: String| {
        warn!(codec = codec.label(), "{msg}");
        warnings.push(msg);
    };

    if config.rc.lookahead > 0 && !limits.lookahead {
        downgrade("lookahead not supported on this device, disabled".into());
        config.rc.lookahead = 0;
    }
    if config.rc.temporal_aq && !limits.temporal_aq {
        downgrade("temporal AQ not supported on this device, disabled".into());
        config.rc.temporal_aq = false;
    }
    if config.b_frames > limits.max_bframes {
        downgrade(format!(
            "B frames {} exceed device maximum, clamped to {}",
            config.b_frames, limits.max_bframes
        ));
        config.b_frames = limits.max_bframes;
    }
    if codec == Codec::H264 && config.cabac && !limits.cabac {
        downgrade("CABAC not supported on this device, using CAVLC".into());
        config.cabac = false;
    }
    if config.bframe_ref_mode && (!limits.bframe_ref_mode || config.b_frames == 0) {
        downgrade("B frame reference mode not supported, disabled".into());
        config.bframe_ref_mode = false;
    }
    if config.qpel_mv && !limits.qpel_mv {
        downgrade("qpel motion vectors not supported, using halfpel".into());
        config.qpel_mv = false;
    }
    if config.rc.vbv_buffer_kbits > 0 && !limits.custom_vbv {
        downgrade("custom VBV size not supported, using device default".into());
        config.rc.vbv_buffer_kbits = 0;
    }
    if config.weighted_prediction {
        if !limits.weighted_prediction {
            downgrade("weighted prediction not supported, disabled".into());
            config.weighted_prediction = false;
        } else if config.b_frames > 0 {
            let mut msg = String::from("weighted prediction with B frames is not supported, disabled");
            if codec == Codec::Hevc {
                msg.push_str(" (HEVC weighted prediction can be unstable)");
            }
            downgrade(msg);
            config.weighted_prediction = false;
        }
    }

    // ─── Derived values ─────────────────────────────────────────────────

    if config.gop_length == 0 {
        config.gop_length = (config.fps.round().max(1) as u32).saturating_mul(10);
    }
    if config.rc.mode == RateControlMode::ConstQp {
        config.rc.max_bitrate_kbps = 0;
    } else if config.rc.max_bitrate_kbps == 0 {
        config.rc.max_bitrate_kbps = config.rc.avg_bitrate_kbps.saturating_mul(3) / 2;
    }

    debug!(
        codec = codec.label(),
        width = config.width,
        height = config.height,
        b_frames = config.b_frames,
        gop = config.gop_length,
        warnings = warnings.len(),
        "Encode parameters validated"
    );

    Ok(ValidatedConfig { config, warnings })
}
