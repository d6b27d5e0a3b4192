//! Encode settings and the resolved per-job configuration.

use serde::{Deserialize, Serialize};

use hwtc_core::error::{EngineError, Result};
use hwtc_core::types::{PictureStructure, PixelFormat, Rational};
use hwtc_device::caps::{Codec, Preset, Profile};
use hwtc_device::select::EncodeRequirements;

/// Encoder ticks per output frame period.
pub const TIMEBASE_SUBDIVISION: i64 = 4;

/// Pipeline timebase for a source frame rate: a quarter of one source
/// frame period, so field durations stay integral.
pub fn internal_timebase(source_fps: Rational) -> Result<Rational> {
    Rational::new(
        source_fps.den(),
        source_fps.num().saturating_mul(TIMEBASE_SUBDIVISION),
    )
}

/// Rate-control modes, valued as their capability mask bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateControlMode {
    ConstQp,
    Vbr,
    Cbr,
    CbrHq,
    VbrHq,
}

impl RateControlMode {
    pub fn mask_bit(&self) -> u32 {
        match self {
            Self::ConstQp => 0x0,
            Self::Vbr => 0x1,
            Self::Cbr => 0x2,
            Self::CbrHq => 0x10,
            Self::VbrHq => 0x20,
        }
    }

    /// Whether a capability mask admits this mode.
    pub fn supported_by(&self, mask: u32) -> bool {
        self.mask_bit() & mask == self.mask_bit()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpTriplet {
    pub i: u8,
    pub p: u8,
    pub b: u8,
}

impl Default for QpTriplet {
    fn default() -> Self {
        Self { i: 20, p: 23, b: 25 }
    }
}

/// Rate-control parameters. Also the unit a dynamic rule overrides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateControl {
    pub mode: RateControlMode,
    pub qp: QpTriplet,
    pub avg_bitrate_kbps: u32,
    /// 0 selects a default derived from the average bitrate.
    pub max_bitrate_kbps: u32,
    pub target_quality: Option<u8>,
    pub vbv_buffer_kbits: u32,
    /// Lookahead depth in frames, 0 disables lookahead.
    pub lookahead: u32,
    pub temporal_aq: bool,
}

impl Default for RateControl {
    fn default() -> Self {
        Self {
            mode: RateControlMode::Vbr,
            qp: QpTriplet::default(),
            avg_bitrate_kbps: 5_000,
            max_bitrate_kbps: 0,
            target_quality: None,
            vbv_buffer_kbits: 0,
            lookahead: 0,
            temporal_aq: false,
        }
    }
}

/// User-facing encode settings, as they appear in a job file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeSettings {
    pub codec: Codec,
    pub profile: Option<Profile>,
    pub preset: Preset,
    pub bit_depth: u8,
    pub yuv444: bool,
    pub lossless: bool,
    pub b_frames: u32,
    /// 0 derives ten seconds' worth of frames from the frame rate.
    pub gop_length: u32,
    pub rc: RateControl,
    pub cabac: bool,
    pub bframe_ref_mode: bool,
    pub qpel_mv: bool,
    pub weighted_prediction: bool,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            profile: None,
            preset: Preset::Default,
            bit_depth: 8,
            yuv444: false,
            lossless: false,
            b_frames: 3,
            gop_length: 0,
            rc: RateControl::default(),
            cabac: true,
            bframe_ref_mode: false,
            qpel_mv: true,
            weighted_prediction: false,
        }
    }
}

impl EncodeSettings {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.bit_depth, 8 | 10) {
            return Err(EngineError::Config(format!(
                "bit_depth must be 8 or 10, got {}",
                self.bit_depth
            )));
        }
        if self.codec == Codec::H264 && self.bit_depth > 8 {
            return Err(EngineError::UnsupportedFeature {
                feature: "H.264 10bit".into(),
                reason: "H.264 encode is 8 bit only".into(),
            });
        }
        if let Some(p) = self.profile
            && p.codec() != self.codec
        {
            return Err(EngineError::Config(format!(
                "profile {p:?} does not belong to codec {}",
                self.codec.label()
            )));
        }
        if self.rc.mode != RateControlMode::ConstQp && self.rc.avg_bitrate_kbps == 0 {
            return Err(EngineError::Config(
                "avg_bitrate_kbps must be non-zero for bitrate-driven rate control".into(),
            ));
        }
        Ok(())
    }
}

/// Encode configuration resolved against a concrete source and filter
/// chain. Validation may downgrade fields in place.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodeConfig {
    pub codec: Codec,
    pub profile: Profile,
    pub preset: Preset,
    pub width: u32,
    pub height: u32,
    /// Frame rate of the encoded stream.
    pub fps: Rational,
    /// Timebase of submitted timestamps.
    pub timebase: Rational,
    pub picstruct: PictureStructure,
    pub input_format: PixelFormat,
    pub bit_depth: u8,
    pub yuv444: bool,
    pub lossless: bool,
    pub b_frames: u32,
    pub gop_length: u32,
    pub rc: RateControl,
    pub cabac: bool,
    pub bframe_ref_mode: bool,
    pub qpel_mv: bool,
    pub weighted_prediction: bool,
}

impl EncodeConfig {
    /// Combine settings with the frame geometry leaving the filter chain.
    /// `rate_scale` is how the chain changes the frame rate (2 for
    /// double-rate deinterlacing, 1/n for frame selection).
    pub fn resolve(
        settings: &EncodeSettings,
        width: u32,
        height: u32,
        source_fps: Rational,
        rate_scale: Rational,
        picstruct: PictureStructure,
    ) -> Result<Self> {
        settings.validate()?;
        if width == 0 || height == 0 {
            return Err(EngineError::Config(format!(
                "encode resolution {width}x{height} is empty"
            )));
        }
        if !source_fps.is_positive() || !rate_scale.is_positive() {
            return Err(EngineError::Config(format!(
                "frame rate {source_fps} x {rate_scale} is not positive"
            )));
        }
        let fps = source_fps.mul(rate_scale)?;
        Ok(Self {
            codec: settings.codec,
            profile: Profile::resolve(
                settings.codec,
                settings.bit_depth,
                settings.yuv444,
                settings.profile,
            ),
            preset: settings.preset,
            width,
            height,
            fps,
            timebase: internal_timebase(source_fps)?,
            picstruct,
            input_format: PixelFormat::encoder_input(settings.bit_depth, settings.yuv444),
            bit_depth: settings.bit_depth,
            yuv444: settings.yuv444,
            lossless: settings.lossless,
            b_frames: settings.b_frames,
            gop_length: settings.gop_length,
            rc: settings.rc.clone(),
            cabac: settings.cabac,
            bframe_ref_mode: settings.bframe_ref_mode,
            qpel_mv: settings.qpel_mv,
            weighted_prediction: settings.weighted_prediction,
        })
    }

    /// Interlaced content reaching the encoder is coded as fields.
    pub fn field_encoding(&self) -> bool {
        self.picstruct.is_interlaced()
    }

    /// What device selection needs to know about this configuration.
    pub fn requirements(&self) -> EncodeRequirements {
        EncodeRequirements {
            codec: self.codec,
            profile: self.profile,
            lossless: self.lossless,
            yuv444: self.yuv444,
            bit_depth: self.bit_depth,
            field_encoding: self.field_encoding(),
            b_frames: self.b_frames,
        }
    }
}
