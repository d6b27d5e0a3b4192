//! Encoder capability tables.
//!
//! One [`GpuDeviceInfo`] per adapter, carrying a [`CodecCapabilities`] entry
//! for every codec the adapter's encoder engine exposes. The tables are
//! plain data: probers fill them, selection and validation read them.

use serde::{Deserialize, Serialize};

use hwtc_core::types::PixelFormat;

/// Output codecs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    H264,
    Hevc,
}

impl Codec {
    pub fn label(&self) -> &'static str {
        match self {
            Self::H264 => "H.264",
            Self::Hevc => "HEVC",
        }
    }
}

/// Encoder profiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    H264Baseline,
    H264Main,
    H264High,
    H264High444,
    HevcMain,
    HevcMain10,
    HevcFrext,
}

impl Profile {
    /// Profile actually required for a codec / chroma / depth combination.
    ///
    /// 4:4:4 forces the range-extension profile and HEVC above 8 bits forces
    /// Main10; otherwise the requested profile (or the codec default) holds.
    pub fn resolve(codec: Codec, bit_depth: u8, yuv444: bool, requested: Option<Profile>) -> Self {
        match codec {
            Codec::H264 if yuv444 => Self::H264High444,
            Codec::H264 => requested.unwrap_or(Self::H264High),
            Codec::Hevc if yuv444 => Self::HevcFrext,
            Codec::Hevc if bit_depth > 8 => Self::HevcMain10,
            Codec::Hevc => requested.unwrap_or(Self::HevcMain),
        }
    }

    pub fn codec(&self) -> Codec {
        match self {
            Self::H264Baseline | Self::H264Main | Self::H264High | Self::H264High444 => Codec::H264,
            Self::HevcMain | Self::HevcMain10 | Self::HevcFrext => Codec::Hevc,
        }
    }
}

/// Encoder presets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    #[default]
    Default,
    Performance,
    Quality,
}

/// Numeric limits and feature switches of one codec on one device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderLimits {
    pub width_max: u32,
    pub height_max: u32,
    /// Maximum macroblocks per frame (16×16 units).
    pub mb_num_max: u32,
    pub max_bframes: u32,
    /// Bitmask of supported rate-control modes.
    pub rc_modes_mask: u32,
    pub bframe_ref_mode: bool,
    pub field_encoding: bool,
    pub qpel_mv: bool,
    pub cabac: bool,
    pub lookahead: bool,
    pub temporal_aq: bool,
    pub custom_vbv: bool,
    pub lossless: bool,
    pub yuv444: bool,
    pub ten_bit: bool,
    pub weighted_prediction: bool,
    pub dyn_bitrate_change: bool,
    pub dyn_rc_mode_change: bool,
}

impl Default for EncoderLimits {
    fn default() -> Self {
        Self {
            width_max: 4096,
            height_max: 4096,
            mb_num_max: 65_536,
            max_bframes: 0,
            rc_modes_mask: 0x3f,
            bframe_ref_mode: false,
            field_encoding: false,
            qpel_mv: true,
            cabac: true,
            lookahead: false,
            temporal_aq: false,
            custom_vbv: true,
            lossless: false,
            yuv444: false,
            ten_bit: false,
            weighted_prediction: false,
            dyn_bitrate_change: true,
            dyn_rc_mode_change: false,
        }
    }
}

/// Capabilities of one codec on one device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecCapabilities {
    pub codec: Codec,
    pub profiles: Vec<Profile>,
    #[serde(default = "default_presets")]
    pub presets: Vec<Preset>,
    /// Surface formats the encoder accepts. Tables that omit the list get
    /// the 4:2:0 formats every encoder generation takes.
    #[serde(default = "default_input_formats")]
    pub input_formats: Vec<PixelFormat>,
    #[serde(default)]
    pub limits: EncoderLimits,
}

fn default_presets() -> Vec<Preset> {
    vec![Preset::Default, Preset::Performance, Preset::Quality]
}

fn default_input_formats() -> Vec<PixelFormat> {
    vec![PixelFormat::Nv12, PixelFormat::P010]
}

impl CodecCapabilities {
    pub fn supports_profile(&self, profile: Profile) -> bool {
        self.profiles.contains(&profile)
    }

    pub fn supports_preset(&self, preset: Preset) -> bool {
        self.presets.contains(&preset)
    }

    pub fn supports_input_format(&self, format: PixelFormat) -> bool {
        self.input_formats.contains(&format)
    }

    /// Fully featured table used by the software reference encoder.
    pub fn reference(codec: Codec) -> Self {
        let profiles = match codec {
            Codec::H264 => vec![
                Profile::H264Baseline,
                Profile::H264Main,
                Profile::H264High,
                Profile::H264High444,
            ],
            Codec::Hevc => vec![Profile::HevcMain, Profile::HevcMain10, Profile::HevcFrext],
        };
        Self {
            codec,
            profiles,
            presets: default_presets(),
            input_formats: vec![
                PixelFormat::Nv12,
                PixelFormat::P010,
                PixelFormat::Yuv444,
                PixelFormat::Yuv444High,
            ],
            limits: EncoderLimits {
                width_max: 8192,
                height_max: 8192,
                mb_num_max: 262_144,
                max_bframes: 4,
                bframe_ref_mode: true,
                field_encoding: codec == Codec::H264,
                lookahead: true,
                temporal_aq: true,
                lossless: true,
                yuv444: true,
                ten_bit: codec == Codec::Hevc,
                weighted_prediction: true,
                dyn_rc_mode_change: true,
                ..EncoderLimits::default()
            },
        }
    }
}

/// One enumerated GPU.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpuDeviceInfo {
    pub id: u32,
    pub name: String,
    /// `(major, minor)`.
    pub compute_capability: (u32, u32),
    pub cuda_cores: u32,
    #[serde(default)]
    pub codecs: Vec<CodecCapabilities>,
}

impl GpuDeviceInfo {
    pub fn codec(&self, codec: Codec) -> Option<&CodecCapabilities> {
        self.codecs.iter().find(|c| c.codec == codec)
    }

    /// Reference device carrying both codec tables.
    pub fn reference(id: u32) -> Self {
        Self {
            id,
            name: "hwtc reference encoder".into(),
            compute_capability: (8, 6),
            cuda_cores: cuda_cores_for(8, 6, 28),
            codecs: vec![
                CodecCapabilities::reference(Codec::H264),
                CodecCapabilities::reference(Codec::Hevc),
            ],
        }
    }
}

/// Oldest compute capability with a usable encoder engine.
pub const MIN_COMPUTE_CAPABILITY: (u32, u32) = (3, 0);

/// Shader cores per streaming multiprocessor for an architecture.
pub fn cores_per_sm(major: u32, minor: u32) -> u32 {
    match (major, minor) {
        (3, _) => 192,
        (5, _) => 128,
        (6, 0) => 64,
        (6, _) => 128,
        (7, _) => 64,
        (8, 0) => 64,
        (8, _) => 128,
        (9, _) => 128,
        _ => 128,
    }
}

pub fn cuda_cores_for(major: u32, minor: u32, multiprocessors: u32) -> u32 {
    cores_per_sm(major, minor) * multiprocessors
}
