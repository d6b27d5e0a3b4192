//! Core value types: exact rationals, frame descriptors, trim windows,
//! chapters.
//!
//! All timing arithmetic in the workspace goes through [`Rational`] and
//! [`rescale`]. Nothing here uses floating point for timestamps.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

// ─── Rational arithmetic ─────────────────────────────────────────────────

/// Greatest common divisor of two signed values (always non-negative).
pub fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a as i64
}

/// Least common multiple, computed in `i128` so that two 32-bit-range
/// denominators never overflow.
pub fn lcm(a: i64, b: i64) -> i128 {
    if a == 0 || b == 0 {
        return 0;
    }
    let g = gcd(a, b) as i128;
    ((a as i128) / g * (b as i128)).abs()
}

/// Exact rational number with a strictly positive denominator, stored in
/// lowest terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRational", into = "RawRational")]
pub struct Rational {
    num: i64,
    den: i64,
}

#[derive(Serialize, Deserialize)]
struct RawRational {
    num: i64,
    den: i64,
}

impl TryFrom<RawRational> for Rational {
    type Error = EngineError;

    fn try_from(raw: RawRational) -> Result<Self> {
        Rational::new(raw.num, raw.den)
    }
}

impl From<Rational> for RawRational {
    fn from(r: Rational) -> Self {
        Self {
            num: r.num,
            den: r.den,
        }
    }
}

impl Rational {
    pub const ONE: Self = Self { num: 1, den: 1 };
    /// 30000/1001, the NTSC frame rate.
    pub const NTSC: Self = Self {
        num: 30_000,
        den: 1001,
    };

    /// Build a normalized rational. A zero denominator is a configuration error.
    pub fn new(num: i64, den: i64) -> Result<Self> {
        if den == 0 {
            return Err(EngineError::Config(format!(
                "rational {num}/{den} has a zero denominator"
            )));
        }
        let g = gcd(num, den).max(1);
        let sign = if den < 0 { -1 } else { 1 };
        Ok(Self {
            num: sign * num / g,
            den: sign * den / g,
        })
    }

    pub const fn num(&self) -> i64 {
        self.num
    }

    pub const fn den(&self) -> i64 {
        self.den
    }

    pub fn is_positive(&self) -> bool {
        self.num > 0
    }

    /// Reciprocal. Inverting zero is a configuration error.
    pub fn inv(&self) -> Result<Self> {
        Self::new(self.den, self.num)
    }

    /// Exact product, reduced through `i128` before narrowing.
    pub fn mul(&self, other: Rational) -> Result<Self> {
        let num = self.num as i128 * other.num as i128;
        let den = self.den as i128 * other.den as i128;
        let g = gcd_i128(num, den).max(1);
        let (num, den) = (num / g, den / g);
        let num = i64::try_from(num)
            .map_err(|_| EngineError::Config("rational product overflows i64".into()))?;
        let den = i64::try_from(den)
            .map_err(|_| EngineError::Config("rational product overflows i64".into()))?;
        Self::new(num, den)
    }

    /// Rounded integer value (half away from zero).
    pub fn round(&self) -> i64 {
        div_round(self.num as i128, self.den as i128) as i64
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for Rational {
    type Err = EngineError;

    /// Parses `"30000/1001"`, `"30000:1001"` or a bare integer `"25"`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let parse = |v: &str| {
            v.trim()
                .parse::<i64>()
                .map_err(|_| EngineError::Config(format!("invalid rational '{s}'")))
        };
        match s.split_once(['/', ':']) {
            Some((n, d)) => Self::new(parse(n)?, parse(d)?),
            None => Self::new(parse(s)?, 1),
        }
    }
}

fn gcd_i128(a: i128, b: i128) -> i128 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a as i128
}

fn div_round(n: i128, d: i128) -> i128 {
    let (n, d) = if d < 0 { (-n, -d) } else { (n, d) };
    if n >= 0 {
        (n + d / 2) / d
    } else {
        -((-n + d / 2) / d)
    }
}

/// Rescale `value` expressed in timebase `from` into timebase `to`, rounding
/// half away from zero.
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    let n = value as i128 * from.num as i128 * to.den as i128;
    let d = from.den as i128 * to.num as i128;
    if d == 0 {
        return 0;
    }
    let q = div_round(n, d);
    q.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

// ─── Pixel format ────────────────────────────────────────────────────────

/// Surface layouts that flow through the filter chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Nv12,
    Yv12,
    P010,
    Yv12High,
    Yuv444,
    Yuv444High,
}

impl PixelFormat {
    pub fn bit_depth(&self) -> u8 {
        match self {
            Self::Nv12 | Self::Yv12 | Self::Yuv444 => 8,
            Self::P010 | Self::Yv12High | Self::Yuv444High => 10,
        }
    }

    pub fn is_yuv444(&self) -> bool {
        matches!(self, Self::Yuv444 | Self::Yuv444High)
    }

    /// Planar format the encoder accepts for a bit depth / chroma choice.
    pub fn encoder_input(bit_depth: u8, yuv444: bool) -> Self {
        match (bit_depth > 8, yuv444) {
            (false, false) => Self::Nv12,
            (true, false) => Self::P010,
            (false, true) => Self::Yuv444,
            (true, true) => Self::Yuv444High,
        }
    }

    /// Bytes for one frame at `width`×`height` with tight pitch.
    pub fn frame_bytes(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        let bytes_per_sample = if self.bit_depth() > 8 { 2 } else { 1 };
        let samples = if self.is_yuv444() {
            pixels * 3
        } else {
            pixels * 3 / 2
        };
        samples * bytes_per_sample
    }
}

// ─── Picture structure ───────────────────────────────────────────────────

/// Progressive or interlaced field order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PictureStructure {
    #[default]
    Progressive,
    TopFieldFirst,
    BottomFieldFirst,
}

impl PictureStructure {
    pub fn is_interlaced(&self) -> bool {
        !matches!(self, Self::Progressive)
    }
}

bitflags! {
    /// Per-frame field-repeat markers.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u32 {
        /// Source signals repeat-first-field.
        const RFF = 1 << 0;
        /// Synthesized copy emitted while expanding a repeated field.
        const RFF_COPY = 1 << 1;
        const RFF_TFF = 1 << 2;
        const RFF_BFF = 1 << 3;
    }
}

impl FrameFlags {
    pub const RFF_ALL: Self = Self::RFF
        .union(Self::RFF_COPY)
        .union(Self::RFF_TFF)
        .union(Self::RFF_BFF);
}

// ─── Surfaces and ownership ──────────────────────────────────────────────

/// Where a surface's bytes live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLocation {
    Device,
    Host,
}

/// Opaque handle to a frame-sized buffer.
///
/// Pixel contents never cross this crate; the handle identifies the buffer
/// to the stage or session that owns the backing allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Surface {
    pub id: u64,
    pub location: MemoryLocation,
    pub pitch: u32,
}

/// Upstream ownership of a source surface (decoder mapping or host input
/// buffer). The surface is handed back to its producer when the last clone
/// of the owning [`OwnershipToken`] drops.
#[derive(Debug)]
pub struct SurfaceLease {
    surface: Surface,
    release: Option<Sender<Surface>>,
}

impl SurfaceLease {
    pub fn new(surface: Surface, release: Option<Sender<Surface>>) -> Self {
        Self { surface, release }
    }

    pub fn surface(&self) -> Surface {
        self.surface
    }
}

impl Drop for SurfaceLease {
    fn drop(&mut self) {
        if let Some(tx) = self.release.take() {
            // The producer may already be gone at teardown.
            let _ = tx.send(self.surface);
        }
    }
}

/// Shared handle on a [`SurfaceLease`]; every frame derived from one source
/// picture carries a clone.
pub type OwnershipToken = Arc<SurfaceLease>;

// ─── Frame descriptor ────────────────────────────────────────────────────

/// One picture flowing between stages.
///
/// `timestamp` and `duration` are in whatever timebase the current stage
/// works in: the source timebase before reconciliation and the internal
/// output timebase afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub surface: Surface,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub picstruct: PictureStructure,
    pub flags: FrameFlags,
    pub timestamp: i64,
    pub duration: i64,
    /// Index of the source picture this frame derives from.
    pub input_frame_id: u64,
}

impl Frame {
    pub fn location(&self) -> MemoryLocation {
        self.surface.location
    }
}

// ─── Trim ────────────────────────────────────────────────────────────────

/// Half-open source-index range `[start, end)` retained by trimming.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimWindow {
    pub start: u64,
    pub end: u64,
}

/// Result of matching one source index against a [`TrimList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrimStatus {
    pub inside: bool,
    /// Ordinal of the window holding the frame, `None` when trimmed away.
    pub window: Option<usize>,
}

/// Ordered, non-overlapping trim windows plus a source index offset.
///
/// `offset` is added to the source index before matching. It compensates
/// for pictures a reader skipped ahead of the first decodable frame.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimList {
    #[serde(default)]
    windows: Vec<TrimWindow>,
    #[serde(default)]
    offset: u64,
}

impl TrimList {
    pub fn new(windows: Vec<TrimWindow>, offset: u64) -> Result<Self> {
        let list = Self { windows, offset };
        list.validate()?;
        Ok(list)
    }

    pub fn validate(&self) -> Result<()> {
        let mut prev_end = 0u64;
        for (i, w) in self.windows.iter().enumerate() {
            if w.start >= w.end {
                return Err(EngineError::Config(format!(
                    "trim window #{i} [{}, {}) is empty",
                    w.start, w.end
                )));
            }
            if i > 0 && w.start < prev_end {
                return Err(EngineError::Config(format!(
                    "trim window #{i} [{}, {}) overlaps or precedes the previous window",
                    w.start, w.end
                )));
            }
            prev_end = w.end;
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        !self.windows.is_empty()
    }

    pub fn windows(&self) -> &[TrimWindow] {
        &self.windows
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Match a source index. With no windows every frame is inside window 0.
    pub fn status(&self, index: u64) -> TrimStatus {
        if self.windows.is_empty() {
            return TrimStatus {
                inside: true,
                window: Some(0),
            };
        }
        let index = index.saturating_add(self.offset);
        match self
            .windows
            .iter()
            .position(|w| (w.start..w.end).contains(&index))
        {
            Some(i) => TrimStatus {
                inside: true,
                window: Some(i),
            },
            None => TrimStatus {
                inside: false,
                window: None,
            },
        }
    }

    /// Number of frames kept from a source of `total` frames.
    pub fn kept_frames(&self, total: u64) -> u64 {
        if self.windows.is_empty() {
            return total;
        }
        let total = total.saturating_add(self.offset);
        self.windows
            .iter()
            .map(|w| w.end.min(total).saturating_sub(w.start.max(self.offset)))
            .sum()
    }
}

// ─── Chapters ────────────────────────────────────────────────────────────

/// Chapter start expressed in its own timebase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: i64,
    pub start: i64,
    pub timebase: Rational,
}
