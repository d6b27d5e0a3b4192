//! Scripted frame source for dry runs and tests.
//!
//! Produces pictures with deterministic timestamps (constant rate, bounded
//! jitter or a scaled spacing), optional repeat-field flags, a position
//! index and chapters, on either decode path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use serde::{Deserialize, Serialize};

use hwtc_codec::config::internal_timebase;
use hwtc_core::codec_traits::{DecodePath, FramePositionIndex, FrameSource, SourceFrame, SourceInfo};
use hwtc_core::error::{EngineError, Result};
use hwtc_core::types::{
    Chapter, Frame, FrameFlags, MemoryLocation, PictureStructure, PixelFormat, Rational, Surface,
    SurfaceLease, rescale,
};

/// Number of distinct surfaces a synthetic decoder cycles through.
const SURFACE_RING: u64 = 8;

/// How frame timestamps advance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyntheticTiming {
    #[default]
    Cfr,
    /// Each timestamp moves by up to `amplitude` source ticks either way.
    Jitter { amplitude: i64 },
    /// Spacing is `num/den` times the nominal frame period.
    Scaled { num: i64, den: i64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticSpec {
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub picstruct: PictureStructure,
    pub fps: Rational,
    /// Defaults to a quarter of the frame period.
    pub timebase: Option<Rational>,
    pub decode: DecodePath,
    pub timing: SyntheticTiming,
    /// First timestamp, in source ticks.
    pub start_pts: i64,
    /// Flag every n-th frame repeat-first-field.
    pub rff_every: Option<u64>,
    /// Publish per-frame durations through a position index.
    pub position_index: bool,
    pub chapters: Vec<Chapter>,
    /// Fail with a decode error instead of producing this frame.
    pub fail_at: Option<u64>,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            frames: 300,
            width: 1920,
            height: 1080,
            format: PixelFormat::Nv12,
            picstruct: PictureStructure::Progressive,
            fps: Rational::NTSC,
            timebase: None,
            decode: DecodePath::Host,
            timing: SyntheticTiming::Cfr,
            start_pts: 0,
            rff_every: None,
            position_index: false,
            chapters: Vec::new(),
            fail_at: None,
        }
    }
}

/// Durations keyed by timestamp.
#[derive(Debug, Default)]
pub struct SyntheticIndex {
    durations: HashMap<i64, i64>,
}

impl FramePositionIndex for SyntheticIndex {
    fn duration_at(&self, pts: i64) -> Option<i64> {
        self.durations.get(&pts).copied()
    }
}

#[derive(Debug)]
pub struct SyntheticSource {
    spec: SyntheticSpec,
    info: SourceInfo,
    /// Nominal frame period in source ticks.
    tick: i64,
    next: u64,
    index: Option<Arc<SyntheticIndex>>,
    release: Option<Sender<Surface>>,
}

impl SyntheticSource {
    pub fn new(spec: SyntheticSpec) -> Result<Self> {
        if spec.width == 0 || spec.height == 0 {
            return Err(EngineError::Config(format!(
                "synthetic source {}x{} is empty",
                spec.width, spec.height
            )));
        }
        if !spec.fps.is_positive() {
            return Err(EngineError::Config(format!("synthetic fps {} is not positive", spec.fps)));
        }
        let timebase = match spec.timebase {
            Some(tb) if tb.is_positive() => tb,
            Some(tb) => {
                return Err(EngineError::Config(format!("synthetic timebase {tb} is not positive")));
            }
            None => internal_timebase(spec.fps)?,
        };
        let tick = rescale(1, spec.fps.inv()?, timebase);
        if tick < 1 {
            return Err(EngineError::Config(format!(
                "timebase {timebase} is coarser than one frame at {} fps",
                spec.fps
            )));
        }
        match spec.timing {
            SyntheticTiming::Jitter { amplitude } if amplitude < 0 || amplitude * 2 >= tick => {
                return Err(EngineError::Config(format!(
                    "jitter amplitude {amplitude} must stay below half a frame ({tick} ticks)"
                )));
            }
            SyntheticTiming::Scaled { num, den } if num <= 0 || den <= 0 => {
                return Err(EngineError::Config(format!("timing scale {num}/{den} is not positive")));
            }
            _ => {}
        }
        let info = SourceInfo {
            width: spec.width,
            height: spec.height,
            format: spec.format,
            picstruct: spec.picstruct,
            fps: spec.fps,
            timebase,
            decode: spec.decode,
            frame_count: Some(spec.frames),
        };
        let mut source = Self {
            spec,
            info,
            tick,
            next: 0,
            index: None,
            release: None,
        };
        if source.spec.position_index {
            let durations = (0..source.spec.frames)
                .map(|i| (source.pts(i), source.pts(i + 1) - source.pts(i)))
                .collect();
            source.index = Some(Arc::new(SyntheticIndex { durations }));
        }
        Ok(source)
    }

    /// Send every surface back on `tx` once its last user drops it.
    pub fn release_to(mut self, tx: Sender<Surface>) -> Self {
        self.release = Some(tx);
        self
    }

    /// Timestamp of frame `i` in source ticks.
    pub fn pts(&self, i: u64) -> i64 {
        let i = i as i64;
        let base = match self.spec.timing {
            SyntheticTiming::Cfr => i * self.tick,
            SyntheticTiming::Jitter { amplitude } => {
                let span = 2 * amplitude + 1;
                i * self.tick + (i * 7919).rem_euclid(span) - amplitude
            }
            SyntheticTiming::Scaled { num, den } => {
                let v = i128::from(i) * i128::from(self.tick) * i128::from(num) / i128::from(den);
                v as i64
            }
        };
        self.spec.start_pts + base
    }

    fn surface(&self, i: u64) -> Surface {
        let location = match self.spec.decode {
            DecodePath::Host => MemoryLocation::Host,
            DecodePath::Hardware => MemoryLocation::Device,
        };
        Surface {
            id: 0x20_0000 + i % SURFACE_RING,
            location,
            pitch: self.spec.width.next_multiple_of(256),
        }
    }
}

impl FrameSource for SyntheticSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        let i = self.next;
        if i >= self.spec.frames {
            return Ok(None);
        }
        if self.spec.fail_at == Some(i) {
            return Err(EngineError::Decode(format!("synthetic decode failure at frame {i}")));
        }
        self.next += 1;
        let mut flags = FrameFlags::empty();
        if let Some(n) = self.spec.rff_every
            && n > 0
            && i % n == n - 1
        {
            flags = FrameFlags::RFF
                | match self.spec.picstruct {
                    PictureStructure::BottomFieldFirst => FrameFlags::RFF_BFF,
                    _ => FrameFlags::RFF_TFF,
                };
        }
        let surface = self.surface(i);
        let frame = Frame {
            surface,
            width: self.spec.width,
            height: self.spec.height,
            format: self.spec.format,
            picstruct: self.spec.picstruct,
            flags,
            timestamp: self.pts(i),
            duration: self.pts(i + 1) - self.pts(i),
            input_frame_id: i,
        };
        Ok(Some(SourceFrame {
            frame,
            owner: Some(Arc::new(SurfaceLease::new(surface, self.release.clone()))),
        }))
    }

    fn position_index(&self) -> Option<Arc<dyn FramePositionIndex>> {
        self.index.clone().map(|i| i as Arc<dyn FramePositionIndex>)
    }

    fn chapters(&self) -> Vec<Chapter> {
        self.spec.chapters.clone()
    }
}
