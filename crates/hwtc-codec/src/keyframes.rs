//! Forced IDR planning and per-picture SEI payloads.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use hwtc_core::error::{EngineError, Result};
use hwtc_core::types::{Chapter, Rational, lcm};
use hwtc_device::caps::Codec;

use crate::session::SeiPayload;

/// SEI payload type for registered ITU-T T.35 user data (HDR10+).
pub const SEI_USER_DATA_REGISTERED: u8 = 4;

/// Decides which submissions must be coded as IDR.
#[derive(Clone, Debug)]
pub struct KeyframePlanner {
    out_tb: Rational,
    /// Chapters not yet reached; `None` once consumed.
    chapters: Vec<Option<Chapter>>,
    key_frames: BTreeSet<u64>,
}

impl KeyframePlanner {
    /// `out_tb` is the timebase of the timestamps passed to
    /// [`KeyframePlanner::force_idr`].
    pub fn new(out_tb: Rational) -> Self {
        Self {
            out_tb,
            chapters: Vec::new(),
            key_frames: BTreeSet::new(),
        }
    }

    /// Chapters with a negative id are ignored.
    pub fn with_chapters(mut self, chapters: &[Chapter]) -> Self {
        self.chapters = chapters
            .iter()
            .filter(|c| c.id >= 0)
            .copied()
            .map(Some)
            .collect();
        self
    }

    pub fn with_keyframes(mut self, key_frames: BTreeSet<u64>) -> Self {
        self.key_frames = key_frames;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty() && self.key_frames.is_empty()
    }

    /// Whether the picture at `timestamp` (submission `frame_index`) must be
    /// an IDR. Each chapter forces at most one IDR.
    pub fn force_idr(&mut self, timestamp: i64, frame_index: u64) -> bool {
        let mut idr = self.key_frames.contains(&frame_index);
        for entry in self.chapters.iter_mut() {
            let Some(chapter) = entry else { continue };
            if chapter_reached(chapter, timestamp, self.out_tb) {
                debug!(chapter = chapter.id, frame = frame_index, "Chapter start forces IDR");
                *entry = None;
                idr = true;
                break;
            }
        }
        idr
    }
}

/// Compare a chapter start and a frame timestamp on a common denominator
/// in 128-bit arithmetic.
fn chapter_reached(chapter: &Chapter, timestamp: i64, out_tb: Rational) -> bool {
    let chap_tb = chapter.timebase;
    let common = lcm(chap_tb.den(), out_tb.den());
    let ts_frame = i128::from(timestamp) * i128::from(out_tb.num()) * (common / i128::from(out_tb.den()));
    let ts_chap = i128::from(chapter.start) * i128::from(chap_tb.num()) * (common / i128::from(chap_tb.den()));
    ts_chap <= ts_frame
}

/// Parse a keyframe list: submission indices separated by whitespace or
/// commas, `#` starting a comment.
pub fn parse_keyframe_list(text: &str) -> Result<BTreeSet<u64>> {
    let mut out = BTreeSet::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default();
        for tok in line.split(|c: char| c.is_whitespace() || c == ',') {
            if tok.is_empty() {
                continue;
            }
            let idx = tok.parse::<u64>().map_err(|_| {
                EngineError::Config(format!(
                    "keyframe list line {}: '{tok}' is not a frame index",
                    lineno + 1
                ))
            })?;
            out.insert(idx);
        }
    }
    Ok(out)
}

pub fn read_keyframe_file(path: &Path) -> Result<BTreeSet<u64>> {
    let text = std::fs::read_to_string(path)?;
    parse_keyframe_list(&text)
}

/// Per-picture dynamic metadata keyed by source picture index.
#[derive(Clone, Debug, Default)]
pub struct SeiTable {
    payloads: HashMap<u64, Vec<u8>>,
}

#[derive(Deserialize)]
struct SeiFile {
    frames: HashMap<u64, Vec<u8>>,
}

impl SeiTable {
    pub fn new(payloads: HashMap<u64, Vec<u8>>) -> Self {
        Self { payloads }
    }

    /// `{"frames": {"<input frame id>": [bytes...]}}`
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: SeiFile = serde_json::from_str(json)
            .map_err(|e| EngineError::Config(format!("invalid SEI table: {e}")))?;
        Ok(Self::new(file.frames))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Payloads to attach to the picture derived from `input_frame_id`.
    /// Only HEVC streams carry them.
    pub fn payloads_for(&self, codec: Codec, input_frame_id: u64) -> Vec<SeiPayload> {
        if codec != Codec::Hevc {
            return Vec::new();
        }
        self.payloads
            .get(&input_frame_id)
            .map(|data| {
                vec![SeiPayload {
                    payload_type: SEI_USER_DATA_REGISTERED,
                    data: data.clone(),
                }]
            })
            .unwrap_or_default()
    }
}
