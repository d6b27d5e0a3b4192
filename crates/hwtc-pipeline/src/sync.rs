//! Timing reconciliation.
//!
//! Source timestamps are converted into the internal timebase (a quarter of
//! one source frame period), rebased so the first kept frame sits at 0, and
//! then either trusted (VFR), replaced by a synthetic CFR clock (assume
//! CFR) or used to steer duplication and dropping against that clock
//! (force CFR). Hardware-decoded frames are then expanded according to the
//! decoder deinterlace mode.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use hwtc_codec::config::internal_timebase;
use hwtc_core::codec_traits::{DecodePath, FramePositionIndex};
use hwtc_core::error::{EngineError, Result};
use hwtc_core::types::{Frame, FrameFlags, PictureStructure, Rational, TrimStatus, rescale};

use crate::filter_chain::DecoderDeinterlace;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Ignore source timing; timestamps follow the nominal frame rate.
    #[default]
    AssumeCfr,
    /// Keep source timestamps.
    Vfr,
    /// Nominal frame rate, duplicating or dropping to follow source timing.
    ForceCfr,
}

/// Drift limits, in units of one nominal frame duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncThresholds {
    /// Drift of `num/den` of a frame triggers a duplicate or a drop.
    pub dup_drop_num: i64,
    pub dup_drop_den: i64,
    /// Force-CFR drift treated as a discontinuity.
    pub force_cfr_gap_frames: i64,
    /// Repeat-field timing drift treated as a discontinuity.
    pub rff_gap_frames: i64,
}

impl Default for SyncThresholds {
    fn default() -> Self {
        Self {
            dup_drop_num: 7,
            dup_drop_den: 8,
            force_cfr_gap_frames: 18,
            rff_gap_frames: 32,
        }
    }
}

impl SyncThresholds {
    pub fn validate(&self) -> Result<()> {
        if self.dup_drop_den <= 0 || self.dup_drop_num <= 0 || self.dup_drop_num > self.dup_drop_den {
            return Err(EngineError::Config(format!(
                "duplicate/drop threshold {}/{} must be in (0, 1]",
                self.dup_drop_num, self.dup_drop_den
            )));
        }
        if self.force_cfr_gap_frames <= 1 || self.rff_gap_frames <= 1 {
            return Err(EngineError::Config(
                "gap thresholds must exceed one frame".into(),
            ));
        }
        Ok(())
    }
}

/// Inputs to [`Reconciler::new`].
#[derive(Clone)]
pub struct ReconcilerConfig {
    pub mode: SyncMode,
    pub thresholds: SyncThresholds,
    pub source_timebase: Rational,
    pub source_fps: Rational,
    pub decode: DecodePath,
    pub deinterlace: DecoderDeinterlace,
    /// Expand repeat-field flags into extra frames.
    pub repeat_field: bool,
    /// Some filter takes timing from repeat-field flags.
    pub rff_aware: bool,
    pub position_index: Option<Arc<dyn FramePositionIndex>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub dropped: u64,
    pub duplicated: u64,
    pub resyncs: u64,
    /// Ticks removed from the timeline across trimmed gaps.
    pub trim_shift: i64,
}

pub struct Reconciler {
    cfg: ReconcilerConfig,
    out_timebase: Rational,
    frame_duration: i64,
    first_pts: Option<i64>,
    estimate: i64,
    /// Timestamp of the first frame of the current trimmed gap.
    gap_start: Option<i64>,
    rff_expanding: bool,
    stats: SyncStats,
}

impl Reconciler {
    pub fn new(cfg: ReconcilerConfig) -> Result<Self> {
        cfg.thresholds.validate()?;
        if !cfg.source_timebase.is_positive() {
            return Err(EngineError::Config(format!(
                "source timebase {} is not positive",
                cfg.source_timebase
            )));
        }
        let out_timebase = internal_timebase(cfg.source_fps)?;
        let frame_duration = rescale(1, cfg.source_fps.inv()?, out_timebase).max(1);
        debug!(
            mode = ?cfg.mode,
            %out_timebase,
            frame_duration,
            "Timing reconciler ready"
        );
        Ok(Self {
            cfg,
            out_timebase,
            frame_duration,
            first_pts: None,
            estimate: 0,
            gap_start: None,
            rff_expanding: false,
            stats: SyncStats::default(),
        })
    }

    pub fn out_timebase(&self) -> Rational {
        self.out_timebase
    }

    /// Nominal duration of one frame in the internal timebase.
    pub fn frame_duration(&self) -> i64 {
        self.frame_duration
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Whether source timestamps drive the output timeline.
    fn source_timing(&self) -> bool {
        self.cfg.mode != SyncMode::AssumeCfr || self.cfg.repeat_field || self.cfg.rff_aware
    }

    fn field_timing(&self) -> bool {
        self.cfg.repeat_field || self.cfg.rff_aware
    }

    /// Account for one source frame's trim status. Returns whether the
    /// frame is kept.
    ///
    /// When a kept frame in a later window follows a trimmed gap, the
    /// baseline moves forward by the gap length so the output timeline has
    /// no hole. The first window needs no shift; rebasing to the first kept
    /// frame already covers it.
    pub fn apply_trim(&mut self, status: TrimStatus, source_pts: i64) -> bool {
        let pts = rescale(source_pts, self.cfg.source_timebase, self.out_timebase);
        if !status.inside {
            self.gap_start.get_or_insert(pts);
            return false;
        }
        if let Some(gap_start) = self.gap_start.take()
            && (self.cfg.mode == SyncMode::Vfr || self.field_timing())
            && status.window.is_some_and(|w| w > 0)
            && let Some(first) = self.first_pts.as_mut()
        {
            *first += pts - gap_start;
            self.stats.trim_shift += pts - gap_start;
            debug!(shift = pts - gap_start, "Timeline shifted across trimmed gap");
        }
        true
    }

    /// Turn one kept source frame into zero or more timed frames.
    pub fn reconcile(&mut self, frame: &Frame, out: &mut Vec<Frame>) -> Result<()> {
        let dur = self.frame_duration;
        let th = self.cfg.thresholds;
        let drop_below = (-dur * th.dup_drop_num / th.dup_drop_den).min(-1);
        let dup_above = (dur * th.dup_drop_num / th.dup_drop_den).max(1);

        let mut out_pts = self.estimate;
        let mut out_dur = dur;
        if self.source_timing() {
            out_pts = rescale(frame.timestamp, self.cfg.source_timebase, self.out_timebase);
        }
        let first = *self.first_pts.get_or_insert(out_pts);
        out_pts -= first;

        if self.cfg.mode == SyncMode::Vfr || self.field_timing() {
            if self.field_timing() {
                if (out_pts - self.estimate).abs() >= th.rff_gap_frames * dur {
                    self.resync(&mut out_pts);
                }
                if out_pts - self.estimate <= drop_below {
                    self.stats.dropped += 1;
                    return Ok(());
                }
            }
            if let Some(index) = &self.cfg.position_index
                && let Some(d) = index.duration_at(frame.timestamp)
                && d > 0
            {
                out_dur = rescale(d, self.cfg.source_timebase, self.out_timebase);
            }
        }

        if self.cfg.mode == SyncMode::ForceCfr {
            if (out_pts - self.estimate).abs() >= th.force_cfr_gap_frames * dur {
                warn!(
                    frame = frame.input_frame_id,
                    drift = out_pts - self.estimate,
                    "Big gap between frames, resynchronizing timestamps"
                );
                self.resync(&mut out_pts);
            }
            let mut drift = out_pts - self.estimate;
            if drift <= drop_below {
                self.stats.dropped += 1;
                return Ok(());
            }
            while drift >= dup_above {
                self.expand(frame, self.estimate, out_dur, out)?;
                self.stats.duplicated += 1;
                self.estimate += dur;
                drift = out_pts - self.estimate;
            }
            out_pts = self.estimate;
        }

        self.estimate += out_dur;
        self.expand(frame, out_pts, out_dur, out)
    }

    fn resync(&mut self, out_pts: &mut i64) {
        let delta = *out_pts - self.estimate;
        if let Some(first) = self.first_pts.as_mut() {
            *first += delta;
        }
        *out_pts = self.estimate;
        self.stats.resyncs += 1;
    }

    /// Emit the frames a decoded picture becomes at `pts`/`duration`.
    fn expand(&mut self, frame: &Frame, pts: i64, duration: i64, out: &mut Vec<Frame>) -> Result<()> {
        let mut f = frame.clone();
        f.timestamp = pts;
        f.duration = duration;
        if self.cfg.decode == DecodePath::Host {
            out.push(f);
            return Ok(());
        }
        match self.cfg.deinterlace {
            DecoderDeinterlace::Weave => {
                let rff = f.flags.contains(FrameFlags::RFF);
                if self.cfg.repeat_field {
                    if rff {
                        f.duration = f.duration * 2 / 3;
                    }
                    if self.rff_expanding {
                        f.timestamp -= f.duration / 2;
                    }
                }
                out.push(f.clone());
                if self.cfg.repeat_field && rff {
                    if self.rff_expanding {
                        f.flags.insert(FrameFlags::RFF_COPY);
                        f.timestamp += f.duration;
                        out.push(f);
                    }
                    self.rff_expanding = !self.rff_expanding;
                }
            }
            DecoderDeinterlace::Bob => {
                f.flags.remove(FrameFlags::RFF_ALL);
                f.picstruct = PictureStructure::Progressive;
                f.duration >>= 1;
                out.push(f.clone());
                f.timestamp += f.duration;
                out.push(f);
            }
            DecoderDeinterlace::Adaptive => {
                f.flags.remove(FrameFlags::RFF_ALL);
                f.picstruct = PictureStructure::Progressive;
                out.push(f);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("mode", &self.cfg.mode)
            .field("out_timebase", &self.out_timebase)
            .field("estimate", &self.estimate)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwtc_core::types::{MemoryLocation, PixelFormat, Surface, TrimList, TrimWindow};

    fn r(n: i64, d: i64) -> Rational {
        Rational::new(n, d).unwrap()
    }

    fn config(mode: SyncMode) -> ReconcilerConfig {
        ReconcilerConfig {
            mode,
            thresholds: SyncThresholds::default(),
            // Source ticks equal internal ticks: 4 per frame at 30000/1001.
            source_timebase: r(1001, 120_000),
            source_fps: r(30_000, 1001),
            decode: DecodePath::Host,
            deinterlace: DecoderDeinterlace::Weave,
            repeat_field: false,
            rff_aware: false,
            position_index: None,
        }
    }

    fn frame(ts: i64, id: u64) -> Frame {
        Frame {
            surface: Surface {
                id,
                location: MemoryLocation::Host,
                pitch: 2048,
            },
            width: 1920,
            height: 1080,
            format: PixelFormat::Nv12,
            picstruct: PictureStructure::TopFieldFirst,
            flags: FrameFlags::empty(),
            timestamp: ts,
            duration: 4,
            input_frame_id: id,
        }
    }

    fn run(rec: &mut Reconciler, frames: &[Frame]) -> Vec<Frame> {
        let mut out = Vec::new();
        for f in frames {
            rec.reconcile(f, &mut out).unwrap();
        }
        out
    }

    #[test]
    fn assume_cfr_ignores_source_timestamps() {
        let mut rec = Reconciler::new(config(SyncMode::AssumeCfr)).unwrap();
        assert_eq!(rec.out_timebase(), r(1001, 120_000));
        assert_eq!(rec.frame_duration(), 4);
        let frames: Vec<Frame> = [1000, 1003, 1020].iter().enumerate().map(|(i, &t)| frame(t, i as u64)).collect();
        let ts: Vec<i64> = run(&mut rec, &frames).iter().map(|f| f.timestamp).collect();
        assert_eq!(ts, vec![0, 4, 8]);
    }

    #[test]
    fn force_cfr_duplicates_half_of_slow_input() {
        let mut rec = Reconciler::new(config(SyncMode::ForceCfr)).unwrap();
        let n = 200u64;
        let frames: Vec<Frame> = (0..n).map(|i| frame(i as i64 * 6, i)).collect();
        let out = run(&mut rec, &frames);
        let dups = rec.stats().duplicated;
        assert_eq!(dups, n / 2 - 1);
        let ratio = dups as f64 / n as f64;
        assert!((ratio - 0.5).abs() < 0.02, "ratio {ratio}");
        let total: i64 = out.iter().map(|f| f.duration).sum();
        let span = n as i64 * 6;
        assert!((total - span).abs() <= 4, "total {total} span {span}");
        assert!(out.windows(2).all(|w| w[1].timestamp == w[0].timestamp + 4));
    }

    #[test]
    fn force_cfr_drops_fast_input() {
        let mut rec = Reconciler::new(config(SyncMode::ForceCfr)).unwrap();
        // Two frames per nominal period.
        let frames: Vec<Frame> = (0..40).map(|i| frame(i * 2, i as u64)).collect();
        let out = run(&mut rec, &frames);
        assert_eq!(rec.stats().dropped, 19);
        assert_eq!(out.len(), 21);
    }

    #[test]
    fn force_cfr_resyncs_on_large_gap() {
        let mut rec = Reconciler::new(config(SyncMode::ForceCfr)).unwrap();
        let frames = [frame(0, 0), frame(4, 1), frame(4 + 4 * 100, 2), frame(8 + 4 * 100, 3)];
        let out = run(&mut rec, &frames);
        assert_eq!(rec.stats().resyncs, 1);
        assert_eq!(rec.stats().duplicated, 0);
        let ts: Vec<i64> = out.iter().map(|f| f.timestamp).collect();
        assert_eq!(ts, vec![0, 4, 8, 12]);
    }

    #[test]
    fn vfr_passthrough_is_monotonic_and_zero_based() {
        let mut rec = Reconciler::new(config(SyncMode::Vfr)).unwrap();
        let pts = [500, 503, 509, 510, 530, 531, 560];
        let frames: Vec<Frame> = pts.iter().enumerate().map(|(i, &t)| frame(t, i as u64)).collect();
        let ts: Vec<i64> = run(&mut rec, &frames).iter().map(|f| f.timestamp).collect();
        assert_eq!(ts[0], 0);
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(ts, pts.iter().map(|p| p - 500).collect::<Vec<_>>());
    }

    #[test]
    fn vfr_trim_gap_is_removed() {
        let mut rec = Reconciler::new(config(SyncMode::Vfr)).unwrap();
        let trim = TrimList::new(
            vec![TrimWindow { start: 0, end: 3 }, TrimWindow { start: 6, end: 9 }],
            0,
        )
        .unwrap();
        let mut out = Vec::new();
        for i in 0..9u64 {
            let f = frame(i as i64 * 4, i);
            if rec.apply_trim(trim.status(i), f.timestamp) {
                rec.reconcile(&f, &mut out).unwrap();
            }
        }
        let ts: Vec<i64> = out.iter().map(|f| f.timestamp).collect();
        assert_eq!(ts, vec![0, 4, 8, 12, 16, 20]);
        assert_eq!(rec.stats().trim_shift, 12);
    }

    #[test]
    fn bob_emits_two_half_duration_fields() {
        let mut rec = Reconciler::new(ReconcilerConfig {
            decode: DecodePath::Hardware,
            deinterlace: DecoderDeinterlace::Bob,
            ..config(SyncMode::AssumeCfr)
        })
        .unwrap();
        let mut f = frame(0, 0);
        f.flags = FrameFlags::RFF | FrameFlags::RFF_TFF;
        let out = run(&mut rec, &[f, frame(4, 1)]);
        let timing: Vec<(i64, i64)> = out.iter().map(|f| (f.timestamp, f.duration)).collect();
        assert_eq!(timing, vec![(0, 2), (2, 2), (4, 2), (6, 2)]);
        assert!(out.iter().all(|f| f.flags.is_empty() && f.picstruct == PictureStructure::Progressive));
    }

    #[test]
    fn weave_expands_repeated_fields() {
        let mut rec = Reconciler::new(ReconcilerConfig {
            decode: DecodePath::Hardware,
            repeat_field: true,
            ..config(SyncMode::AssumeCfr)
        })
        .unwrap();
        let mut a = frame(0, 0);
        a.flags = FrameFlags::RFF;
        let b = frame(6, 1);
        let mut c = frame(12, 2);
        c.flags = FrameFlags::RFF;
        let out = run(&mut rec, &[a, b, c]);
        // RFF frames last 2/3 of their period. While expanding, pictures
        // move back half a duration and the next RFF frame emits a copy.
        let timing: Vec<(i64, i64, bool)> = out
            .iter()
            .map(|f| (f.timestamp, f.duration, f.flags.contains(FrameFlags::RFF_COPY)))
            .collect();
        assert_eq!(timing, vec![(0, 2, false), (4, 4, false), (11, 2, false), (13, 2, true)]);
    }

    #[test]
    fn thresholds_are_validated() {
        let bad = SyncThresholds {
            dup_drop_den: 0,
            ..SyncThresholds::default()
        };
        let err = Reconciler::new(ReconcilerConfig {
            thresholds: bad,
            ..config(SyncMode::ForceCfr)
        })
        .expect_err("zero denominator");
        assert!(err.to_string().contains("threshold"));
    }
}
