//! Shared collaborator traits used across crate boundaries.
//!
//! The pipeline talks to the reader, the output writer and the utilization
//! monitor only through these seams, so tests can drive it with scripted
//! implementations.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Chapter, Frame, OwnershipToken, PictureStructure, PixelFormat, Rational};

// ─── Frame source (reader → pipeline) ────────────────────────────────────

/// How source pictures reach the filter chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePath {
    /// Reader returns host-resident raw pictures synchronously.
    #[default]
    Host,
    /// Hardware decoder runs on an auxiliary thread and publishes mapped
    /// device surfaces through a ready queue.
    Hardware,
}

/// Static description of the source stream.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub picstruct: PictureStructure,
    pub fps: Rational,
    /// Timebase of [`Frame::timestamp`] values produced by the source.
    pub timebase: Rational,
    pub decode: DecodePath,
    /// Total picture count when the container knows it.
    pub frame_count: Option<u64>,
}

/// A decoded picture plus the lease keeping its surface alive.
#[derive(Debug)]
pub struct SourceFrame {
    pub frame: Frame,
    pub owner: Option<OwnershipToken>,
}

/// Produces source pictures in display order.
///
/// Implementations: raw-frame readers, hardware decoders, scripted test
/// sources.
pub trait FrameSource: Send + 'static {
    fn info(&self) -> &SourceInfo;

    /// Next picture, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<SourceFrame>>;

    /// Per-packet durations when the demuxer kept them.
    fn position_index(&self) -> Option<Arc<dyn FramePositionIndex>> {
        None
    }

    fn chapters(&self) -> Vec<Chapter> {
        Vec::new()
    }
}

/// Lookup of original packet durations keyed by pts (source timebase).
pub trait FramePositionIndex: Send + Sync {
    fn duration_at(&self, pts: i64) -> Option<i64>;
}

// ─── Bitstream sink (encoder → writer) ───────────────────────────────────

/// One encoded access unit handed to the writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
    /// Presentation timestamp in [`EncodedPacket::timebase`] units.
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub timebase: Rational,
    pub is_keyframe: bool,
    /// Submission order index of the picture.
    pub frame_index: u64,
}

/// Receives encoded bitstream output.
///
/// Implementations: file writer, stdout writer, in-memory collector.
pub trait BitstreamSink: Send + 'static {
    fn write_packet(&mut self, packet: &EncodedPacket) -> Result<()>;

    /// Flush buffered output and finalize the stream.
    fn flush(&mut self) -> Result<()>;

    /// Whether this writer targets process stdout. At most one writer in a
    /// job may do so.
    fn uses_stdout(&self) -> bool {
        false
    }
}

// ─── Utilization telemetry ───────────────────────────────────────────────

/// Point-in-time load of one GPU, both as fractions in `[0, 1]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UtilizationSample {
    pub gpu_load: f64,
    pub video_engine_load: f64,
}

/// Source of live device utilization for device scoring.
#[async_trait]
pub trait GpuTelemetry: Send + Sync {
    /// Sample one device. `None` when the monitor has no data for it.
    async fn sample(&self, device_id: u32) -> Option<UtilizationSample>;
}
