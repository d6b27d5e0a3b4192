//! Software encoder session.
//!
//! Behaves like a hardware session from the pipeline's point of view: slots
//! must be mapped before submission, output completes asynchronously with a
//! reorder delay of `b_frames` pictures, and end of stream flushes every
//! held picture. The bitstream is a minimal Annex B stand-in that carries
//! the picture index, not real coded video.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use hwtc_core::codec_traits::EncodedPacket;
use hwtc_core::context::CompletionEvent;
use hwtc_core::error::{EngineError, Result};
use hwtc_core::types::{MemoryLocation, Rational, Surface};
use hwtc_device::caps::Codec;

use crate::config::{EncodeConfig, RateControl};
use crate::session::{
    EncoderSession, OpenError, PictureParams, SessionOpener, SlotResources, SubmitStatus,
};

/// Encoder status code for calls made in the wrong state.
const STATUS_INVALID_CALL: i32 = 8;

/// What a reference session observed, shared with whoever opened it.
#[derive(Clone, Debug, Default)]
pub struct ReferenceStats {
    pub submitted: u64,
    pub completed: u64,
    /// Submission indices coded as IDR.
    pub idr_frames: Vec<u64>,
    /// `(first affected submission index, parameters)` per reconfiguration.
    pub reconfigurations: Vec<(u64, RateControl)>,
    /// Submission indices that carried SEI payloads.
    pub sei_frames: Vec<u64>,
    /// Presentation timestamps in submission order.
    pub timestamps: Vec<i64>,
    pub mapped: usize,
    pub peak_mapped: usize,
    pub eos_sent: bool,
    pub destroyed: bool,
}

pub type StatsHandle = Arc<Mutex<ReferenceStats>>;

fn with_stats<R>(stats: &StatsHandle, f: impl FnOnce(&mut ReferenceStats) -> R) -> R {
    let mut guard = stats.lock().unwrap_or_else(|poison| poison.into_inner());
    f(&mut guard)
}

#[derive(Debug)]
struct Slot {
    resources: SlotResources,
    mapped: bool,
    picture: Option<(PictureParams, bool)>,
    output: Option<EncodedPacket>,
    bitstream_locked: bool,
}

#[derive(Debug)]
pub struct ReferenceSession {
    config: Option<EncodeConfig>,
    timebase: Option<Rational>,
    slots: Vec<Slot>,
    reorder: VecDeque<usize>,
    next_surface_id: u64,
    since_idr: u64,
    idr_pending: bool,
    rc: Option<RateControl>,
    stall_eos: bool,
    stats: StatsHandle,
}

impl Default for ReferenceSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceSession {
    pub fn new() -> Self {
        Self::with_stats(StatsHandle::default(), false)
    }

    fn with_stats(stats: StatsHandle, stall_eos: bool) -> Self {
        Self {
            config: None,
            timebase: None,
            slots: Vec::new(),
            reorder: VecDeque::new(),
            next_surface_id: 0x1000,
            since_idr: 0,
            idr_pending: false,
            rc: None,
            stall_eos,
            stats,
        }
    }

    pub fn stats(&self) -> StatsHandle {
        Arc::clone(&self.stats)
    }

    fn invalid(call: &'static str) -> EngineError {
        EngineError::Hardware {
            call,
            status: STATUS_INVALID_CALL,
        }
    }

    fn slot_mut(&mut self, slot: usize, call: &'static str) -> Result<&mut Slot> {
        self.slots.get_mut(slot).ok_or_else(|| Self::invalid(call))
    }

    fn config(&self, call: &'static str) -> Result<&EncodeConfig> {
        self.config.as_ref().ok_or_else(|| Self::invalid(call))
    }

    /// Complete held pictures until at most `keep` remain.
    fn complete_ready(&mut self, keep: usize) -> Result<usize> {
        let codec = self.config("encode_picture")?.codec;
        let timebase = self.timebase.ok_or_else(|| Self::invalid("encode_picture"))?;
        let mut completed = 0;
        while self.reorder.len() > keep {
            let Some(index) = self.reorder.pop_front() else {
                break;
            };
            let slot = self.slot_mut(index, "encode_picture")?;
            let Some((pic, idr)) = slot.picture.take() else {
                return Err(Self::invalid("encode_picture"));
            };
            slot.output = Some(EncodedPacket {
                data: access_unit(codec, &pic, idr),
                pts: pic.timestamp,
                dts: pic.timestamp,
                duration: pic.duration,
                timebase,
                is_keyframe: idr,
                frame_index: pic.frame_index,
            });
            slot.resources.output_event.signal();
            completed += 1;
        }
        with_stats(&self.stats, |s| s.completed += completed as u64);
        Ok(completed)
    }
}

/// Start code, one NAL header, the picture index and any SEI bytes.
fn access_unit(codec: Codec, pic: &PictureParams, idr: bool) -> Vec<u8> {
    let mut out = vec![0, 0, 0, 1];
    match (codec, idr) {
        (Codec::H264, true) => out.push(0x65),
        (Codec::H264, false) => out.push(0x41),
        (Codec::Hevc, true) => out.extend_from_slice(&[0x26, 0x01]),
        (Codec::Hevc, false) => out.extend_from_slice(&[0x02, 0x01]),
    }
    out.extend_from_slice(&pic.frame_index.to_le_bytes());
    for sei in &pic.sei {
        out.push(sei.payload_type);
        out.extend_from_slice(&sei.data);
    }
    out
}

impl EncoderSession for ReferenceSession {
    fn name(&self) -> &str {
        "reference"
    }

    fn initialize(&mut self, config: &EncodeConfig) -> Result<()> {
        if self.config.is_some() {
            return Err(Self::invalid("initialize_encoder"));
        }
        self.timebase = Some(config.timebase);
        self.rc = Some(config.rc.clone());
        self.config = Some(config.clone());
        debug!(
            codec = config.codec.label(),
            width = config.width,
            height = config.height,
            b_frames = config.b_frames,
            "Reference encoder initialized"
        );
        Ok(())
    }

    fn create_slot(&mut self, index: usize, location: MemoryLocation) -> Result<SlotResources> {
        let pitch = self.config("create_input_buffer")?.width.next_multiple_of(256);
        if index != self.slots.len() {
            return Err(Self::invalid("create_input_buffer"));
        }
        let resources = SlotResources {
            surface: Surface {
                id: self.next_surface_id,
                location,
                pitch,
            },
            output_event: CompletionEvent::new(),
        };
        self.next_surface_id += 1;
        self.slots.push(Slot {
            resources: resources.clone(),
            mapped: false,
            picture: None,
            output: None,
            bitstream_locked: false,
        });
        Ok(resources)
    }

    fn map_input(&mut self, slot: usize) -> Result<()> {
        let s = self.slot_mut(slot, "map_input_resource")?;
        if s.mapped {
            return Err(Self::invalid("map_input_resource"));
        }
        s.mapped = true;
        with_stats(&self.stats, |st| {
            st.mapped += 1;
            st.peak_mapped = st.peak_mapped.max(st.mapped);
        });
        Ok(())
    }

    fn unmap_input(&mut self, slot: usize) -> Result<()> {
        let s = self.slot_mut(slot, "unmap_input_resource")?;
        if !s.mapped || s.bitstream_locked || s.picture.is_some() {
            return Err(Self::invalid("unmap_input_resource"));
        }
        s.mapped = false;
        with_stats(&self.stats, |st| st.mapped = st.mapped.saturating_sub(1));
        Ok(())
    }

    fn submit(&mut self, slot: usize, picture: &PictureParams) -> Result<SubmitStatus> {
        let (gop, b_frames) = {
            let cfg = self.config("encode_picture")?;
            (u64::from(cfg.gop_length.max(1)), cfg.b_frames as usize)
        };
        let idr = picture.frame_index == 0
            || picture.force_idr
            || self.idr_pending
            || self.since_idr >= gop;
        {
            let s = self.slot_mut(slot, "encode_picture")?;
            if !s.mapped || s.picture.is_some() || s.output.is_some() {
                return Err(Self::invalid("encode_picture"));
            }
            s.picture = Some((picture.clone(), idr));
            s.resources.output_event.record();
        }
        if idr {
            self.since_idr = 1;
            self.idr_pending = false;
        } else {
            self.since_idr += 1;
        }
        with_stats(&self.stats, |st| {
            st.submitted += 1;
            st.timestamps.push(picture.timestamp);
            if idr {
                st.idr_frames.push(picture.frame_index);
            }
            if !picture.sei.is_empty() {
                st.sei_frames.push(picture.frame_index);
            }
        });
        self.reorder.push_back(slot);
        trace!(slot, frame = picture.frame_index, idr, "Picture submitted");
        if self.complete_ready(b_frames)? > 0 {
            Ok(SubmitStatus::Accepted)
        } else {
            Ok(SubmitStatus::NeedMoreInput)
        }
    }

    fn lock_bitstream(&mut self, slot: usize) -> Result<EncodedPacket> {
        let s = self.slot_mut(slot, "lock_bitstream")?;
        if s.bitstream_locked {
            return Err(Self::invalid("lock_bitstream"));
        }
        let packet = s.output.clone().ok_or_else(|| Self::invalid("lock_bitstream"))?;
        s.bitstream_locked = true;
        Ok(packet)
    }

    fn unlock_bitstream(&mut self, slot: usize) -> Result<()> {
        let s = self.slot_mut(slot, "unlock_bitstream")?;
        if !s.bitstream_locked {
            return Err(Self::invalid("unlock_bitstream"));
        }
        s.bitstream_locked = false;
        s.output = None;
        Ok(())
    }

    fn reconfigure(&mut self, rc: &RateControl, reset: bool, force_idr: bool) -> Result<()> {
        self.config("reconfigure_encoder")?;
        self.rc = Some(rc.clone());
        if reset || force_idr {
            self.idr_pending = force_idr;
        }
        with_stats(&self.stats, |st| {
            let at = st.submitted;
            st.reconfigurations.push((at, rc.clone()));
        });
        Ok(())
    }

    fn send_eos(&mut self, eos: &CompletionEvent) -> Result<()> {
        self.complete_ready(0)?;
        eos.record();
        if !self.stall_eos {
            eos.signal();
        }
        with_stats(&self.stats, |st| st.eos_sent = true);
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        self.slots.clear();
        self.reorder.clear();
        self.config = None;
        with_stats(&self.stats, |st| st.destroyed = true);
        Ok(())
    }
}

// ─── Opener ──────────────────────────────────────────────────────────────

/// Opens [`ReferenceSession`]s, optionally failing first.
#[derive(Debug, Default)]
pub struct ReferenceOpener {
    oom_failures: u32,
    fatal: Option<EngineError>,
    stall_eos: bool,
    attempts: u32,
    stats: StatsHandle,
}

impl ReferenceOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report out-of-memory for the first `n` attempts.
    pub fn fail_out_of_memory(mut self, n: u32) -> Self {
        self.oom_failures = n;
        self
    }

    /// Fail the next attempt with `err`.
    pub fn fail_fatal(mut self, err: EngineError) -> Self {
        self.fatal = Some(err);
        self
    }

    /// Sessions never signal their end-of-stream event.
    pub fn stall_eos(mut self) -> Self {
        self.stall_eos = true;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Statistics of every session this opener creates.
    pub fn stats(&self) -> StatsHandle {
        Arc::clone(&self.stats)
    }
}

impl SessionOpener for ReferenceOpener {
    fn open(&mut self, device_id: u32) -> std::result::Result<Box<dyn EncoderSession>, OpenError> {
        self.attempts += 1;
        if let Some(err) = self.fatal.take() {
            return Err(OpenError::Fatal(err));
        }
        if self.oom_failures > 0 {
            self.oom_failures -= 1;
            return Err(OpenError::OutOfMemory);
        }
        debug!(device = device_id, "Reference encoder session opened");
        Ok(Box::new(ReferenceSession::with_stats(
            Arc::clone(&self.stats),
            self.stall_eos,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncodeSettings;
    use hwtc_core::types::PictureStructure;
    use std::time::Duration;

    fn session(b_frames: u32) -> ReferenceSession {
        let settings = EncodeSettings {
            b_frames,
            gop_length: 30,
            ..EncodeSettings::default()
        };
        let fps = Rational::new(30, 1).unwrap();
        let cfg = EncodeConfig::resolve(&settings, 640, 360, fps, Rational::new(1, 1).unwrap(), PictureStructure::Progressive).unwrap();
        let mut s = ReferenceSession::new();
        s.initialize(&cfg).unwrap();
        s
    }

    fn picture(i: u64) -> PictureParams {
        PictureParams {
            timestamp: i as i64 * 4,
            duration: 4,
            frame_index: i,
            input_frame_id: i,
            picstruct: PictureStructure::Progressive,
            force_idr: false,
            sei: Vec::new(),
        }
    }

    #[test]
    fn reorder_delay_holds_b_frames() {
        let mut s = session(2);
        let slots: Vec<_> = (0..3)
            .map(|i| s.create_slot(i, MemoryLocation::Device).unwrap())
            .collect();
        for (i, _) in slots.iter().enumerate() {
            s.map_input(i).unwrap();
        }
        assert_eq!(s.submit(0, &picture(0)).unwrap(), SubmitStatus::NeedMoreInput);
        assert_eq!(s.submit(1, &picture(1)).unwrap(), SubmitStatus::NeedMoreInput);
        assert!(!slots[0].output_event.query());
        assert_eq!(s.submit(2, &picture(2)).unwrap(), SubmitStatus::Accepted);
        slots[0].output_event.wait("output", Duration::from_millis(10)).unwrap();
        let pkt = s.lock_bitstream(0).unwrap();
        assert!(pkt.is_keyframe);
        assert_eq!(pkt.frame_index, 0);
        s.unlock_bitstream(0).unwrap();
        s.unmap_input(0).unwrap();

        let eos = CompletionEvent::new();
        s.send_eos(&eos).unwrap();
        assert!(eos.query());
        assert!(slots[2].output_event.query());
    }

    #[test]
    fn unmapped_submit_is_rejected() {
        let mut s = session(0);
        s.create_slot(0, MemoryLocation::Device).unwrap();
        let err = s.submit(0, &picture(0)).expect_err("slot not mapped");
        assert!(err.to_string().contains("encode_picture"));
    }

    #[test]
    fn unmap_before_retrieval_is_rejected() {
        let mut s = session(1);
        s.create_slot(0, MemoryLocation::Host).unwrap();
        s.map_input(0).unwrap();
        s.submit(0, &picture(0)).unwrap();
        assert!(s.unmap_input(0).is_err());
    }

    #[test]
    fn forced_idr_after_reconfigure() {
        let mut s = session(0);
        for i in 0..3 {
            s.create_slot(i, MemoryLocation::Device).unwrap();
        }
        let stats = s.stats();
        for i in 0..3u64 {
            if i == 2 {
                let rc = RateControl {
                    avg_bitrate_kbps: 1_000,
                    ..RateControl::default()
                };
                s.reconfigure(&rc, true, true).unwrap();
            }
            s.map_input(i as usize).unwrap();
            s.submit(i as usize, &picture(i)).unwrap();
        }
        let st = stats.lock().unwrap();
        assert_eq!(st.idr_frames, vec![0, 2]);
        assert_eq!(st.reconfigurations.len(), 1);
        assert_eq!(st.reconfigurations[0].0, 2);
        assert_eq!(st.peak_mapped, 3);
    }

    #[test]
    fn stalled_eos_never_signals() {
        let mut opener = ReferenceOpener::new().stall_eos();
        let mut s = opener.open(0).ok().expect("open");
        let settings = EncodeSettings::default();
        let fps = Rational::new(25, 1).unwrap();
        let cfg = EncodeConfig::resolve(&settings, 320, 240, fps, Rational::new(1, 1).unwrap(), PictureStructure::Progressive).unwrap();
        s.initialize(&cfg).unwrap();
        let eos = CompletionEvent::new();
        s.send_eos(&eos).unwrap();
        assert!(eos.wait("encoder EOS", Duration::from_millis(10)).is_err());
        assert!(opener.stats().lock().unwrap().eos_sent);
    }
}
