//! Fixed ring of encode slots.
//!
//! Capacity is decided once, before the session exists, and never grows.
//! A slot cycles `Free → Filling → Submitted → Free`. When every slot is
//! taken, [`EncodeBufferPool::acquire`] retrieves the oldest submitted
//! slot's output first; this forced retrieval is the pipeline's
//! backpressure.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, trace};

use hwtc_core::codec_traits::{BitstreamSink, EncodedPacket};
use hwtc_core::error::{EngineError, Result};
use hwtc_core::types::{MemoryLocation, Surface};

use crate::session::{EncoderSession, PictureParams, SlotResources};

/// Hard ceiling on encode slots.
pub const MAX_ENCODE_QUEUE: usize = 64;
/// Soft ceiling used when adding resolution headroom.
pub const ENCODE_QUEUE_HEADROOM_CAP: usize = 32;

/// Everything the capacity formula reads.
#[derive(Clone, Copy, Debug)]
pub struct PoolSizing {
    pub width: u32,
    pub height: u32,
    pub b_frames: u32,
    /// Lookahead depth, 0 when disabled.
    pub lookahead: u32,
    /// Frames the pipeline holds between filtering and submission.
    pub pipeline_depth: usize,
}

/// Slot count for a job. Fails above [`MAX_ENCODE_QUEUE`].
pub fn pool_capacity(sizing: &PoolSizing) -> Result<usize> {
    let pixels = u64::from(sizing.width) * u64::from(sizing.height);
    let extra = if pixels <= 2048 * 1080 {
        4
    } else if pixels <= 4096 * 2160 {
        2
    } else {
        0
    };
    let required = (sizing.b_frames as usize + 1) + 4 + sizing.lookahead as usize;
    let count = required + sizing.pipeline_depth;
    let count = count.max((count + extra).min(ENCODE_QUEUE_HEADROOM_CAP));
    if count > MAX_ENCODE_QUEUE {
        return Err(EngineError::PoolExhausted(format!(
            "{count} encode slots required, limit is {MAX_ENCODE_QUEUE}"
        )));
    }
    Ok(count)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Filling,
    Submitted,
}

#[derive(Debug)]
struct EncodeSlot {
    resources: SlotResources,
    state: SlotState,
}

/// Handle on a slot between [`EncodeBufferPool::acquire`] and
/// [`EncodeBufferPool::submit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotTicket {
    pub index: usize,
    /// Target the terminal filter stage writes into.
    pub surface: Surface,
}

/// Counters reported at the end of a job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub forced_retrievals: u64,
    pub retrieved: u64,
    pub peak_mapped: usize,
}

#[derive(Debug)]
pub struct EncodeBufferPool {
    slots: Vec<EncodeSlot>,
    free: VecDeque<usize>,
    submitted: VecDeque<usize>,
    output_timeout: Duration,
    mapped: usize,
    stats: PoolStats,
}

impl EncodeBufferPool {
    /// Create `capacity` slots on `session`.
    pub fn allocate(
        session: &mut dyn EncoderSession,
        capacity: usize,
        location: MemoryLocation,
        output_timeout: Duration,
    ) -> Result<Self> {
        if capacity == 0 || capacity > MAX_ENCODE_QUEUE {
            return Err(EngineError::PoolExhausted(format!(
                "invalid encode slot count {capacity}"
            )));
        }
        let mut slots = Vec::with_capacity(capacity);
        for index in 0..capacity {
            slots.push(EncodeSlot {
                resources: session.create_slot(index, location)?,
                state: SlotState::Free,
            });
        }
        debug!(capacity, ?location, "Encode buffer pool allocated");
        Ok(Self {
            slots,
            free: (0..capacity).collect(),
            submitted: VecDeque::with_capacity(capacity),
            output_timeout,
            mapped: 0,
            stats: PoolStats {
                capacity,
                ..PoolStats::default()
            },
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_flight(&self) -> usize {
        self.submitted.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Take a slot for writing, retrieving the oldest submitted output when
    /// no slot is free.
    pub fn acquire(
        &mut self,
        session: &mut dyn EncoderSession,
        sink: &mut dyn BitstreamSink,
    ) -> Result<SlotTicket> {
        if self.free.is_empty() {
            if self.submitted.is_empty() {
                return Err(EngineError::PoolExhausted(format!(
                    "all {} slots are being filled",
                    self.capacity()
                )));
            }
            self.retrieve_oldest(session, sink)?;
            self.stats.forced_retrievals += 1;
            trace!(forced = self.stats.forced_retrievals, "Forced encoder output retrieval");
        }
        let index = self
            .free
            .pop_front()
            .ok_or_else(|| EngineError::InvariantViolation("retrieval did not free a slot".into()))?;
        let slot = &mut self.slots[index];
        slot.state = SlotState::Filling;
        Ok(SlotTicket {
            index,
            surface: slot.resources.surface,
        })
    }

    /// Map a filled slot and submit it.
    pub fn submit(
        &mut self,
        session: &mut dyn EncoderSession,
        ticket: SlotTicket,
        picture: &PictureParams,
    ) -> Result<()> {
        let state = self.slots.get(ticket.index).map(|s| s.state);
        if state != Some(SlotState::Filling) {
            return Err(EngineError::InvariantViolation(format!(
                "submitting slot {} in state {state:?}",
                ticket.index
            )));
        }
        session.map_input(ticket.index)?;
        self.mapped += 1;
        self.stats.peak_mapped = self.stats.peak_mapped.max(self.mapped);
        session.submit(ticket.index, picture)?;
        self.slots[ticket.index].state = SlotState::Submitted;
        self.submitted.push_back(ticket.index);
        Ok(())
    }

    /// Give back a slot that was acquired but never submitted.
    pub fn release_unsubmitted(&mut self, ticket: SlotTicket) {
        if let Some(slot) = self.slots.get_mut(ticket.index)
            && slot.state == SlotState::Filling
        {
            slot.state = SlotState::Free;
            self.free.push_back(ticket.index);
        }
    }

    /// Retrieve every submitted output in submission order.
    pub fn drain(
        &mut self,
        session: &mut dyn EncoderSession,
        sink: &mut dyn BitstreamSink,
    ) -> Result<u64> {
        let mut n = 0;
        while !self.submitted.is_empty() {
            self.retrieve_oldest(session, sink)?;
            n += 1;
        }
        Ok(n)
    }

    fn retrieve_oldest(
        &mut self,
        session: &mut dyn EncoderSession,
        sink: &mut dyn BitstreamSink,
    ) -> Result<EncodedPacket> {
        let Some(&index) = self.submitted.front() else {
            return Err(EngineError::InvariantViolation("no submitted slot to retrieve".into()));
        };
        self.slots[index]
            .resources
            .output_event
            .wait("encoder output", self.output_timeout)?;
        let packet = session.lock_bitstream(index)?;
        let written = sink.write_packet(&packet);
        session.unlock_bitstream(index)?;
        written?;
        session.unmap_input(index)?;
        self.submitted.pop_front();
        self.mapped -= 1;
        self.slots[index].state = SlotState::Free;
        self.free.push_back(index);
        self.stats.retrieved += 1;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncodeConfig, EncodeSettings};
    use crate::reference::ReferenceSession;
    use hwtc_core::types::{PictureStructure, Rational};

    #[derive(Default)]
    struct Collect(Vec<EncodedPacket>);

    impl BitstreamSink for Collect {
        fn write_packet(&mut self, packet: &EncodedPacket) -> Result<()> {
            self.0.push(packet.clone());
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn session(b_frames: u32) -> ReferenceSession {
        let settings = EncodeSettings {
            b_frames,
            ..EncodeSettings::default()
        };
        let fps = Rational::new(24, 1).unwrap();
        let cfg = EncodeConfig::resolve(&settings, 1280, 720, fps, Rational::new(1, 1).unwrap(), PictureStructure::Progressive).unwrap();
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

    fn sizing(w: u32, h: u32, b: u32, la: u32) -> PoolSizing {
        PoolSizing {
            width: w,
            height: h,
            b_frames: b,
            lookahead: la,
            pipeline_depth: 4,
        }
    }

    #[test]
    fn capacity_formula_by_resolution() {
        // required = (3 + 1) + 4 = 8, + depth 4 = 12
        assert_eq!(pool_capacity(&sizing(1920, 1080, 3, 0)).unwrap(), 16);
        assert_eq!(pool_capacity(&sizing(3840, 2160, 3, 0)).unwrap(), 14);
        assert_eq!(pool_capacity(&sizing(7680, 4320, 3, 0)).unwrap(), 12);
        // headroom never pushes past 32 but never shrinks either
        assert_eq!(pool_capacity(&sizing(1920, 1080, 3, 20)).unwrap(), 32);
        assert_eq!(pool_capacity(&sizing(1920, 1080, 4, 32)).unwrap(), 45);
    }

    #[test]
    fn capacity_over_limit_fails() {
        let err = pool_capacity(&sizing(1920, 1080, 4, 60)).expect_err("over 64 slots");
        assert!(err.to_string().contains("limit is 64"));
    }

    #[test]
    fn forced_retrievals_bound_mapped_slots() {
        let mut s = session(0);
        let mut sink = Collect::default();
        let capacity = 4;
        let mut pool =
            EncodeBufferPool::allocate(&mut s, capacity, MemoryLocation::Device, Duration::from_millis(50))
                .unwrap();
        let n = 10u64;
        for i in 0..n {
            let ticket = pool.acquire(&mut s, &mut sink).unwrap();
            pool.submit(&mut s, ticket, &picture(i)).unwrap();
            assert!(pool.in_flight() <= capacity);
        }
        assert_eq!(pool.stats().forced_retrievals, n - capacity as u64);
        assert_eq!(pool.drain(&mut s, &mut sink).unwrap(), capacity as u64);
        let stats = pool.stats();
        assert!(stats.peak_mapped <= capacity);
        assert_eq!(stats.retrieved, n);
        let order: Vec<u64> = sink.0.iter().map(|p| p.frame_index).collect();
        assert_eq!(order, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn retrieval_waits_out_reorder_delay() {
        let mut s = session(2);
        let mut sink = Collect::default();
        let mut pool =
            EncodeBufferPool::allocate(&mut s, 4, MemoryLocation::Host, Duration::from_millis(50)).unwrap();
        for i in 0..6 {
            let ticket = pool.acquire(&mut s, &mut sink).unwrap();
            pool.submit(&mut s, ticket, &picture(i)).unwrap();
        }
        assert_eq!(pool.stats().forced_retrievals, 2);
        assert_eq!(sink.0.len(), 2);
    }

    #[test]
    fn stuck_output_times_out() {
        let mut s = session(3);
        let mut sink = Collect::default();
        let mut pool =
            EncodeBufferPool::allocate(&mut s, 2, MemoryLocation::Device, Duration::from_millis(10)).unwrap();
        for i in 0..2 {
            let ticket = pool.acquire(&mut s, &mut sink).unwrap();
            pool.submit(&mut s, ticket, &picture(i)).unwrap();
        }
        let err = pool.acquire(&mut s, &mut sink).expect_err("reorder holds both slots");
        assert_eq!(err.error_code(), 302);
    }

    #[test]
    fn all_slots_filling_is_exhaustion() {
        let mut s = session(0);
        let mut sink = Collect::default();
        let mut pool =
            EncodeBufferPool::allocate(&mut s, 2, MemoryLocation::Device, Duration::from_millis(10)).unwrap();
        let a = pool.acquire(&mut s, &mut sink).unwrap();
        let _b = pool.acquire(&mut s, &mut sink).unwrap();
        let err = pool.acquire(&mut s, &mut sink).expect_err("nothing to retrieve");
        assert!(matches!(err, EngineError::PoolExhausted(_)));
        pool.release_unsubmitted(a);
        assert!(pool.acquire(&mut s, &mut sink).is_ok());
    }
}
