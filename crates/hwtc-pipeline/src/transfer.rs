//! Bounded tracking of in-flight input transfers.
//!
//! Each source picture copied into the filter chain leaves a record holding
//! the transfer's completion event and the picture's ownership token. The
//! token moves into the queue and is dropped, releasing the decoder or
//! host buffer, once the transfer is known complete.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::trace;

use hwtc_core::context::{CompletionEvent, EventArena, EventId};
use hwtc_core::error::{EngineError, Result};
use hwtc_core::types::OwnershipToken;

#[derive(Debug)]
struct TransferRecord {
    event_id: EventId,
    event: CompletionEvent,
    input_frame_id: u64,
    _owner: Option<OwnershipToken>,
}

#[derive(Debug)]
pub struct TransferQueue {
    depth: usize,
    records: VecDeque<TransferRecord>,
    arena: EventArena,
    timeout: Duration,
    completed: u64,
}

impl TransferQueue {
    pub fn new(depth: usize, timeout: Duration) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            records: VecDeque::with_capacity(depth),
            arena: EventArena::with_capacity(depth + 1),
            timeout,
            completed: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// `(events allocated, events in use)` of the backing arena.
    pub fn event_usage(&self) -> (usize, usize) {
        self.arena.usage()
    }

    /// Event to record after the next transfer is enqueued.
    pub fn begin(&mut self) -> (EventId, CompletionEvent) {
        self.arena.acquire()
    }

    /// Track a transfer whose event came from [`TransferQueue::begin`].
    pub fn push(&mut self, event_id: EventId, input_frame_id: u64, owner: Option<OwnershipToken>) -> Result<()> {
        let event = self
            .arena
            .get(event_id)
            .cloned()
            .ok_or_else(|| EngineError::InvariantViolation(format!("unknown transfer event {event_id:?}")))?;
        self.records.push_back(TransferRecord {
            event_id,
            event,
            input_frame_id,
            _owner: owner,
        });
        Ok(())
    }

    /// Return an event from [`TransferQueue::begin`] that was never pushed.
    pub fn cancel(&mut self, event_id: EventId) {
        self.arena.release(event_id);
    }

    /// Retire the oldest transfer: wait for it when at least `depth`
    /// transfers are tracked, otherwise only poll. Returns whether a record
    /// was retired.
    pub fn reclaim(&mut self, depth: usize) -> Result<bool> {
        let Some(front) = self.records.front() else {
            return Ok(false);
        };
        let done = if self.records.len() >= depth {
            front.event.wait("input transfer", self.timeout)?;
            true
        } else {
            front.event.query()
        };
        if !done {
            return Ok(false);
        }
        if let Some(rec) = self.records.pop_front() {
            trace!(frame = rec.input_frame_id, "Input transfer retired");
            self.arena.release(rec.event_id);
            self.completed += 1;
        }
        Ok(true)
    }

    /// Make room for one more transfer at the configured depth.
    pub fn reserve(&mut self) -> Result<()> {
        self.reclaim(self.depth).map(|_| ())
    }

    /// Wait for every tracked transfer.
    pub fn drain(&mut self) -> Result<()> {
        while !self.records.is_empty() {
            self.reclaim(1)?;
        }
        Ok(())
    }

    /// Drop every record without waiting. Used when tearing down after an
    /// error; owners are released.
    pub fn abandon(&mut self) -> usize {
        let n = self.records.len();
        for rec in self.records.drain(..) {
            self.arena.release(rec.event_id);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwtc_core::context::{DeferredStream, GpuStream};
    use hwtc_core::types::{MemoryLocation, Surface, SurfaceLease};
    use std::sync::Arc;
    use std::sync::mpsc;

    fn lease(id: u64, tx: &mpsc::Sender<Surface>) -> OwnershipToken {
        Arc::new(SurfaceLease::new(
            Surface {
                id,
                location: MemoryLocation::Device,
                pitch: 256,
            },
            Some(tx.clone()),
        ))
    }

    #[test]
    fn below_depth_only_polls() {
        let stream = DeferredStream::new();
        let mut q = TransferQueue::new(3, Duration::from_millis(10));
        let (id, ev) = q.begin();
        stream.record(&ev).unwrap();
        q.push(id, 0, None).unwrap();
        assert!(!q.reclaim(3).unwrap());
        assert_eq!(q.len(), 1);
        stream.complete_all();
        assert!(q.reclaim(3).unwrap());
        assert!(q.is_empty());
    }

    #[test]
    fn at_depth_waits_and_times_out() {
        let stream = DeferredStream::new();
        let mut q = TransferQueue::new(1, Duration::from_millis(10));
        let (id, ev) = q.begin();
        stream.record(&ev).unwrap();
        q.push(id, 7, None).unwrap();
        let err = q.reserve().expect_err("pending transfer");
        assert_eq!(err.error_code(), 302);
        assert!(err.to_string().contains("input transfer"));
    }

    #[test]
    fn retiring_releases_owner_and_reuses_events() {
        let (tx, rx) = mpsc::channel();
        let stream = DeferredStream::new();
        let mut q = TransferQueue::new(2, Duration::from_millis(50));
        for i in 0..2 {
            let (id, ev) = q.begin();
            stream.record(&ev).unwrap();
            q.push(id, i, Some(lease(i, &tx))).unwrap();
        }
        assert!(rx.try_recv().is_err());
        stream.complete_all();
        q.drain().unwrap();
        let released: Vec<u64> = rx.try_iter().map(|s| s.id).collect();
        assert_eq!(released, vec![0, 1]);
        assert_eq!(q.completed(), 2);
        let (allocated, in_use) = q.event_usage();
        assert_eq!(in_use, 0);
        let _ = q.begin();
        assert_eq!(q.event_usage().0, allocated);
    }

    #[test]
    fn cancelled_event_returns_to_arena() {
        let mut q = TransferQueue::new(2, Duration::from_millis(10));
        let (id, _ev) = q.begin();
        assert_eq!(q.event_usage().1, 1);
        q.cancel(id);
        assert_eq!(q.event_usage().1, 0);
        assert!(q.is_empty());
        let (again, _) = q.begin();
        assert_eq!(again, id);
    }
}
