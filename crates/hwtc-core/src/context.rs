//! GPU context lock, host-visible completion events and the reusable event
//! arena.
//!
//! # Context lock
//!
//! Every call that touches the shared GPU context runs while a
//! [`ContextGuard`] is alive. The guard is scoped: dropping it on any path,
//! error returns included, releases the lock.
//!
//! # Completion events
//!
//! A [`CompletionEvent`] is recorded when work is enqueued and signaled when
//! that work finishes. Consumers either poll it with
//! [`CompletionEvent::query`] or block with a bounded
//! [`CompletionEvent::wait`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::error::{EngineError, Result};

// ─── Context lock ────────────────────────────────────────────────────────

/// Mutual exclusion around the shared GPU context.
#[derive(Debug, Default)]
pub struct ContextLock {
    inner: Mutex<()>,
    acquisitions: AtomicU64,
    contended: AtomicU64,
}

impl ContextLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the context for the lifetime of the returned guard.
    pub fn enter(&self) -> Result<ContextGuard<'_>> {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        let guard = match self.inner.try_lock() {
            Ok(g) => g,
            Err(std::sync::TryLockError::WouldBlock) => {
                self.contended.fetch_add(1, Ordering::Relaxed);
                self.inner.lock().map_err(|_| poisoned())?
            }
            Err(std::sync::TryLockError::Poisoned(_)) => return Err(poisoned()),
        };
        Ok(ContextGuard {
            _guard: guard,
            entered: Instant::now(),
        })
    }

    /// `(total acquisitions, acquisitions that had to wait)`.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.acquisitions.load(Ordering::Relaxed),
            self.contended.load(Ordering::Relaxed),
        )
    }
}

fn poisoned() -> EngineError {
    EngineError::InvariantViolation("GPU context lock poisoned by a panicking holder".into())
}

/// Scoped ownership of the GPU context.
pub struct ContextGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    entered: Instant,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        let held = self.entered.elapsed();
        if held > Duration::from_millis(100) {
            warn!(held_ms = held.as_millis() as u64, "GPU context held for a long time");
        }
    }
}

// ─── Completion events ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EventState {
    /// Never recorded; nothing outstanding.
    Idle,
    Pending,
    Signaled,
}

#[derive(Debug)]
struct EventInner {
    state: Mutex<EventState>,
    cv: Condvar,
}

/// Host-visible fence for one unit of asynchronous work.
#[derive(Clone, Debug)]
pub struct CompletionEvent {
    inner: Arc<EventInner>,
}

impl Default for CompletionEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionEvent {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: Mutex::new(EventState::Idle),
                cv: Condvar::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EventState> {
        // A poisoned fence still carries a meaningful state value.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Mark work as outstanding.
    pub fn record(&self) {
        *self.state() = EventState::Pending;
    }

    /// Mark the recorded work complete and wake all waiters.
    pub fn signal(&self) {
        *self.state() = EventState::Signaled;
        self.inner.cv.notify_all();
    }

    /// Non-blocking completion check. An event never recorded is complete.
    pub fn query(&self) -> bool {
        *self.state() != EventState::Pending
    }

    /// Block until complete, failing with [`EngineError::EventTimeout`] after
    /// `timeout`.
    pub fn wait(&self, what: &'static str, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let guard = self.state();
        let (guard, res) = self
            .inner
            .cv
            .wait_timeout_while(guard, timeout, |s| *s == EventState::Pending)
            .unwrap_or_else(|poison| poison.into_inner());
        if res.timed_out() && *guard == EventState::Pending {
            return Err(EngineError::EventTimeout {
                what,
                elapsed_ms: start.elapsed().as_millis() as u64,
            });
        }
        Ok(())
    }

    fn reset(&self) {
        *self.state() = EventState::Idle;
    }
}

// ─── Event arena ─────────────────────────────────────────────────────────

/// Index of an event inside an [`EventArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventId(usize);

/// Reusable pool of completion events (avoids per-frame event creation).
///
/// Slots are addressed by [`EventId`]; released ids go back to a free list
/// and are handed out again before the arena grows.
#[derive(Debug, Default)]
pub struct EventArena {
    slots: Vec<CompletionEvent>,
    free: VecDeque<EventId>,
    in_use: usize,
}

impl EventArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arena pre-populated with `n` idle events.
    pub fn with_capacity(n: usize) -> Self {
        let mut arena = Self::default();
        for i in 0..n {
            arena.slots.push(CompletionEvent::new());
            arena.free.push_back(EventId(i));
        }
        arena
    }

    /// Get or create an idle event.
    pub fn acquire(&mut self) -> (EventId, CompletionEvent) {
        self.in_use += 1;
        if let Some(id) = self.free.pop_front() {
            let event = self.slots[id.0].clone();
            event.reset();
            return (id, event);
        }
        let id = EventId(self.slots.len());
        let event = CompletionEvent::new();
        self.slots.push(event.clone());
        trace!(slots = self.slots.len(), "Event arena grew");
        (id, event)
    }

    pub fn get(&self, id: EventId) -> Option<&CompletionEvent> {
        self.slots.get(id.0)
    }

    /// Return an event for reuse.
    pub fn release(&mut self, id: EventId) {
        if id.0 >= self.slots.len() || self.free.contains(&id) {
            warn!(id = id.0, "Ignoring release of unknown or already free event");
            return;
        }
        self.in_use -= 1;
        self.free.push_back(id);
    }

    /// `(allocated slots, slots currently handed out)`.
    pub fn usage(&self) -> (usize, usize) {
        (self.slots.len(), self.in_use)
    }
}

// ─── Streams ─────────────────────────────────────────────────────────────

/// Ordered queue of GPU work that can record completion events.
pub trait GpuStream: Send + Sync {
    /// Record `event` after all work enqueued so far.
    fn record(&self, event: &CompletionEvent) -> Result<()>;
}

/// Stream whose work is already complete when recorded (host-synchronous
/// stages).
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateStream;

impl GpuStream for ImmediateStream {
    fn record(&self, event: &CompletionEvent) -> Result<()> {
        event.record();
        event.signal();
        Ok(())
    }
}

/// Stream that leaves events pending until [`DeferredStream::complete_all`]
/// runs; models copies still in flight on the device.
#[derive(Debug, Default)]
pub struct DeferredStream {
    pending: Mutex<Vec<CompletionEvent>>,
}

impl DeferredStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal every event recorded so far, returning how many completed.
    pub fn complete_all(&self) -> usize {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let n = pending.len();
        for ev in pending.drain(..) {
            ev.signal();
        }
        n
    }

    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .map(|p| p.len())
            .unwrap_or_default()
    }
}

impl GpuStream for DeferredStream {
    fn record(&self, event: &CompletionEvent) -> Result<()> {
        event.record();
        self.pending
            .lock()
            .map_err(|_| EngineError::InvariantViolation("deferred stream poisoned".into()))?
            .push(event.clone());
        Ok(())
    }
}
