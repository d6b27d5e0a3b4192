//! Encoder session seam and session opening.
//!
//! An [`EncoderSession`] owns the encoder engine for one job. Input slots are
//! created once, up front; afterwards the pipeline only maps, submits,
//! retrieves and unmaps them by index.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use hwtc_core::codec_traits::EncodedPacket;
use hwtc_core::context::CompletionEvent;
use hwtc_core::error::{EngineError, Result};
use hwtc_core::types::{MemoryLocation, PictureStructure, Surface};

use crate::config::{EncodeConfig, RateControl};

/// Opaque payload attached to one picture (HDR dynamic metadata).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeiPayload {
    pub payload_type: u8,
    pub data: Vec<u8>,
}

/// Per-picture submission parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PictureParams {
    /// Presentation timestamp in the encoder timebase.
    pub timestamp: i64,
    pub duration: i64,
    /// Submission order, starting at 0.
    pub frame_index: u64,
    pub input_frame_id: u64,
    pub picstruct: PictureStructure,
    pub force_idr: bool,
    pub sei: Vec<SeiPayload>,
}

/// Resources backing one encode slot.
#[derive(Clone, Debug)]
pub struct SlotResources {
    pub surface: Surface,
    /// Signaled by the session when the slot's output is ready to lock.
    pub output_event: CompletionEvent,
}

/// Result of a successful submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitStatus {
    /// At least one output became available.
    Accepted,
    /// The encoder is holding the picture for reordering. Not an error.
    NeedMoreInput,
}

/// Encoder engine for one job.
pub trait EncoderSession: Send {
    fn name(&self) -> &str;

    fn initialize(&mut self, config: &EncodeConfig) -> Result<()>;

    /// Create slot `index`. Host slots come back locked for writing.
    fn create_slot(&mut self, index: usize, location: MemoryLocation) -> Result<SlotResources>;

    /// Hand a filled slot to the encoder (device: map, host: unlock).
    fn map_input(&mut self, slot: usize) -> Result<()>;

    /// Take a retrieved slot back for writing (device: unmap, host: lock).
    fn unmap_input(&mut self, slot: usize) -> Result<()>;

    fn submit(&mut self, slot: usize, picture: &PictureParams) -> Result<SubmitStatus>;

    /// Read the encoded output of a completed slot.
    fn lock_bitstream(&mut self, slot: usize) -> Result<EncodedPacket>;

    fn unlock_bitstream(&mut self, slot: usize) -> Result<()>;

    /// Apply new rate-control parameters from the next picture on.
    fn reconfigure(&mut self, rc: &RateControl, reset: bool, force_idr: bool) -> Result<()>;

    /// Submit end of stream. `eos` is signaled once every pending picture
    /// has produced output.
    fn send_eos(&mut self, eos: &CompletionEvent) -> Result<()>;

    fn destroy(&mut self) -> Result<()>;
}

// ─── Opening ─────────────────────────────────────────────────────────────

/// Why opening a session failed.
#[derive(Debug)]
pub enum OpenError {
    /// Out of encoder memory, usually because another process holds
    /// sessions. Retried.
    OutOfMemory,
    Fatal(EngineError),
}

/// Creates encoder sessions.
pub trait SessionOpener: Send {
    fn open(&mut self, device_id: u32) -> std::result::Result<Box<dyn EncoderSession>, OpenError>;
}

/// Retry schedule for [`open_with_retry`].
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total time to keep retrying; zero disables retry.
    pub budget: Duration,
    pub interval: Duration,
    /// Minimum spacing of the "waiting" log line.
    pub log_every: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: Duration::ZERO,
            interval: Duration::from_millis(500),
            log_every: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_budget_secs(secs: u64) -> Self {
        Self {
            budget: Duration::from_secs(secs),
            ..Self::default()
        }
    }

    fn max_retries(&self) -> u64 {
        let interval = self.interval.as_millis().max(1);
        (self.budget.as_millis() / interval) as u64
    }

    fn log_stride(&self) -> u64 {
        let interval = self.interval.as_millis().max(1);
        ((self.log_every.as_millis() / interval) as u64).max(1)
    }
}

/// Open a session, retrying only on out-of-memory until the budget runs
/// out. `aborted` is polled between attempts.
pub fn open_with_retry(
    opener: &mut dyn SessionOpener,
    device_id: u32,
    policy: RetryPolicy,
    aborted: &dyn Fn() -> bool,
) -> Result<Box<dyn EncoderSession>> {
    let start = Instant::now();
    let max_retries = policy.max_retries();
    let stride = policy.log_stride();
    let mut retry = 0u64;
    loop {
        match opener.open(device_id) {
            Ok(session) => {
                if retry > 0 {
                    info!(device = device_id, retries = retry, "Encoder session opened after waiting");
                }
                return Ok(session);
            }
            Err(OpenError::Fatal(err)) => return Err(err),
            Err(OpenError::OutOfMemory) => {
                if retry >= max_retries {
                    warn!(device = device_id, attempts = retry + 1, "Encoder session unavailable");
                    return Err(EngineError::SessionBusy {
                        attempts: (retry + 1) as u32,
                        waited_ms: start.elapsed().as_millis() as u64,
                    });
                }
                if retry % stride == 0 {
                    info!(
                        device = device_id,
                        waited_ms = start.elapsed().as_millis() as u64,
                        "Waiting for other encode to finish"
                    );
                }
                if aborted() {
                    return Err(EngineError::Aborted);
                }
                std::thread::sleep(policy.interval);
                retry += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceOpener;

    fn fast(budget_ms: u64) -> RetryPolicy {
        RetryPolicy {
            budget: Duration::from_millis(budget_ms),
            interval: Duration::from_millis(5),
            log_every: Duration::from_millis(20),
        }
    }

    #[test]
    fn out_of_memory_is_retried_until_success() {
        let mut opener = ReferenceOpener::new().fail_out_of_memory(3);
        let session = open_with_retry(&mut opener, 0, fast(100), &|| false).unwrap();
        assert_eq!(session.name(), "reference");
        assert_eq!(opener.attempts(), 4);
    }

    #[test]
    fn retry_budget_exhaustion_reports_busy() {
        let mut opener = ReferenceOpener::new().fail_out_of_memory(u32::MAX);
        let err = open_with_retry(&mut opener, 0, fast(20), &|| false)
            .err()
            .expect("budget must run out");
        assert!(matches!(err, EngineError::SessionBusy { attempts: 5, .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn zero_budget_fails_on_first_out_of_memory() {
        let mut opener = ReferenceOpener::new().fail_out_of_memory(1);
        let err = open_with_retry(&mut opener, 0, RetryPolicy::default(), &|| false)
            .err()
            .expect("no retry budget");
        assert!(matches!(err, EngineError::SessionBusy { attempts: 1, .. }));
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let mut opener = ReferenceOpener::new().fail_fatal(EngineError::Hardware {
            call: "open_session",
            status: 10,
        });
        let err = open_with_retry(&mut opener, 0, fast(100), &|| false)
            .err()
            .expect("fatal error");
        assert!(err.to_string().contains("open_session"));
        assert_eq!(opener.attempts(), 1);
    }

    #[test]
    fn abort_stops_waiting() {
        let mut opener = ReferenceOpener::new().fail_out_of_memory(u32::MAX);
        let err = open_with_retry(&mut opener, 0, fast(10_000), &|| true)
            .err()
            .expect("aborted");
        assert!(matches!(err, EngineError::Aborted));
    }
}
