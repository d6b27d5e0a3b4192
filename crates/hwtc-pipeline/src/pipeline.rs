//! Transcode orchestrator: read → trim → time → filter → encode → write.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ ready(depth) ┌──────────────────────────────────────────┐
//! │ Decode thread│─────────────►│ Controller (blocking)                    │
//! │ (hw sources) │              │ trim → reconcile → filter → slot → submit│
//! └──────────────┘              └───────────────┬──────────────────────────┘
//!                                               │ forced / final retrieval
//!                                               ▼
//!                                          BitstreamSink
//! ```
//!
//! One controlling thread drives everything. Hardware-decoded sources get
//! an auxiliary decode thread feeding a bounded ready queue; host sources
//! are read in place.
//!
//! # Backpressure
//!
//! Input transfers are tracked in a queue of `pipeline_depth` records and
//! the oldest is waited on before a new one starts. Encode slots come from
//! a fixed pool; acquiring from a full pool retrieves the oldest output
//! first, so memory stays bounded for any stream length.
//!
//! # Shutdown protocol
//!
//! 1. **Normal EOS**: the source runs dry → every buffering filter stage is
//!    drained → EOS is sent → every outstanding output is retrieved.
//! 2. **Cancellation**: the token is polled once per iteration; the loop
//!    stops submitting and falls through to the same teardown.
//! 3. **Error**: the first error ends the loop; teardown still runs.
//!
//! Teardown always joins the decode thread before the encoder session is
//! destroyed, waits at most `eos_timeout` for the encoder to finish, and
//! flushes the sink even when an earlier step failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use hwtc_codec::buffer_pool::EncodeBufferPool;
use hwtc_codec::session::{EncoderSession, PictureParams, RetryPolicy, SessionOpener, open_with_retry};
use hwtc_core::codec_traits::{BitstreamSink, FrameSource, SourceFrame};
use hwtc_core::context::{CompletionEvent, ContextLock, GpuStream, ImmediateStream};
use hwtc_core::error::{EngineError, Result};
use hwtc_core::types::{Frame, Rational};

use crate::decode_thread::{DecodeEvent, FrameFeed};
use crate::filter_chain::{FilterChain, StageTiming, SurfaceArena};
use crate::plan::TranscodePlan;
use crate::transfer::TransferQueue;

// ─── Metrics ─────────────────────────────────────────────────────────────

/// Atomic frame counters, readable while a run is in progress.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Source pictures pulled from the reader.
    pub frames_read: AtomicU64,
    /// Source pictures outside every trim window.
    pub frames_trimmed: AtomicU64,
    /// Pictures dropped by timing reconciliation.
    pub frames_dropped: AtomicU64,
    /// Extra copies inserted by timing reconciliation.
    pub frames_duplicated: AtomicU64,
    /// Frames that left the filter chain.
    pub frames_filtered: AtomicU64,
    pub frames_submitted: AtomicU64,
    /// Outputs handed to the sink.
    pub frames_encoded: AtomicU64,
    pub forced_retrievals: AtomicU64,
    pub reconfigurations: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ordering invariants. Should hold at shutdown.
    pub fn validate(&self) -> bool {
        let read = self.frames_read.load(Ordering::Acquire);
        let trimmed = self.frames_trimmed.load(Ordering::Acquire);
        let filtered = self.frames_filtered.load(Ordering::Acquire);
        let submitted = self.frames_submitted.load(Ordering::Acquire);
        let encoded = self.frames_encoded.load(Ordering::Acquire);
        read >= trimmed && filtered >= submitted && submitted >= encoded
    }

    pub fn report(&self) {
        info!(
            read = self.frames_read.load(Ordering::Relaxed),
            trimmed = self.frames_trimmed.load(Ordering::Relaxed),
            dropped = self.frames_dropped.load(Ordering::Relaxed),
            duplicated = self.frames_duplicated.load(Ordering::Relaxed),
            filtered = self.frames_filtered.load(Ordering::Relaxed),
            submitted = self.frames_submitted.load(Ordering::Relaxed),
            encoded = self.frames_encoded.load(Ordering::Relaxed),
            forced_retrievals = self.forced_retrievals.load(Ordering::Relaxed),
            reconfigurations = self.reconfigurations.load(Ordering::Relaxed),
            "Frame counts"
        );
    }
}

fn enforce_metrics_invariants(metrics: &PipelineMetrics, strict: bool) -> Result<()> {
    if !strict || metrics.validate() {
        return Ok(());
    }
    Err(EngineError::InvariantViolation(format!(
        "Pipeline ordering violation: read={} trimmed={} filtered={} submitted={} encoded={}",
        metrics.frames_read.load(Ordering::Acquire),
        metrics.frames_trimmed.load(Ordering::Acquire),
        metrics.frames_filtered.load(Ordering::Acquire),
        metrics.frames_submitted.load(Ordering::Acquire),
        metrics.frames_encoded.load(Ordering::Acquire),
    )))
}

// ─── Config / report ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Input transfers tracked at once; also the decoder ready-queue depth.
    pub pipeline_depth: usize,
    pub session_retry: Duration,
    /// Final wait for the encoder's end-of-stream event.
    pub eos_timeout: Duration,
    /// Per-transfer and per-slot completion wait.
    pub event_timeout: Duration,
    /// Wait on an empty decoder ready queue before retrying.
    pub ready_queue_wait: Duration,
    /// Accumulate per-stage filter timing.
    pub check_performance: bool,
    /// Promote metrics ordering violations into a hard error at shutdown.
    pub strict_invariants: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 4,
            session_retry: Duration::ZERO,
            eos_timeout: Duration::from_millis(500),
            event_timeout: Duration::from_secs(10),
            ready_queue_wait: Duration::from_millis(100),
            check_performance: false,
            strict_invariants: false,
        }
    }
}

/// Outcome of a completed run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunReport {
    pub frames_read: u64,
    pub frames_trimmed: u64,
    pub frames_dropped: u64,
    pub frames_duplicated: u64,
    pub frames_filtered: u64,
    pub frames_submitted: u64,
    pub frames_encoded: u64,
    pub forced_retrievals: u64,
    pub reconfigurations: u64,
    pub resyncs: u64,
    pub trim_shift: i64,
    pub pool_capacity: usize,
    pub peak_mapped: usize,
    pub timebase: Option<Rational>,
    pub stage_timing: Vec<StageTiming>,
}

// ─── Pipeline ────────────────────────────────────────────────────────────

pub struct TranscodePipeline {
    config: PipelineConfig,
    cancel: CancellationToken,
    metrics: Arc<PipelineMetrics>,
    stream: Arc<dyn GpuStream>,
}

impl TranscodePipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            metrics: PipelineMetrics::new(),
            stream: Arc::new(ImmediateStream),
        }
    }

    /// Record input transfer events on `stream` instead of completing them
    /// immediately.
    pub fn with_stream(mut self, stream: Arc<dyn GpuStream>) -> Self {
        self.stream = stream;
        self
    }

    /// Cancelling this token stops the run at the next iteration.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Run a planned job to completion, cancellation or the first error.
    ///
    /// When this returns the decode thread is joined, the encoder session
    /// is destroyed and the sink has been flushed.
    #[instrument(skip_all, name = "transcode_pipeline")]
    pub async fn run(
        &self,
        plan: TranscodePlan,
        source: Box<dyn FrameSource>,
        opener: Box<dyn SessionOpener>,
        sink: Box<dyn BitstreamSink>,
    ) -> Result<RunReport> {
        let cancel = self.cancel.clone();
        let metrics = self.metrics.clone();
        let config = self.config;
        let stream = self.stream.clone();

        let mut tasks = JoinSet::new();
        {
            let cancel = cancel.clone();
            tasks.spawn_blocking(move || -> Result<RunReport> {
                let controller = Controller::start(plan, source, opener, sink, config, metrics, cancel, stream)?;
                controller.run()
            });
        }

        let mut report = None;
        let mut first_error: Option<EngineError> = None;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(r)) => report = Some(r),
                Ok(Err(e)) => {
                    error!(%e, "Pipeline stage failed");
                    cancel.cancel();
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    error!(%join_err, "Pipeline task panicked");
                    cancel.cancel();
                    first_error.get_or_insert(EngineError::InvariantViolation(format!(
                        "Task panic: {join_err}"
                    )));
                }
            }
        }

        if first_error.is_none() {
            enforce_metrics_invariants(&self.metrics, self.config.strict_invariants)?;
        }
        self.metrics.report();

        match (first_error, report) {
            (Some(e), _) => Err(e),
            (None, Some(report)) => {
                info!(
                    submitted = report.frames_submitted,
                    encoded = report.frames_encoded,
                    forced_retrievals = report.forced_retrievals,
                    peak_mapped = report.peak_mapped,
                    "Pipeline finished"
                );
                Ok(report)
            }
            (None, None) => Err(EngineError::InvariantViolation(
                "pipeline finished without a report".into(),
            )),
        }
    }
}

// ─── Controller ──────────────────────────────────────────────────────────

/// Allocated state of one run, owned by the controlling thread.
struct Controller {
    plan: TranscodePlan,
    session: Box<dyn EncoderSession>,
    pool: EncodeBufferPool,
    chain: FilterChain,
    feed: Option<FrameFeed>,
    transfers: TransferQueue,
    stream: Arc<dyn GpuStream>,
    sink: Box<dyn BitstreamSink>,
    config: PipelineConfig,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
    /// Submission index of the next picture.
    frame_index: u64,
}

impl Controller {
    /// Open the session and allocate slots and filter surfaces. On failure
    /// everything already created is torn down and the sink flushed.
    #[allow(clippy::too_many_arguments)]
    fn start(
        plan: TranscodePlan,
        source: Box<dyn FrameSource>,
        mut opener: Box<dyn SessionOpener>,
        mut sink: Box<dyn BitstreamSink>,
        config: PipelineConfig,
        metrics: Arc<PipelineMetrics>,
        cancel: CancellationToken,
        stream: Arc<dyn GpuStream>,
    ) -> Result<Self> {
        let aborted = || cancel.is_cancelled();
        let mut session = match open_with_retry(
            opener.as_mut(),
            plan.selection.device.id,
            RetryPolicy {
                budget: config.session_retry,
                ..RetryPolicy::default()
            },
            &aborted,
        ) {
            Ok(s) => s,
            Err(e) => {
                flush_quietly(sink.as_mut());
                return Err(e);
            }
        };
        info!(session = session.name(), device = plan.selection.device.id, "Encoder session opened");

        let allocated = allocate(session.as_mut(), &plan, source, &config);
        let (pool, chain, feed) = match allocated {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(destroy_err) = session.destroy() {
                    warn!(%destroy_err, "Encoder session destroy failed");
                }
                flush_quietly(sink.as_mut());
                return Err(e);
            }
        };

        Ok(Self {
            plan,
            session,
            pool,
            chain,
            feed: Some(feed),
            transfers: TransferQueue::new(config.pipeline_depth, config.event_timeout),
            stream,
            sink,
            config,
            metrics,
            cancel,
            frame_index: 0,
        })
    }

    fn run(mut self) -> Result<RunReport> {
        let outcome = self.pump();
        self.finish(outcome)
    }

    /// Main loop. Returns once the source is exhausted and the filter chain
    /// drained, or on the first error.
    fn pump(&mut self) -> Result<()> {
        let mut source_index = 0u64;
        let mut timed: Vec<Frame> = Vec::with_capacity(4);
        loop {
            if self.cancel.is_cancelled() {
                info!(frames = self.frame_index, "Transcode cancelled");
                return Err(EngineError::Aborted);
            }
            self.transfers.reserve()?;
            let feed = self
                .feed
                .as_mut()
                .ok_or_else(|| EngineError::InvariantViolation("frame feed already finished".into()))?;
            let SourceFrame { frame, owner } = match feed.next(self.config.ready_queue_wait)? {
                DecodeEvent::Frame(f) => f,
                DecodeEvent::Empty => continue,
                DecodeEvent::Finished => break,
            };
            let index = source_index;
            source_index += 1;
            self.metrics.frames_read.fetch_add(1, Ordering::Relaxed);

            let status = self.plan.trim.status(index);
            if !self.plan.reconciler.apply_trim(status, frame.timestamp) {
                self.metrics.frames_trimmed.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            timed.clear();
            self.plan.reconciler.reconcile(&frame, &mut timed)?;
            self.sync_reconciler_stats();
            if timed.is_empty() {
                continue;
            }

            let (event_id, event) = self.transfers.begin();
            let filtered = self
                .filter_and_encode(&timed)
                .and_then(|()| self.stream.record(&event));
            if let Err(e) = filtered {
                self.transfers.cancel(event_id);
                return Err(e);
            }
            self.transfers.push(event_id, frame.input_frame_id, owner)?;
        }

        debug!(frames = source_index, "Source exhausted, draining filters");
        let ready = self.chain.process(None)?;
        self.encode_ready(ready)
    }

    fn filter_and_encode(&mut self, timed: &[Frame]) -> Result<()> {
        for f in timed {
            let ready = self.chain.process(Some(f))?;
            self.encode_ready(ready)?;
        }
        Ok(())
    }

    fn sync_reconciler_stats(&self) {
        let stats = self.plan.reconciler.stats();
        self.metrics.frames_dropped.store(stats.dropped, Ordering::Relaxed);
        self.metrics.frames_duplicated.store(stats.duplicated, Ordering::Relaxed);
    }

    /// Give every filtered frame an encode slot and submit it.
    fn encode_ready(&mut self, frames: Vec<Frame>) -> Result<()> {
        for frame in frames {
            self.metrics.frames_filtered.fetch_add(1, Ordering::Relaxed);
            let ticket = self.pool.acquire(self.session.as_mut(), self.sink.as_mut())?;
            self.sync_pool_stats();
            let written = match self.chain.write_target(&frame, ticket.surface) {
                Ok(f) => f,
                Err(e) => {
                    self.pool.release_unsubmitted(ticket);
                    return Err(e);
                }
            };

            let index = self.frame_index;
            if self.plan.dynamic_rc.on_frame(index, self.session.as_mut())? {
                self.metrics.reconfigurations.fetch_add(1, Ordering::Relaxed);
            }
            let force_idr = self.plan.keyframes.force_idr(written.timestamp, index);
            let sei = self
                .plan
                .sei
                .as_ref()
                .map(|t| t.payloads_for(self.plan.encode.codec, written.input_frame_id))
                .unwrap_or_default();
            let picture = PictureParams {
                timestamp: written.timestamp,
                duration: written.duration,
                frame_index: index,
                input_frame_id: written.input_frame_id,
                picstruct: written.picstruct,
                force_idr,
                sei,
            };
            self.pool.submit(self.session.as_mut(), ticket, &picture)?;
            self.frame_index += 1;
            self.metrics.frames_submitted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn sync_pool_stats(&self) {
        let stats = self.pool.stats();
        self.metrics.frames_encoded.store(stats.retrieved, Ordering::Relaxed);
        self.metrics.forced_retrievals.store(stats.forced_retrievals, Ordering::Relaxed);
    }

    /// Send EOS, retrieve every outstanding output and wait for the encoder
    /// to report completion.
    fn flush_encoder(&mut self) -> Result<()> {
        let eos = CompletionEvent::new();
        self.session.send_eos(&eos)?;
        let n = self.pool.drain(self.session.as_mut(), self.sink.as_mut())?;
        debug!(outputs = n, "Encoder drained");
        eos.wait("encoder EOS", self.config.eos_timeout)
    }

    /// Tear down in order: transfers, decode thread, encoder, sink.
    fn finish(mut self, outcome: Result<()>) -> Result<RunReport> {
        let mut first_error = outcome.err();

        if first_error.is_some() {
            let abandoned = self.transfers.abandon();
            let (events, in_use) = self.transfers.event_usage();
            debug!(abandoned, events, in_use, "Input transfers abandoned");
        } else if let Err(e) = self.transfers.drain() {
            first_error.get_or_insert(e);
        }

        if let Some(feed) = self.feed.take() {
            match feed.finish() {
                Ok(decoded) => debug!(decoded, "Frame feed finished"),
                Err(e) => {
                    warn!(%e, "Frame feed shutdown failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.flush_encoder() {
            warn!(%e, "Encoder flush failed");
            first_error.get_or_insert(e);
        }
        self.sync_pool_stats();
        self.sync_reconciler_stats();

        if let Err(e) = self.session.destroy() {
            warn!(%e, "Encoder session destroy failed");
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.sink.flush() {
            warn!(%e, "Sink flush failed");
            first_error.get_or_insert(e);
        }
        self.chain.log_timing();

        if let Some(e) = first_error {
            return Err(e);
        }

        let m = &self.metrics;
        let sync = self.plan.reconciler.stats();
        let pool = self.pool.stats();
        Ok(RunReport {
            frames_read: m.frames_read.load(Ordering::Acquire),
            frames_trimmed: m.frames_trimmed.load(Ordering::Acquire),
            frames_dropped: sync.dropped,
            frames_duplicated: sync.duplicated,
            frames_filtered: m.frames_filtered.load(Ordering::Acquire),
            frames_submitted: m.frames_submitted.load(Ordering::Acquire),
            frames_encoded: pool.retrieved,
            forced_retrievals: pool.forced_retrievals,
            reconfigurations: m.reconfigurations.load(Ordering::Acquire),
            resyncs: sync.resyncs,
            trim_shift: sync.trim_shift,
            pool_capacity: pool.capacity,
            peak_mapped: pool.peak_mapped,
            timebase: Some(self.plan.encode.timebase),
            stage_timing: self.chain.timings().to_vec(),
        })
    }
}

/// Initialize the session, then create encode slots, filter surfaces and
/// the frame feed.
fn allocate(
    session: &mut dyn EncoderSession,
    plan: &TranscodePlan,
    source: Box<dyn FrameSource>,
    config: &PipelineConfig,
) -> Result<(EncodeBufferPool, FilterChain, FrameFeed)> {
    session.initialize(&plan.encode)?;
    let pool = EncodeBufferPool::allocate(
        session,
        plan.pool_capacity,
        plan.chain.slot_location(),
        config.event_timeout,
    )?;
    let mut arena = SurfaceArena::new();
    let chain = plan.chain.instantiate(
        &mut arena,
        Arc::new(ContextLock::new()),
        config.pipeline_depth,
        config.check_performance,
    )?;
    debug!(surfaces = arena.allocated(), bytes = arena.bytes(), "Filter surfaces allocated");
    let feed = FrameFeed::start(source, config.pipeline_depth)?;
    Ok((pool, chain, feed))
}

fn flush_quietly(sink: &mut dyn BitstreamSink) {
    if let Err(e) = sink.flush() {
        warn!(%e, "Sink flush failed");
    }
}
