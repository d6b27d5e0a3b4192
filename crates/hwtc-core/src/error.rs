//! Typed error hierarchy for the transcoder.
//!
//! Every variant maps to a stable integer code via [`EngineError::error_code`]
//! so the CLI can report failures as process exit codes and JSON envelopes
//! without string parsing.

/// All errors originating from the transcoding engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported feature: {feature} ({reason})")]
    UnsupportedFeature { feature: String, reason: String },

    #[error("Resolution {width}x{height} exceeds device limit {max_width}x{max_height}")]
    ResolutionOverLimit {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },

    #[error("Filter conflict: {0}")]
    FilterConflict(String),

    #[error("Invalid dynamic rate-control rule: {0}")]
    InvalidDynamicRc(String),

    // ── Resources ────────────────────────────────────────────────────
    #[error("Encoder session busy: {attempts} attempt(s) over {waited_ms} ms")]
    SessionBusy { attempts: u32, waited_ms: u64 },

    #[error("Encode buffer pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Out of device memory: {0}")]
    OutOfMemory(String),

    // ── Hardware ─────────────────────────────────────────────────────
    #[error("{call} failed with status {status}")]
    Hardware { call: &'static str, status: i32 },

    #[cfg(feature = "cuda")]
    #[error("CUDA driver error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),

    #[error("Timed out waiting for {what} after {elapsed_ms} ms")]
    EventTimeout { what: &'static str, elapsed_ms: u64 },

    // ── Stream ───────────────────────────────────────────────────────
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Decode error: {0}")]
    Decode(String),

    // ── Pipeline ─────────────────────────────────────────────────────
    #[error("Pipeline channel closed unexpectedly")]
    ChannelClosed,

    #[error("Transcode aborted")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bitstream writer error: {0}")]
    Writer(String),

    // ── Audit invariants ─────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: configuration
    /// - 2xx: resources
    /// - 3xx: hardware
    /// - 4xx: stream
    /// - 5xx: pipeline
    /// - 6xx: audit/invariant
    pub fn error_code(&self) -> i32 {
        match self {
            Self::Config(_) => 100,
            Self::UnsupportedFeature { .. } => 101,
            Self::ResolutionOverLimit { .. } => 102,
            Self::FilterConflict(_) => 103,
            Self::InvalidDynamicRc(_) => 104,
            Self::SessionBusy { .. } => 200,
            Self::PoolExhausted(_) => 201,
            Self::OutOfMemory(_) => 202,
            Self::Hardware { .. } => 300,
            #[cfg(feature = "cuda")]
            Self::Cuda(_) => 301,
            Self::EventTimeout { .. } => 302,
            Self::Stream(_) => 400,
            Self::Decode(_) => 401,
            Self::ChannelClosed => 500,
            Self::Aborted => 501,
            Self::Io(_) => 502,
            Self::Writer(_) => 503,
            Self::InvariantViolation(_) => 600,
        }
    }

    /// Whether this error is raised before any device resource is touched.
    ///
    /// Configuration-class failures are reported to the user verbatim and
    /// never leave a session or buffer behind.
    pub fn is_config_error(&self) -> bool {
        (100..200).contains(&self.error_code())
    }

    /// Whether a retry of the same call may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SessionBusy { .. } | Self::OutOfMemory(_))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;
