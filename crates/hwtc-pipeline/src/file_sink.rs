//! Bitstream writers: file, stdout, in-memory and fan-out.
//!
//! Packets are written as raw Annex B access units in submission order.

use std::fs::File;
use std::io::{BufWriter, Stdout, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use hwtc_core::codec_traits::{BitstreamSink, EncodedPacket};
use hwtc_core::error::{EngineError, Result};

const WRITE_BUFFER: usize = 4 * 1024 * 1024;

/// Where a job's bitstream goes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputTarget {
    File { path: PathBuf },
    Stdout,
    /// Discard output (benchmarks, dry runs).
    Null,
}

pub fn open_sink(target: &OutputTarget) -> Result<Box<dyn BitstreamSink>> {
    Ok(match target {
        OutputTarget::File { path } => Box::new(FileSink::new(path.clone())?),
        OutputTarget::Stdout => Box::new(StdoutSink::new()),
        OutputTarget::Null => Box::new(NullSink::default()),
    })
}

/// Open every target behind one sink. At most one may be stdout.
pub fn open_outputs(targets: &[OutputTarget]) -> Result<Box<dyn BitstreamSink>> {
    check_targets(targets)?;
    let mut sinks = targets.iter().map(open_sink).collect::<Result<Vec<_>>>()?;
    match sinks.len() {
        0 => Err(EngineError::Config("no output configured".into())),
        1 => sinks
            .pop()
            .ok_or_else(|| EngineError::InvariantViolation("output list emptied".into())),
        _ => Ok(Box::new(TeeSink::new(sinks)?)),
    }
}

/// Reject target lists that bind stdout more than once, before opening any.
pub fn check_targets(targets: &[OutputTarget]) -> Result<()> {
    let n = targets.iter().filter(|t| **t == OutputTarget::Stdout).count();
    stdout_conflict(n)
}

fn stdout_conflict(n: usize) -> Result<()> {
    if n > 1 {
        return Err(EngineError::Config(format!(
            "{n} outputs are bound to stdout, at most one may be"
        )));
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    bytes: u64,
    packets: u64,
}

impl Progress {
    fn add(&mut self, packet: &EncodedPacket) {
        self.bytes += packet.data.len() as u64;
        self.packets += 1;
        if self.packets.is_multiple_of(100) {
            tracing::debug!(
                packets = self.packets,
                bytes_mb = self.bytes / (1024 * 1024),
                "Sink progress"
            );
        }
    }
}

// ─── File ────────────────────────────────────────────────────────────────

pub struct FileSink {
    writer: BufWriter<File>,
    progress: Progress,
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Result<Self> {
        let file = File::create(&path).map_err(|e| {
            EngineError::Writer(format!(
                "failed to create output file {}: {e}",
                path.display()
            ))
        })?;
        tracing::info!(path = %path.display(), "Output bitstream sink opened");
        Ok(Self {
            writer: BufWriter::with_capacity(WRITE_BUFFER, file),
            progress: Progress::default(),
            path,
        })
    }
}

impl BitstreamSink for FileSink {
    fn write_packet(&mut self, packet: &EncodedPacket) -> Result<()> {
        self.writer.write_all(&packet.data).map_err(|e| {
            EngineError::Writer(format!("failed to write to {}: {e}", self.path.display()))
        })?;
        self.progress.add(packet);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| {
            EngineError::Writer(format!("failed to flush {}: {e}", self.path.display()))
        })?;
        tracing::info!(
            path = %self.path.display(),
            packets = self.progress.packets,
            bytes = self.progress.bytes,
            "Output file closed"
        );
        Ok(())
    }
}

// ─── Stdout ──────────────────────────────────────────────────────────────

pub struct StdoutSink {
    writer: BufWriter<Stdout>,
    progress: Progress,
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            writer: BufWriter::with_capacity(WRITE_BUFFER, std::io::stdout()),
            progress: Progress::default(),
        }
    }
}

impl BitstreamSink for StdoutSink {
    fn write_packet(&mut self, packet: &EncodedPacket) -> Result<()> {
        self.writer
            .write_all(&packet.data)
            .map_err(|e| EngineError::Writer(format!("failed to write to stdout: {e}")))?;
        self.progress.add(packet);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| EngineError::Writer(format!("failed to flush stdout: {e}")))
    }

    fn uses_stdout(&self) -> bool {
        true
    }
}

// ─── Null / memory ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct NullSink {
    packets: u64,
}

impl BitstreamSink for NullSink {
    fn write_packet(&mut self, _packet: &EncodedPacket) -> Result<()> {
        self.packets += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        tracing::debug!(packets = self.packets, "Null sink flushed");
        Ok(())
    }
}

/// Shared view of what a [`MemorySink`] received.
#[derive(Debug, Default)]
pub struct Collected {
    pub packets: Vec<EncodedPacket>,
    pub flushes: u32,
}

/// Keeps every packet in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    collected: Arc<Mutex<Collected>>,
    fail_after: Option<u64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write after `n` packets.
    pub fn fail_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn collected(&self) -> Arc<Mutex<Collected>> {
        Arc::clone(&self.collected)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Collected> {
        self.collected
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl BitstreamSink for MemorySink {
    fn write_packet(&mut self, packet: &EncodedPacket) -> Result<()> {
        let fail_after = self.fail_after;
        let mut c = self.lock();
        if fail_after.is_some_and(|n| c.packets.len() as u64 >= n) {
            return Err(EngineError::Writer("memory sink closed".into()));
        }
        c.packets.push(packet.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.lock().flushes += 1;
        Ok(())
    }
}

// ─── Fan-out ─────────────────────────────────────────────────────────────

/// Writes every packet to several sinks.
pub struct TeeSink {
    sinks: Vec<Box<dyn BitstreamSink>>,
}

impl TeeSink {
    pub fn new(sinks: Vec<Box<dyn BitstreamSink>>) -> Result<Self> {
        check_stdout_conflict(&sinks)?;
        Ok(Self { sinks })
    }
}

/// At most one writer may be bound to stdout.
pub fn check_stdout_conflict(sinks: &[Box<dyn BitstreamSink>]) -> Result<()> {
    stdout_conflict(sinks.iter().filter(|s| s.uses_stdout()).count())
}

impl BitstreamSink for TeeSink {
    fn write_packet(&mut self, packet: &EncodedPacket) -> Result<()> {
        for s in &mut self.sinks {
            s.write_packet(packet)?;
        }
        Ok(())
    }

    /// Flushes every sink even if one fails; reports the first failure.
    fn flush(&mut self) -> Result<()> {
        let mut first = None;
        for s in &mut self.sinks {
            if let Err(e) = s.flush() {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn uses_stdout(&self) -> bool {
        self.sinks.iter().any(|s| s.uses_stdout())
    }
}
