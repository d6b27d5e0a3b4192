//! Auxiliary decode thread and the ready queue it feeds.
//!
//! Hardware-decoded sources run on their own thread and publish pictures
//! through a bounded channel; the controlling thread waits on it with a
//! timeout and retries. Host sources are read synchronously instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error};

use hwtc_core::codec_traits::{DecodePath, FrameSource, SourceFrame};
use hwtc_core::error::{EngineError, Result};

/// Result of polling the ready queue.
#[derive(Debug)]
pub enum DecodeEvent {
    Frame(SourceFrame),
    /// Nothing ready within the wait; try again.
    Empty,
    Finished,
}

#[derive(Debug)]
pub struct DecodeThread {
    rx: Receiver<Result<SourceFrame>>,
    handle: Option<JoinHandle<u64>>,
    stop: Arc<AtomicBool>,
    finished: bool,
}

impl DecodeThread {
    /// Start decoding `source` into a ready queue of `queue_depth` pictures.
    pub fn spawn(source: Box<dyn FrameSource>, queue_depth: usize) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(queue_depth.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("hwtc-decode".into())
            .spawn(move || decode_loop(source, tx, thread_stop))?;
        Ok(Self {
            rx,
            handle: Some(handle),
            stop,
            finished: false,
        })
    }

    /// Wait up to `wait` for the next picture.
    pub fn next(&mut self, wait: Duration) -> Result<DecodeEvent> {
        if self.finished {
            return Ok(DecodeEvent::Finished);
        }
        match self.rx.recv_timeout(wait) {
            Ok(Ok(frame)) => Ok(DecodeEvent::Frame(frame)),
            Ok(Err(e)) => {
                self.finished = true;
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => Ok(DecodeEvent::Empty),
            Err(RecvTimeoutError::Disconnected) => {
                self.finished = true;
                Ok(DecodeEvent::Finished)
            }
        }
    }

    /// Stop the thread, discard queued pictures and join. Returns how many
    /// pictures the thread produced.
    pub fn drain_and_join(mut self) -> Result<u64> {
        self.stop.store(true, Ordering::Release);
        let mut discarded = 0u64;
        while self.rx.recv().is_ok() {
            discarded += 1;
        }
        let handle = self
            .handle
            .take()
            .ok_or_else(|| EngineError::InvariantViolation("decode thread already joined".into()))?;
        let decoded = handle
            .join()
            .map_err(|_| EngineError::InvariantViolation("decode thread panicked".into()))?;
        debug!(decoded, discarded, "Decode thread joined");
        Ok(decoded)
    }
}

impl Drop for DecodeThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            while self.rx.recv().is_ok() {}
            let _ = handle.join();
        }
    }
}

fn decode_loop(mut source: Box<dyn FrameSource>, tx: SyncSender<Result<SourceFrame>>, stop: Arc<AtomicBool>) -> u64 {
    let mut decoded = 0u64;
    while !stop.load(Ordering::Acquire) {
        match source.next_frame() {
            Ok(Some(frame)) => {
                decoded += 1;
                if tx.send(Ok(frame)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(%e, decoded, "Decoder failed");
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
    decoded
}

/// Where the controlling thread gets source pictures from.
#[derive(Debug)]
pub enum FrameFeed {
    Host(HostFeed),
    Hardware(DecodeThread),
}

/// Synchronous reader for host sources.
pub struct HostFeed {
    source: Box<dyn FrameSource>,
    finished: bool,
    read: u64,
}

impl std::fmt::Debug for HostFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFeed")
            .field("finished", &self.finished)
            .field("read", &self.read)
            .finish()
    }
}

impl FrameFeed {
    /// Host sources are read in place; hardware sources get a decode
    /// thread.
    pub fn start(source: Box<dyn FrameSource>, queue_depth: usize) -> Result<Self> {
        match source.info().decode {
            DecodePath::Host => Ok(Self::Host(HostFeed {
                source,
                finished: false,
                read: 0,
            })),
            DecodePath::Hardware => Ok(Self::Hardware(DecodeThread::spawn(source, queue_depth)?)),
        }
    }

    pub fn next(&mut self, wait: Duration) -> Result<DecodeEvent> {
        match self {
            Self::Host(feed) => {
                if feed.finished {
                    return Ok(DecodeEvent::Finished);
                }
                match feed.source.next_frame() {
                    Ok(Some(frame)) => {
                        feed.read += 1;
                        Ok(DecodeEvent::Frame(frame))
                    }
                    Ok(None) => {
                        feed.finished = true;
                        Ok(DecodeEvent::Finished)
                    }
                    Err(e) => {
                        feed.finished = true;
                        Err(e)
                    }
                }
            }
            Self::Hardware(thread) => thread.next(wait),
        }
    }

    /// Stop reading and join any decode thread.
    pub fn finish(self) -> Result<u64> {
        match self {
            Self::Host(feed) => Ok(feed.read),
            Self::Hardware(thread) => thread.drain_and_join(),
        }
    }
}
