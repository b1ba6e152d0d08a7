//! The minimal capability set a connection needs from its attached writer
//! (§9 "Dynamic dispatch on sinks").
//!
//! `ServerConnection` must accept the real HTTP body writer, the proxy's
//! byte pump, and an in-memory test double interchangeably, so it is
//! coupled only to this trait rather than to any specific framework's
//! response type.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// A destination for outbound SSE frames.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Write one already-encoded frame. Implementations should treat any
    /// failure (including a closed peer) as a write failure, never panic.
    async fn write(&mut self, frame: Bytes) -> Result<()>;

    /// Close the sink. Called once, on connection teardown or explicit
    /// `sink.close()`; implementations should make this idempotent.
    async fn close(&mut self);
}

/// A [`FrameSink`] backed by a bounded channel, used to bridge the
/// connection's drain loop to a streaming HTTP response body (the
/// `axum`/`hyper` "hijack" in spec terms) or to the proxy's downstream pump.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    /// Wrap a channel sender as a [`FrameSink`].
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn write(&mut self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::sink_write("receiver dropped"))
    }

    async fn close(&mut self) {
        // Dropping the sender side ends the response body stream; there is
        // nothing else to flush since each send already completed.
    }
}

/// An in-memory [`FrameSink`] used by tests to simulate the attached
/// response writer and its disconnects without real network I/O.
#[derive(Default)]
pub struct RecordingSink {
    pub frames: Vec<Bytes>,
    pub closed: bool,
    /// When set, the next `write` fails once and then resets to `None` —
    /// used to simulate a transient write failure while `sink` is attached.
    pub fail_next: bool,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn write(&mut self, frame: Bytes) -> Result<()> {
        if self.fail_next {
            self.fail_next = false;
            return Err(Error::sink_write("simulated write failure"));
        }
        self.frames.push(frame);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
