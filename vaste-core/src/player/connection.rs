//! The object-safe connection seam between sessions and their socket.
//!
//! The trait abstracts the transport so that:
//! - the real WebSocket connection in the `vaste` binary handles live traffic
//! - [`RecordingConnection`] records outbound frames for assertions

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use vaste_utils::locks::SyncMutex;

/// An error surfaced when a frame cannot be handed to the transport.
#[derive(Error, Debug)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// An object-safe handle to a client's socket.
///
/// Sends enqueue onto the connection's outbound queue; an `Err` means
/// the queue is gone and the session is tearing down.
pub trait SessionConnection: Send + Sync {
    /// Enqueues a JSON text frame.
    fn send_text(&self, text: String) -> Result<(), ConnectionClosed>;

    /// Enqueues a binary chunk frame. The buffer is shared so resends
    /// and batched outstanding entries reuse the same allocation.
    fn send_binary(&self, bytes: Arc<[u8]>) -> Result<(), ConnectionClosed>;

    /// Closes the connection.
    fn close(&self);

    /// Whether the connection is closed.
    fn closed(&self) -> bool;
}

/// A frame recorded by [`RecordingConnection`].
#[derive(Debug, Clone)]
pub enum RecordedFrame {
    /// A JSON text frame.
    Text(String),
    /// A binary chunk frame.
    Binary(Arc<[u8]>),
}

/// A connection double that records every frame instead of writing to a
/// socket. Used by the streaming tests.
#[derive(Default)]
pub struct RecordingConnection {
    frames: SyncMutex<Vec<RecordedFrame>>,
    closed: AtomicBool,
    /// When set, sends fail without recording; lets tests exercise the
    /// requeue-on-write-failure path.
    pub fail_sends: AtomicBool,
}

impl RecordingConnection {
    /// Creates an open recording connection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All frames recorded so far.
    #[must_use]
    pub fn frames(&self) -> Vec<RecordedFrame> {
        self.frames.lock().clone()
    }

    /// Only the binary frames recorded so far.
    #[must_use]
    pub fn binary_frames(&self) -> Vec<Arc<[u8]>> {
        self.frames
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                RecordedFrame::Binary(bytes) => Some(bytes.clone()),
                RecordedFrame::Text(_) => None,
            })
            .collect()
    }

    /// Only the text frames recorded so far.
    #[must_use]
    pub fn text_frames(&self) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                RecordedFrame::Text(text) => Some(text.clone()),
                RecordedFrame::Binary(_) => None,
            })
            .collect()
    }

    /// Drops every recorded frame.
    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}

impl SessionConnection for RecordingConnection {
    fn send_text(&self, text: String) -> Result<(), ConnectionClosed> {
        if self.closed() || self.fail_sends.load(Ordering::Relaxed) {
            return Err(ConnectionClosed);
        }
        self.frames.lock().push(RecordedFrame::Text(text));
        Ok(())
    }

    fn send_binary(&self, bytes: Arc<[u8]>) -> Result<(), ConnectionClosed> {
        if self.closed() || self.fail_sends.load(Ordering::Relaxed) {
            return Err(ConnectionClosed);
        }
        self.frames.lock().push(RecordedFrame::Binary(bytes));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}
