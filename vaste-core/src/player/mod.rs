//! Player sessions and the per-session streaming machinery.

pub mod block_actions;
pub mod chunk_streamer;
pub mod connection;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::DVec3;
use uuid::Uuid;
use vaste_protocol::ServerMessage;
use vaste_utils::locks::SyncMutex;

use crate::player::connection::SessionConnection;

pub use block_actions::{ActionError, ActionKind};
pub use chunk_streamer::{ChunkStreamer, StreamerEvent, StreamerSnapshot};
pub use connection::{ConnectionClosed, RecordedFrame, RecordingConnection};

/// Per-session streaming counters, reported when the session closes.
#[derive(Debug, Default)]
pub struct SessionTelemetry {
    /// Chunk frames handed to the socket, resends included.
    pub frames_sent: AtomicU64,
    /// Acks received.
    pub acks: AtomicU64,
    /// Frames resent after an ack timeout.
    pub resends: AtomicU64,
    /// Outstanding entries dropped after exhausting retries.
    pub dropped: AtomicU64,
}

impl SessionTelemetry {
    /// One-line summary for the close log.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "sent={} acks={} resends={} dropped={}",
            self.frames_sent.load(Ordering::Relaxed),
            self.acks.load(Ordering::Relaxed),
            self.resends.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

/// An authenticated player.
///
/// Created on successful auth, destroyed on socket close. Everything
/// mutable here is either owned by the session's own task (the
/// [`ChunkStreamer`]) or small shared state other sessions read for
/// broadcasts.
pub struct PlayerSession {
    /// Server-local session id.
    pub id: u64,
    /// The verified account id.
    pub user_id: String,
    /// The verified account uuid.
    pub uuid: Uuid,
    /// Display name.
    pub username: String,
    position: SyncMutex<DVec3>,
    connection: Arc<dyn SessionConnection>,
    /// Streaming counters.
    pub telemetry: SessionTelemetry,
}

impl PlayerSession {
    /// Creates a session around an authenticated connection.
    #[must_use]
    pub fn new(
        id: u64,
        user_id: String,
        uuid: Uuid,
        username: String,
        position: DVec3,
        connection: Arc<dyn SessionConnection>,
    ) -> Self {
        Self {
            id,
            user_id,
            uuid,
            username,
            position: SyncMutex::new(position),
            connection,
            telemetry: SessionTelemetry::default(),
        }
    }

    /// The last-known player position.
    #[must_use]
    pub fn position(&self) -> DVec3 {
        *self.position.lock()
    }

    /// Updates the last-known player position.
    pub fn set_position(&self, position: DVec3) {
        *self.position.lock() = position;
    }

    /// The session's connection handle.
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn SessionConnection> {
        &self.connection
    }

    /// Sends a JSON message, logging on a dead connection.
    pub fn send(&self, message: &ServerMessage) {
        if self.connection.send_text(message.to_json()).is_err() {
            log::debug!("dropping message to closed session {}", self.id);
        }
    }
}
