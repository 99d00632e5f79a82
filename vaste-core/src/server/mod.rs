//! Shared server state: the session registry, broadcasts, the
//! single-writer world task, and resume snapshots.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::DVec3;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use vaste_protocol::ServerMessage;
use vaste_utils::BlockPos;
use vaste_utils::locks::SyncMutex;

use crate::chunk::chunk_store::{BlockChange, ChunkStore, StoreError};
use crate::chunk::worker_pool::{GenerationPool, SerializePool, default_pool_size};
use crate::chunk::generator::GeneratorKind;
use crate::config::ServerConfig;
use crate::player::block_actions::{ActionError, ActionKind};
use crate::player::chunk_streamer::StreamerSnapshot;
use crate::player::PlayerSession;

/// A mutation request routed to the world task.
enum WorldCommand {
    Apply {
        kind: ActionKind,
        pos: BlockPos,
        block: u16,
        reply: oneshot::Sender<Result<BlockChange, ActionError>>,
    },
}

/// Handle to the single task allowed to mutate the chunk table.
///
/// Every authoritative mutation flows through here, which serializes
/// precondition checks against the mutation they guard.
#[derive(Clone)]
pub struct WorldHandle {
    commands: mpsc::UnboundedSender<WorldCommand>,
}

impl WorldHandle {
    /// Spawns the world task over the given store.
    #[must_use]
    pub fn spawn(store: Arc<ChunkStore>) -> Self {
        let (commands, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    WorldCommand::Apply {
                        kind,
                        pos,
                        block,
                        reply,
                    } => {
                        let _ = reply.send(Self::apply_on_task(&store, kind, pos, block).await);
                    }
                }
            }
        });
        Self { commands }
    }

    /// Commits one precondition-checked cell mutation.
    pub async fn apply(
        &self,
        kind: ActionKind,
        pos: BlockPos,
        block: u16,
    ) -> Result<BlockChange, ActionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(WorldCommand::Apply {
                kind,
                pos,
                block,
                reply,
            })
            .map_err(|_| ActionError::Store(StoreError::Closed))?;
        rx.await.map_err(|_| ActionError::Store(StoreError::Closed))?
    }

    async fn apply_on_task(
        store: &Arc<ChunkStore>,
        kind: ActionKind,
        pos: BlockPos,
        block: u16,
    ) -> Result<BlockChange, ActionError> {
        let holder = store.ensure(vaste_utils::ChunkPos::containing(pos)).await?;
        let current = holder.snapshot().get(pos.local_index());
        match kind {
            ActionKind::Place if current != 0 => return Err(ActionError::Occupied),
            ActionKind::Break if current == 0 => return Err(ActionError::Air),
            _ => {}
        }
        Ok(store.set_block(pos, block).await?)
    }
}

/// The shared server state.
pub struct Server {
    config: ServerConfig,
    store: Arc<ChunkStore>,
    serialize: Arc<SerializePool>,
    world: WorldHandle,
    sessions: scc::HashMap<u64, Arc<PlayerSession>>,
    resume: SyncMutex<FxHashMap<String, StreamerSnapshot>>,
    next_session_id: AtomicU64,
}

impl Server {
    /// Builds the server state, spawning the worker pools and the
    /// world task.
    #[must_use]
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let pool_size = default_pool_size();
        let generator = GeneratorKind::from(config.world_generator);
        let store = Arc::new(ChunkStore::new(
            GenerationPool::new(pool_size, generator),
            config.max_chunks,
        ));
        let serialize = Arc::new(SerializePool::new(pool_size));
        log::info!("world pools started with {pool_size} workers each");
        Self::with_parts(config, store, serialize)
    }

    /// Builds the server state around pre-built pools. Lets embedders
    /// and tests supply their own generator.
    #[must_use]
    pub fn with_parts(
        config: ServerConfig,
        store: Arc<ChunkStore>,
        serialize: Arc<SerializePool>,
    ) -> Arc<Self> {
        let world = WorldHandle::spawn(Arc::clone(&store));
        Arc::new(Self {
            config,
            store,
            serialize,
            world,
            sessions: scc::HashMap::new(),
            resume: SyncMutex::new(FxHashMap::default()),
            next_session_id: AtomicU64::new(1),
        })
    }

    /// The loaded configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The authoritative chunk table.
    #[must_use]
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// The shared serialization pool.
    #[must_use]
    pub fn serialize_pool(&self) -> &Arc<SerializePool> {
        &self.serialize
    }

    /// The mutation handle.
    #[must_use]
    pub fn world(&self) -> &WorldHandle {
        &self.world
    }

    /// Allocates a session id.
    #[must_use]
    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether another player fits under `max_players`.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.session_count() < self.config.max_players as usize
    }

    /// Registers an authenticated session and announces it.
    pub fn register_session(&self, session: Arc<PlayerSession>) {
        let position = session.position();
        self.broadcast_except(
            session.id,
            &ServerMessage::PlayerJoined {
                id: session.id,
                username: session.username.clone(),
                x: position.x,
                y: position.y,
                z: position.z,
            },
        );
        let _ = self.sessions.insert_sync(session.id, session);
    }

    /// Removes a session and announces the departure.
    pub fn remove_session(&self, id: u64) {
        if self.sessions.remove_sync(&id).is_some() {
            self.broadcast_except(id, &ServerMessage::PlayerDisconnect { id });
        }
    }

    /// Looks up a live session.
    #[must_use]
    pub fn session(&self, id: u64) -> Option<Arc<PlayerSession>> {
        self.sessions.read_sync(&id, |_, session| session.clone())
    }

    /// Sends to every session except `exclude`.
    pub fn broadcast_except(&self, exclude: u64, message: &ServerMessage) {
        self.sessions.iter_sync(|_, session| {
            if session.id != exclude {
                session.send(message);
            }
            true
        });
    }

    /// Sends to every session whose last-known position is within
    /// `radius` blocks of `center`.
    pub fn broadcast_nearby(&self, center: DVec3, radius: f64, message: &ServerMessage) {
        let radius_squared = radius * radius;
        self.sessions.iter_sync(|_, session| {
            if session.position().distance_squared(center) <= radius_squared {
                session.send(message);
            }
            true
        });
    }

    /// Persists resumable streamer state for a user.
    pub fn store_resume_snapshot(&self, user_id: &str, snapshot: StreamerSnapshot) {
        if snapshot.is_empty() {
            self.resume.lock().remove(user_id);
        } else {
            self.resume.lock().insert(user_id.to_string(), snapshot);
        }
    }

    /// Takes (and clears) resumable streamer state for a user.
    #[must_use]
    pub fn take_resume_snapshot(&self, user_id: &str) -> Option<StreamerSnapshot> {
        self.resume.lock().remove(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldGeneratorType;
    use crate::player::RecordingConnection;
    use uuid::Uuid;

    fn test_server() -> Arc<Server> {
        let config = ServerConfig {
            license_key: "test".to_string(),
            world_generator: WorldGeneratorType::Empty,
            ..ServerConfig::default()
        };
        Server::new(config)
    }

    fn add_session(server: &Arc<Server>, position: DVec3) -> (Arc<PlayerSession>, Arc<RecordingConnection>) {
        let connection = Arc::new(RecordingConnection::new());
        let id = server.next_session_id();
        let session = Arc::new(PlayerSession::new(
            id,
            format!("u-{id}"),
            Uuid::nil(),
            format!("player{id}"),
            position,
            connection.clone(),
        ));
        server.register_session(session.clone());
        (session, connection)
    }

    #[tokio::test]
    async fn place_then_break_roundtrip() {
        let server = test_server();
        let pos = BlockPos::new(1, 2, 0);

        let placed = server
            .world()
            .apply(ActionKind::Place, pos, 1)
            .await
            .expect("place into air");
        assert_eq!(placed.old, 0);

        let broken = server
            .world()
            .apply(ActionKind::Break, pos, 0)
            .await
            .expect("break what was placed");
        assert_eq!(broken.old, 1);
        assert!(broken.version > placed.version);
    }

    #[tokio::test]
    async fn place_on_occupied_cell_is_refused() {
        let server = test_server();
        let pos = BlockPos::new(0, 0, 0);
        server
            .world()
            .apply(ActionKind::Place, pos, 1)
            .await
            .expect("first place");
        let err = server
            .world()
            .apply(ActionKind::Place, pos, 1)
            .await
            .expect_err("second place");
        assert_eq!(err, ActionError::Occupied);
        assert_eq!(err.reason(), "occupied");

        let err = server
            .world()
            .apply(ActionKind::Break, BlockPos::new(5, 5, 5), 0)
            .await
            .expect_err("break air");
        assert_eq!(err, ActionError::Air);
    }

    #[tokio::test]
    async fn nearby_broadcast_respects_radius() {
        let server = test_server();
        let (_near, near_conn) = add_session(&server, DVec3::new(0.0, 0.0, 0.0));
        let (_far, far_conn) = add_session(&server, DVec3::new(500.0, 0.0, 0.0));
        near_conn.clear();
        far_conn.clear();

        server.broadcast_nearby(
            DVec3::ZERO,
            128.0,
            &ServerMessage::Teleport {
                x: 0.0,
                y: 0.0,
                z: 0.0,
            },
        );
        assert_eq!(near_conn.text_frames().len(), 1);
        assert_eq!(far_conn.text_frames().len(), 0);
    }

    #[tokio::test]
    async fn resume_snapshots_are_take_once() {
        let server = test_server();
        let snapshot = StreamerSnapshot {
            next_seq: 5,
            outstanding: vec![(vaste_utils::ChunkPos::new(0, 0, 0), 4)],
            queued: vec![],
        };
        server.store_resume_snapshot("u-1", snapshot.clone());
        assert_eq!(server.take_resume_snapshot("u-1"), Some(snapshot));
        assert_eq!(server.take_resume_snapshot("u-1"), None);
    }
}
