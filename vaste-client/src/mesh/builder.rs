//! Mesh worker pool and the version-driven rebuild scheduler.

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{Receiver, Sender, TryRecvError, unbounded};
use glam::DVec3;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use vaste_utils::{BlockPos, CHUNK_SIZE, CHUNK_VOLUME, ChunkPos, Direction};

use crate::mesh::mesher::{AtlasMeta, ChunkMesh, MeshInput, NeighborFaces, build_chunk_mesh};
use crate::store::ClientChunkStore;

/// Render distance driving mesh maintenance, in chunks.
pub const RENDER_DISTANCE_CHUNKS: i32 = 10;

/// The outcome of one mesh job.
#[derive(Debug)]
pub enum MeshResult {
    /// The mesh was built and may be mounted if still current.
    Built(ChunkMesh),
    /// The job was cancelled or superseded before building.
    Cancelled {
        /// The chunk the job was for.
        pos: ChunkPos,
        /// The version the job captured.
        version: u32,
    },
}

struct MeshJob {
    input: MeshInput,
    atlas: Option<Arc<AtlasMeta>>,
}

/// Desired chunk versions, shared with the workers so superseded and
/// cancelled jobs can bail before doing any work.
type DesiredVersions = Arc<Mutex<FxHashMap<ChunkPos, u32>>>;

/// Fixed pool of mesh worker threads fed round-robin.
pub struct MeshBuilder {
    senders: Vec<Sender<MeshJob>>,
    results: Receiver<MeshResult>,
    desired: DesiredVersions,
    next_worker: usize,
}

impl MeshBuilder {
    /// Spawns `size` mesh workers.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let desired: DesiredVersions = Arc::new(Mutex::new(FxHashMap::default()));
        let (result_tx, results) = unbounded();
        let mut senders = Vec::with_capacity(size.max(1));
        for index in 0..size.max(1) {
            let (tx, rx) = unbounded::<MeshJob>();
            let result_tx = result_tx.clone();
            let desired = Arc::clone(&desired);
            thread::Builder::new()
                .name(format!("chunk-mesh-{index}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let current = desired.lock().get(&job.input.pos).copied();
                        let result = if current == Some(job.input.version) {
                            MeshResult::Built(build_chunk_mesh(
                                &job.input,
                                job.atlas.as_deref(),
                            ))
                        } else {
                            MeshResult::Cancelled {
                                pos: job.input.pos,
                                version: job.input.version,
                            }
                        };
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                })
                .unwrap_or_else(|e| panic!("failed to spawn mesh worker: {e}"));
            senders.push(tx);
        }
        Self {
            senders,
            results,
            desired,
            next_worker: 0,
        }
    }

    /// Submits a mesh job; the newest version per chunk wins.
    pub fn submit(&mut self, input: MeshInput, atlas: Option<Arc<AtlasMeta>>) {
        self.desired.lock().insert(input.pos, input.version);
        let worker = self.next_worker % self.senders.len();
        self.next_worker = self.next_worker.wrapping_add(1);
        if self.senders[worker].send(MeshJob { input, atlas }).is_err() {
            log::error!("mesh worker pool is gone");
        }
    }

    /// Cancels any job for the chunk; in-flight work reports
    /// [`MeshResult::Cancelled`].
    pub fn cancel(&self, pos: ChunkPos) {
        self.desired.lock().remove(&pos);
    }

    /// The version the builder currently wants for a chunk.
    #[must_use]
    pub fn desired_version(&self, pos: ChunkPos) -> Option<u32> {
        self.desired.lock().get(&pos).copied()
    }

    /// Collects finished jobs without blocking.
    pub fn drain_results(&self) -> Vec<MeshResult> {
        let mut results = Vec::new();
        loop {
            match self.results.try_recv() {
                Ok(result) => results.push(result),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::error!("mesh worker pool is gone");
                    break;
                }
            }
        }
        results
    }
}

/// Watches `(chunks, chunk_versions, player_position)` and keeps mesh
/// jobs flowing for every in-range chunk whose version moved.
pub struct MeshScheduler {
    builder: MeshBuilder,
    built_versions: FxHashMap<ChunkPos, u32>,
    render_distance: i32,
}

impl MeshScheduler {
    /// Creates a scheduler over its worker pool.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            builder: MeshBuilder::new(workers),
            built_versions: FxHashMap::default(),
            render_distance: RENDER_DISTANCE_CHUNKS,
        }
    }

    /// Overrides the render distance; test support.
    pub fn set_render_distance(&mut self, chunks: i32) {
        self.render_distance = chunks;
    }

    /// Access to the underlying builder.
    pub fn builder_mut(&mut self) -> &mut MeshBuilder {
        &mut self.builder
    }

    /// Submits jobs for every in-range chunk whose version changed
    /// since its last submitted build, and cancels jobs for chunks
    /// that left the render distance. Returns chunks that left range
    /// so the upload layer can unmount them.
    pub fn update(
        &mut self,
        store: &ClientChunkStore,
        player: DVec3,
        atlas: Option<&Arc<AtlasMeta>>,
    ) -> Vec<ChunkPos> {
        let player_chunk = ChunkPos::containing_point(player);
        let in_range = |pos: ChunkPos| {
            (pos.x - player_chunk.x).abs() <= self.render_distance
                && (pos.y - player_chunk.y).abs() <= self.render_distance
                && (pos.z - player_chunk.z).abs() <= self.render_distance
        };

        let mut left: Vec<ChunkPos> = Vec::new();
        self.built_versions.retain(|pos, _| {
            if in_range(*pos) {
                true
            } else {
                left.push(*pos);
                false
            }
        });
        for pos in &left {
            self.builder.cancel(*pos);
        }

        for pos in store.chunk_positions() {
            if !in_range(pos) {
                continue;
            }
            let version = store.version(pos);
            if version == 0 {
                continue;
            }
            let known = self.built_versions.get(&pos).copied().unwrap_or(0);
            if version > known {
                self.built_versions.insert(pos, version);
                self.builder
                    .submit(build_input(store, pos, version), atlas.cloned());
            }
        }
        left
    }

    /// Collects finished jobs.
    pub fn drain_results(&self) -> Vec<MeshResult> {
        self.builder.drain_results()
    }
}

/// Snapshots a chunk and its neighbor boundary planes for a mesh job.
#[must_use]
pub fn build_input(store: &ClientChunkStore, pos: ChunkPos, version: u32) -> MeshInput {
    let mut blocks: Box<[u16; CHUNK_VOLUME]> = Box::new([0; CHUNK_VOLUME]);
    if let Some(chunk) = store.chunk(pos) {
        for cell in chunk.values() {
            let index = BlockPos::new(cell.x, cell.y, cell.z).local_index();
            blocks[usize::from(index)] = cell.block_type;
        }
    }

    let mut neighbors = NeighborFaces::default();
    let origin = pos.origin();
    for dir in Direction::ALL {
        let neighbor_pos = ChunkPos::new(
            pos.x + dir.offset().0,
            pos.y + dir.offset().1,
            pos.z + dir.offset().2,
        );
        let Some(neighbor) = store.chunk(neighbor_pos) else {
            continue;
        };
        let mut plane: Box<[u16; 256]> = Box::new([0; 256]);
        for a in 0..CHUNK_SIZE {
            for b in 0..CHUNK_SIZE {
                // The neighbor cell touching our (a, b) across `dir`.
                let world = match dir {
                    Direction::Down => BlockPos::new(origin.x + a, origin.y - 1, origin.z + b),
                    Direction::Up => {
                        BlockPos::new(origin.x + a, origin.y + CHUNK_SIZE, origin.z + b)
                    }
                    Direction::North => BlockPos::new(origin.x + a, origin.y + b, origin.z - 1),
                    Direction::South => {
                        BlockPos::new(origin.x + a, origin.y + b, origin.z + CHUNK_SIZE)
                    }
                    Direction::West => BlockPos::new(origin.x - 1, origin.y + b, origin.z + a),
                    Direction::East => {
                        BlockPos::new(origin.x + CHUNK_SIZE, origin.y + b, origin.z + a)
                    }
                };
                if let Some(cell) = neighbor.get(&world.as_i64()) {
                    plane[(b * CHUNK_SIZE + a) as usize] = cell.block_type;
                }
            }
        }
        neighbors.set(dir, plane);
    }

    MeshInput {
        pos,
        version,
        blocks,
        neighbors,
    }
}
