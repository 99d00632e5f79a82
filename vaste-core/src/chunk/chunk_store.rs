//! The authoritative chunk table.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use vaste_utils::locks::SyncMutex;
use vaste_utils::{BlockPos, ChunkPos};

use crate::chunk::chunk_data::{ChunkBlocks, ChunkData};
use crate::chunk::chunk_holder::ChunkHolder;
use crate::chunk::worker_pool::GenerationPool;

/// An error from the chunk store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The generation job for the chunk failed.
    #[error("chunk generation failed for {0}")]
    Generation(ChunkPos),
    /// The store is shutting down.
    #[error("chunk store closed")]
    Closed,
}

/// The outcome of an authoritative single-cell mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChange {
    /// The mutated cell.
    pub pos: BlockPos,
    /// Block type before the mutation.
    pub old: u16,
    /// Block type after the mutation.
    pub new: u16,
    /// The chunk version after the mutation.
    pub version: u32,
}

type EnsureWaiter = oneshot::Sender<Result<Arc<ChunkHolder>, StoreError>>;

/// Owns the chunk set, collapses duplicate generation requests, and
/// evicts least-recently-touched unpinned chunks over capacity.
///
/// Versions are tracked in a table that outlives eviction, so a chunk
/// that is evicted and re-generated continues its version sequence
/// instead of restarting at 1.
pub struct ChunkStore {
    chunks: scc::HashMap<ChunkPos, Arc<ChunkHolder>>,
    versions: SyncMutex<FxHashMap<ChunkPos, u32>>,
    pending: SyncMutex<FxHashMap<ChunkPos, Vec<EnsureWaiter>>>,
    generation: GenerationPool,
    tracker: TaskTracker,
    max_chunks: usize,
    clock: AtomicU64,
}

impl ChunkStore {
    /// Creates a store generating absent chunks through `generation`.
    #[must_use]
    pub fn new(generation: GenerationPool, max_chunks: usize) -> Self {
        Self {
            chunks: scc::HashMap::new(),
            versions: SyncMutex::new(FxHashMap::default()),
            pending: SyncMutex::new(FxHashMap::default()),
            generation,
            tracker: TaskTracker::new(),
            max_chunks,
            clock: AtomicU64::new(0),
        }
    }

    /// Non-blocking cache hit; touches the LRU stamp.
    #[must_use]
    pub fn get(&self, pos: ChunkPos) -> Option<Arc<ChunkHolder>> {
        let holder = self.chunks.read_sync(&pos, |_, holder| holder.clone())?;
        holder.touch(self.tick());
        Some(holder)
    }

    /// Number of resident chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether no chunks are resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Returns the chunk, generating it if absent.
    ///
    /// Concurrent calls for the same position collapse onto a single
    /// generation job.
    pub async fn ensure(self: &Arc<Self>, pos: ChunkPos) -> Result<Arc<ChunkHolder>, StoreError> {
        if let Some(holder) = self.get(pos) {
            return Ok(holder);
        }

        let rx = {
            let mut pending = self.pending.lock();
            // Re-check under the lock: completion also holds it while
            // inserting, so a hit here cannot race with a drain.
            if let Some(holder) = self.get(pos) {
                return Ok(holder);
            }
            let (tx, rx) = oneshot::channel();
            match pending.entry(pos) {
                std::collections::hash_map::Entry::Occupied(mut waiters) => {
                    waiters.get_mut().push(tx);
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(vec![tx]);
                    self.spawn_generation(pos);
                }
            }
            rx
        };

        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Chunks whose center lies within `radius_chunks` of the given
    /// chunk, among those currently resident.
    #[must_use]
    pub fn chunks_in_range(&self, center: ChunkPos, radius_chunks: i32) -> Vec<Arc<ChunkHolder>> {
        let mut found = Vec::new();
        let max_distance = f64::from(radius_chunks) * f64::from(vaste_utils::CHUNK_SIZE);
        let center_point = center.center();
        self.chunks.iter_sync(|_, holder| {
            if holder.pos().center().distance(center_point) <= max_distance {
                found.push(holder.clone());
            }
            true
        });
        found
    }

    /// Mutates one cell, ensuring the owning chunk first. Returns the
    /// previous block and the post-mutation version.
    ///
    /// Must only be called from the world task; see [`crate::server`].
    pub async fn set_block(
        self: &Arc<Self>,
        pos: BlockPos,
        block: u16,
    ) -> Result<BlockChange, StoreError> {
        let holder = self.ensure(ChunkPos::containing(pos)).await?;
        let index = pos.local_index();
        let current = holder.snapshot();
        let old = current.get(index);
        let version = self.next_version(holder.pos());
        holder.store(current.with_block(index, block, version));
        holder.touch(self.tick());
        Ok(BlockChange {
            pos,
            old,
            new: block,
            version,
        })
    }

    /// Waits for in-flight generation tasks, rejecting new ones.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn spawn_generation(self: &Arc<Self>, pos: ChunkPos) {
        let rx = self.generation.submit(pos);
        let store = Arc::clone(self);
        self.tracker.spawn(async move {
            let blocks = rx.await.ok();
            store.finish_generation(pos, blocks);
        });
    }

    fn finish_generation(self: &Arc<Self>, pos: ChunkPos, blocks: Option<ChunkBlocks>) {
        let outcome = {
            let mut pending = self.pending.lock();
            let outcome = match blocks {
                Some(blocks) => {
                    let version = self.next_version(pos);
                    let holder = Arc::new(ChunkHolder::new(
                        pos,
                        ChunkData::from_blocks(version, blocks),
                        self.tick(),
                    ));
                    let _ = self.chunks.insert_sync(pos, holder.clone());
                    Ok(holder)
                }
                None => {
                    log::error!("chunk generation failed for {pos}");
                    Err(StoreError::Generation(pos))
                }
            };
            let waiters = pending.remove(&pos).unwrap_or_default();
            drop(pending);
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
            outcome
        };
        if outcome.is_ok() {
            self.evict_over_capacity();
        }
    }

    fn next_version(&self, pos: ChunkPos) -> u32 {
        let mut versions = self.versions.lock();
        let version = versions.entry(pos).or_insert(0);
        *version += 1;
        *version
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Evicts least-recently-touched unpinned chunks until the store is
    /// back under capacity. Pinned chunks are skipped; if everything
    /// over capacity is pinned the overshoot is tolerated.
    fn evict_over_capacity(&self) {
        while self.chunks.len() > self.max_chunks {
            let mut victim: Option<(ChunkPos, u64)> = None;
            self.chunks.iter_sync(|pos, holder| {
                if !holder.pinned() {
                    let stamp = holder.last_touched();
                    if victim.is_none_or(|(_, best)| stamp < best) {
                        victim = Some((*pos, stamp));
                    }
                }
                true
            });
            let Some((pos, _)) = victim else {
                log::warn!(
                    "chunk store over capacity ({} > {}) but every chunk is pinned",
                    self.chunks.len(),
                    self.max_chunks
                );
                return;
            };
            self.chunks.remove_sync(&pos);
            log::debug!("evicted chunk {pos}");
        }
    }
}
