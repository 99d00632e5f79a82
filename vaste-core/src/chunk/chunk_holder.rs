//! Shared handle to one chunk in the store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use arc_swap::ArcSwap;
use vaste_utils::ChunkPos;

use crate::chunk::chunk_data::ChunkData;

/// A chunk slot in the store.
///
/// Readers take [`ChunkHolder::snapshot`]; only the world task swaps
/// new data in. The pin count keeps the holder safe from eviction while
/// any session still references the chunk.
#[derive(Debug)]
pub struct ChunkHolder {
    pos: ChunkPos,
    data: ArcSwap<ChunkData>,
    pins: AtomicU32,
    last_touched: AtomicU64,
}

impl ChunkHolder {
    /// Creates a holder around freshly generated data.
    #[must_use]
    pub fn new(pos: ChunkPos, data: ChunkData, stamp: u64) -> Self {
        Self {
            pos,
            data: ArcSwap::from_pointee(data),
            pins: AtomicU32::new(0),
            last_touched: AtomicU64::new(stamp),
        }
    }

    /// The chunk position.
    #[must_use]
    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    /// A point-in-time snapshot of the chunk's voxels.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ChunkData> {
        self.data.load_full()
    }

    /// The current chunk version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.data.load().version()
    }

    /// Replaces the chunk data. World-task only.
    pub fn store(&self, data: ChunkData) {
        self.data.store(Arc::new(data));
    }

    /// Marks the chunk recently used for LRU ordering.
    pub fn touch(&self, stamp: u64) {
        self.last_touched.store(stamp, Ordering::Relaxed);
    }

    /// The LRU stamp of the most recent touch.
    #[must_use]
    pub fn last_touched(&self) -> u64 {
        self.last_touched.load(Ordering::Relaxed)
    }

    /// Protects this chunk from eviction.
    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases one eviction pin.
    pub fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "unpin without matching pin for {}", self.pos);
    }

    /// Whether any session currently pins this chunk.
    #[must_use]
    pub fn pinned(&self) -> bool {
        self.pins.load(Ordering::Relaxed) > 0
    }
}
