//! Client-side voxel storage: per-chunk block maps, version counters,
//! and the legacy flat per-voxel map kept consistent with their union.

use rustc_hash::FxHashMap;
use vaste_utils::{BlockPos, ChunkPos};

/// Packed block-position key, see [`BlockPos::as_i64`].
pub type BlockKey = i64;

/// One non-air cell in a chunk map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCell {
    /// World x.
    pub x: i32,
    /// World y.
    pub y: i32,
    /// World z.
    pub z: i32,
    /// Block type; never 0 inside a chunk map.
    pub block_type: u16,
}

/// A chunk's non-air cells keyed by packed world position.
pub type ChunkMap = FxHashMap<BlockKey, BlockCell>;

/// The client's view of the world.
#[derive(Debug, Default)]
pub struct ClientChunkStore {
    chunks: FxHashMap<ChunkPos, ChunkMap>,
    chunk_versions: FxHashMap<ChunkPos, u32>,
    voxels: FxHashMap<BlockKey, u16>,
}

impl ClientChunkStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The chunk map for a position, if any frame arrived for it.
    #[must_use]
    pub fn chunk(&self, pos: ChunkPos) -> Option<&ChunkMap> {
        self.chunks.get(&pos)
    }

    /// All chunk positions with data.
    pub fn chunk_positions(&self) -> impl Iterator<Item = ChunkPos> + '_ {
        self.chunks.keys().copied()
    }

    /// The local version counter for a chunk; 0 before any update.
    #[must_use]
    pub fn version(&self, pos: ChunkPos) -> u32 {
        self.chunk_versions.get(&pos).copied().unwrap_or(0)
    }

    /// The block type at a world position, 0 for air or unknown.
    #[must_use]
    pub fn block_at(&self, pos: BlockPos) -> u16 {
        self.voxels.get(&pos.as_i64()).copied().unwrap_or(0)
    }

    /// Atomically replaces a chunk's map and reconciles the legacy
    /// per-voxel map with the change.
    pub fn replace_chunk(&mut self, pos: ChunkPos, map: ChunkMap) {
        if let Some(old) = self.chunks.get(&pos) {
            for key in old.keys() {
                if !map.contains_key(key) {
                    self.voxels.remove(key);
                }
            }
        }
        for (key, cell) in &map {
            self.voxels.insert(*key, cell.block_type);
        }
        self.chunks.insert(pos, map);
    }

    /// Sets one cell, updating both the owning chunk map and the
    /// legacy map. Used by optimistic actions and authoritative
    /// patches; does not touch version counters.
    pub fn set_block(&mut self, pos: BlockPos, block_type: u16) {
        let key = pos.as_i64();
        let chunk = self.chunks.entry(ChunkPos::containing(pos)).or_default();
        if block_type == 0 {
            chunk.remove(&key);
            self.voxels.remove(&key);
        } else {
            chunk.insert(
                key,
                BlockCell {
                    x: pos.x,
                    y: pos.y,
                    z: pos.z,
                    block_type,
                },
            );
            self.voxels.insert(key, block_type);
        }
    }

    /// Bumps a chunk's local version counter.
    pub fn bump_version(&mut self, pos: ChunkPos) {
        *self.chunk_versions.entry(pos).or_insert(0) += 1;
    }

    /// Bumps a chunk and its six face neighbors. Face visibility can
    /// only change across shared faces, so the 26-neighborhood is not
    /// needed.
    pub fn bump_version_with_neighbors(&mut self, pos: ChunkPos) {
        self.bump_version(pos);
        for neighbor in pos.face_neighbors() {
            self.bump_version(neighbor);
        }
    }

    /// Number of non-air cells across all chunk maps; equals the
    /// legacy map's size whenever the store is consistent.
    #[must_use]
    pub fn non_air_count(&self) -> usize {
        self.voxels.len()
    }

    /// Checks the legacy map against the union of the chunk maps.
    /// Test support.
    #[must_use]
    pub fn legacy_map_consistent(&self) -> bool {
        let union_size: usize = self.chunks.values().map(FxHashMap::len).sum();
        if union_size != self.voxels.len() {
            return false;
        }
        self.chunks.values().all(|chunk| {
            chunk
                .iter()
                .all(|(key, cell)| self.voxels.get(key) == Some(&cell.block_type))
        })
    }
}
