//! Dense voxel storage for a single chunk.

use vaste_protocol::ChunkFull;
use vaste_utils::{CHUNK_VOLUME, ChunkPos};

/// The dense voxel array of a chunk. `0` is air.
pub type ChunkBlocks = Box<[u16; CHUNK_VOLUME]>;

/// An immutable point-in-time copy of a chunk's voxels, stamped with
/// the chunk version it captures.
///
/// Mutation never happens in place: the world task clones, edits and
/// swaps a fresh `ChunkData` into the holder, so every reader keeps a
/// consistent snapshot for as long as it holds the `Arc`.
#[derive(Debug, Clone)]
pub struct ChunkData {
    version: u32,
    blocks: ChunkBlocks,
}

impl ChunkData {
    /// Creates an all-air chunk at the given version.
    #[must_use]
    pub fn empty(version: u32) -> Self {
        Self::from_blocks(version, Box::new([0; CHUNK_VOLUME]))
    }

    /// Wraps a dense voxel array.
    #[must_use]
    pub fn from_blocks(version: u32, blocks: ChunkBlocks) -> Self {
        Self { version, blocks }
    }

    /// The chunk version this snapshot captures.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Voxel at a dense local index.
    #[must_use]
    pub fn get(&self, index: u16) -> u16 {
        self.blocks[usize::from(index)]
    }

    /// Returns a copy of this snapshot with one cell replaced and the
    /// version advanced to `version`.
    #[must_use]
    pub fn with_block(&self, index: u16, block: u16, version: u32) -> Self {
        let mut blocks = self.blocks.clone();
        blocks[usize::from(index)] = block;
        Self { version, blocks }
    }

    /// Number of non-air cells.
    #[must_use]
    pub fn non_air_count(&self) -> usize {
        self.blocks.iter().filter(|&&b| b != 0).count()
    }

    /// Whether the chunk is all air.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|&b| b == 0)
    }

    /// Sparse non-air cells as `(local_index, block_type)`, ascending.
    #[must_use]
    pub fn non_air_entries(&self) -> Vec<(u16, u16)> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b != 0)
            .map(|(i, &b)| (i as u16, b))
            .collect()
    }

    /// Encodes this snapshot as a `CHUNK_FULL` frame.
    #[must_use]
    pub fn to_frame(&self, pos: ChunkPos, seq: u32) -> ChunkFull {
        ChunkFull {
            seq,
            pos,
            version: self.version,
            entries: self.non_air_entries(),
        }
    }
}

/// Rebuilds a dense array from decoded sparse entries.
#[must_use]
pub fn blocks_from_entries(entries: &[(u16, u16)]) -> ChunkBlocks {
    let mut blocks: ChunkBlocks = Box::new([0; CHUNK_VOLUME]);
    for &(index, block) in entries {
        blocks[usize::from(index)] = block;
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaste_utils::BlockPos;

    #[test]
    fn sparse_entries_are_sorted_and_roundtrip() {
        let mut blocks: ChunkBlocks = vec![0; CHUNK_VOLUME].try_into().expect("sized");
        blocks[2056] = 3;
        blocks[136] = 1;
        blocks[4095] = 2;
        let data = ChunkData::from_blocks(5, blocks);

        let entries = data.non_air_entries();
        assert_eq!(entries, vec![(136, 1), (2056, 3), (4095, 2)]);
        assert_eq!(data.non_air_count(), 3);

        let rebuilt = blocks_from_entries(&entries);
        assert_eq!(rebuilt[136], 1);
        assert_eq!(rebuilt[2056], 3);
        assert_eq!(rebuilt[4095], 2);
        assert_eq!(rebuilt.iter().filter(|&&b| b != 0).count(), 3);
    }

    #[test]
    fn with_block_leaves_original_untouched() {
        let data = ChunkData::empty(1);
        let pos = BlockPos::new(8, 0, 8);
        let edited = data.with_block(pos.local_index(), 7, 2);

        assert_eq!(data.get(pos.local_index()), 0);
        assert_eq!(data.version(), 1);
        assert_eq!(edited.get(pos.local_index()), 7);
        assert_eq!(edited.version(), 2);
    }

    #[test]
    fn frame_captures_version_and_entries() {
        let data = ChunkData::empty(1).with_block(136, 1, 1);
        let frame = data.to_frame(ChunkPos::new(0, 0, 0), 1);
        assert_eq!(frame.version, 1);
        assert_eq!(frame.entries, vec![(136, 1)]);
    }
}
