//! World generators.

use enum_dispatch::enum_dispatch;
use vaste_utils::{BlockPos, CHUNK_SIZE, CHUNK_VOLUME, ChunkPos};

use crate::chunk::chunk_data::ChunkBlocks;
use crate::config::WorldGeneratorType;

/// A trait for generating the voxels of absent chunks.
///
/// Generators are pure functions of the chunk position; they run on the
/// generation pool workers and share no state.
#[enum_dispatch]
pub trait WorldGenerator: Send + Sync {
    /// Produces the dense voxel array for the chunk at `pos`.
    fn generate(&self, pos: ChunkPos) -> ChunkBlocks;
}

/// The configured generator variants.
#[enum_dispatch(WorldGenerator)]
pub enum GeneratorKind {
    /// Flat surface world.
    Flat(FlatGenerator),
    /// All-air world.
    Empty(EmptyGenerator),
}

impl From<WorldGeneratorType> for GeneratorKind {
    fn from(value: WorldGeneratorType) -> Self {
        match value {
            WorldGeneratorType::Flat => Self::Flat(FlatGenerator::default()),
            WorldGeneratorType::Empty => Self::Empty(EmptyGenerator),
        }
    }
}

/// Fills one solid surface layer at world `y == 0`.
pub struct FlatGenerator {
    /// Block type of the surface layer.
    pub surface_block: u16,
}

impl Default for FlatGenerator {
    fn default() -> Self {
        Self { surface_block: 1 }
    }
}

impl WorldGenerator for FlatGenerator {
    fn generate(&self, pos: ChunkPos) -> ChunkBlocks {
        let mut blocks: ChunkBlocks = Box::new([0; CHUNK_VOLUME]);
        if pos.y == 0 {
            for z in 0..CHUNK_SIZE {
                for x in 0..CHUNK_SIZE {
                    let index = BlockPos::new(x, 0, z).local_index();
                    blocks[usize::from(index)] = self.surface_block;
                }
            }
        }
        blocks
    }
}

/// Generates nothing but air.
pub struct EmptyGenerator;

impl WorldGenerator for EmptyGenerator {
    fn generate(&self, _pos: ChunkPos) -> ChunkBlocks {
        Box::new([0; CHUNK_VOLUME])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_generator_fills_only_the_surface_chunk() {
        let generator = FlatGenerator::default();

        let surface = generator.generate(ChunkPos::new(0, 0, 0));
        assert_eq!(surface.iter().filter(|&&b| b != 0).count(), 256);
        assert_eq!(surface[usize::from(BlockPos::new(8, 0, 8).local_index())], 1);
        assert_eq!(surface[usize::from(BlockPos::new(8, 1, 8).local_index())], 0);

        let above = generator.generate(ChunkPos::new(0, 1, 0));
        assert!(above.iter().all(|&b| b == 0));
        let below = generator.generate(ChunkPos::new(0, -1, 0));
        assert!(below.iter().all(|&b| b == 0));
    }
}
