//! Core position types shared between the server and client crates.

use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Edge length of a chunk in blocks.
pub const CHUNK_SIZE: i32 = 16;
/// Number of voxels in a chunk.
pub const CHUNK_VOLUME: usize = 4096;

const CHUNK_BITS: i32 = 4;
const CHUNK_MASK: i32 = CHUNK_SIZE - 1;

/// A chunk position in chunk coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    /// Chunk x coordinate.
    pub x: i32,
    /// Chunk y coordinate.
    pub y: i32,
    /// Chunk z coordinate.
    pub z: i32,
}

impl ChunkPos {
    /// Creates a new `ChunkPos`.
    #[must_use]
    #[inline]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Returns the chunk containing the given block position.
    #[must_use]
    #[inline]
    pub const fn containing(pos: BlockPos) -> Self {
        Self {
            x: pos.x >> CHUNK_BITS,
            y: pos.y >> CHUNK_BITS,
            z: pos.z >> CHUNK_BITS,
        }
    }

    /// Returns the chunk containing the given world-space point.
    #[must_use]
    pub fn containing_point(point: DVec3) -> Self {
        Self::containing(BlockPos::new(
            point.x.floor() as i32,
            point.y.floor() as i32,
            point.z.floor() as i32,
        ))
    }

    /// Packs the position into an `i64`, 21 bits per axis.
    ///
    /// Usable as a map key for any world the server accepts; block
    /// coordinates are bounds-checked long before they exceed 2^24.
    #[must_use]
    #[inline]
    pub const fn as_i64(&self) -> i64 {
        ((self.x as i64 & 0x1F_FFFF) << 42)
            | ((self.y as i64 & 0x1F_FFFF) << 21)
            | (self.z as i64 & 0x1F_FFFF)
    }

    /// Unpacks a position packed with [`ChunkPos::as_i64`].
    #[must_use]
    #[inline]
    pub const fn from_i64(value: i64) -> Self {
        let x = (value >> 42) << 43 >> 43;
        let y = ((value >> 21) & 0x1F_FFFF) << 43 >> 43;
        let z = (value & 0x1F_FFFF) << 43 >> 43;
        Self {
            x: x as i32,
            y: y as i32,
            z: z as i32,
        }
    }

    /// World-space block coordinate of this chunk's minimum corner.
    #[must_use]
    #[inline]
    pub const fn origin(&self) -> BlockPos {
        BlockPos::new(
            self.x * CHUNK_SIZE,
            self.y * CHUNK_SIZE,
            self.z * CHUNK_SIZE,
        )
    }

    /// World-space center of the chunk.
    #[must_use]
    pub fn center(&self) -> DVec3 {
        let origin = self.origin();
        DVec3::new(
            f64::from(origin.x) + 8.0,
            f64::from(origin.y) + 8.0,
            f64::from(origin.z) + 8.0,
        )
    }

    /// Squared distance between chunk centers, in blocks.
    #[must_use]
    pub fn distance_squared_to(&self, point: DVec3) -> f64 {
        self.center().distance_squared(point)
    }

    /// The six face-adjacent neighbor positions.
    #[must_use]
    pub const fn face_neighbors(&self) -> [ChunkPos; 6] {
        [
            Self::new(self.x, self.y - 1, self.z),
            Self::new(self.x, self.y + 1, self.z),
            Self::new(self.x, self.y, self.z - 1),
            Self::new(self.x, self.y, self.z + 1),
            Self::new(self.x - 1, self.y, self.z),
            Self::new(self.x + 1, self.y, self.z),
        ]
    }

    /// Iterates every chunk position in the cube of the given radius
    /// (in chunks) centered on this chunk.
    pub fn cube_around(&self, radius: i32) -> impl Iterator<Item = ChunkPos> + use<> {
        let center = *self;
        (-radius..=radius).flat_map(move |dy| {
            (-radius..=radius).flat_map(move |dz| {
                (-radius..=radius)
                    .map(move |dx| ChunkPos::new(center.x + dx, center.y + dy, center.z + dz))
            })
        })
    }
}

impl std::fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

/// A block position in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPos {
    /// World x coordinate.
    pub x: i32,
    /// World y coordinate.
    pub y: i32,
    /// World z coordinate.
    pub z: i32,
}

impl BlockPos {
    /// Creates a new `BlockPos`.
    #[must_use]
    #[inline]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Returns a new position offset by the given amounts.
    #[must_use]
    #[inline]
    pub const fn offset(&self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }

    /// The coordinates of this block relative to its owning chunk,
    /// each in `0..16`.
    #[must_use]
    #[inline]
    pub const fn chunk_local(&self) -> (u16, u16, u16) {
        (
            (self.x & CHUNK_MASK) as u16,
            (self.y & CHUNK_MASK) as u16,
            (self.z & CHUNK_MASK) as u16,
        )
    }

    /// The dense local index of this block within its chunk,
    /// `((y * 16 + z) * 16) + x`.
    #[must_use]
    #[inline]
    pub const fn local_index(&self) -> u16 {
        let (x, y, z) = self.chunk_local();
        (y * 16 + z) * 16 + x
    }

    /// Reconstructs a world position from a chunk position and a dense
    /// local index.
    #[must_use]
    #[inline]
    pub const fn from_local_index(chunk: ChunkPos, index: u16) -> Self {
        let x = (index % 16) as i32;
        let z = ((index / 16) % 16) as i32;
        let y = (index / 256) as i32;
        let origin = chunk.origin();
        Self::new(origin.x + x, origin.y + y, origin.z + z)
    }

    /// Packs the position into an `i64` key, 21 bits per axis.
    #[must_use]
    #[inline]
    pub const fn as_i64(&self) -> i64 {
        ((self.x as i64 & 0x1F_FFFF) << 42)
            | ((self.y as i64 & 0x1F_FFFF) << 21)
            | (self.z as i64 & 0x1F_FFFF)
    }

    /// Center of the block as a world-space point.
    #[must_use]
    pub fn as_dvec3(&self) -> DVec3 {
        DVec3::new(f64::from(self.x), f64::from(self.y), f64::from(self.z))
    }
}

impl std::fmt::Display for BlockPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}
