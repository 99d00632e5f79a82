//! # Vaste Utils
//!
//! Shared primitives for the Vaste voxel server and client: chunk and
//! block positions, local index math, face directions and lock aliases.

pub mod direction;
pub mod locks;
pub mod types;

pub use direction::Direction;
pub use types::{BlockPos, CHUNK_SIZE, CHUNK_VOLUME, ChunkPos};
