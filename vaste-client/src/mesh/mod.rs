//! Off-thread chunk meshing and throttled geometry uploads.

pub mod builder;
pub mod mesher;
pub mod upload;

pub use builder::{MeshBuilder, MeshResult, MeshScheduler};
pub use mesher::{AtlasMeta, AtlasTile, ChunkMesh, MaterialKey, MeshInput, MeshPart, NeighborFaces, build_chunk_mesh};
pub use upload::{IndexData, MAX_UPLOADS_PER_FRAME, UploadQueue, select_indices};
