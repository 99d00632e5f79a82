//! Chunk data, storage, generation and serialization offload.

pub mod chunk_data;
pub mod chunk_holder;
pub mod chunk_store;
pub mod generator;
pub mod worker_pool;

pub use chunk_data::{ChunkBlocks, ChunkData};
pub use chunk_holder::ChunkHolder;
pub use chunk_store::{BlockChange, ChunkStore, StoreError};
pub use generator::{GeneratorKind, WorldGenerator};
pub use worker_pool::{GenerationPool, SerializePool, SerializedChunk, WorkerPool};
