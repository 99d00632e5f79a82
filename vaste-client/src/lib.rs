//! # Vaste Client
//!
//! The client half of the chunk pipeline: off-thread frame decoding,
//! versioned chunk application with coalesced update ticks, optimistic
//! block actions, face-culled meshing with throttled uploads, and
//! voxel raycasting.
//!
//! Everything here is transport-agnostic: binary frames come in as
//! byte buffers, outbound messages leave through [`OutboundSink`].

pub mod actions;
pub mod mesh;
pub mod processor;
pub mod raycast;
pub mod seqs;
pub mod store;

pub use actions::{ActionTracker, PendingAction};
pub use processor::{AppliedUpdate, ChunkProcessor, ClientPersistence, OutboundSink};
pub use raycast::{RaycastHit, raycast};
pub use seqs::SeqSet;
pub use store::{BlockCell, ClientChunkStore};
