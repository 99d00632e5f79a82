//! # Vaste Protocol
//!
//! The wire layer shared by the server and client: the binary chunk
//! frame codec, the JSON message set, and the protocol error type.
//!
//! Text frames carry JSON messages ([`messages`]); binary frames carry
//! `CHUNK_FULL` or `CHUNK_BATCH` frames ([`chunk_codec`]).

pub mod chunk_codec;
pub mod error;
pub mod messages;
pub mod ser;

pub use chunk_codec::{ChunkBatch, ChunkFull, decode_frame};
pub use error::ProtocolError;
pub use messages::{ChunkAckKey, ClientMessage, SeqRange, ServerMessage};
