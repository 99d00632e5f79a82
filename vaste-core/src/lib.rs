//! # Vaste Core
//!
//! The authoritative world half of the Vaste server: chunk storage with
//! generation offload, the per-session chunk streamer, block actions
//! and session broadcasts.

pub mod chunk;
pub mod config;
pub mod player;
pub mod server;
