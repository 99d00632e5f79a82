//! The network edge: the account service client and the per-socket
//! WebSocket state machine.

pub mod account;
pub mod ws_client;
