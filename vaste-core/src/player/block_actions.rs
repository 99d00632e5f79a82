//! Authoritative place/break handling.

use std::sync::Arc;

use thiserror::Error;
use vaste_protocol::messages::BlockPatchEntry;
use vaste_protocol::ServerMessage;
use vaste_utils::BlockPos;

use crate::chunk::chunk_store::StoreError;
use crate::player::PlayerSession;
use crate::server::Server;

/// Coordinates further out than this are rejected outright.
const MAX_ACTION_COORDINATE: i32 = 10_000;
/// Broadcast radius for block patches, in blocks.
const PATCH_BROADCAST_RADIUS: f64 = 128.0;
/// Block type placed when the client does not name one.
const DEFAULT_PLACED_BLOCK: u16 = 1;

/// The two authoritative block actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Place a block into an air cell.
    Place,
    /// Break a non-air cell.
    Break,
}

/// Why a block action was refused. The wire reason string is
/// [`ActionError::reason`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// A coordinate exceeded the world's sanity bounds.
    #[error("coordinate out of bounds")]
    OutOfBounds,
    /// Place targeted a non-air cell.
    #[error("cell occupied")]
    Occupied,
    /// Break targeted an air cell.
    #[error("cell is air")]
    Air,
    /// The owning chunk could not be loaded.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ActionError {
    /// The reason string reported in `block_action_result`.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::OutOfBounds => "out_of_bounds",
            Self::Occupied => "occupied",
            Self::Air => "air",
            Self::Store(_) => "world_unavailable",
        }
    }
}

/// Validates and commits one block action, then reports to the actor
/// and broadcasts the authoritative patch to nearby sessions.
///
/// The mutation itself runs on the world task; the precondition (air
/// for place, non-air for break) is checked there too, so two racing
/// actions on the same cell serialize correctly.
pub async fn handle_block_action(
    server: &Arc<Server>,
    session: &Arc<PlayerSession>,
    kind: ActionKind,
    pos: BlockPos,
    block_type: Option<u16>,
    action_id: String,
) {
    let result = commit(server, kind, pos, block_type).await;
    match result {
        Ok(block) => {
            session.send(&ServerMessage::BlockActionResult {
                action_id: action_id.clone(),
                success: true,
                reason: None,
                x: Some(pos.x),
                y: Some(pos.y),
                z: Some(pos.z),
            });
            server.broadcast_nearby(
                pos.as_dvec3(),
                PATCH_BROADCAST_RADIUS,
                &ServerMessage::BlockPatch {
                    patches: vec![BlockPatchEntry {
                        x: pos.x,
                        y: pos.y,
                        z: pos.z,
                        block_type: block,
                        action_id: Some(action_id),
                    }],
                },
            );
        }
        Err(error) => {
            log::debug!(
                "session {}: {kind:?} at {pos} refused: {error}",
                session.id
            );
            session.send(&ServerMessage::BlockActionResult {
                action_id,
                success: false,
                reason: Some(error.reason().to_string()),
                x: None,
                y: None,
                z: None,
            });
        }
    }
}

async fn commit(
    server: &Arc<Server>,
    kind: ActionKind,
    pos: BlockPos,
    block_type: Option<u16>,
) -> Result<u16, ActionError> {
    // unsigned_abs: i32::MIN from the wire must reject, not overflow.
    if pos.x.unsigned_abs() > MAX_ACTION_COORDINATE as u32
        || pos.y.unsigned_abs() > MAX_ACTION_COORDINATE as u32
        || pos.z.unsigned_abs() > MAX_ACTION_COORDINATE as u32
    {
        return Err(ActionError::OutOfBounds);
    }
    let block = match kind {
        ActionKind::Place => block_type.unwrap_or(DEFAULT_PLACED_BLOCK),
        ActionKind::Break => 0,
    };
    let change = server.world().apply(kind, pos, block).await?;
    Ok(change.new)
}
