//! Optimistic block actions and their reconciliation with the
//! server's authoritative responses.

use rustc_hash::FxHashMap;
use vaste_protocol::ClientMessage;
use vaste_protocol::messages::BlockPatchEntry;
use vaste_utils::{BlockPos, ChunkPos};

use crate::processor::OutboundSink;
use crate::store::ClientChunkStore;

/// What a pending action did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// Placed a block optimistically.
    Place,
    /// Broke a block optimistically.
    Break,
}

/// An optimistic mutation awaiting the server's verdict.
#[derive(Debug, Clone)]
pub struct PendingAction {
    /// The id sent to the server.
    pub action_id: String,
    /// Place or break.
    pub kind: PendingKind,
    /// The mutated cell.
    pub pos: BlockPos,
    /// The cell's value before the optimistic apply, restored on
    /// rejection.
    pub previous: u16,
}

/// Tracks optimistic actions from issue to confirmation or rollback.
#[derive(Debug, Default)]
pub struct ActionTracker {
    pending: FxHashMap<String, PendingAction>,
    next_id: u64,
}

impl ActionTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unresolved actions.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Optimistically places a block: mutates the local world, bumps
    /// the chunk and face-neighbor versions, and sends the request.
    /// Returns the synthesized action id, or `None` when the cell is
    /// already occupied locally.
    pub fn place(
        &mut self,
        store: &mut ClientChunkStore,
        pos: BlockPos,
        block_type: u16,
        sink: &dyn OutboundSink,
    ) -> Option<String> {
        let previous = store.block_at(pos);
        if previous != 0 {
            return None;
        }
        let action_id = self.issue(store, PendingKind::Place, pos, previous, block_type);
        sink.send(&ClientMessage::PlaceBlock {
            x: pos.x,
            y: pos.y,
            z: pos.z,
            block_type: Some(block_type),
            action_id: action_id.clone(),
        });
        Some(action_id)
    }

    /// Optimistically breaks a block. Returns the synthesized action
    /// id, or `None` when the cell is already air locally.
    pub fn break_block(
        &mut self,
        store: &mut ClientChunkStore,
        pos: BlockPos,
        sink: &dyn OutboundSink,
    ) -> Option<String> {
        let previous = store.block_at(pos);
        if previous == 0 {
            return None;
        }
        let action_id = self.issue(store, PendingKind::Break, pos, previous, 0);
        sink.send(&ClientMessage::BreakBlock {
            x: pos.x,
            y: pos.y,
            z: pos.z,
            action_id: action_id.clone(),
        });
        Some(action_id)
    }

    fn issue(
        &mut self,
        store: &mut ClientChunkStore,
        kind: PendingKind,
        pos: BlockPos,
        previous: u16,
        new_value: u16,
    ) -> String {
        self.next_id += 1;
        let action_id = format!("a-{}", self.next_id);
        store.set_block(pos, new_value);
        store.bump_version_with_neighbors(ChunkPos::containing(pos));
        self.pending.insert(
            action_id.clone(),
            PendingAction {
                action_id: action_id.clone(),
                kind,
                pos,
                previous,
            },
        );
        action_id
    }

    /// Applies the server's `block_action_result`. A success just
    /// clears the pending entry (the broadcast patch reasserts the
    /// value); a failure rolls the cell back.
    pub fn on_result(&mut self, store: &mut ClientChunkStore, action_id: &str, success: bool) {
        let Some(action) = self.pending.remove(action_id) else {
            log::debug!("result for unknown action {action_id}");
            return;
        };
        if !success {
            store.set_block(action.pos, action.previous);
            store.bump_version_with_neighbors(ChunkPos::containing(action.pos));
        }
    }

    /// Applies an authoritative `block_patch`. Idempotent for the
    /// acting client: its optimistic value matches the patch.
    pub fn on_block_patch(&self, store: &mut ClientChunkStore, patches: &[BlockPatchEntry]) {
        for patch in patches {
            let pos = BlockPos::new(patch.x, patch.y, patch.z);
            if store.block_at(pos) != patch.block_type {
                store.set_block(pos, patch.block_type);
                store.bump_version_with_neighbors(ChunkPos::containing(pos));
            }
        }
    }
}
