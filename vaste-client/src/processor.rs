//! Ingestion of binary chunk frames: off-thread decode, version-gated
//! staging, and the coalesced apply tick.

use std::thread;

use crossbeam::channel::{Receiver, Sender, TryRecvError, unbounded};
use rustc_hash::FxHashMap;
use vaste_protocol::messages::ChunkAckKey;
use vaste_protocol::{ChunkFull, ClientMessage, decode_frame};
use vaste_utils::{BlockPos, ChunkPos};

use crate::seqs::SeqSet;
use crate::store::{BlockCell, ChunkMap, ClientChunkStore};

/// Where the processor sends its outbound JSON messages.
pub trait OutboundSink {
    /// Queues one message towards the server.
    fn send(&self, message: &ClientMessage);
}

/// Key/value persistence for client state, the browser-local-storage
/// contract. Only `applied_chunk_seqs` lives here today.
pub trait ClientPersistence {
    /// Reads a value.
    fn get(&self, key: &str) -> Option<String>;
    /// Writes a value.
    fn set(&self, key: &str, value: &str);
}

const APPLIED_SEQS_KEY: &str = "applied_chunk_seqs";

/// The decode worker: frames in, decoded chunk lists out.
///
/// Decoding runs on its own OS thread so a burst of tens of thousands
/// of voxels never stalls the render loop; malformed frames are logged
/// and dropped there.
struct DecodeWorker {
    jobs: Sender<Vec<u8>>,
    results: Receiver<Vec<ChunkFull>>,
}

impl DecodeWorker {
    fn spawn() -> Self {
        let (jobs, job_rx) = unbounded::<Vec<u8>>();
        let (result_tx, results) = unbounded();
        thread::Builder::new()
            .name("chunk-decode".to_string())
            .spawn(move || {
                while let Ok(frame) = job_rx.recv() {
                    match decode_frame(&frame) {
                        Ok(chunks) => {
                            if result_tx.send(chunks).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("dropping malformed chunk frame: {e}"),
                    }
                }
            })
            .expect("failed to spawn chunk-decode thread");
        Self { jobs, results }
    }
}

/// The result of one apply tick: which chunk versions moved, for the
/// mesh layer to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedUpdate {
    /// Chunks whose frames were applied this tick.
    pub applied: Vec<ChunkPos>,
}

/// Client-side chunk ingestion pipeline.
pub struct ChunkProcessor {
    store: ClientChunkStore,
    decode: DecodeWorker,
    last_applied: FxHashMap<ChunkPos, u32>,
    pending: FxHashMap<ChunkPos, (u32, ChunkMap)>,
    applied_seqs: SeqSet,
}

impl ChunkProcessor {
    /// Creates the pipeline, restoring the applied-seq set from
    /// persistence when present.
    #[must_use]
    pub fn new(persistence: Option<&dyn ClientPersistence>) -> Self {
        let applied_seqs = persistence
            .and_then(|p| p.get(APPLIED_SEQS_KEY))
            .and_then(|json| match serde_json::from_str(&json) {
                Ok(set) => Some(set),
                Err(e) => {
                    log::warn!("ignoring corrupt persisted {APPLIED_SEQS_KEY}: {e}");
                    None
                }
            })
            .unwrap_or_default();
        Self {
            store: ClientChunkStore::new(),
            decode: DecodeWorker::spawn(),
            last_applied: FxHashMap::default(),
            pending: FxHashMap::default(),
            applied_seqs: SeqSet::new(),
        }
        .with_seqs(applied_seqs)
    }

    fn with_seqs(mut self, applied_seqs: SeqSet) -> Self {
        self.applied_seqs = applied_seqs;
        self
    }

    /// The client's world view.
    #[must_use]
    pub fn store(&self) -> &ClientChunkStore {
        &self.store
    }

    /// Mutable world view, for the optimistic action layer.
    pub fn store_mut(&mut self) -> &mut ClientChunkStore {
        &mut self.store
    }

    /// Hands a received binary frame to the decode worker.
    pub fn on_binary_frame(&self, bytes: Vec<u8>) {
        if self.decode.jobs.send(bytes).is_err() {
            log::error!("chunk decode worker is gone");
        }
    }

    /// Drains decoded chunks into the pending stage, acking each
    /// frame. Returns whether an apply tick should be scheduled.
    pub fn poll_decoded(&mut self, sink: &dyn OutboundSink) -> bool {
        let mut staged = false;
        loop {
            match self.decode.results.try_recv() {
                Ok(chunks) => {
                    for chunk in chunks {
                        staged |= self.ingest(chunk, sink);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::error!("chunk decode worker is gone");
                    break;
                }
            }
        }
        staged || !self.pending.is_empty()
    }

    /// Stages one decoded chunk. Every frame is acked, duplicates
    /// included, so the server stops resending; only frames newer than
    /// the last applied version change state.
    fn ingest(&mut self, chunk: ChunkFull, sink: &dyn OutboundSink) -> bool {
        let key = ChunkAckKey {
            pos: chunk.pos,
            version: chunk.version,
            seq: chunk.seq,
        };
        sink.send(&ClientMessage::ChunkAck {
            chunk_key: key.to_string(),
            seq: chunk.seq,
        });
        self.applied_seqs.insert(chunk.seq);

        let last = self.last_applied.get(&chunk.pos).copied().unwrap_or(0);
        if chunk.version <= last {
            log::debug!(
                "dropping stale chunk {} v{} (applied v{last})",
                chunk.pos,
                chunk.version
            );
            return false;
        }
        if let Some((pending_version, _)) = self.pending.get(&chunk.pos)
            && chunk.version <= *pending_version
        {
            return false;
        }

        let mut map = ChunkMap::default();
        for &(index, block_type) in &chunk.entries {
            let pos = BlockPos::from_local_index(chunk.pos, index);
            map.insert(
                pos.as_i64(),
                BlockCell {
                    x: pos.x,
                    y: pos.y,
                    z: pos.z,
                    block_type,
                },
            );
        }
        self.pending.insert(chunk.pos, (chunk.version, map));
        true
    }

    /// The coalesced apply tick: swaps every pending chunk map in,
    /// bumps versions (self plus face neighbors), and reports the one
    /// state-change notification. Call once per animation frame when
    /// [`ChunkProcessor::poll_decoded`] asked for it.
    pub fn apply_pending(&mut self, persistence: Option<&dyn ClientPersistence>) -> Option<AppliedUpdate> {
        if self.pending.is_empty() {
            return None;
        }
        let mut applied = Vec::with_capacity(self.pending.len());
        for (pos, (version, map)) in std::mem::take(&mut self.pending) {
            self.store.replace_chunk(pos, map);
            self.store.bump_version_with_neighbors(pos);
            self.last_applied.insert(pos, version);
            applied.push(pos);
        }
        if let Some(persistence) = persistence
            && let Ok(json) = serde_json::to_string(&self.applied_seqs)
        {
            persistence.set(APPLIED_SEQS_KEY, &json);
        }
        Some(AppliedUpdate { applied })
    }

    /// The `chunk_have` manifest to send on `world_init`, if any
    /// frames were applied in a previous session.
    #[must_use]
    pub fn resume_manifest(&self) -> Option<ClientMessage> {
        if self.applied_seqs.is_empty() {
            return None;
        }
        let (seqs, ranges) = self.applied_seqs.manifest();
        Some(ClientMessage::ChunkHave { seqs, ranges })
    }

    /// Last applied version for a chunk; test support.
    #[must_use]
    pub fn last_applied(&self, pos: ChunkPos) -> u32 {
        self.last_applied.get(&pos).copied().unwrap_or(0)
    }
}
