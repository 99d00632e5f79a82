//! Per-session chunk delivery: send queue, outstanding window, acks,
//! retransmission and resumable state.
//!
//! The streamer is owned by its session's task; nothing here is shared.
//! Generation and serialization run elsewhere and report back through
//! the [`StreamerEvent`] channel the session task drains, so the
//! streamer itself never blocks on a pool.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use glam::DVec3;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::Instant;
use vaste_protocol::messages::{ChunkAckKey, SeqRange};
use vaste_protocol::{ChunkBatch, ChunkFull};
use vaste_utils::ChunkPos;

use crate::chunk::chunk_holder::ChunkHolder;
use crate::chunk::chunk_store::ChunkStore;
use crate::chunk::worker_pool::{SerializeJob, SerializePool, SerializedChunk};
use crate::player::PlayerSession;

/// Outstanding window size while the initial neighborhood streams.
const BULK_MAX_OUTSTANDING: usize = 32;
/// Outstanding window size after the initial neighborhood drained.
const STEADY_MAX_OUTSTANDING: usize = 128;
/// Default adaptive envelope target.
const DEFAULT_BATCH_TARGET: usize = 256 * 1024;
/// Lower bound of the adaptive envelope target.
const MIN_BATCH_TARGET: usize = 16 * 1024;
/// Upper bound of the adaptive envelope target.
const MAX_BATCH_TARGET: usize = 1024 * 1024;
/// Cap for the envelopes carrying the nearest chunks.
const NEAR_ENVELOPE_CAP: usize = 64 * 1024;
/// Base ack timeout before the first resend.
const CHUNK_ACK_TIMEOUT: Duration = Duration::from_millis(5000);
/// Ceiling of the exponential resend backoff.
const MAX_BACKOFF: Duration = Duration::from_millis(30_000);
/// Resends before an outstanding entry is dropped.
const MAX_RETRIES: u32 = 5;
/// How long a resumed session waits for the client's `chunk_have`.
const HAVE_GRACE: Duration = Duration::from_millis(2000);
/// Mean serialize time above which the envelope target shrinks.
const SLOW_SERIALIZE: Duration = Duration::from_millis(100);
/// Mean serialize time below which the envelope target grows.
const FAST_SERIALIZE: Duration = Duration::from_millis(20);

/// Suggested cadence for driving [`ChunkStreamer::tick`].
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// A sent-but-unacknowledged chunk frame.
#[derive(Debug, Clone)]
pub struct OutstandingEntry {
    /// The chunk the frame carries.
    pub pos: ChunkPos,
    /// The frame sequence number; resends reuse it.
    pub seq: u32,
    /// The chunk version baked into the frame.
    pub version: u32,
    /// The envelope bytes, shared with sibling entries from the same batch.
    pub buffer: Arc<[u8]>,
    /// When the frame was last handed to the socket.
    pub last_sent_at: Instant,
    /// Completed resends.
    pub retries: u32,
    /// Delay before the next resend.
    pub next_backoff: Duration,
}

/// One chunk inside a queued envelope.
#[derive(Debug, Clone, Copy)]
struct EnvelopeChunk {
    pos: ChunkPos,
    seq: u32,
    version: u32,
}

/// A ready-to-send binary frame and the chunks it carries.
#[derive(Debug, Clone)]
struct FrameEnvelope {
    buffer: Arc<[u8]>,
    chunks: Vec<EnvelopeChunk>,
}

/// Completions reported back to the session task.
#[derive(Debug)]
pub enum StreamerEvent {
    /// A generation group finished (or hit its deadline).
    Generated {
        /// Chunks now resident in the store.
        ready: Vec<Arc<ChunkHolder>>,
        /// Chunks whose generation failed; they may be re-requested on
        /// a later position update.
        failed: Vec<ChunkPos>,
    },
    /// A serialization group finished.
    Serialized(Vec<SerializedChunk>),
}

/// Resumable streamer state, persisted per user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamerSnapshot {
    /// Next frame sequence number, so a resumed session never reuses one.
    pub next_seq: u32,
    /// Frames that were in flight, as `(chunk, seq)`.
    pub outstanding: Vec<(ChunkPos, u32)>,
    /// Chunks that were queued but not yet sent.
    pub queued: Vec<ChunkPos>,
}

impl StreamerSnapshot {
    /// Whether there is anything to resume.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty() && self.queued.is_empty()
    }
}

/// The per-session chunk streamer.
pub struct ChunkStreamer {
    session: Arc<PlayerSession>,
    store: Arc<ChunkStore>,
    serialize: Arc<SerializePool>,
    events: UnboundedSender<StreamerEvent>,

    send_queue: VecDeque<FrameEnvelope>,
    outstanding: FxHashMap<ChunkPos, OutstandingEntry>,
    seq_index: FxHashMap<u32, ChunkPos>,
    loaded_chunks: FxHashMap<ChunkPos, Arc<ChunkHolder>>,
    pending_generation: FxHashSet<ChunkPos>,

    next_seq: u32,
    max_outstanding: usize,
    bulk: bool,
    batch_target_bytes: usize,
    awaiting_have: Option<Instant>,

    resume_seqs: FxHashMap<ChunkPos, u32>,
    resume_outstanding: FxHashSet<u32>,
    resume_queued: Vec<ChunkPos>,

    last_chunk_pos: ChunkPos,
    radius: i32,
    initial_wait: Duration,
}

impl ChunkStreamer {
    /// Creates the streamer and the event receiver its session task
    /// must drain into [`ChunkStreamer::handle_event`].
    ///
    /// With a prior snapshot the streamer starts in `awaiting_have`:
    /// nothing is sent until the client's `chunk_have` arrives or the
    /// grace timeout elapses on a tick.
    #[must_use]
    pub fn new(
        session: Arc<PlayerSession>,
        store: Arc<ChunkStore>,
        serialize: Arc<SerializePool>,
        radius: i32,
        initial_wait: Duration,
        resume: Option<StreamerSnapshot>,
    ) -> (Self, UnboundedReceiver<StreamerEvent>) {
        let (events, events_rx) = unbounded_channel();
        let mut streamer = Self {
            session,
            store,
            serialize,
            events,
            send_queue: VecDeque::new(),
            outstanding: FxHashMap::default(),
            seq_index: FxHashMap::default(),
            loaded_chunks: FxHashMap::default(),
            pending_generation: FxHashSet::default(),
            next_seq: 1,
            max_outstanding: BULK_MAX_OUTSTANDING,
            bulk: true,
            batch_target_bytes: DEFAULT_BATCH_TARGET,
            awaiting_have: None,
            resume_seqs: FxHashMap::default(),
            resume_outstanding: FxHashSet::default(),
            resume_queued: Vec::new(),
            last_chunk_pos: ChunkPos::new(0, 0, 0),
            radius: radius.clamp(1, 32),
            initial_wait,
        };
        if let Some(snapshot) = resume
            && !snapshot.is_empty()
        {
            streamer.next_seq = snapshot.next_seq.max(1);
            for (pos, seq) in snapshot.outstanding {
                streamer.resume_seqs.insert(pos, seq);
                streamer.resume_outstanding.insert(seq);
            }
            streamer.resume_queued = snapshot.queued;
            streamer.awaiting_have = Some(Instant::now() + HAVE_GRACE);
            // A resumed session is past its initial bulk load, and the
            // restored window may already be wider than the bulk bound.
            streamer.bulk = false;
            streamer.max_outstanding = STEADY_MAX_OUTSTANDING;
        }
        (streamer, events_rx)
    }

    /// Frames currently awaiting an ack.
    #[must_use]
    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Envelopes waiting behind the window.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.send_queue.len()
    }

    /// The current adaptive envelope target.
    #[must_use]
    pub fn batch_target_bytes(&self) -> usize {
        self.batch_target_bytes
    }

    /// The current window bound.
    #[must_use]
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    /// Kicks off streaming of the spawn neighborhood.
    pub fn on_authenticated(&mut self, position: DVec3) {
        self.session.set_position(position);
        self.last_chunk_pos = ChunkPos::containing_point(position);

        let mut desired: FxHashSet<ChunkPos> =
            self.last_chunk_pos.cube_around(self.radius).collect();
        desired.extend(self.resume_seqs.keys().copied());
        desired.extend(mem::take(&mut self.resume_queued));
        self.request_chunks(desired.into_iter().collect(), Some(self.initial_wait));
    }

    /// Streams newly visible chunks after a chunk-boundary crossing and
    /// forgets ones that left the radius.
    pub fn on_position_update(&mut self, position: DVec3) {
        self.session.set_position(position);
        let chunk = ChunkPos::containing_point(position);
        if chunk == self.last_chunk_pos {
            return;
        }
        self.last_chunk_pos = chunk;

        let desired: FxHashSet<ChunkPos> = chunk.cube_around(self.radius).collect();
        let newly: Vec<ChunkPos> = desired
            .iter()
            .filter(|pos| !self.loaded_chunks.contains_key(pos))
            .copied()
            .collect();

        let left: Vec<ChunkPos> = self
            .loaded_chunks
            .keys()
            .filter(|pos| !desired.contains(pos) && !self.outstanding.contains_key(pos))
            .copied()
            .collect();
        for pos in left {
            if let Some(holder) = self.loaded_chunks.remove(&pos) {
                holder.unpin();
            }
        }

        self.request_chunks(newly, None);
    }

    /// Handles a `chunk_ack`, removing the matching outstanding entry.
    ///
    /// The caller persists [`ChunkStreamer::snapshot`] afterwards.
    pub fn on_chunk_ack(&mut self, chunk_key: &str, seq: u32) {
        let Some(pos) = self.seq_index.remove(&seq) else {
            log::debug!(
                "session {}: ack for unknown seq {seq} (late or duplicate)",
                self.session.id
            );
            return;
        };
        if let Ok(key) = chunk_key.parse::<ChunkAckKey>()
            && key.pos != pos
        {
            log::warn!(
                "session {}: ack key {chunk_key} does not match seq {seq} ({pos})",
                self.session.id
            );
        }
        if self.outstanding.remove(&pos).is_some() {
            self.session.telemetry.acks.fetch_add(1, Ordering::Relaxed);
        }
        self.maybe_leave_bulk();
        self.pump();
    }

    /// Handles the client's resume manifest.
    pub fn on_chunk_have(&mut self, seqs: &[u32], ranges: &[SeqRange]) {
        let covered =
            |seq: u32| seqs.contains(&seq) || ranges.iter().any(|range| range.contains(seq));

        let pruned: Vec<ChunkPos> = self
            .outstanding
            .values()
            .filter(|entry| covered(entry.seq))
            .map(|entry| entry.pos)
            .collect();
        for pos in pruned {
            if let Some(entry) = self.outstanding.remove(&pos) {
                self.seq_index.remove(&entry.seq);
            }
        }
        // Frames still being re-serialized for resume are covered too.
        self.resume_outstanding.retain(|&seq| !covered(seq));

        self.awaiting_have = None;
        self.maybe_leave_bulk();
        self.pump();
    }

    /// Fixed-cadence maintenance: have-grace expiry and resends.
    pub fn tick(&mut self) {
        if let Some(deadline) = self.awaiting_have
            && Instant::now() >= deadline
        {
            self.awaiting_have = None;
            self.pump();
        }
        self.resend_overdue();
    }

    /// Applies a completion reported by a background task.
    pub fn handle_event(&mut self, event: StreamerEvent) {
        match event {
            StreamerEvent::Generated { ready, failed } => {
                for pos in failed {
                    self.pending_generation.remove(&pos);
                }
                self.accept_ready(ready);
            }
            StreamerEvent::Serialized(results) => self.handle_serialized(results),
        }
    }

    /// Captures resumable state.
    #[must_use]
    pub fn snapshot(&self) -> StreamerSnapshot {
        let mut outstanding: Vec<(ChunkPos, u32)> = self
            .outstanding
            .values()
            .map(|entry| (entry.pos, entry.seq))
            .collect();
        outstanding.extend(self.resume_seqs.iter().map(|(&pos, &seq)| (pos, seq)));
        let queued = self
            .send_queue
            .iter()
            .flat_map(|envelope| envelope.chunks.iter().map(|chunk| chunk.pos))
            .collect();
        StreamerSnapshot {
            next_seq: self.next_seq,
            outstanding,
            queued,
        }
    }

    /// Releases every chunk pin. Called when the session tears down.
    pub fn shutdown(&mut self) {
        for (_, holder) in self.loaded_chunks.drain() {
            holder.unpin();
        }
        log::info!(
            "session {} streamer closed: {}",
            self.session.id,
            self.session.telemetry.summary()
        );
    }

    fn in_radius(&self, pos: ChunkPos) -> bool {
        let dx = (pos.x - self.last_chunk_pos.x).abs();
        let dy = (pos.y - self.last_chunk_pos.y).abs();
        let dz = (pos.z - self.last_chunk_pos.z).abs();
        dx.max(dy).max(dz) <= self.radius
    }

    /// Spawns a task ensuring `positions`. With a deadline, whatever is
    /// ready by then reports as one group (for dense batching) and the
    /// stragglers trickle in afterwards; without one, the whole group
    /// reports together.
    fn request_chunks(&mut self, positions: Vec<ChunkPos>, wait: Option<Duration>) {
        let positions: Vec<ChunkPos> = positions
            .into_iter()
            .filter(|pos| {
                !self.pending_generation.contains(pos) && !self.loaded_chunks.contains_key(pos)
            })
            .collect();
        if positions.is_empty() {
            return;
        }
        self.pending_generation.extend(positions.iter().copied());

        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut ensures: FuturesUnordered<_> = positions
                .into_iter()
                .map(|pos| {
                    let store = Arc::clone(&store);
                    async move { (pos, store.ensure(pos).await) }
                })
                .collect();

            let deadline = wait.map(|wait| Instant::now() + wait);
            let mut ready = Vec::new();
            let mut failed = Vec::new();
            loop {
                let next = match deadline {
                    Some(deadline) => {
                        match tokio::time::timeout_at(deadline, ensures.next()).await {
                            Ok(next) => next,
                            Err(_) => break,
                        }
                    }
                    None => ensures.next().await,
                };
                match next {
                    Some((_, Ok(holder))) => ready.push(holder),
                    Some((pos, Err(_))) => failed.push(pos),
                    None => break,
                }
            }
            if !ready.is_empty() || !failed.is_empty() {
                let _ = events.send(StreamerEvent::Generated { ready, failed });
            }

            // Past the deadline: report stragglers as they land.
            while let Some((pos, result)) = ensures.next().await {
                let event = match result {
                    Ok(holder) => StreamerEvent::Generated {
                        ready: vec![holder],
                        failed: Vec::new(),
                    },
                    Err(_) => StreamerEvent::Generated {
                        ready: Vec::new(),
                        failed: vec![pos],
                    },
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        });
    }

    /// Pins freshly generated chunks and schedules their serialization.
    fn accept_ready(&mut self, holders: Vec<Arc<ChunkHolder>>) {
        let mut receivers = Vec::new();
        for holder in holders {
            let pos = holder.pos();
            self.pending_generation.remove(&pos);
            if self.loaded_chunks.contains_key(&pos) {
                continue;
            }
            // A chunk that left the radius while generating is only
            // kept when a resume still owes its frame.
            if !self.in_radius(pos) && !self.resume_seqs.contains_key(&pos) {
                continue;
            }
            holder.pin();
            self.loaded_chunks.insert(pos, holder.clone());

            // All-air chunks carry nothing worth a frame; mutations
            // reach the client through block patches instead.
            let data = holder.snapshot();
            if data.is_empty() && !self.resume_seqs.contains_key(&pos) {
                continue;
            }

            let seq = self.resume_seqs.remove(&pos).unwrap_or_else(|| {
                let seq = self.next_seq;
                self.next_seq += 1;
                seq
            });
            receivers.push(self.serialize.submit(SerializeJob { pos, seq, data }));
        }
        if receivers.is_empty() {
            return;
        }

        let events = self.events.clone();
        tokio::spawn(async move {
            let mut results = Vec::with_capacity(receivers.len());
            for receiver in receivers {
                match receiver.await {
                    Ok(chunk) => results.push(chunk),
                    Err(_) => log::warn!("chunk serialization failed, skipping chunk"),
                }
            }
            let _ = events.send(StreamerEvent::Serialized(results));
        });
    }

    /// Batches a serialized group into envelopes and advances the queue.
    fn handle_serialized(&mut self, results: Vec<SerializedChunk>) {
        if results.is_empty() {
            return;
        }
        let mean_elapsed = results
            .iter()
            .map(|chunk| chunk.elapsed)
            .sum::<Duration>()
            / results.len() as u32;
        log::debug!(
            "session {}: serialized {} chunks, mean {:?}",
            self.session.id,
            results.len(),
            mean_elapsed
        );

        let now = Instant::now();
        let mut fresh = Vec::new();
        for chunk in results {
            if self.resume_outstanding.remove(&chunk.seq) {
                // Was in flight before the reconnect: back into the
                // window with its original seq, resent on timeout.
                let entry = OutstandingEntry {
                    pos: chunk.pos,
                    seq: chunk.seq,
                    version: chunk.version,
                    buffer: chunk.bytes.into(),
                    last_sent_at: now,
                    retries: 0,
                    next_backoff: CHUNK_ACK_TIMEOUT,
                };
                self.seq_index.insert(entry.seq, entry.pos);
                self.outstanding.insert(entry.pos, entry);
            } else if !self.outstanding.contains_key(&chunk.pos) {
                fresh.push(chunk);
            }
        }

        let envelopes = self.build_envelopes(fresh);
        self.send_queue.extend(envelopes);
        self.pump();
        self.tune_batch_target(mean_elapsed);
    }

    /// Greedy distance-sorted batching under the adaptive byte target.
    ///
    /// The budget tracks payload bytes; the nearest 15% ship under a
    /// reduced cap for first-frame latency, and an envelope never holds
    /// more chunks than the window admits at once.
    fn build_envelopes(&mut self, mut chunks: Vec<SerializedChunk>) -> Vec<FrameEnvelope> {
        if chunks.is_empty() {
            return Vec::new();
        }
        let player = self.session.position();
        chunks.sort_by(|a, b| {
            a.pos
                .distance_squared_to(player)
                .total_cmp(&b.pos.distance_squared_to(player))
        });

        let near_count = (chunks.len() * 15).div_ceil(100);
        let near_cap = (self.batch_target_bytes / 4).min(NEAR_ENVELOPE_CAP);

        let mut envelopes = Vec::new();
        let mut group: Vec<SerializedChunk> = Vec::new();
        let mut group_bytes = 0usize;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let cap = if index < near_count {
                near_cap
            } else {
                self.batch_target_bytes
            };
            let closes_near_section = index == near_count;
            if !group.is_empty()
                && (closes_near_section
                    || group_bytes + chunk.bytes.len() > cap
                    || group.len() >= self.max_outstanding)
            {
                envelopes.push(Self::make_envelope(mem::take(&mut group)));
                group_bytes = 0;
            }
            group_bytes += chunk.bytes.len();
            group.push(chunk);
            if group_bytes > cap {
                // A single chunk above the cap ships alone.
                envelopes.push(Self::make_envelope(mem::take(&mut group)));
                group_bytes = 0;
            }
        }
        if !group.is_empty() {
            envelopes.push(Self::make_envelope(group));
        }
        envelopes
    }

    fn make_envelope(group: Vec<SerializedChunk>) -> FrameEnvelope {
        let chunks: Vec<EnvelopeChunk> = group
            .iter()
            .map(|chunk| EnvelopeChunk {
                pos: chunk.pos,
                seq: chunk.seq,
                version: chunk.version,
            })
            .collect();
        let buffer: Arc<[u8]> = if group.len() == 1 {
            group.into_iter().next().map_or_else(
                || unreachable!("envelope group checked non-empty"),
                |chunk| chunk.bytes.into(),
            )
        } else {
            let payloads: Vec<&[u8]> = group.iter().map(|chunk| chunk.bytes.as_slice()).collect();
            ChunkBatch::encode(&payloads).into()
        };
        FrameEnvelope { buffer, chunks }
    }

    fn tune_batch_target(&mut self, mean_elapsed: Duration) {
        let before = self.batch_target_bytes;
        if mean_elapsed > SLOW_SERIALIZE {
            self.batch_target_bytes =
                ((self.batch_target_bytes as f64 * 0.7) as usize).max(MIN_BATCH_TARGET);
        } else if mean_elapsed < FAST_SERIALIZE {
            self.batch_target_bytes =
                ((self.batch_target_bytes as f64 * 1.15) as usize).min(MAX_BATCH_TARGET);
        }
        if self.outstanding.len() >= self.max_outstanding {
            self.batch_target_bytes =
                ((self.batch_target_bytes as f64 * 0.8) as usize).max(MIN_BATCH_TARGET);
        }
        if self.batch_target_bytes != before {
            log::debug!(
                "session {}: batch target {} -> {}",
                self.session.id,
                before,
                self.batch_target_bytes
            );
        }
    }

    /// Sends queued envelopes while the window has room.
    ///
    /// A failed write puts the envelope back at the front and moves
    /// nothing into the window.
    fn pump(&mut self) {
        if self.awaiting_have.is_some() {
            return;
        }
        while self.outstanding.len() < self.max_outstanding {
            let Some(envelope) = self.send_queue.pop_front() else {
                break;
            };
            if self.outstanding.len() + envelope.chunks.len() > self.max_outstanding {
                self.send_queue.push_front(envelope);
                break;
            }
            if self
                .session
                .connection()
                .send_binary(envelope.buffer.clone())
                .is_err()
            {
                self.send_queue.push_front(envelope);
                break;
            }
            let now = Instant::now();
            self.session
                .telemetry
                .frames_sent
                .fetch_add(envelope.chunks.len() as u64, Ordering::Relaxed);
            for chunk in &envelope.chunks {
                self.seq_index.insert(chunk.seq, chunk.pos);
                self.outstanding.insert(
                    chunk.pos,
                    OutstandingEntry {
                        pos: chunk.pos,
                        seq: chunk.seq,
                        version: chunk.version,
                        buffer: envelope.buffer.clone(),
                        last_sent_at: now,
                        retries: 0,
                        next_backoff: CHUNK_ACK_TIMEOUT,
                    },
                );
            }
        }
    }

    fn resend_overdue(&mut self) {
        let now = Instant::now();
        let due: Vec<ChunkPos> = self
            .outstanding
            .values()
            .filter(|entry| now.duration_since(entry.last_sent_at) >= entry.next_backoff)
            .map(|entry| entry.pos)
            .collect();
        if due.is_empty() {
            return;
        }

        let mut exhausted = Vec::new();
        let mut resend: Vec<ChunkPos> = Vec::new();
        for pos in due {
            let Some(entry) = self.outstanding.get(&pos) else {
                continue;
            };
            if entry.retries >= MAX_RETRIES {
                exhausted.push(pos);
            } else {
                resend.push(pos);
            }
        }

        for pos in exhausted {
            if let Some(entry) = self.outstanding.remove(&pos) {
                self.seq_index.remove(&entry.seq);
                self.session.telemetry.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "session {}: dropping chunk {pos} seq {} after {MAX_RETRIES} retries",
                    self.session.id,
                    entry.seq
                );
            }
        }

        // Entries that shared an envelope share its buffer; resend each
        // buffer once and advance every entry it carries.
        let mut sent_buffers: Vec<*const u8> = Vec::new();
        for pos in resend {
            let Some(entry) = self.outstanding.get(&pos) else {
                continue;
            };
            let buffer = entry.buffer.clone();
            let ptr = buffer.as_ptr();
            if !sent_buffers.contains(&ptr) {
                if self.session.connection().send_binary(buffer).is_err() {
                    // Leave the entry untouched; next tick retries.
                    continue;
                }
                sent_buffers.push(ptr);
                self.session
                    .telemetry
                    .frames_sent
                    .fetch_add(1, Ordering::Relaxed);
            }
            if let Some(entry) = self.outstanding.get_mut(&pos) {
                entry.retries += 1;
                entry.last_sent_at = now;
                entry.next_backoff = (entry.next_backoff * 2).min(MAX_BACKOFF);
                self.session.telemetry.resends.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.pump();
    }

    fn maybe_leave_bulk(&mut self) {
        if self.bulk && self.outstanding.is_empty() && self.send_queue.is_empty() {
            self.bulk = false;
            self.max_outstanding = STEADY_MAX_OUTSTANDING;
        }
    }
}

/// Decodes the chunks an envelope buffer carries; test helper shared
/// with the integration suite.
#[must_use]
pub fn decode_envelope(bytes: &[u8]) -> Vec<ChunkFull> {
    vaste_protocol::decode_frame(bytes).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_data::ChunkData;
    use crate::chunk::generator::{EmptyGenerator, GeneratorKind};
    use crate::chunk::worker_pool::GenerationPool;
    use crate::player::RecordingConnection;
    use uuid::Uuid;

    fn test_session(connection: Arc<RecordingConnection>) -> Arc<PlayerSession> {
        Arc::new(PlayerSession::new(
            1,
            "u-1".to_string(),
            Uuid::nil(),
            "tester".to_string(),
            DVec3::ZERO,
            connection,
        ))
    }

    fn test_streamer() -> (ChunkStreamer, Arc<RecordingConnection>) {
        let connection = Arc::new(RecordingConnection::new());
        let session = test_session(connection.clone());
        let store = Arc::new(ChunkStore::new(
            GenerationPool::new(1, GeneratorKind::from(EmptyGenerator)),
            1024,
        ));
        let serialize = Arc::new(SerializePool::new(1));
        let (streamer, _rx) = ChunkStreamer::new(
            session,
            store,
            serialize,
            2,
            Duration::from_millis(1200),
            None,
        );
        (streamer, connection)
    }

    fn serialized(pos: ChunkPos, seq: u32, payload_len: usize) -> SerializedChunk {
        // A frame whose encoded length is exactly `payload_len`
        // (header is 23 bytes, each entry 4).
        let entries = (payload_len - 23) / 4;
        let mut blocks: crate::chunk::ChunkBlocks = Box::new([0; vaste_utils::CHUNK_VOLUME]);
        for slot in blocks.iter_mut().take(entries) {
            *slot = 1;
        }
        let bytes = ChunkData::from_blocks(1, blocks).to_frame(pos, seq).encode();
        assert_eq!(bytes.len(), payload_len);
        SerializedChunk {
            pos,
            seq,
            version: 1,
            bytes,
            elapsed: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn adaptive_batching_splits_at_target() {
        // 64 chunks of ~8 KiB against the 256 KiB default target:
        // near 15% (10 chunks) in 64 KiB envelopes (8 chunks each),
        // the remaining 54 in two target-bound envelopes of 32 and 22.
        let (mut streamer, connection) = test_streamer();
        let chunks: Vec<SerializedChunk> = (0..64)
            .map(|i| serialized(ChunkPos::new(i, 0, 0), (i + 1) as u32, 8191))
            .collect();

        let envelopes = streamer.build_envelopes(chunks);
        let sizes: Vec<usize> = envelopes.iter().map(|e| e.chunks.len()).collect();
        assert_eq!(sizes, vec![8, 2, 32, 22]);

        for envelope in &envelopes {
            let payload: usize = decode_envelope(&envelope.buffer)
                .iter()
                .map(ChunkFull::encoded_len)
                .sum();
            assert!(payload <= streamer.batch_target_bytes || envelope.chunks.len() == 1);
        }
        drop(connection);
    }

    #[tokio::test]
    async fn oversized_chunk_ships_alone() {
        let (mut streamer, _connection) = test_streamer();
        streamer.batch_target_bytes = MIN_BATCH_TARGET;
        let big = serialized(ChunkPos::new(0, 0, 0), 1, 23 + 4096 * 4);
        let small = serialized(ChunkPos::new(1, 0, 0), 2, 23 + 4);

        let envelopes = streamer.build_envelopes(vec![big, small]);
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].chunks.len(), 1);
    }

    #[tokio::test]
    async fn window_bounds_outstanding() {
        let (mut streamer, connection) = test_streamer();
        // 40 tiny chunks; bulk window is 32.
        let chunks: Vec<SerializedChunk> = (0..40)
            .map(|i| serialized(ChunkPos::new(i, 0, 0), (i + 1) as u32, 27))
            .collect();
        streamer.handle_serialized(chunks);

        assert!(streamer.outstanding_len() <= BULK_MAX_OUTSTANDING);
        assert!(streamer.queue_len() > 0);

        // Acking everything in flight lets the queue drain.
        let in_flight: Vec<(u32, ChunkPos)> = streamer
            .outstanding
            .values()
            .map(|e| (e.seq, e.pos))
            .collect();
        for (seq, pos) in in_flight {
            let key = ChunkAckKey {
                pos,
                version: 1,
                seq,
            };
            streamer.on_chunk_ack(&key.to_string(), seq);
        }
        assert!(streamer.outstanding_len() <= BULK_MAX_OUTSTANDING);
        assert!(connection.binary_frames().len() >= 2);
    }

    #[tokio::test]
    async fn failed_write_requeues_envelope() {
        let (mut streamer, connection) = test_streamer();
        connection.fail_sends.store(true, Ordering::Relaxed);
        streamer.handle_serialized(vec![serialized(ChunkPos::new(0, 0, 0), 1, 27)]);

        assert_eq!(streamer.outstanding_len(), 0);
        assert_eq!(streamer.queue_len(), 1);

        connection.fail_sends.store(false, Ordering::Relaxed);
        streamer.pump();
        assert_eq!(streamer.outstanding_len(), 1);
        assert_eq!(streamer.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resend_backs_off_and_drops() {
        let (mut streamer, connection) = test_streamer();
        streamer.handle_serialized(vec![serialized(ChunkPos::new(0, 0, 0), 7, 27)]);
        assert_eq!(connection.binary_frames().len(), 1);

        // First resend at the 5 s ack timeout, backoff doubles to 10 s.
        tokio::time::advance(Duration::from_millis(5000)).await;
        streamer.tick();
        assert_eq!(connection.binary_frames().len(), 2);
        let entry = streamer.outstanding.values().next().expect("outstanding");
        assert_eq!(entry.retries, 1);
        assert_eq!(entry.next_backoff, Duration::from_millis(10_000));
        assert_eq!(entry.seq, 7, "resend reuses the seq");
        let frames = connection.binary_frames();
        assert_eq!(frames[0], frames[1], "identical buffer resent");

        // Exhaust the remaining retries; backoff caps at 30 s.
        for _ in 0..4 {
            tokio::time::advance(Duration::from_millis(30_000)).await;
            streamer.tick();
        }
        let entry = streamer.outstanding.values().next().expect("outstanding");
        assert_eq!(entry.retries, 5);
        assert_eq!(entry.next_backoff, Duration::from_millis(30_000));

        tokio::time::advance(Duration::from_millis(30_000)).await;
        streamer.tick();
        assert_eq!(streamer.outstanding_len(), 0);
        assert_eq!(
            streamer
                .session
                .telemetry
                .dropped
                .load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn ack_clears_window_and_leaves_bulk() {
        let (mut streamer, _connection) = test_streamer();
        streamer.handle_serialized(vec![serialized(ChunkPos::new(0, 0, 0), 1, 27)]);
        assert_eq!(streamer.outstanding_len(), 1);
        assert_eq!(streamer.max_outstanding(), BULK_MAX_OUTSTANDING);

        streamer.on_chunk_ack("0,0,0:1:1", 1);
        assert_eq!(streamer.outstanding_len(), 0);
        assert_eq!(streamer.max_outstanding(), STEADY_MAX_OUTSTANDING);
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_have_prunes_and_releases_sending() {
        let connection = Arc::new(RecordingConnection::new());
        let session = test_session(connection.clone());
        let store = Arc::new(ChunkStore::new(
            GenerationPool::new(1, GeneratorKind::from(EmptyGenerator)),
            1024,
        ));
        let serialize = Arc::new(SerializePool::new(1));
        let snapshot = StreamerSnapshot {
            next_seq: 10,
            outstanding: vec![(ChunkPos::new(0, 0, 0), 3), (ChunkPos::new(1, 0, 0), 4)],
            queued: vec![],
        };
        let (mut streamer, _rx) = ChunkStreamer::new(
            session,
            store,
            serialize,
            2,
            Duration::from_millis(1200),
            Some(snapshot),
        );
        assert!(streamer.awaiting_have.is_some());

        // Queued frames hold until the manifest arrives.
        streamer.handle_serialized(vec![serialized(ChunkPos::new(2, 0, 0), 10, 27)]);
        assert_eq!(connection.binary_frames().len(), 0);
        assert_eq!(streamer.queue_len(), 1);

        streamer.on_chunk_have(&[], &[SeqRange { from: 3, to: 4 }]);
        assert!(streamer.awaiting_have.is_none());
        assert!(streamer.resume_outstanding.is_empty());
        assert_eq!(connection.binary_frames().len(), 1);
    }
}
