//! Fixed-size OS-thread worker pools for generation and serialization.
//!
//! Jobs are dispatched round-robin over per-worker channels and resolve
//! through oneshot futures, so async callers can await results without
//! tying up the runtime. Workers are pure functions over their input.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Sender, unbounded};
use tokio::sync::oneshot;
use vaste_utils::ChunkPos;

use crate::chunk::chunk_data::{ChunkBlocks, ChunkData};
use crate::chunk::generator::{GeneratorKind, WorldGenerator};

/// Default worker count for both pools.
#[must_use]
pub fn default_pool_size() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get().saturating_sub(2).max(1))
}

/// A fixed set of worker threads running one job function.
pub struct WorkerPool<J, R> {
    senders: Vec<Sender<(J, oneshot::Sender<R>)>>,
    next: AtomicUsize,
}

impl<J: Send + 'static, R: Send + 'static> WorkerPool<J, R> {
    /// Spawns `size` named worker threads running `run`.
    #[must_use]
    pub fn new<F>(name: &str, size: usize, run: F) -> Self
    where
        F: Fn(J) -> R + Send + Sync + 'static,
    {
        let run = Arc::new(run);
        let mut senders = Vec::with_capacity(size);
        for index in 0..size {
            let (tx, rx) = unbounded::<(J, oneshot::Sender<R>)>();
            let run = Arc::clone(&run);
            let thread_name = format!("{name}-{index}");
            thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    // Exits when the pool (and with it every sender) drops.
                    while let Ok((job, reply)) = rx.recv() {
                        let _ = reply.send(run(job));
                    }
                })
                .unwrap_or_else(|e| panic!("failed to spawn {thread_name}: {e}"));
            senders.push(tx);
        }
        Self {
            senders,
            next: AtomicUsize::new(0),
        }
    }

    /// Number of workers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.senders.len()
    }

    /// Dispatches a job to the next worker round-robin.
    ///
    /// The receiver resolves with the result, or with a recv error if
    /// the job panicked the worker.
    pub fn submit(&self, job: J) -> oneshot::Receiver<R> {
        let (tx, rx) = oneshot::channel();
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        if self.senders[index].send((job, tx)).is_err() {
            log::error!("worker pool channel closed, dropping job");
        }
        rx
    }
}

/// Pool producing chunk voxel arrays from the world generator.
pub struct GenerationPool {
    pool: WorkerPool<ChunkPos, ChunkBlocks>,
}

impl GenerationPool {
    /// Spawns the generation workers around a configured generator.
    #[must_use]
    pub fn new(size: usize, generator: GeneratorKind) -> Self {
        Self::with_generator(size, generator)
    }

    /// Spawns the generation workers around any generator
    /// implementation.
    #[must_use]
    pub fn with_generator<G: WorldGenerator + 'static>(size: usize, generator: G) -> Self {
        let generator = Arc::new(generator);
        Self {
            pool: WorkerPool::new("chunk-gen", size, move |pos| generator.generate(pos)),
        }
    }

    /// Generates the chunk at `pos`.
    pub fn submit(&self, pos: ChunkPos) -> oneshot::Receiver<ChunkBlocks> {
        self.pool.submit(pos)
    }
}

/// An encoded `CHUNK_FULL` frame plus the timing the adaptive batcher
/// feeds on.
#[derive(Debug)]
pub struct SerializedChunk {
    /// The chunk position.
    pub pos: ChunkPos,
    /// The frame sequence number baked into the bytes.
    pub seq: u32,
    /// The chunk version baked into the bytes.
    pub version: u32,
    /// The encoded `CHUNK_FULL` frame.
    pub bytes: Vec<u8>,
    /// Time the encode took on the worker.
    pub elapsed: Duration,
}

/// A serialization request: an owned chunk snapshot plus its assigned seq.
pub struct SerializeJob {
    /// The chunk position.
    pub pos: ChunkPos,
    /// The frame sequence number to bake into the frame.
    pub seq: u32,
    /// The snapshot to encode.
    pub data: Arc<ChunkData>,
}

/// Pool encoding chunk snapshots to `CHUNK_FULL` bytes.
pub struct SerializePool {
    pool: WorkerPool<SerializeJob, SerializedChunk>,
}

impl SerializePool {
    /// Spawns the serialization workers.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            pool: WorkerPool::new("chunk-ser", size, |job: SerializeJob| {
                let start = Instant::now();
                let bytes = job.data.to_frame(job.pos, job.seq).encode();
                SerializedChunk {
                    pos: job.pos,
                    seq: job.seq,
                    version: job.data.version(),
                    bytes,
                    elapsed: start.elapsed(),
                }
            }),
        }
    }

    /// Encodes one chunk snapshot.
    pub fn submit(&self, job: SerializeJob) -> oneshot::Receiver<SerializedChunk> {
        self.pool.submit(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_robin_distributes_jobs() {
        let pool = WorkerPool::new("test", 3, |n: usize| {
            (n, thread::current().name().map(String::from))
        });
        let mut names = Vec::new();
        for n in 0..3 {
            let (echo, name) = pool.submit(n).await.expect("worker alive");
            assert_eq!(echo, n);
            names.push(name.expect("named thread"));
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3);
    }

    #[tokio::test]
    async fn serialize_pool_bakes_seq_and_version() {
        let pool = SerializePool::new(1);
        let data = Arc::new(ChunkData::empty(1).with_block(136, 1, 1));
        let result = pool
            .submit(SerializeJob {
                pos: ChunkPos::new(0, 0, 0),
                seq: 9,
                data,
            })
            .await
            .expect("worker alive");

        let frame = vaste_protocol::ChunkFull::decode(&result.bytes).expect("valid frame");
        assert_eq!(frame.seq, 9);
        assert_eq!(frame.version, 1);
        assert_eq!(frame.entries, vec![(136, 1)]);
    }

    #[tokio::test]
    async fn generation_pool_runs_generator() {
        let pool = GenerationPool::new(2, GeneratorKind::from(crate::chunk::generator::EmptyGenerator));
        let blocks = pool.submit(ChunkPos::new(1, 2, 3)).await.expect("worker alive");
        assert!(blocks.iter().all(|&b| b == 0));
    }
}
