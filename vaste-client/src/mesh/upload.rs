//! GPU upload throttling and mounted-geometry bookkeeping.
//!
//! Finished meshes queue FIFO and at most [`MAX_UPLOADS_PER_FRAME`]
//! mount per frame. Mounting replaces the previous geometry
//! atomically; the replaced geometry is disposed one frame later so
//! the chunk is never blank for a frame.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use vaste_utils::ChunkPos;

use crate::mesh::builder::MeshResult;
use crate::mesh::mesher::ChunkMesh;

/// Geometries mounted per animation frame.
pub const MAX_UPLOADS_PER_FRAME: usize = 5;

/// Index data in the narrowest format the runtime supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexData {
    /// 32-bit element indices.
    U32(Vec<u32>),
    /// 16-bit element indices; all indices fit.
    U16(Vec<u16>),
    /// The runtime supports neither; vertices must be expanded into a
    /// non-indexed stream in this order.
    NonIndexed(Vec<u32>),
}

/// Picks the index format: u32 when the runtime exposes 32-bit element
/// indices, else u16 when the maximum index fits, else a non-indexed
/// expansion order.
#[must_use]
pub fn select_indices(indices: &[u32], supports_u32: bool) -> IndexData {
    if supports_u32 {
        return IndexData::U32(indices.to_vec());
    }
    if indices.iter().all(|&index| index <= u32::from(u16::MAX)) {
        return IndexData::U16(indices.iter().map(|&index| index as u16).collect());
    }
    IndexData::NonIndexed(indices.to_vec())
}

/// A mounted chunk geometry.
#[derive(Debug, Clone)]
pub struct MountedGeometry {
    /// The chunk version the geometry reflects.
    pub version: u32,
    /// The geometry, shared with the renderer.
    pub mesh: Arc<ChunkMesh>,
    /// True for the placeholder mounted by a cancelled job when
    /// nothing else was there.
    pub empty_sentinel: bool,
}

/// The FIFO upload queue and the mounted-geometry table.
pub struct UploadQueue {
    queue: VecDeque<MeshResult>,
    mounted: FxHashMap<ChunkPos, MountedGeometry>,
    disposal: Vec<(u64, Arc<ChunkMesh>)>,
    disposed_total: u64,
    frame: u64,
}

impl UploadQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            mounted: FxHashMap::default(),
            disposal: Vec::new(),
            disposed_total: 0,
            frame: 0,
        }
    }

    /// Queues one finished mesh job.
    pub fn enqueue(&mut self, result: MeshResult) {
        self.queue.push_back(result);
    }

    /// Jobs still waiting to mount.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    /// The mounted geometry for a chunk.
    #[must_use]
    pub fn mounted(&self, pos: ChunkPos) -> Option<&MountedGeometry> {
        self.mounted.get(&pos)
    }

    /// Geometries disposed since creation; test support.
    #[must_use]
    pub fn disposed_total(&self) -> u64 {
        self.disposed_total
    }

    /// Unmounts a chunk (left render distance); its geometry is
    /// disposed on the next frame like any replacement.
    pub fn unmount(&mut self, pos: ChunkPos) {
        if let Some(old) = self.mounted.remove(&pos) {
            self.disposal.push((self.frame + 1, old.mesh));
        }
    }

    /// One animation frame: dispose yesterday's replaced geometries,
    /// then mount up to [`MAX_UPLOADS_PER_FRAME`] queued results.
    pub fn drain_frame(&mut self) {
        self.frame += 1;
        let frame = self.frame;
        let before = self.disposal.len();
        self.disposal.retain(|(due, _)| *due > frame);
        self.disposed_total += (before - self.disposal.len()) as u64;

        for _ in 0..MAX_UPLOADS_PER_FRAME {
            let Some(result) = self.queue.pop_front() else {
                break;
            };
            match result {
                MeshResult::Built(mesh) => self.mount(mesh),
                MeshResult::Cancelled { pos, .. } => {
                    // A cancelled job never overwrites a mounted
                    // geometry; it only fills a hole with a sentinel.
                    if !self.mounted.contains_key(&pos) {
                        self.mounted.insert(
                            pos,
                            MountedGeometry {
                                version: 0,
                                mesh: Arc::new(ChunkMesh {
                                    pos,
                                    version: 0,
                                    parts: Vec::new(),
                                }),
                                empty_sentinel: true,
                            },
                        );
                    }
                }
            }
        }
    }

    fn mount(&mut self, mesh: ChunkMesh) {
        let pos = mesh.pos;
        if let Some(current) = self.mounted.get(&pos)
            && !current.empty_sentinel
            && current.version >= mesh.version
        {
            // Stale result: a newer geometry is already mounted.
            return;
        }
        let replaced = self.mounted.insert(
            pos,
            MountedGeometry {
                version: mesh.version,
                mesh: Arc::new(mesh),
                empty_sentinel: false,
            },
        );
        if let Some(old) = replaced
            && !old.empty_sentinel
        {
            self.disposal.push((self.frame + 1, old.mesh));
        }
    }
}

impl Default for UploadQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::mesher::{MaterialKey, MeshPart};

    fn mesh(pos: ChunkPos, version: u32, quads: usize) -> ChunkMesh {
        let mut part = MeshPart::default();
        for quad in 0..quads {
            let base = (quad * 4) as u32;
            for corner in 0..4 {
                part.positions.push([corner as f32, 0.0, 0.0]);
                part.normals.push([0.0, 1.0, 0.0]);
                part.uvs.push([0.0, 0.0]);
            }
            part.indices
                .extend([base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        ChunkMesh {
            pos,
            version,
            parts: vec![(MaterialKey::BlockType(1), part)],
        }
    }

    #[test]
    fn uploads_are_throttled_per_frame() {
        let mut queue = UploadQueue::new();
        for i in 0..12 {
            queue.enqueue(MeshResult::Built(mesh(ChunkPos::new(i, 0, 0), 1, 1)));
        }

        queue.drain_frame();
        assert_eq!(queue.backlog(), 7);
        queue.drain_frame();
        assert_eq!(queue.backlog(), 2);
        queue.drain_frame();
        assert_eq!(queue.backlog(), 0);
        assert!(queue.mounted(ChunkPos::new(11, 0, 0)).is_some());
    }

    #[test]
    fn replacement_disposes_one_frame_later() {
        let mut queue = UploadQueue::new();
        let pos = ChunkPos::new(0, 0, 0);
        queue.enqueue(MeshResult::Built(mesh(pos, 1, 1)));
        queue.drain_frame();
        assert_eq!(queue.disposed_total(), 0);

        queue.enqueue(MeshResult::Built(mesh(pos, 2, 2)));
        queue.drain_frame();
        // Replaced this frame; the old geometry lives one more frame.
        assert_eq!(queue.mounted(pos).map(|m| m.version), Some(2));
        assert_eq!(queue.disposed_total(), 0);

        queue.drain_frame();
        assert_eq!(queue.disposed_total(), 1);
    }

    #[test]
    fn stale_results_never_replace_newer_geometry() {
        let mut queue = UploadQueue::new();
        let pos = ChunkPos::new(0, 0, 0);
        queue.enqueue(MeshResult::Built(mesh(pos, 3, 2)));
        queue.drain_frame();

        queue.enqueue(MeshResult::Built(mesh(pos, 2, 1)));
        queue.drain_frame();
        let mounted = queue.mounted(pos).expect("mounted");
        assert_eq!(mounted.version, 3);
        assert_eq!(mounted.mesh.quad_count(), 2);
    }

    #[test]
    fn cancelled_jobs_only_fill_holes() {
        let mut queue = UploadQueue::new();
        let pos = ChunkPos::new(0, 0, 0);

        queue.enqueue(MeshResult::Cancelled { pos, version: 1 });
        queue.drain_frame();
        let mounted = queue.mounted(pos).expect("sentinel mounted");
        assert!(mounted.empty_sentinel);

        // A real build replaces the sentinel without a disposal delay
        // entry for it.
        queue.enqueue(MeshResult::Built(mesh(pos, 2, 1)));
        queue.drain_frame();
        assert!(!queue.mounted(pos).expect("mounted").empty_sentinel);

        // A later cancelled job does not overwrite the real geometry.
        queue.enqueue(MeshResult::Cancelled { pos, version: 3 });
        queue.drain_frame();
        assert_eq!(queue.mounted(pos).map(|m| m.version), Some(2));
    }

    #[test]
    fn index_format_selection() {
        let small = [0u32, 1, 2, 0, 2, 3];
        assert_eq!(
            select_indices(&small, true),
            IndexData::U32(small.to_vec())
        );
        assert_eq!(
            select_indices(&small, false),
            IndexData::U16(vec![0, 1, 2, 0, 2, 3])
        );

        let large = [0u32, 70_000, 2];
        assert_eq!(
            select_indices(&large, false),
            IndexData::NonIndexed(large.to_vec())
        );
    }
}
