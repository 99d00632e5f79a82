//! Face-culled chunk meshing.
//!
//! A mesh job gets an owned snapshot of its chunk plus the boundary
//! planes of the six face-adjacent chunks, so workers never read
//! shared state. Voxels are centered on integer coordinates; each
//! visible face contributes one quad of two triangles.

use rustc_hash::FxHashMap;
use vaste_utils::{BlockPos, CHUNK_SIZE, CHUNK_VOLUME, ChunkPos, Direction};

/// The material a mesh part renders with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialKey {
    /// All block types share the texture atlas.
    Atlas,
    /// One material per block type (no atlas available).
    BlockType(u16),
}

/// A tile rectangle inside the atlas, in normalized UV space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtlasTile {
    /// Left edge.
    pub u0: f32,
    /// Bottom edge.
    pub v0: f32,
    /// Right edge.
    pub u1: f32,
    /// Top edge.
    pub v1: f32,
}

/// Atlas layout handed into mesh jobs.
#[derive(Debug, Clone, Default)]
pub struct AtlasMeta {
    tiles: FxHashMap<u16, AtlasTile>,
}

impl AtlasMeta {
    /// Creates an atlas description from per-block-type tiles.
    #[must_use]
    pub fn new(tiles: FxHashMap<u16, AtlasTile>) -> Self {
        Self { tiles }
    }

    /// The tile for a block type, falling back to the whole texture.
    #[must_use]
    pub fn tile(&self, block_type: u16) -> AtlasTile {
        self.tiles.get(&block_type).copied().unwrap_or(AtlasTile {
            u0: 0.0,
            v0: 0.0,
            u1: 1.0,
            v1: 1.0,
        })
    }
}

/// Boundary planes of the six face-adjacent chunks.
///
/// Plane `planes[dir]` holds the 16x16 layer of the neighbor chunk
/// that touches this chunk's `dir` face; `None` means the neighbor is
/// not known yet and its side counts as outside the known world.
#[derive(Debug, Clone, Default)]
pub struct NeighborFaces {
    planes: [Option<Box<[u16; 256]>>; 6],
}

impl NeighborFaces {
    /// Sets the plane for one direction.
    pub fn set(&mut self, dir: Direction, plane: Box<[u16; 256]>) {
        self.planes[dir.index()] = Some(plane);
    }

    /// The neighbor cell touching local cell `(x, y, z)` across the
    /// `dir` face. `None` when the neighbor chunk is unknown.
    #[must_use]
    pub fn cell(&self, dir: Direction, x: i32, y: i32, z: i32) -> Option<u16> {
        let plane = self.planes[dir.index()].as_deref()?;
        // Planes are indexed by the two in-plane axes.
        let (a, b) = match dir {
            Direction::Down | Direction::Up => (x, z),
            Direction::North | Direction::South => (x, y),
            Direction::West | Direction::East => (z, y),
        };
        Some(plane[(b * CHUNK_SIZE + a) as usize])
    }
}

/// An owned meshing snapshot.
pub struct MeshInput {
    /// The chunk position.
    pub pos: ChunkPos,
    /// The chunk version this snapshot captures; stale results are
    /// discarded on upload.
    pub version: u32,
    /// Dense voxels.
    pub blocks: Box<[u16; CHUNK_VOLUME]>,
    /// Neighbor boundary planes.
    pub neighbors: NeighborFaces,
}

/// Geometry for one material.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshPart {
    /// Vertex positions in world space.
    pub positions: Vec<[f32; 3]>,
    /// Per-vertex normals.
    pub normals: Vec<[f32; 3]>,
    /// Per-vertex texture coordinates.
    pub uvs: Vec<[f32; 2]>,
    /// Triangle indices, two per face quad.
    pub indices: Vec<u32>,
}

impl MeshPart {
    /// Number of face quads in the part.
    #[must_use]
    pub fn quad_count(&self) -> usize {
        self.positions.len() / 4
    }
}

/// A built chunk mesh.
#[derive(Debug, Clone)]
pub struct ChunkMesh {
    /// The chunk position.
    pub pos: ChunkPos,
    /// The chunk version the mesh reflects.
    pub version: u32,
    /// Geometry grouped by material.
    pub parts: Vec<(MaterialKey, MeshPart)>,
}

impl ChunkMesh {
    /// Whether the mesh has no geometry at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|(_, part)| part.positions.is_empty())
    }

    /// Total quads across parts.
    #[must_use]
    pub fn quad_count(&self) -> usize {
        self.parts.iter().map(|(_, part)| part.quad_count()).sum()
    }
}

/// Corner offsets (±0.5 around the voxel center) and unit UVs for each
/// face direction, counter-clockwise seen from outside. Top/bottom
/// faces map UVs from (x, z), ±X faces from z, ±Z faces from x, with
/// the u axis flipped on negative normals so texture orientation stays
/// consistent.
fn face_quad(dir: Direction) -> [([f32; 3], [f32; 2]); 4] {
    const N: f32 = -0.5;
    const P: f32 = 0.5;
    match dir {
        Direction::Up => [
            ([N, P, N], [0.0, 0.0]),
            ([N, P, P], [0.0, 1.0]),
            ([P, P, P], [1.0, 1.0]),
            ([P, P, N], [1.0, 0.0]),
        ],
        Direction::Down => [
            ([N, N, N], [1.0, 0.0]),
            ([P, N, N], [0.0, 0.0]),
            ([P, N, P], [0.0, 1.0]),
            ([N, N, P], [1.0, 1.0]),
        ],
        Direction::East => [
            ([P, N, P], [0.0, 0.0]),
            ([P, N, N], [1.0, 0.0]),
            ([P, P, N], [1.0, 1.0]),
            ([P, P, P], [0.0, 1.0]),
        ],
        Direction::West => [
            ([N, N, N], [0.0, 0.0]),
            ([N, N, P], [1.0, 0.0]),
            ([N, P, P], [1.0, 1.0]),
            ([N, P, N], [0.0, 1.0]),
        ],
        Direction::South => [
            ([N, N, P], [0.0, 0.0]),
            ([P, N, P], [1.0, 0.0]),
            ([P, P, P], [1.0, 1.0]),
            ([N, P, P], [0.0, 1.0]),
        ],
        Direction::North => [
            ([P, N, N], [0.0, 0.0]),
            ([N, N, N], [1.0, 0.0]),
            ([N, P, N], [1.0, 1.0]),
            ([P, P, N], [0.0, 1.0]),
        ],
    }
}

fn local_block(blocks: &[u16; CHUNK_VOLUME], x: i32, y: i32, z: i32) -> u16 {
    blocks[((y * CHUNK_SIZE + z) * CHUNK_SIZE + x) as usize]
}

/// Whether the face towards `dir` from local cell `(x, y, z)` is
/// visible: the adjacent cell is air or outside the known world.
fn face_visible(input: &MeshInput, x: i32, y: i32, z: i32, dir: Direction) -> bool {
    let (dx, dy, dz) = dir.offset();
    let (nx, ny, nz) = (x + dx, y + dy, z + dz);
    if (0..CHUNK_SIZE).contains(&nx)
        && (0..CHUNK_SIZE).contains(&ny)
        && (0..CHUNK_SIZE).contains(&nz)
    {
        return local_block(&input.blocks, nx, ny, nz) == 0;
    }
    match input.neighbors.cell(dir, x, y, z) {
        Some(block) => block == 0,
        None => true,
    }
}

/// Builds the face-culled mesh for one chunk snapshot.
#[must_use]
pub fn build_chunk_mesh(input: &MeshInput, atlas: Option<&AtlasMeta>) -> ChunkMesh {
    let mut parts: FxHashMap<MaterialKey, MeshPart> = FxHashMap::default();
    let origin = input.pos.origin();

    for y in 0..CHUNK_SIZE {
        for z in 0..CHUNK_SIZE {
            for x in 0..CHUNK_SIZE {
                let block = local_block(&input.blocks, x, y, z);
                if block == 0 {
                    continue;
                }
                let center = BlockPos::new(origin.x + x, origin.y + y, origin.z + z);
                for dir in Direction::ALL {
                    if !face_visible(input, x, y, z, dir) {
                        continue;
                    }
                    let material = match atlas {
                        Some(_) => MaterialKey::Atlas,
                        None => MaterialKey::BlockType(block),
                    };
                    let part = parts.entry(material).or_default();
                    let base = part.positions.len() as u32;
                    let normal = dir.normal();
                    for (offset, uv) in face_quad(dir) {
                        part.positions.push([
                            center.x as f32 + offset[0],
                            center.y as f32 + offset[1],
                            center.z as f32 + offset[2],
                        ]);
                        part.normals.push(normal);
                        let uv = match atlas {
                            Some(atlas) => {
                                let tile = atlas.tile(block);
                                [
                                    tile.u0 + uv[0] * (tile.u1 - tile.u0),
                                    tile.v0 + uv[1] * (tile.v1 - tile.v0),
                                ]
                            }
                            None => uv,
                        };
                        part.uvs.push(uv);
                    }
                    part.indices
                        .extend([base, base + 1, base + 2, base, base + 2, base + 3]);
                }
            }
        }
    }

    let mut parts: Vec<(MaterialKey, MeshPart)> = parts.into_iter().collect();
    parts.sort_by_key(|(material, _)| match material {
        MaterialKey::Atlas => 0,
        MaterialKey::BlockType(block) => i32::from(*block),
    });
    ChunkMesh {
        pos: input.pos,
        version: input.version,
        parts,
    }
}
