//! Chunk coordinates, identifiers and snapshots

use glam::{IVec3, Vec3};
use rkyv::{Archive, Deserialize, Serialize};

use crate::core::types::Result;
use crate::math::morton::{MortonKey, encode_morton_3d};
use crate::voxel::encoding::{self, ChunkType};
use crate::voxel::material::MaterialId;

/// Blocks per chunk edge
pub const CHUNK_SIDE: usize = 16;

/// Blocks per chunk (16³)
pub const CHUNK_VOLUME: usize = CHUNK_SIDE * CHUNK_SIDE * CHUNK_SIDE;

/// Highest pool index a chunk id can carry (the top bit of a packed node id
/// is the chunk/octree discriminator).
pub const MAX_RESIDENT_BUFFERS: usize = 0x7fff;

/// Index of a block inside a chunk, x fastest, then y, then z.
pub fn block_index(x: usize, y: usize, z: usize) -> usize {
    debug_assert!(x < CHUNK_SIDE && y < CHUNK_SIDE && z < CHUNK_SIDE);
    x + y * CHUNK_SIDE + z * CHUNK_SIDE * CHUNK_SIDE
}

/// Inverse of [`block_index`].
pub fn block_position(index: usize) -> (usize, usize, usize) {
    (
        index % CHUNK_SIDE,
        (index / CHUNK_SIDE) % CHUNK_SIDE,
        index / (CHUNK_SIDE * CHUNK_SIDE),
    )
}

/// Integer coordinate identifying a chunk in the world grid
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkCoord {
    /// Create a new chunk coordinate
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Convert world position to chunk coordinate
    pub fn from_world_pos(pos: Vec3, chunk_world_size: f32) -> Self {
        Self {
            x: (pos.x / chunk_world_size).floor() as i32,
            y: (pos.y / chunk_world_size).floor() as i32,
            z: (pos.z / chunk_world_size).floor() as i32,
        }
    }

    /// Get the world-space origin (minimum corner) of this chunk
    pub fn world_origin(&self, chunk_world_size: f32) -> Vec3 {
        self.as_ivec3().as_vec3() * chunk_world_size
    }

    /// World-space center of this chunk
    pub fn world_center(&self, chunk_world_size: f32) -> Vec3 {
        self.world_origin(chunk_world_size) + Vec3::splat(chunk_world_size * 0.5)
    }

    pub fn as_ivec3(&self) -> IVec3 {
        IVec3::new(self.x, self.y, self.z)
    }

    /// Buffer region containing this chunk and the slot it occupies there.
    pub fn buffer_location(&self, buffer_side: u32) -> (BufferKey, u16) {
        let side = buffer_side as i32;
        let region = self.as_ivec3().div_euclid(IVec3::splat(side));
        let local = self.as_ivec3().rem_euclid(IVec3::splat(side));
        let slot = encode_morton_3d(local.x as u32, local.y as u32, local.z as u32) as u16;
        (BufferKey::from_region(region), slot)
    }
}

impl From<IVec3> for ChunkCoord {
    fn from(v: IVec3) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

/// Identifies the buffer region a chunk belongs to; the persistence key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferKey(pub u64);

impl BufferKey {
    /// Region coordinates beyond ±2²⁰ are clamped; chunks that far out are
    /// already past the deepest supported octree.
    pub fn from_region(region: IVec3) -> Self {
        let bound = crate::math::morton::SIGNED_BIAS - 1;
        let clamped = region.clamp(IVec3::splat(-bound), IVec3::splat(bound));
        let key = MortonKey::encode_signed(clamped.x, clamped.y, clamped.z)
            .unwrap_or_default();
        Self(key.raw())
    }

    pub fn region(&self) -> IVec3 {
        let (x, y, z) = MortonKey(self.0).decode_signed();
        IVec3::new(x, y, z)
    }
}

impl std::fmt::Display for BufferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Stable handle to a resident chunk: buffer pool index plus slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Archive, Deserialize, Serialize)]
pub struct ChunkId {
    pub pool: u16,
    pub slot: u16,
}

impl ChunkId {
    pub fn new(pool: u16, slot: u16) -> Self {
        debug_assert!((pool as usize) <= MAX_RESIDENT_BUFFERS);
        Self { pool, slot }
    }

    pub fn pack(self) -> u32 {
        ((self.pool as u32) << 16) | self.slot as u32
    }

    pub fn unpack(raw: u32) -> Self {
        Self {
            pool: ((raw >> 16) & 0x7fff) as u16,
            slot: (raw & 0xffff) as u16,
        }
    }
}

/// Owned copy of one chunk's compressed data, handed to listeners and readers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkSnapshot {
    pub id: ChunkId,
    pub coord: ChunkCoord,
    pub encoding: ChunkType,
    pub payload: Vec<u8>,
}

impl ChunkSnapshot {
    /// Decode the full block sequence.
    pub fn blocks(&self) -> Result<Vec<MaterialId>> {
        encoding::decode(self.encoding, &self.payload, CHUNK_VOLUME)
    }

    /// Material at a local block position.
    pub fn material_at(&self, x: usize, y: usize, z: usize) -> Result<MaterialId> {
        encoding::material_at(self.encoding, &self.payload, block_index(x, y, z))
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_world_pos() {
        let cs = 16.0;
        assert_eq!(ChunkCoord::from_world_pos(Vec3::new(8.0, 8.0, 8.0), cs), ChunkCoord::new(0, 0, 0));
        assert_eq!(ChunkCoord::from_world_pos(Vec3::new(16.0, 0.0, 0.0), cs), ChunkCoord::new(1, 0, 0));

        // Negative coordinates
        let coord = ChunkCoord::from_world_pos(Vec3::new(-10.0, -20.0, -33.0), cs);
        assert_eq!(coord, ChunkCoord::new(-1, -2, -3));
    }

    #[test]
    fn test_world_origin_round_trip() {
        let original = ChunkCoord::new(5, -3, 10);
        let recovered = ChunkCoord::from_world_pos(original.world_center(16.0), 16.0);
        assert_eq!(original, recovered);
    }

    #[test]
    fn test_block_index_order() {
        assert_eq!(block_index(1, 0, 0), 1);
        assert_eq!(block_index(0, 1, 0), CHUNK_SIDE);
        assert_eq!(block_index(0, 0, 1), CHUNK_SIDE * CHUNK_SIDE);
        for i in [0, 17, 300, CHUNK_VOLUME - 1] {
            let (x, y, z) = block_position(i);
            assert_eq!(block_index(x, y, z), i);
        }
    }

    #[test]
    fn test_buffer_location() {
        let (key_a, slot_a) = ChunkCoord::new(0, 0, 0).buffer_location(4);
        let (key_b, slot_b) = ChunkCoord::new(3, 3, 3).buffer_location(4);
        let (key_c, slot_c) = ChunkCoord::new(-1, 0, 0).buffer_location(4);

        assert_eq!(key_a, key_b);
        assert_ne!(key_a, key_c);
        assert_eq!(slot_a, 0);
        assert_eq!(slot_b, 63);
        // -1 lands in the last column of region -1: local (3, 0, 0)
        assert_eq!(slot_c, 9);
        assert_eq!(key_c.region(), IVec3::new(-1, 0, 0));
    }

    #[test]
    fn test_chunk_id_pack() {
        let id = ChunkId::new(0x1234, 0x0fed);
        assert_eq!(ChunkId::unpack(id.pack()), id);
        assert_eq!(id.pack() & 0x8000_0000, 0);
    }
}
