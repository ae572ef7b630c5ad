//! Morton encoding (Z-order curve) for octree addressing

/// Bits per axis that fit in a 64-bit key
pub const MAX_DEPTH: u8 = 21;

/// Largest coordinate accepted on each axis
pub const MAX_COORD: u32 = (1 << MAX_DEPTH) - 1;

/// Offset applied to signed coordinates before encoding
pub const SIGNED_BIAS: i32 = 1 << (MAX_DEPTH - 1);

/// Spread bits of a 21-bit integer into every third bit of a 64-bit integer
fn spread_bits(x: u32) -> u64 {
    let mut x = x as u64 & 0x1fffff; // 21 bits max
    x = (x | (x << 32)) & 0x1f00000000ffff;
    x = (x | (x << 16)) & 0x1f0000ff0000ff;
    x = (x | (x << 8)) & 0x100f00f00f00f00f;
    x = (x | (x << 4)) & 0x10c30c30c30c30c3;
    x = (x | (x << 2)) & 0x1249249249249249;
    x
}

/// Compact every third bit of a 64-bit integer into a 21-bit integer
fn compact_bits(x: u64) -> u32 {
    let mut x = x & 0x1249249249249249;
    x = (x | (x >> 2)) & 0x10c30c30c30c30c3;
    x = (x | (x >> 4)) & 0x100f00f00f00f00f;
    x = (x | (x >> 8)) & 0x1f0000ff0000ff;
    x = (x | (x >> 16)) & 0x1f00000000ffff;
    x = (x | (x >> 32)) & 0x1fffff;
    x as u32
}

/// Encode 3D coordinates into Morton code (Z-order curve)
/// Each coordinate can be up to 21 bits (0..=MAX_COORD); higher bits are dropped.
pub fn encode_morton_3d(x: u32, y: u32, z: u32) -> u64 {
    spread_bits(x) | (spread_bits(y) << 1) | (spread_bits(z) << 2)
}

/// Decode Morton code back to 3D coordinates
pub fn decode_morton_3d(code: u64) -> (u32, u32, u32) {
    (
        compact_bits(code),
        compact_bits(code >> 1),
        compact_bits(code >> 2),
    )
}

/// Bit-interleaved octree address.
///
/// The low three bits select the octant at the deepest level, the next three
/// the octant one level up, and so on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MortonKey(pub u64);

impl MortonKey {
    /// Encode in-range coordinates. Coordinates above `MAX_COORD` are a
    /// contract violation; use [`MortonKey::encode_checked`] when unsure.
    pub fn encode(x: u32, y: u32, z: u32) -> Self {
        debug_assert!(x <= MAX_COORD && y <= MAX_COORD && z <= MAX_COORD);
        Self(encode_morton_3d(x, y, z))
    }

    pub fn encode_checked(x: u32, y: u32, z: u32) -> Option<Self> {
        if x > MAX_COORD || y > MAX_COORD || z > MAX_COORD {
            return None;
        }
        Some(Self(encode_morton_3d(x, y, z)))
    }

    /// Encode signed coordinates by shifting them into the unsigned range.
    pub fn encode_signed(x: i32, y: i32, z: i32) -> Option<Self> {
        let shift = |v: i32| -> Option<u32> {
            let shifted = v.checked_add(SIGNED_BIAS)?;
            u32::try_from(shifted).ok()
        };
        Self::encode_checked(shift(x)?, shift(y)?, shift(z)?)
    }

    pub fn decode(self) -> (u32, u32, u32) {
        decode_morton_3d(self.0)
    }

    /// Inverse of [`MortonKey::encode_signed`].
    pub fn decode_signed(self) -> (i32, i32, i32) {
        let (x, y, z) = self.decode();
        (
            x as i32 - SIGNED_BIAS,
            y as i32 - SIGNED_BIAS,
            z as i32 - SIGNED_BIAS,
        )
    }

    /// Octant (0..8) selected at `level` counted from the leaves (0 = deepest).
    pub fn octant_at(self, level: u8) -> u8 {
        ((self.0 >> (3 * level as u32)) & 0b111) as u8
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Octant index for a child offset; bit 0 = x, bit 1 = y, bit 2 = z.
pub fn octant_index(x: u32, y: u32, z: u32) -> u8 {
    ((x & 1) | ((y & 1) << 1) | ((z & 1) << 2)) as u8
}
