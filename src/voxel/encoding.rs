//! Compressed chunk encodings
//!
//! Every chunk is stored in exactly one of five formats. The writer picks
//! the smallest exact representation:
//!
//! | id | name         | layout                                   |
//! |----|--------------|------------------------------------------|
//! | 0  | RLE_2_2      | runs of (count: u16, material: u16)      |
//! | 1  | EMPTY        | no payload, every block is empty         |
//! | 2  | UNCOMPRESSED | one u16 material per block               |
//! | 3  | RLE_3_1      | runs of (count: u24, material: u8)       |
//! | 4  | RLE_1_1      | runs of (count: u8, material: u8)        |
//!
//! All fields are little-endian. Runs longer than a format's maximum count
//! are split across several records.

use rayon::prelude::*;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::voxel::material::{EMPTY_MATERIAL, MaterialId};

/// Encoding id stored in buffer headers
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Rle22 = 0,
    Empty = 1,
    Uncompressed = 2,
    Rle31 = 3,
    Rle11 = 4,
}

impl ChunkType {
    pub const ALL: [ChunkType; 5] = [
        ChunkType::Rle22,
        ChunkType::Empty,
        ChunkType::Uncompressed,
        ChunkType::Rle31,
        ChunkType::Rle11,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            ChunkType::Rle22 => "RLE_2_2",
            ChunkType::Empty => "EMPTY",
            ChunkType::Uncompressed => "UNCOMPRESSED",
            ChunkType::Rle31 => "RLE_3_1",
            ChunkType::Rle11 => "RLE_1_1",
        }
    }

    /// Record layout for the run-length formats.
    fn rle_layout(self) -> Option<RleLayout> {
        match self {
            ChunkType::Rle22 => Some(RleLayout { count_bytes: 2, id_bytes: 2 }),
            ChunkType::Rle31 => Some(RleLayout { count_bytes: 3, id_bytes: 1 }),
            ChunkType::Rle11 => Some(RleLayout { count_bytes: 1, id_bytes: 1 }),
            ChunkType::Empty | ChunkType::Uncompressed => None,
        }
    }
}

impl TryFrom<u8> for ChunkType {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        ChunkType::ALL
            .into_iter()
            .find(|t| t.id() == id)
            .ok_or_else(|| Error::MalformedEncoding {
                encoding: id,
                reason: "unknown encoding id".into(),
            })
    }
}

impl std::fmt::Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug)]
struct RleLayout {
    count_bytes: usize,
    id_bytes: usize,
}

impl RleLayout {
    fn record_bytes(self) -> usize {
        self.count_bytes + self.id_bytes
    }

    fn max_count(self) -> u32 {
        ((1u64 << (8 * self.count_bytes)) - 1) as u32
    }

    fn max_id(self) -> u32 {
        ((1u64 << (8 * self.id_bytes)) - 1) as u32
    }
}

/// Formats tried for run-length encoding, in tie-break order.
const RLE_CANDIDATES: [ChunkType; 3] = [ChunkType::Rle11, ChunkType::Rle31, ChunkType::Rle22];

/// One chunk in its chosen encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedChunk {
    pub kind: ChunkType,
    pub data: Vec<u8>,
}

impl EncodedChunk {
    pub fn empty() -> Self {
        Self { kind: ChunkType::Empty, data: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Collapse a block sequence into (count, material) runs.
fn runs(blocks: &[MaterialId]) -> Vec<(u32, MaterialId)> {
    let mut runs: Vec<(u32, MaterialId)> = Vec::new();
    for &block in blocks {
        match runs.last_mut() {
            Some((count, id)) if *id == block => *count += 1,
            _ => runs.push((1, block)),
        }
    }
    runs
}

/// Payload size of `runs` in an RLE format, or `None` when some material id
/// does not fit.
fn rle_size(layout: RleLayout, runs: &[(u32, MaterialId)]) -> Option<usize> {
    let max_count = layout.max_count();
    let mut records = 0usize;
    for &(count, id) in runs {
        if id as u32 > layout.max_id() {
            return None;
        }
        records += count.div_ceil(max_count) as usize;
    }
    Some(records * layout.record_bytes())
}

/// Pick the format that represents `blocks` in the fewest bytes, without
/// encoding anything.
pub fn select_encoding(blocks: &[MaterialId]) -> (ChunkType, usize) {
    if blocks.iter().all(|&b| b == EMPTY_MATERIAL) {
        return (ChunkType::Empty, 0);
    }

    let runs = runs(blocks);
    let uncompressed = blocks.len() * 2;
    let best_rle = RLE_CANDIDATES
        .into_iter()
        .filter_map(|kind| {
            let layout = kind.rle_layout()?;
            rle_size(layout, &runs).map(|size| (kind, size))
        })
        .fold(None, |best: Option<(ChunkType, usize)>, candidate| match best {
            Some(b) if b.1 <= candidate.1 => Some(b),
            _ => Some(candidate),
        });

    match best_rle {
        Some((kind, size)) if size < uncompressed => (kind, size),
        _ => (ChunkType::Uncompressed, uncompressed),
    }
}

/// Encode a block sequence in its smallest exact representation.
pub fn encode(blocks: &[MaterialId]) -> EncodedChunk {
    let (kind, size) = select_encoding(blocks);
    encode_as(kind, blocks, size)
}

/// Encode a batch of chunks in parallel, preserving order.
pub fn encode_many<B>(chunks: &[B]) -> Vec<EncodedChunk>
where
    B: AsRef<[MaterialId]> + Sync,
{
    chunks.par_iter().map(|blocks| encode(blocks.as_ref())).collect()
}

fn encode_as(kind: ChunkType, blocks: &[MaterialId], size_hint: usize) -> EncodedChunk {
    let mut data = Vec::with_capacity(size_hint);
    match kind.rle_layout() {
        None if kind == ChunkType::Empty => {}
        None => {
            for &block in blocks {
                data.extend_from_slice(&block.to_le_bytes());
            }
        }
        Some(layout) => {
            let max_count = layout.max_count();
            for (mut count, id) in runs(blocks) {
                while count > 0 {
                    let take = count.min(max_count);
                    data.extend_from_slice(&take.to_le_bytes()[..layout.count_bytes]);
                    data.extend_from_slice(&(id as u32).to_le_bytes()[..layout.id_bytes]);
                    count -= take;
                }
            }
        }
    }
    EncodedChunk { kind, data }
}

fn read_le(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .rev()
        .fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

fn malformed(kind: ChunkType, reason: impl Into<String>) -> Error {
    Error::MalformedEncoding {
        encoding: kind.id(),
        reason: reason.into(),
    }
}

/// Iterate the (count, material) records of a run-length payload.
fn rle_records(
    kind: ChunkType,
    layout: RleLayout,
    payload: &[u8],
) -> Result<impl Iterator<Item = (u32, MaterialId)> + '_> {
    if payload.len() % layout.record_bytes() != 0 {
        return Err(malformed(
            kind,
            format!("payload length {} is not a multiple of {}", payload.len(), layout.record_bytes()),
        ));
    }
    Ok(payload.chunks_exact(layout.record_bytes()).map(move |record| {
        let count = read_le(&record[..layout.count_bytes]);
        let id = read_le(&record[layout.count_bytes..]) as MaterialId;
        (count, id)
    }))
}

/// Decode a payload back into `volume` blocks.
pub fn decode(kind: ChunkType, payload: &[u8], volume: usize) -> Result<Vec<MaterialId>> {
    if let Some(layout) = kind.rle_layout() {
        return decode_runs(kind, layout, payload, volume);
    }
    match kind {
        ChunkType::Empty => {
            if !payload.is_empty() {
                return Err(malformed(kind, format!("{} payload bytes on an empty chunk", payload.len())));
            }
            Ok(vec![EMPTY_MATERIAL; volume])
        }
        ChunkType::Uncompressed => {
            if payload.len() != volume * 2 {
                return Err(malformed(
                    kind,
                    format!("expected {} bytes, found {}", volume * 2, payload.len()),
                ));
            }
            Ok(payload
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect())
        }
        other => Err(malformed(other, "not a fixed-size format")),
    }
}

fn decode_runs(
    kind: ChunkType,
    layout: RleLayout,
    payload: &[u8],
    volume: usize,
) -> Result<Vec<MaterialId>> {
    let mut blocks = Vec::with_capacity(volume);
    for (count, id) in rle_records(kind, layout, payload)? {
        if count == 0 {
            return Err(malformed(kind, "zero-length run"));
        }
        if blocks.len() + count as usize > volume {
            return Err(malformed(kind, format!("runs exceed chunk volume {volume}")));
        }
        blocks.resize(blocks.len() + count as usize, id);
    }
    if blocks.len() != volume {
        return Err(malformed(
            kind,
            format!("runs cover {} of {} blocks", blocks.len(), volume),
        ));
    }
    Ok(blocks)
}

/// Read a single block without decoding the whole chunk.
pub fn material_at(kind: ChunkType, payload: &[u8], index: usize) -> Result<MaterialId> {
    if let Some(layout) = kind.rle_layout() {
        let mut covered = 0usize;
        for (count, id) in rle_records(kind, layout, payload)? {
            covered += count as usize;
            if index < covered {
                return Ok(id);
            }
        }
        return Err(malformed(kind, format!("block {index} past the last run")));
    }
    match kind {
        ChunkType::Empty => Ok(EMPTY_MATERIAL),
        _ => payload
            .get(index * 2..index * 2 + 2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .ok_or_else(|| malformed(kind, format!("block {index} out of range"))),
    }
}

/// The single material of a chunk, if it holds only one.
pub fn uniform_material(kind: ChunkType, payload: &[u8]) -> Result<Option<MaterialId>> {
    let Some(layout) = kind.rle_layout() else {
        return Ok(match kind {
            ChunkType::Empty => Some(EMPTY_MATERIAL),
            // Selection never keeps a uniform chunk uncompressed
            _ => None,
        });
    };
    let mut records = rle_records(kind, layout, payload)?.map(|(_, id)| id);
    let Some(first) = records.next() else {
        return Ok(None);
    };
    Ok(records.all(|id| id == first).then_some(first))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::chunk::CHUNK_VOLUME;

    fn two_runs(first: MaterialId, second: MaterialId, split: usize) -> Vec<MaterialId> {
        let mut blocks = vec![first; split];
        blocks.resize(CHUNK_VOLUME, second);
        blocks
    }

    /// Deterministic pseudo-random sequence with short runs
    fn noisy(seed: u32, max_id: u16) -> Vec<MaterialId> {
        let mut state = seed;
        (0..CHUNK_VOLUME)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                ((state >> 16) % (max_id as u32 + 1)) as MaterialId
            })
            .collect()
    }

    #[test]
    fn test_uniform_air_is_empty() {
        let blocks = vec![EMPTY_MATERIAL; CHUNK_VOLUME];
        let encoded = encode(&blocks);
        assert_eq!(encoded.kind, ChunkType::Empty);
        assert!(encoded.data.is_empty());
        assert_eq!(decode(encoded.kind, &encoded.data, CHUNK_VOLUME).unwrap(), blocks);
    }

    #[test]
    fn test_short_runs_are_rle_1_1() {
        // 32 alternating runs of 128 blocks: 64 bytes as RLE_1_1, 128 as RLE_3_1
        let blocks: Vec<MaterialId> = (0..CHUNK_VOLUME).map(|i| 1 + ((i / 128) % 2) as MaterialId).collect();
        let encoded = encode(&blocks);
        assert_eq!(encoded.kind, ChunkType::Rle11);
        assert_eq!(encoded.data.len(), 64);
        assert_eq!(decode(encoded.kind, &encoded.data, CHUNK_VOLUME).unwrap(), blocks);

        // Two runs each within a single u8 count
        let short: Vec<MaterialId> = [vec![7; 100], vec![9; 155]].concat();
        let encoded = encode(&short);
        assert_eq!(encoded.kind, ChunkType::Rle11);
        assert_eq!(encoded.data, vec![100, 7, 155, 9]);
    }

    #[test]
    fn test_long_runs_prefer_rle_3_1() {
        // Two runs of 2048 blocks: RLE_1_1 needs 18 records, RLE_3_1 needs 2
        let blocks = two_runs(1, 2, 2048);
        let encoded = encode(&blocks);
        assert_eq!(encoded.kind, ChunkType::Rle31);
        assert_eq!(encoded.data.len(), 8);
    }

    #[test]
    fn test_wide_ids_use_rle_2_2() {
        let blocks = two_runs(300, 1000, 1024);
        let encoded = encode(&blocks);
        assert_eq!(encoded.kind, ChunkType::Rle22);
        assert_eq!(encoded.data.len(), 8);
        assert_eq!(decode(encoded.kind, &encoded.data, CHUNK_VOLUME).unwrap(), blocks);
    }

    #[test]
    fn test_noisy_data_falls_back_to_uncompressed() {
        let blocks = noisy(7, 600);
        let encoded = encode(&blocks);
        assert_eq!(encoded.kind, ChunkType::Uncompressed);
        assert_eq!(encoded.data.len(), CHUNK_VOLUME * 2);
        assert_eq!(decode(encoded.kind, &encoded.data, CHUNK_VOLUME).unwrap(), blocks);
    }

    #[test]
    fn test_every_format_roundtrips() {
        let samples = [
            vec![EMPTY_MATERIAL; CHUNK_VOLUME],
            two_runs(1, 2, 10),
            two_runs(4, 5, 3000),
            two_runs(256, 4, 77),
            noisy(1, 3),
            noisy(2, 255),
            noisy(3, u16::MAX),
        ];
        for blocks in &samples {
            for kind in ChunkType::ALL {
                // Force every format that can represent the sample
                let representable = match kind {
                    ChunkType::Empty => blocks.iter().all(|&b| b == EMPTY_MATERIAL),
                    ChunkType::Uncompressed => true,
                    _ => rle_size(kind.rle_layout().unwrap(), &runs(blocks)).is_some(),
                };
                if !representable {
                    continue;
                }
                let encoded = encode_as(kind, blocks, 0);
                let decoded = decode(kind, &encoded.data, CHUNK_VOLUME).unwrap();
                assert_eq!(&decoded, blocks, "round-trip failed for {kind}");
            }
        }
    }

    #[test]
    fn test_selection_is_minimal() {
        let samples = [
            two_runs(1, 2, 10),
            two_runs(4, 5, 3000),
            two_runs(256, 4, 77),
            noisy(4, 2),
            noisy(5, 255),
        ];
        for blocks in &samples {
            let chosen = encode(blocks);
            let smallest = RLE_CANDIDATES
                .into_iter()
                .filter_map(|kind| rle_size(kind.rle_layout().unwrap(), &runs(blocks)))
                .chain(std::iter::once(blocks.len() * 2))
                .min()
                .unwrap();
            assert_eq!(chosen.data.len(), smallest);
        }
    }

    #[test]
    fn test_material_at_matches_decode() {
        let blocks = noisy(9, 4);
        let encoded = encode(&blocks);
        for index in [0, 1, 100, 2047, CHUNK_VOLUME - 1] {
            assert_eq!(material_at(encoded.kind, &encoded.data, index).unwrap(), blocks[index]);
        }
    }

    #[test]
    fn test_uniform_material() {
        let stone = encode(&vec![3; CHUNK_VOLUME]);
        assert_eq!(uniform_material(stone.kind, &stone.data).unwrap(), Some(3));
        assert_eq!(uniform_material(ChunkType::Empty, &[]).unwrap(), Some(EMPTY_MATERIAL));

        let mixed = encode(&two_runs(1, 2, 100));
        assert_eq!(uniform_material(mixed.kind, &mixed.data).unwrap(), None);
    }

    #[test]
    fn test_encode_many_preserves_order() {
        let batch = vec![vec![EMPTY_MATERIAL; CHUNK_VOLUME], two_runs(300, 1000, 1024), noisy(7, 600)];
        let encoded = encode_many(&batch);
        let kinds: Vec<_> = encoded.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ChunkType::Empty, ChunkType::Rle22, ChunkType::Uncompressed]);
    }

    #[test]
    fn test_malformed_payloads() {
        // Truncated record
        assert!(matches!(
            decode(ChunkType::Rle11, &[3], CHUNK_VOLUME),
            Err(Error::MalformedEncoding { encoding: 4, .. })
        ));
        // Runs do not cover the chunk
        assert!(decode(ChunkType::Rle22, &[10, 0, 1, 0], CHUNK_VOLUME).is_err());
        // Zero-length run
        assert!(decode(ChunkType::Rle11, &[0, 1], CHUNK_VOLUME).is_err());
        // Payload on an empty chunk
        assert!(decode(ChunkType::Empty, &[1], CHUNK_VOLUME).is_err());
        // Wrong uncompressed length
        assert!(decode(ChunkType::Uncompressed, &[0; 10], CHUNK_VOLUME).is_err());
        // Unknown id
        assert!(ChunkType::try_from(9).is_err());
    }
}
