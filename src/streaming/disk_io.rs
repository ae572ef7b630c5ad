//! Buffer and node group serialization and disk I/O
//!
//! Images are rkyv archives compressed with LZ4 (size prepended). Layout
//! under the world directory:
//!
//! - `chunks/<buffer key as 16 hex digits>.tcb`
//! - `octree/group_<n>.tog`
//! - `octree/meta.json`

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::streaming::persistence::{ChunkPersistence, OctreePersistence};
use crate::voxel::buffer::{ChunkBuffer, ChunkOrigin};
use crate::voxel::chunk::{BufferKey, ChunkCoord};
use crate::voxel::encoding::{ChunkType, EncodedChunk};
use crate::voxel::svo::{ArchivedNodeGroupImage, NodeGroupImage, OctreeMeta};

/// Header entry for one stored chunk
#[derive(Archive, Deserialize, Serialize)]
struct SlotEntry {
    slot: u16,
    x: i32,
    y: i32,
    z: i32,
    encoding: u8,
    len: u32,
}

/// Serializable buffer: header table followed by concatenated payloads
#[derive(Archive, Deserialize, Serialize)]
pub struct BufferImage {
    key: u64,
    side: u32,
    entries: Vec<SlotEntry>,
    payload: Vec<u8>,
}

fn invalid_data(msg: impl std::fmt::Display) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidData, msg.to_string()))
}

/// Copy into an aligned buffer so the archive can be validated in place.
fn aligned(bytes: &[u8]) -> AlignedVec {
    let mut out = AlignedVec::with_capacity(bytes.len());
    out.extend_from_slice(bytes);
    out
}

/// Serialize a buffer to bytes (uncompressed)
pub fn serialize_buffer(buffer: &ChunkBuffer) -> Result<Vec<u8>> {
    let mut entries = Vec::with_capacity(buffer.chunk_count());
    let mut payload = Vec::new();
    for view in buffer.iter() {
        entries.push(SlotEntry {
            slot: view.slot,
            x: view.coord.x,
            y: view.coord.y,
            z: view.coord.z,
            encoding: view.kind.id(),
            len: view.payload.len() as u32,
        });
        payload.extend_from_slice(view.payload);
    }
    let image = BufferImage {
        key: buffer.key().0,
        side: buffer.side(),
        entries,
        payload,
    };

    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&image)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(bytes.to_vec())
}

/// Deserialize a buffer from bytes (uncompressed). Every chunk comes back
/// detached and the buffer clean.
pub fn deserialize_buffer(data: &[u8]) -> Result<ChunkBuffer> {
    let data = aligned(data);
    let archived = rkyv::access::<ArchivedBufferImage, rkyv::rancor::Error>(&data)
        .map_err(invalid_data)?;
    let image: BufferImage = rkyv::deserialize::<BufferImage, rkyv::rancor::Error>(archived)
        .map_err(invalid_data)?;

    if !image.side.is_power_of_two() || image.side > 16 {
        return Err(invalid_data(format!("buffer side {} out of range", image.side)));
    }
    let total: usize = image.entries.iter().map(|e| e.len as usize).sum();
    if total != image.payload.len() {
        return Err(invalid_data(format!(
            "header covers {} payload bytes, archive holds {}",
            total,
            image.payload.len()
        )));
    }

    let key = BufferKey(image.key);
    let mut buffer = ChunkBuffer::new(key, image.side);
    let mut offset = 0usize;
    for entry in &image.entries {
        let bytes = &image.payload[offset..offset + entry.len as usize];
        offset += entry.len as usize;
        let coord = ChunkCoord::new(entry.x, entry.y, entry.z);
        let chunk = match ChunkType::try_from(entry.encoding) {
            Ok(kind) => EncodedChunk { kind, data: bytes.to_vec() },
            Err(e) => {
                warn!("Chunk {:?} in buffer {}: {}, treating as empty", coord, key, e);
                EncodedChunk::empty()
            }
        };
        if entry.slot as usize >= buffer.capacity() {
            return Err(invalid_data(format!("slot {} out of range", entry.slot)));
        }
        buffer.put(entry.slot, coord, &chunk, ChunkOrigin::Generated);
    }
    buffer.mark_clean();
    Ok(buffer)
}

/// Serialize and compress a buffer
pub fn compress_buffer(buffer: &ChunkBuffer) -> Result<Vec<u8>> {
    let serialized = serialize_buffer(buffer)?;
    Ok(lz4_flex::compress_prepend_size(&serialized))
}

/// Decompress and deserialize a buffer
pub fn decompress_buffer(data: &[u8]) -> Result<ChunkBuffer> {
    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| invalid_data(format!("LZ4 decompression failed: {}", e)))?;
    deserialize_buffer(&decompressed)
}

/// Serialize and compress a node group
pub fn compress_group(image: &NodeGroupImage) -> Result<Vec<u8>> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(image)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

/// Decompress and deserialize a node group
pub fn decompress_group(data: &[u8]) -> Result<NodeGroupImage> {
    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| invalid_data(format!("LZ4 decompression failed: {}", e)))?;
    let data = aligned(&decompressed);
    let archived = rkyv::access::<ArchivedNodeGroupImage, rkyv::rancor::Error>(&data)
        .map_err(invalid_data)?;
    rkyv::deserialize::<NodeGroupImage, rkyv::rancor::Error>(archived).map_err(invalid_data)
}

/// Get the file path for a buffer
pub fn buffer_path(base_dir: &Path, key: BufferKey) -> PathBuf {
    base_dir.join("chunks").join(format!("{}.tcb", key))
}

/// Get the file path for a node group
pub fn group_path(base_dir: &Path, index: u32) -> PathBuf {
    base_dir.join("octree").join(format!("group_{}.tog", index))
}

pub fn meta_path(base_dir: &Path) -> PathBuf {
    base_dir.join("octree").join("meta.json")
}

/// Write through a temporary file so a crash never leaves a torn image.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Read a file, mapping "not found" to `None`.
fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// On-disk persistence rooted at one world directory.
#[derive(Clone, Debug)]
pub struct DiskPersistence {
    base_dir: PathBuf,
}

impl DiskPersistence {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Whether a buffer image exists on disk
    pub fn buffer_exists(&self, key: BufferKey) -> bool {
        buffer_path(&self.base_dir, key).exists()
    }

    /// Delete a buffer image
    pub fn delete_buffer(&self, key: BufferKey) -> Result<()> {
        match fs::remove_file(buffer_path(&self.base_dir, key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl ChunkPersistence for DiskPersistence {
    fn load_chunks(&self, key: BufferKey) -> Result<Option<ChunkBuffer>> {
        let path = buffer_path(&self.base_dir, key);
        let Some(compressed) = read_optional(&path)? else {
            return Ok(None);
        };
        let buffer = decompress_buffer(&compressed)?;
        if buffer.key() != key {
            return Err(invalid_data(format!(
                "{} holds buffer {}",
                path.display(),
                buffer.key()
            )));
        }
        debug!("Loaded buffer {} ({} chunks)", key, buffer.chunk_count());
        Ok(Some(buffer))
    }

    fn save_chunks(&self, key: BufferKey, buffer: &ChunkBuffer) -> Result<()> {
        let compressed = compress_buffer(buffer)?;
        write_atomic(&buffer_path(&self.base_dir, key), &compressed)?;
        debug!("Saved buffer {} ({} bytes)", key, compressed.len());
        Ok(())
    }
}

impl OctreePersistence for DiskPersistence {
    fn load_group(&self, index: u32) -> Result<Option<NodeGroupImage>> {
        read_optional(&group_path(&self.base_dir, index))?
            .map(|bytes| decompress_group(&bytes))
            .transpose()
    }

    fn save_group(&self, index: u32, image: &NodeGroupImage) -> Result<()> {
        let compressed = compress_group(image)?;
        write_atomic(&group_path(&self.base_dir, index), &compressed)?;
        Ok(())
    }

    fn load_meta(&self) -> Result<Option<OctreeMeta>> {
        match read_optional(&meta_path(&self.base_dir))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_meta(&self, meta: &OctreeMeta) -> Result<()> {
        let json = serde_json::to_vec_pretty(meta)?;
        write_atomic(&meta_path(&self.base_dir), &json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::chunk::CHUNK_VOLUME;
    use crate::voxel::encoding::encode;
    use crate::voxel::svo::{ChildSlot, OctreeNode};
    use tempfile::TempDir;

    fn sample_buffer() -> ChunkBuffer {
        let mut buffer = ChunkBuffer::new(BufferKey(0x1234), 2);
        let stripes: Vec<u16> = (0..CHUNK_VOLUME).map(|i| (i % 7) as u16).collect();
        buffer.put(0, ChunkCoord::new(0, 0, 0), &encode(&stripes), ChunkOrigin::Generated);
        buffer.put(5, ChunkCoord::new(1, 0, 1), &encode(&vec![2; CHUNK_VOLUME]), ChunkOrigin::Edited);
        buffer.put(7, ChunkCoord::new(1, 1, 1), &EncodedChunk::empty(), ChunkOrigin::Generated);
        buffer.attach(5);
        buffer
    }

    #[test]
    fn test_buffer_path() {
        let base = Path::new("/tmp/world");
        assert_eq!(
            buffer_path(base, BufferKey(0xabc)),
            PathBuf::from("/tmp/world/chunks/0000000000000abc.tcb")
        );
        assert_eq!(group_path(base, 3), PathBuf::from("/tmp/world/octree/group_3.tog"));
    }

    #[test]
    fn test_compress_decompress_buffer() {
        let buffer = sample_buffer();
        let compressed = compress_buffer(&buffer).expect("compression failed");
        let restored = decompress_buffer(&compressed).expect("decompression failed");

        assert_eq!(restored.key(), buffer.key());
        assert_eq!(restored.chunk_count(), 3);
        assert!(!restored.is_dirty());
        for slot in [0, 5, 7] {
            let a = buffer.get(slot).unwrap();
            let b = restored.get(slot).unwrap();
            assert_eq!(a.coord, b.coord);
            assert_eq!(a.kind, b.kind);
            assert_eq!(a.payload, b.payload);
        }
        // Residency is not persisted
        assert_eq!(restored.attached_count(), 0);
    }

    #[test]
    fn test_corrupt_image_is_an_error() {
        let mut compressed = compress_buffer(&sample_buffer()).unwrap();
        compressed.truncate(compressed.len() / 2);
        assert!(decompress_buffer(&compressed).is_err());
    }

    #[test]
    fn test_group_roundtrip() {
        let mut internal = OctreeNode::empty();
        internal.set_child(2, ChildSlot::Node(1));
        internal.set_child(4, ChildSlot::Uniform(9));
        let image = NodeGroupImage {
            index: 0,
            nodes: vec![Some(internal), Some(OctreeNode::leaf(glam::Vec3::ONE, 42, None)), None],
        };
        let restored = decompress_group(&compress_group(&image).unwrap()).unwrap();
        assert_eq!(restored, image);
    }

    #[test]
    fn test_disk_persistence_roundtrip() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let disk = DiskPersistence::new(temp_dir.path());
        let key = BufferKey(0x1234);

        assert!(disk.load_chunks(key).unwrap().is_none());
        disk.save_chunks(key, &sample_buffer()).unwrap();
        assert!(disk.buffer_exists(key));

        let loaded = disk.load_chunks(key).unwrap().expect("buffer not found");
        assert_eq!(loaded.chunk_count(), 3);

        disk.delete_buffer(key).unwrap();
        assert!(!disk.buffer_exists(key));
        disk.delete_buffer(key).unwrap();
    }

    #[test]
    fn test_disk_meta_roundtrip() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let disk = DiskPersistence::new(temp_dir.path());
        assert!(disk.load_meta().unwrap().is_none());

        let meta = OctreeMeta {
            root: 0,
            depth: 5,
            base: [-16, -16, -16],
            group_size: 64,
            groups: vec![0, 1],
        };
        disk.save_meta(&meta).unwrap();
        assert_eq!(disk.load_meta().unwrap(), Some(meta));
    }
}
