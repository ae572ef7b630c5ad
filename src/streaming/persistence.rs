//! Persistence collaborators
//!
//! Chunk data is persisted per buffer, octree nodes per node group. Both
//! traits are synchronous; the engine calls them from blocking tasks and
//! never while holding a storage lock.

use std::collections::HashMap;

use log::trace;
use parking_lot::Mutex;

use crate::core::types::Result;
use crate::voxel::buffer::ChunkBuffer;
use crate::voxel::chunk::BufferKey;
use crate::voxel::svo::{NodeGroupImage, OctreeMeta};

/// Loads and saves chunk buffers.
pub trait ChunkPersistence: Send + Sync {
    /// Load the buffer stored under `key`; `Ok(None)` if nothing was saved.
    fn load_chunks(&self, key: BufferKey) -> Result<Option<ChunkBuffer>>;

    fn save_chunks(&self, key: BufferKey, buffer: &ChunkBuffer) -> Result<()>;
}

/// Loads and saves octree node groups and the master metadata.
pub trait OctreePersistence: Send + Sync {
    fn load_group(&self, index: u32) -> Result<Option<NodeGroupImage>>;

    fn save_group(&self, index: u32, image: &NodeGroupImage) -> Result<()>;

    fn load_meta(&self) -> Result<Option<OctreeMeta>>;

    fn save_meta(&self, meta: &OctreeMeta) -> Result<()>;
}

/// Persistence that remembers nothing; every load comes back empty.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPersistence;

impl ChunkPersistence for NullPersistence {
    fn load_chunks(&self, _key: BufferKey) -> Result<Option<ChunkBuffer>> {
        Ok(None)
    }

    fn save_chunks(&self, key: BufferKey, _buffer: &ChunkBuffer) -> Result<()> {
        trace!("Discarding buffer {}", key);
        Ok(())
    }
}

impl OctreePersistence for NullPersistence {
    fn load_group(&self, _index: u32) -> Result<Option<NodeGroupImage>> {
        Ok(None)
    }

    fn save_group(&self, _index: u32, _image: &NodeGroupImage) -> Result<()> {
        Ok(())
    }

    fn load_meta(&self) -> Result<Option<OctreeMeta>> {
        Ok(None)
    }

    fn save_meta(&self, _meta: &OctreeMeta) -> Result<()> {
        Ok(())
    }
}

/// Process-local persistence, mostly useful for tests and tools.
#[derive(Default)]
pub struct MemoryPersistence {
    buffers: Mutex<HashMap<BufferKey, ChunkBuffer>>,
    groups: Mutex<HashMap<u32, NodeGroupImage>>,
    meta: Mutex<Option<OctreeMeta>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn contains(&self, key: BufferKey) -> bool {
        self.buffers.lock().contains_key(&key)
    }
}

impl ChunkPersistence for MemoryPersistence {
    fn load_chunks(&self, key: BufferKey) -> Result<Option<ChunkBuffer>> {
        Ok(self.buffers.lock().get(&key).cloned())
    }

    fn save_chunks(&self, key: BufferKey, buffer: &ChunkBuffer) -> Result<()> {
        // Residency is not persisted
        let mut image = buffer.clone();
        image.detach_all();
        image.mark_clean();
        self.buffers.lock().insert(key, image);
        Ok(())
    }
}

impl OctreePersistence for MemoryPersistence {
    fn load_group(&self, index: u32) -> Result<Option<NodeGroupImage>> {
        Ok(self.groups.lock().get(&index).cloned())
    }

    fn save_group(&self, index: u32, image: &NodeGroupImage) -> Result<()> {
        self.groups.lock().insert(index, image.clone());
        Ok(())
    }

    fn load_meta(&self) -> Result<Option<OctreeMeta>> {
        Ok(self.meta.lock().clone())
    }

    fn save_meta(&self, meta: &OctreeMeta) -> Result<()> {
        *self.meta.lock() = Some(meta.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::buffer::ChunkOrigin;
    use crate::voxel::chunk::ChunkCoord;
    use crate::voxel::encoding::encode;

    #[test]
    fn test_null_persistence_forgets() {
        let persistence = NullPersistence;
        let buffer = ChunkBuffer::new(BufferKey(3), 2);
        persistence.save_chunks(BufferKey(3), &buffer).unwrap();
        assert!(persistence.load_chunks(BufferKey(3)).unwrap().is_none());
        assert!(OctreePersistence::load_meta(&persistence).unwrap().is_none());
    }

    #[test]
    fn test_memory_persistence_roundtrip() {
        let persistence = MemoryPersistence::new();
        let mut buffer = ChunkBuffer::new(BufferKey(5), 2);
        buffer.put(1, ChunkCoord::new(1, 0, 0), &encode(&vec![3; 4096]), ChunkOrigin::Edited);

        persistence.save_chunks(BufferKey(5), &buffer).unwrap();
        assert!(persistence.contains(BufferKey(5)));

        buffer.attach(1);
        persistence.save_chunks(BufferKey(5), &buffer).unwrap();
        let loaded = persistence.load_chunks(BufferKey(5)).unwrap().unwrap();
        assert_eq!(loaded.chunk_count(), 1);
        assert_eq!(loaded.attached_count(), 0);
        assert!(!loaded.is_dirty());
        assert_eq!(loaded.get(1).unwrap().payload, buffer.get(1).unwrap().payload);
    }
}
