//! World façade: queries, load markers and persistence of one streamed world

pub mod builder;

pub use builder::WorldBuilder;
pub use crate::streaming::chunk_loader::{LogListener, UpdateHandle, UpdateReport, WorldListener};

use std::sync::Arc;

use glam::Vec3;
use log::{info, warn};
use tokio::runtime::{Handle, Runtime};

use crate::core::config::WorldConfig;
use crate::core::types::Result;
use crate::streaming::budget::{MemoryManager, MemoryUsage};
use crate::streaming::chunk_loader::WorldLoader;
use crate::streaming::marker::LoadMarker;
use crate::streaming::persistence::OctreePersistence;
use crate::voxel::chunk::{ChunkCoord, ChunkId, ChunkSnapshot};
use crate::voxel::material::{MaterialId, MaterialRegistry};
use crate::voxel::storage::ChunkStorage;
use crate::voxel::svo::{Located, MasterOctree, Node, NodeId, NodeTarget, OctreeStorage};

/// A streamed voxel world.
///
/// Built by [`WorldBuilder`]. Markers decide what is resident; the world
/// answers queries against whatever currently is.
pub struct World {
    pub(crate) config: WorldConfig,
    pub(crate) registry: MaterialRegistry,
    pub(crate) memory: Arc<MemoryManager>,
    pub(crate) chunks: Arc<ChunkStorage>,
    pub(crate) octree: Arc<OctreeStorage>,
    pub(crate) octree_persistence: Arc<dyn OctreePersistence>,
    pub(crate) loader: Arc<WorldLoader>,
    pub(crate) handle: Handle,
    /// Present when no runtime was available at build time
    pub(crate) runtime: Option<Runtime>,
}

impl World {
    pub fn builder(config: WorldConfig) -> WorldBuilder {
        WorldBuilder::new(config)
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn material_registry(&self) -> &MaterialRegistry {
        &self.registry
    }

    /// Runtime running this world's background work
    pub fn runtime(&self) -> &Handle {
        &self.handle
    }

    /// Deepest node at a world position: a resident chunk, a uniform cell or
    /// a structural octree node.
    pub fn get_node(&self, x: f32, y: f32, z: f32) -> Option<Node> {
        match self.octree.locate(Vec3::new(x, y, z))? {
            Located::Uniform { coord, material } => Some(Node::Uniform { coord, material }),
            Located::Node(index) => {
                let node = self.octree.node(index)?;
                match node.chunk().and_then(|id| self.chunks.get_chunk(id)) {
                    Some(chunk) => Some(Node::Chunk(chunk)),
                    None => Some(Node::Octree { index, node }),
                }
            }
        }
    }

    /// Resolve a packed node id.
    pub fn resolve(&self, id: NodeId) -> Option<Node> {
        match id.target() {
            NodeTarget::Octree(index) => self.octree.node(index).map(|node| Node::Octree { index, node }),
            NodeTarget::Chunk(chunk) => self.get_chunk(chunk).map(Node::Chunk),
        }
    }

    pub fn get_chunk(&self, id: ChunkId) -> Option<ChunkSnapshot> {
        self.chunks.get_chunk(id)
    }

    /// Resident chunk at a chunk coordinate.
    pub fn chunk_at(&self, coord: ChunkCoord) -> Option<ChunkSnapshot> {
        self.chunks.lookup(coord).and_then(|id| self.chunks.get_chunk(id))
    }

    /// Decoded blocks of a resident chunk. Unreadable data reads as empty.
    pub fn blocks(&self, coord: ChunkCoord) -> Option<Vec<MaterialId>> {
        self.chunks.lookup(coord).and_then(|id| self.chunks.blocks(id))
    }

    /// Replace a chunk's blocks (4096, x fastest, then y, then z).
    pub fn write_chunk(&self, coord: ChunkCoord, blocks: &[MaterialId]) -> Result<ChunkId> {
        self.loader.write(coord, blocks)
    }

    pub fn master_octree(&self) -> MasterOctree {
        self.octree.master()
    }

    pub fn add_load_marker(&self, marker: Arc<LoadMarker>) {
        self.loader.add_marker(marker);
    }

    /// Create and register a marker using the configured move threshold.
    pub fn create_load_marker(&self, position: Vec3, hard_radius: u32, soft_radius: u32) -> Arc<LoadMarker> {
        let marker = Arc::new(
            LoadMarker::new(position, hard_radius, soft_radius).with_move_threshold(self.config.move_threshold),
        );
        self.loader.add_marker(marker.clone());
        marker
    }

    pub fn remove_load_marker(&self, marker: &Arc<LoadMarker>) -> bool {
        self.loader.remove_marker(marker)
    }

    pub fn load_markers(&self) -> Vec<Arc<LoadMarker>> {
        self.loader.markers()
    }

    /// Start loading and unloading for every moved marker.
    pub fn update_load_markers(&self) -> Vec<UpdateHandle> {
        self.loader.update(false)
    }

    /// Like [`World::update_load_markers`], optionally for every marker.
    pub fn update_load_markers_with(&self, force: bool) -> Vec<UpdateHandle> {
        self.loader.update(force)
    }

    /// Ask for a background unload down to the preferred budget.
    pub fn request_unload(&self) {
        self.memory.queue_unload();
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.memory.usage()
    }

    /// Persist every dirty chunk buffer and the octree.
    pub fn save(&self) -> Result<()> {
        let buffers = self.chunks.flush()?;
        self.octree.save(self.octree_persistence.as_ref())?;
        info!("World saved ({} chunk buffers written)", buffers);
        Ok(())
    }
}

impl Drop for World {
    fn drop(&mut self) {
        if let Err(e) = self.save() {
            warn!("Failed to save world on shutdown: {}", e);
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
