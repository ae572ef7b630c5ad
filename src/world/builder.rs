//! Composition root for a streamed world

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};
use tokio::runtime::{Builder as RuntimeBuilder, Handle};

use crate::core::config::WorldConfig;
use crate::core::types::Result;
use crate::generation::{GeneratorStage, Pipeline};
use crate::streaming::budget::{MemoryManager, MemoryPanicHandler, ReclaimOnPanic};
use crate::streaming::chunk_loader::{LogListener, WorldListener, WorldLoader};
use crate::streaming::disk_io::DiskPersistence;
use crate::streaming::persistence::{ChunkPersistence, NullPersistence, OctreePersistence};
use crate::voxel::material::MaterialRegistry;
use crate::voxel::storage::ChunkStorage;
use crate::voxel::svo::OctreeStorage;
use crate::world::World;

/// Collects the collaborators of a [`World`].
///
/// Everything but the configuration is optional: persistence defaults to
/// [`NullPersistence`], the listener only logs failures, the panic handler
/// reclaims urgently and the runtime is the current one (or a new one owned
/// by the world when there is none).
pub struct WorldBuilder {
    config: WorldConfig,
    registry: MaterialRegistry,
    stages: Vec<Box<dyn GeneratorStage>>,
    chunk_persistence: Option<Arc<dyn ChunkPersistence>>,
    octree_persistence: Option<Arc<dyn OctreePersistence>>,
    listener: Option<Arc<dyn WorldListener>>,
    panic_handler: Option<Arc<dyn MemoryPanicHandler>>,
    runtime: Option<Handle>,
}

impl WorldBuilder {
    pub fn new(config: WorldConfig) -> Self {
        Self {
            config,
            registry: MaterialRegistry::new(),
            stages: Vec::new(),
            chunk_persistence: None,
            octree_persistence: None,
            listener: None,
            panic_handler: None,
            runtime: None,
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn materials(mut self, registry: MaterialRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Append a generator stage; stages run in the order added.
    pub fn stage(mut self, stage: impl GeneratorStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Use one backend for both chunk buffers and octree groups.
    pub fn persistence<P>(mut self, persistence: Arc<P>) -> Self
    where
        P: ChunkPersistence + OctreePersistence + 'static,
    {
        self.chunk_persistence = Some(persistence.clone());
        self.octree_persistence = Some(persistence);
        self
    }

    /// Persist to LZ4 archives under `dir`.
    pub fn disk(self, dir: impl Into<PathBuf>) -> Self {
        self.persistence(Arc::new(DiskPersistence::new(dir)))
    }

    pub fn chunk_persistence(mut self, persistence: Arc<dyn ChunkPersistence>) -> Self {
        self.chunk_persistence = Some(persistence);
        self
    }

    pub fn octree_persistence(mut self, persistence: Arc<dyn OctreePersistence>) -> Self {
        self.octree_persistence = Some(persistence);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn WorldListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn panic_handler(mut self, handler: Arc<dyn MemoryPanicHandler>) -> Self {
        self.panic_handler = Some(handler);
        self
    }

    /// Run background work on an existing runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<World> {
        let config = self.config;
        config.validate()?;

        let (handle, owned) = match self.runtime.or_else(|| Handle::try_current().ok()) {
            Some(handle) => (handle, None),
            None => {
                let runtime = RuntimeBuilder::new_multi_thread()
                    .worker_threads(config.worker_threads)
                    .thread_name("terra-worker")
                    .enable_all()
                    .build()?;
                debug!("Started world runtime with {} workers", config.worker_threads);
                (runtime.handle().clone(), Some(runtime))
            }
        };

        let panic_handler = self.panic_handler.unwrap_or_else(|| Arc::new(ReclaimOnPanic));
        let memory = MemoryManager::new(config.memory_preferred, config.memory_max, panic_handler);
        memory.set_runtime(handle.clone());

        let chunk_persistence = self
            .chunk_persistence
            .unwrap_or_else(|| Arc::new(NullPersistence));
        let octree_persistence = self
            .octree_persistence
            .unwrap_or_else(|| Arc::new(NullPersistence));

        let octree = match OctreeStorage::load(&config, memory.clone(), octree_persistence.as_ref())? {
            Some(octree) => {
                info!("Restored octree with {} leaves", octree.leaf_count());
                octree
            }
            None => OctreeStorage::new(&config, memory.clone())?,
        };
        let octree = Arc::new(octree);
        let chunks = Arc::new(ChunkStorage::new(&config, chunk_persistence, memory.clone()));
        let pipeline = Arc::new(Pipeline::new(
            config.seed,
            config.chunk_world_size,
            &self.registry,
            self.stages,
        )?);
        let listener = self.listener.unwrap_or_else(|| Arc::new(LogListener));

        let loader = WorldLoader::new(
            &config,
            chunks.clone(),
            octree.clone(),
            pipeline.clone(),
            listener,
            memory.clone(),
            handle.clone(),
        );

        info!(
            "World ready: seed {}, {} generator stages, {} max buffers of {}³ chunks",
            config.seed,
            pipeline.len(),
            config.max_buffers,
            config.buffer_side
        );

        Ok(World {
            config,
            registry: self.registry,
            memory,
            chunks,
            octree,
            octree_persistence,
            loader,
            handle,
            runtime: owned,
        })
    }
}
