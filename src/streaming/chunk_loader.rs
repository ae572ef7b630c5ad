//! Marker-driven chunk loading
//!
//! Every update computes the regions of the moved markers, unloads what no
//! marker wants any more and loads the rest: from persistence when the
//! chunk was saved, from the generator pipeline otherwise. Chunk tasks run
//! on blocking threads, bounded by a semaphore; results are dropped at
//! commit time when the coordinate is no longer wanted.

use std::sync::{Arc, Weak};

use log::{debug, error, info, trace, warn};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinSet;

use crate::core::config::WorldConfig;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::generation::Pipeline;
use crate::streaming::budget::{MemoryManager, Reclaim};
use crate::streaming::marker::{LoadMarker, MarkerRegions, MarkerTicket};
use crate::streaming::priority::{ChunkPriority, ChunkPriorityQueue};
use crate::voxel::buffer::{ChunkOrigin, SlotState};
use crate::voxel::chunk::{BufferKey, CHUNK_VOLUME, ChunkCoord, ChunkId, ChunkSnapshot};
use crate::voxel::encoding;
use crate::voxel::material::MaterialId;
use crate::voxel::storage::{Admission, ChunkStorage, StoreOutcome};
use crate::voxel::svo::{LeafContent, MasterOctree, OctreeStorage};

/// Receives chunk residency changes. Called from worker threads with no
/// storage lock held.
pub trait WorldListener: Send + Sync {
    fn chunk_loaded(&self, _chunk: &ChunkSnapshot) {}

    fn chunk_unloaded(&self, _chunk: &ChunkSnapshot) {}

    fn chunk_failed(&self, coord: ChunkCoord, error: &Error) {
        warn!("Chunk {:?} failed to load: {}", coord, error);
    }
}

/// Listener that ignores everything but failures, which it logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogListener;

impl WorldListener for LogListener {}

/// How one chunk task ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoadOutcome {
    Loaded,
    Generated,
    AlreadyResident,
    Discarded,
    Deferred,
    Failed,
}

/// Counts of what one marker update did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Restored from persistence
    pub loaded: usize,
    pub generated: usize,
    /// Attached by an earlier or overlapping update
    pub already_resident: usize,
    /// Finished after the coordinate stopped being wanted
    pub discarded: usize,
    /// Soft loads refused by the memory budget
    pub deferred: usize,
    pub failed: usize,
    pub unloaded: usize,
}

impl UpdateReport {
    fn record(&mut self, outcome: LoadOutcome) {
        match outcome {
            LoadOutcome::Loaded => self.loaded += 1,
            LoadOutcome::Generated => self.generated += 1,
            LoadOutcome::AlreadyResident => self.already_resident += 1,
            LoadOutcome::Discarded => self.discarded += 1,
            LoadOutcome::Deferred => self.deferred += 1,
            LoadOutcome::Failed => self.failed += 1,
        }
    }
}

/// Completion handle for one marker's update.
#[derive(Debug)]
pub struct UpdateHandle {
    marker: Arc<LoadMarker>,
    receiver: oneshot::Receiver<UpdateReport>,
}

impl UpdateHandle {
    pub fn marker(&self) -> &Arc<LoadMarker> {
        &self.marker
    }

    pub async fn wait(self) -> Result<UpdateReport> {
        self.receiver
            .await
            .map_err(|_| Error::TaskFailed("marker update dropped before completion".into()))
    }

    /// Block the current thread until the update finishes. Must not be
    /// called from inside the async runtime.
    pub fn wait_blocking(self) -> Result<UpdateReport> {
        self.receiver
            .blocking_recv()
            .map_err(|_| Error::TaskFailed("marker update dropped before completion".into()))
    }
}

struct MarkerEntry {
    marker: Arc<LoadMarker>,
    /// Regions of the last update started for this marker
    serviced: Option<MarkerRegions>,
}

/// Reconciles wanted and resident chunks for every load marker.
pub struct WorldLoader {
    chunk_world_size: f32,
    chunks: Arc<ChunkStorage>,
    octree: Arc<OctreeStorage>,
    pipeline: Arc<Pipeline>,
    listener: Arc<dyn WorldListener>,
    memory: Arc<MemoryManager>,
    /// Most important first
    markers: RwLock<Vec<MarkerEntry>>,
    permits: Arc<Semaphore>,
    runtime: Handle,
    master: RwLock<MasterOctree>,
}

impl WorldLoader {
    /// Create the loader and register it as the memory manager's reclaim
    /// target.
    pub fn new(
        config: &WorldConfig,
        chunks: Arc<ChunkStorage>,
        octree: Arc<OctreeStorage>,
        pipeline: Arc<Pipeline>,
        listener: Arc<dyn WorldListener>,
        memory: Arc<MemoryManager>,
        runtime: Handle,
    ) -> Arc<Self> {
        let master = octree.master();
        let loader = Arc::new(Self {
            chunk_world_size: config.chunk_world_size,
            chunks,
            octree,
            pipeline,
            listener,
            memory: memory.clone(),
            markers: RwLock::new(Vec::new()),
            permits: Arc::new(Semaphore::new(config.max_concurrent_loads)),
            runtime,
            master: RwLock::new(master),
        });
        let weak = Arc::downgrade(&loader);
        let target: Weak<dyn Reclaim> = weak;
        memory.set_reclaim_target(target);
        loader
    }

    pub fn add_marker(&self, marker: Arc<LoadMarker>) {
        let mut markers = self.markers.write();
        if markers.iter().any(|e| Arc::ptr_eq(&e.marker, &marker)) {
            return;
        }
        markers.push(MarkerEntry {
            marker,
            serviced: None,
        });
        // Stable: equal markers keep insertion order
        markers.sort_by(|a, b| b.marker.importance().cmp(&a.marker.importance()));
    }

    /// Forget a marker and unload in the background whatever only it
    /// wanted. Returns `false` if the marker was not registered.
    pub fn remove_marker(self: &Arc<Self>, marker: &Arc<LoadMarker>) -> bool {
        let stale = {
            let mut markers = self.markers.write();
            let Some(index) = markers.iter().position(|e| Arc::ptr_eq(&e.marker, marker)) else {
                return false;
            };
            let entry = markers.remove(index);
            let remaining: Vec<MarkerRegions> = markers
                .iter()
                .map(|e| e.marker.regions(self.chunk_world_size))
                .collect();
            entry
                .serviced
                .map(|regions| unwanted_by(&regions, &remaining))
                .unwrap_or_default()
        };
        if !stale.is_empty() {
            let loader = Arc::clone(self);
            self.runtime.spawn_blocking(move || loader.unload_all(&stale));
        }
        true
    }

    pub fn marker_count(&self) -> usize {
        self.markers.read().len()
    }

    pub fn markers(&self) -> Vec<Arc<LoadMarker>> {
        self.markers.read().iter().map(|e| Arc::clone(&e.marker)).collect()
    }

    /// Cached master octree geometry.
    pub fn master(&self) -> MasterOctree {
        *self.master.read()
    }

    /// Tell the loader the octree's root or extent changed.
    pub fn world_config(&self, master: MasterOctree) {
        let mut cached = self.master.write();
        if *cached != master {
            info!(
                "Master octree: root {} depth {} scale {} center {:?}",
                master.root, master.depth, master.scale, master.center
            );
            *cached = master;
        }
    }

    /// Whether any marker currently wants `coord`.
    pub fn is_wanted(&self, coord: ChunkCoord) -> bool {
        self.markers
            .read()
            .iter()
            .any(|e| e.marker.regions(self.chunk_world_size).wants(coord))
    }

    /// Start an update for every moved marker (every marker when `force`).
    /// Only spawns work; each handle resolves when its marker's chunks are
    /// settled.
    pub fn update(self: &Arc<Self>, force: bool) -> Vec<UpdateHandle> {
        let plans: Vec<(Arc<LoadMarker>, MarkerTicket, MarkerRegions, Vec<ChunkCoord>)> = {
            let mut markers = self.markers.write();
            let current: Vec<MarkerRegions> = markers
                .iter()
                .map(|e| e.marker.regions(self.chunk_world_size))
                .collect();
            markers
                .iter_mut()
                .filter(|e| force || e.marker.has_moved())
                .map(|entry| {
                    let ticket = entry.marker.begin_update();
                    let regions = entry.marker.regions_at(ticket.position, self.chunk_world_size);
                    let stale = entry
                        .serviced
                        .map(|previous| unwanted_by(&previous, &current))
                        .unwrap_or_default();
                    entry.serviced = Some(regions);
                    (Arc::clone(&entry.marker), ticket, regions, stale)
                })
                .collect()
        };

        plans
            .into_iter()
            .map(|(marker, ticket, regions, stale)| {
                let queue = ChunkPriorityQueue::for_regions(
                    &regions,
                    ticket.position,
                    self.chunk_world_size,
                    |c| self.chunks.state(c) == SlotState::Attached,
                );
                trace!(
                    "Marker at {:?}: {} chunks to load, {} to unload",
                    ticket.position,
                    queue.len(),
                    stale.len()
                );
                let (sender, receiver) = oneshot::channel();
                let loader = Arc::clone(self);
                let task_marker = Arc::clone(&marker);
                self.runtime.spawn(async move {
                    let report = Arc::clone(&loader).run_update(stale, queue.into_sorted()).await;
                    // Failed chunks leave the marker moved so the next
                    // update retries them
                    if report.failed == 0 {
                        task_marker.complete_update(ticket);
                    }
                    debug!("Marker update finished: {:?}", report);
                    let _ = sender.send(report);
                });
                UpdateHandle { marker, receiver }
            })
            .collect()
    }

    async fn run_update(self: Arc<Self>, stale: Vec<ChunkCoord>, requests: Vec<ChunkPriority>) -> UpdateReport {
        let mut report = UpdateReport::default();

        if !stale.is_empty() {
            let loader = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || loader.unload_all(&stale)).await {
                Ok(unloaded) => report.unloaded = unloaded,
                Err(e) => error!("Unload task failed: {}", e),
            }
        }

        let mut tasks = JoinSet::new();
        for request in requests {
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            let loader = Arc::clone(&self);
            tasks.spawn_blocking(move || {
                let _permit = permit;
                loader.load_chunk(request)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!("Chunk task failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn load_chunk(&self, request: ChunkPriority) -> LoadOutcome {
        let coord = request.coord;
        if !self.is_wanted(coord) {
            return LoadOutcome::Discarded;
        }
        match self.try_load(coord, request.admission) {
            Ok(outcome) => outcome,
            Err(Error::AllocationDenied { requested, allocated, .. }) => {
                debug!(
                    "Soft load of {:?} deferred: {} bytes requested with {} allocated",
                    coord, requested, allocated
                );
                LoadOutcome::Deferred
            }
            Err(e) => {
                self.listener.chunk_failed(coord, &e);
                LoadOutcome::Failed
            }
        }
    }

    fn try_load(&self, coord: ChunkCoord, admission: Admission) -> Result<LoadOutcome> {
        let on_unload = |chunk: &ChunkSnapshot| self.chunk_evicted(chunk);

        if let Some(outcome) = self.chunks.attach(coord, admission, &on_unload)? {
            return self.commit(coord, outcome, LoadOutcome::Loaded);
        }

        let blocks = self.pipeline.generate(coord)?;
        let encoded = encoding::encode(&blocks);
        if !self.is_wanted(coord) {
            return Ok(LoadOutcome::Discarded);
        }
        let outcome = self
            .chunks
            .store(coord, &encoded, ChunkOrigin::Generated, admission, &on_unload)?;
        self.commit(coord, outcome, LoadOutcome::Generated)
    }

    /// Index a freshly attached chunk in the octree and tell the listener.
    fn commit(&self, coord: ChunkCoord, outcome: StoreOutcome, fresh: LoadOutcome) -> Result<LoadOutcome> {
        let Some(chunk) = self.chunks.get_chunk(outcome.id) else {
            return Ok(LoadOutcome::Discarded);
        };
        let content = match encoding::uniform_material(chunk.encoding, &chunk.payload) {
            Ok(Some(material)) => LeafContent::Uniform(material),
            _ => LeafContent::Chunk(outcome.id),
        };
        match self.octree.insert(coord, content) {
            Ok(true) => self.world_config(self.octree.master()),
            Ok(false) => {}
            Err(e) => {
                self.withdraw(coord, outcome);
                return Err(e);
            }
        }

        if !self.is_wanted(coord) {
            // Unloaded while we were committing
            self.octree.remove(coord);
            self.withdraw(coord, outcome);
            return Ok(LoadOutcome::Discarded);
        }
        if outcome.newly_attached {
            self.listener.chunk_loaded(&chunk);
            Ok(fresh)
        } else {
            Ok(LoadOutcome::AlreadyResident)
        }
    }

    /// Store caller-written blocks at `coord`, last write wins. The chunk
    /// joins the resident set only while a marker wants it; otherwise it is
    /// kept detached until its buffer is saved. The listener hears about
    /// every write that lands in the resident set.
    pub fn write(&self, coord: ChunkCoord, blocks: &[MaterialId]) -> Result<ChunkId> {
        if blocks.len() != CHUNK_VOLUME {
            return Err(Error::BlockCount {
                coord,
                len: blocks.len(),
            });
        }
        let encoded = encoding::encode(blocks);
        let on_unload = |chunk: &ChunkSnapshot| self.chunk_evicted(chunk);
        let outcome = self
            .chunks
            .store(coord, &encoded, ChunkOrigin::Edited, Admission::Hard, &on_unload)?;

        if !self.is_wanted(coord) {
            self.withdraw(coord, outcome);
            self.octree.remove(coord);
            debug!("Chunk {:?} written outside every marker region", coord);
            return Ok(outcome.id);
        }
        if self.commit(coord, outcome, LoadOutcome::Generated)? == LoadOutcome::AlreadyResident {
            if let Some(chunk) = self.chunks.get_chunk(outcome.id) {
                self.listener.chunk_loaded(&chunk);
            }
        }
        Ok(outcome.id)
    }

    /// Detach a chunk that was just stored but is not wanted. If the store
    /// found it already attached, the listener was told it loaded and now
    /// hears that it left.
    fn withdraw(&self, coord: ChunkCoord, outcome: StoreOutcome) {
        let detached = self.chunks.detach(coord);
        if let (false, Some(chunk)) = (outcome.newly_attached, detached) {
            self.listener.chunk_unloaded(&chunk);
        }
    }

    /// An attached chunk left memory with its buffer.
    fn chunk_evicted(&self, chunk: &ChunkSnapshot) {
        self.listener.chunk_unloaded(chunk);
        self.octree.remove(chunk.coord);
    }

    /// Unload one coordinate unless a marker wants it again. Returns whether
    /// an attached chunk was unloaded.
    fn unload_chunk(&self, coord: ChunkCoord) -> bool {
        if self.is_wanted(coord) {
            return false;
        }
        let detached = self.chunks.detach(coord);
        if let Some(chunk) = &detached {
            self.listener.chunk_unloaded(chunk);
        }
        self.octree.remove(coord);

        // Buffers still overlapping some marker stay for its pending loads
        let side = self.chunks.buffer_side();
        let (key, _) = coord.buffer_location(side);
        if !Self::buffer_wanted(&self.current_regions(), key, side) {
            self.chunks.evict_if_unattached(key, &|chunk| self.chunk_evicted(chunk));
        }
        detached.is_some()
    }

    fn unload_all(&self, coords: &[ChunkCoord]) -> usize {
        let unloaded = coords.iter().filter(|&&c| self.unload_chunk(c)).count();
        let trimmed = self.octree.trim();
        debug!("Unloaded {} chunks, {} octree bytes trimmed", unloaded, trimmed);
        unloaded
    }

    fn current_regions(&self) -> Vec<MarkerRegions> {
        self.markers
            .read()
            .iter()
            .map(|e| e.marker.regions(self.chunk_world_size))
            .collect()
    }

    /// Whether any marker region touches the buffer `key`.
    fn buffer_wanted(regions: &[MarkerRegions], key: BufferKey, buffer_side: u32) -> bool {
        regions.iter().any(|r| r.overlaps_buffer(key, buffer_side))
    }
}

impl Reclaim for WorldLoader {
    fn reclaim(&self, goal: u64, urgent: bool) -> u64 {
        let start = self.memory.allocated();
        let side = self.chunks.buffer_side();
        let wanted = self.current_regions();
        let on_unload = |chunk: &ChunkSnapshot| self.chunk_evicted(chunk);

        let mut evicted = 0;
        while self.memory.allocated() > goal {
            let victim = self
                .chunks
                .select_victim(|info| !Self::buffer_wanted(&wanted, info.key, side))
                .or_else(|| urgent.then(|| self.chunks.select_victim(|_| true)).flatten());
            let Some(key) = victim else {
                break;
            };
            if !self.chunks.evict(key, &on_unload) {
                break;
            }
            evicted += 1;
        }
        self.octree.trim();

        let freed = start.saturating_sub(self.memory.allocated());
        if evicted > 0 {
            info!(
                "Reclaimed {} bytes by evicting {} buffers{}",
                freed,
                evicted,
                if urgent { " (urgent)" } else { "" }
            );
        }
        freed
    }
}

/// Coordinates of `regions` that none of `others` wants.
fn unwanted_by(regions: &MarkerRegions, others: &[MarkerRegions]) -> Vec<ChunkCoord> {
    regions
        .iter()
        .filter(|c| !others.iter().any(|r| r.wants(*c)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{GenerationTask, GeneratorControl, GeneratorStage, LayeredStage};
    use crate::streaming::budget::ReclaimOnPanic;
    use crate::streaming::persistence::MemoryPersistence;
    use crate::voxel::material::MaterialRegistry;
    use glam::Vec3;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        loaded: Mutex<Vec<ChunkCoord>>,
        unloaded: Mutex<Vec<ChunkCoord>>,
        failed: Mutex<Vec<ChunkCoord>>,
    }

    impl WorldListener for Recorder {
        fn chunk_loaded(&self, chunk: &ChunkSnapshot) {
            self.loaded.lock().push(chunk.coord);
        }

        fn chunk_unloaded(&self, chunk: &ChunkSnapshot) {
            self.unloaded.lock().push(chunk.coord);
        }

        fn chunk_failed(&self, coord: ChunkCoord, _error: &Error) {
            self.failed.lock().push(coord);
        }
    }

    /// Fails every chunk with the given x
    struct FailColumn(i32);

    impl GeneratorStage for FailColumn {
        fn name(&self) -> &str {
            "fail-column"
        }

        fn setup(&mut self, _seed: u64, _registry: &MaterialRegistry) -> Result<()> {
            Ok(())
        }

        fn apply(&self, task: &GenerationTask, _control: &mut GeneratorControl) -> Result<()> {
            if task.coord.x == self.0 {
                return Err(Error::Generation {
                    coord: task.coord,
                    reason: "column is cursed".into(),
                });
            }
            Ok(())
        }
    }

    /// Stalls every chunk for a while
    struct Slow(std::time::Duration);

    impl GeneratorStage for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn setup(&mut self, _seed: u64, _registry: &MaterialRegistry) -> Result<()> {
            Ok(())
        }

        fn apply(&self, _task: &GenerationTask, _control: &mut GeneratorControl) -> Result<()> {
            std::thread::sleep(self.0);
            Ok(())
        }
    }

    struct Fixture {
        loader: Arc<WorldLoader>,
        chunks: Arc<ChunkStorage>,
        octree: Arc<OctreeStorage>,
        memory: Arc<MemoryManager>,
        recorder: Arc<Recorder>,
    }

    fn fixture(stages: Vec<Box<dyn GeneratorStage>>) -> Fixture {
        let config = WorldConfig {
            buffer_side: 2,
            ..Default::default()
        };
        let registry = MaterialRegistry::with_materials(["test:stone"]).unwrap();
        let memory = MemoryManager::new(config.memory_preferred, config.memory_max, Arc::new(ReclaimOnPanic));
        memory.set_runtime(Handle::current());
        let chunks = Arc::new(ChunkStorage::new(&config, Arc::new(MemoryPersistence::new()), memory.clone()));
        let octree = Arc::new(OctreeStorage::new(&config, memory.clone()).unwrap());
        let pipeline = Arc::new(Pipeline::new(config.seed, config.chunk_world_size, &registry, stages).unwrap());
        let recorder = Arc::new(Recorder::default());
        let loader = WorldLoader::new(
            &config,
            chunks.clone(),
            octree.clone(),
            pipeline,
            recorder.clone(),
            memory.clone(),
            Handle::current(),
        );
        Fixture {
            loader,
            chunks,
            octree,
            memory,
            recorder,
        }
    }

    fn stone_below_zero() -> Vec<Box<dyn GeneratorStage>> {
        vec![Box::new(LayeredStage::new().band(0.0, "test:stone"))]
    }

    async fn settle(handles: Vec<UpdateHandle>) -> Vec<UpdateReport> {
        let mut reports = Vec::new();
        for handle in handles {
            reports.push(handle.wait().await.unwrap());
        }
        reports
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hard_region_becomes_resident() {
        let f = fixture(stone_below_zero());
        let marker = Arc::new(LoadMarker::new(Vec3::ZERO, 2, 2));
        f.loader.add_marker(marker.clone());

        let reports = settle(f.loader.update(false)).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].generated, 64);
        assert!(!marker.has_moved());

        for coord in marker.regions(16.0).hard.iter() {
            assert_eq!(f.chunks.state(coord), SlotState::Attached, "{:?}", coord);
            assert!(f.octree.content(coord).is_some());
        }
        assert_eq!(f.recorder.loaded.lock().len(), 64);

        // Uniform chunks sit inline in the octree
        assert_eq!(
            f.octree.content(ChunkCoord::new(0, -1, 0)),
            Some(LeafContent::Uniform(1))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unmoved_marker_is_skipped() {
        let f = fixture(stone_below_zero());
        let marker = Arc::new(LoadMarker::new(Vec3::ZERO, 1, 1).with_move_threshold(8.0));
        f.loader.add_marker(marker.clone());
        settle(f.loader.update(false)).await;

        marker.move_to(Vec3::new(2.0, 0.0, 0.0));
        assert!(f.loader.update(false).is_empty());

        let forced = settle(f.loader.update(true)).await;
        assert_eq!(forced[0].already_resident + forced[0].generated, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_move_unloads_old_region() {
        let f = fixture(stone_below_zero());
        let marker = Arc::new(LoadMarker::new(Vec3::ZERO, 1, 1));
        f.loader.add_marker(marker.clone());
        settle(f.loader.update(false)).await;
        let before = f.memory.allocated();

        marker.move_to(Vec3::new(1000.0, 0.0, 0.0));
        let reports = settle(f.loader.update(false)).await;
        assert_eq!(reports[0].unloaded, 8);
        assert_eq!(reports[0].generated, 8);
        assert_eq!(f.recorder.unloaded.lock().len(), 8);
        assert_eq!(f.chunks.state(ChunkCoord::new(0, 0, 0)), SlotState::Empty);
        assert!(f.octree.content(ChunkCoord::new(0, 0, 0)).is_none());
        assert!(f.memory.allocated() <= before * 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shared_coordinates_survive_marker_removal() {
        let f = fixture(stone_below_zero());
        let a = Arc::new(LoadMarker::new(Vec3::ZERO, 1, 1));
        let b = Arc::new(LoadMarker::new(Vec3::new(16.0, 0.0, 0.0), 1, 1));
        f.loader.add_marker(a.clone());
        f.loader.add_marker(b.clone());
        settle(f.loader.update(false)).await;

        assert!(f.loader.remove_marker(&a));
        assert!(!f.loader.remove_marker(&a));
        // Background unload; wait for it by polling the storage
        for _ in 0..200 {
            if f.chunks.state(ChunkCoord::new(-1, 0, 0)) != SlotState::Attached {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_ne!(f.chunks.state(ChunkCoord::new(-1, 0, 0)), SlotState::Attached);
        // x = 0 is shared with b
        assert_eq!(f.chunks.state(ChunkCoord::new(0, 0, 0)), SlotState::Attached);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_generation_failure_reported() {
        let f = fixture(vec![Box::new(FailColumn(0))]);
        let marker = Arc::new(LoadMarker::new(Vec3::ZERO, 1, 1));
        f.loader.add_marker(marker.clone());

        let reports = settle(f.loader.update(false)).await;
        assert_eq!(reports[0].failed, 4);
        assert_eq!(reports[0].generated, 4);
        assert!(f.recorder.failed.lock().iter().all(|c| c.x == 0));
        assert!(marker.has_moved(), "failed chunks are retried next update");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reclaim_prefers_unwanted_buffers() {
        let f = fixture(stone_below_zero());
        let marker = Arc::new(LoadMarker::new(Vec3::ZERO, 1, 1));
        f.loader.add_marker(marker.clone());
        settle(f.loader.update(false)).await;

        // A buffer nobody wants
        let far = ChunkCoord::new(100, 0, 0);
        let encoded = encoding::encode(&vec![1; crate::voxel::chunk::CHUNK_VOLUME]);
        f.chunks
            .store(far, &encoded, ChunkOrigin::Generated, Admission::Hard, &|_| {})
            .unwrap();
        f.chunks.detach(far);
        let buffers = f.chunks.buffer_count();

        let freed = f.loader.reclaim(0, false);
        assert!(freed > 0);
        assert_eq!(f.chunks.buffer_count(), buffers - 1);
        assert_eq!(f.chunks.state(ChunkCoord::new(0, 0, 0)), SlotState::Attached);

        // Urgent reclaim may take wanted regions too
        f.loader.reclaim(0, true);
        assert_eq!(f.chunks.buffer_count(), 0);
        assert_eq!(f.recorder.unloaded.lock().len(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_markers_ordered_by_importance() {
        let f = fixture(stone_below_zero());
        let small = Arc::new(LoadMarker::new(Vec3::ZERO, 1, 1));
        let large = Arc::new(LoadMarker::new(Vec3::ZERO, 1, 4));
        f.loader.add_marker(small.clone());
        f.loader.add_marker(large.clone());
        f.loader.add_marker(large.clone());

        let markers = f.loader.markers();
        assert_eq!(markers.len(), 2);
        assert!(Arc::ptr_eq(&markers[0], &large));
    }

    fn count_of(events: &Mutex<Vec<ChunkCoord>>, coord: ChunkCoord) -> usize {
        events.lock().iter().filter(|&&c| c == coord).count()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_after_move_reports_unload() {
        let f = fixture(stone_below_zero());
        let marker = Arc::new(LoadMarker::new(Vec3::ZERO, 1, 1));
        f.loader.add_marker(marker.clone());
        settle(f.loader.update(false)).await;

        let origin = ChunkCoord::new(0, 0, 0);
        marker.move_to(Vec3::new(1000.0, 0.0, 0.0));
        f.loader.write(origin, &vec![1; CHUNK_VOLUME]).unwrap();
        assert_eq!(f.chunks.state(origin), SlotState::Detached);
        assert_eq!(count_of(&f.recorder.unloaded, origin), 1);

        settle(f.loader.update(false)).await;
        assert_eq!(count_of(&f.recorder.loaded, origin), 1);
        assert_eq!(count_of(&f.recorder.unloaded, origin), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unload_keeps_buffers_other_markers_want() {
        let f = fixture(stone_below_zero());
        let a = Arc::new(LoadMarker::new(Vec3::ZERO, 1, 1));
        f.loader.add_marker(a.clone());
        settle(f.loader.update(false)).await;

        // b covers x in 1..=2 and has not loaded anything yet
        let b = Arc::new(LoadMarker::new(Vec3::new(32.0, 0.0, 0.0), 1, 1));
        f.loader.add_marker(b);
        a.move_to(Vec3::new(1000.0, 0.0, 0.0));

        let shared = ChunkCoord::new(0, 0, 0);
        let lonely = ChunkCoord::new(-1, -1, -1);
        assert_eq!(f.loader.unload_all(&[shared, lonely]), 2);
        assert_eq!(f.recorder.unloaded.lock().len(), 2);

        // The buffer of (0, 0, 0) also holds b's (1, 0, 0)
        assert_eq!(f.chunks.state(shared), SlotState::Detached);
        assert_eq!(f.chunks.state(lonely), SlotState::Empty);
        assert!(f.octree.content(shared).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loads_finishing_after_move_are_discarded() {
        let f = fixture(vec![
            Box::new(Slow(std::time::Duration::from_millis(50))),
            Box::new(LayeredStage::new().band(0.0, "test:stone")),
        ]);
        let marker = Arc::new(LoadMarker::new(Vec3::ZERO, 1, 1));
        f.loader.add_marker(marker.clone());
        let old = marker.regions(16.0);

        let first = f.loader.update(false);
        marker.move_to(Vec3::new(1000.0, 0.0, 0.0));
        let second = f.loader.update(false);
        assert_eq!(second.len(), 1);

        let first = settle(first).await;
        let second = settle(second).await;
        assert!(first[0].discarded > 0, "{:?}", first[0]);
        assert_eq!(second[0].generated, 8);

        for coord in old.iter() {
            assert_ne!(f.chunks.state(coord), SlotState::Attached, "{:?}", coord);
            assert!(f.octree.content(coord).is_none());
        }
        assert!(f.recorder.loaded.lock().iter().all(|c| !old.wants(*c)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writes_last_one_wins() {
        let f = fixture(stone_below_zero());
        let marker = Arc::new(LoadMarker::new(Vec3::ZERO, 1, 1));
        f.loader.add_marker(marker.clone());
        settle(f.loader.update(false)).await;

        let footprints = |chunks: &ChunkStorage| -> u64 {
            chunks.resident_buffers().iter().map(|b| b.footprint as u64).sum()
        };
        let octree_charge = f.memory.allocated() - footprints(&f.chunks);
        let groups = f.octree.group_count();

        let coord = ChunkCoord::new(0, 0, 0);
        let mut tasks = JoinSet::new();
        for material in 1..=8u16 {
            let loader = Arc::clone(&f.loader);
            tasks.spawn_blocking(move || loader.write(coord, &vec![material; CHUNK_VOLUME]));
        }
        let mut ids = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            ids.push(joined.unwrap().unwrap());
        }

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        let blocks = f.chunks.blocks(ids[0]).unwrap();
        assert!((1..=8).contains(&blocks[0]));
        assert!(blocks.iter().all(|&b| b == blocks[0]));
        assert_eq!(f.chunks.state(coord), SlotState::Attached);

        assert_eq!(f.octree.group_count(), groups);
        assert_eq!(f.memory.allocated() - footprints(&f.chunks), octree_charge);
    }
}
