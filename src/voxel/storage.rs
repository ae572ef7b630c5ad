//! Resident chunk buffers
//!
//! At most `max_buffers` buffers are resident. Each occupies a pool index
//! that, together with the slot, forms a [`ChunkId`]. Memory is reserved
//! before the structural lock is taken and released after it is dropped;
//! persistence and unload callbacks also run without the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, info, trace, warn};
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::core::config::WorldConfig;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::streaming::budget::MemoryManager;
use crate::streaming::persistence::ChunkPersistence;
use crate::voxel::buffer::{ChunkBuffer, ChunkOrigin, SlotState, SlotView};
use crate::voxel::chunk::{BufferKey, CHUNK_VOLUME, ChunkCoord, ChunkId, ChunkSnapshot};
use crate::voxel::encoding::EncodedChunk;
use crate::voxel::material::{EMPTY_MATERIAL, MaterialId};

/// How a reservation made on behalf of a chunk is admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Escalates to the panic handler when over the hard limit
    Hard,
    /// Refused above the preferred limit
    Soft,
}

/// Result of placing a chunk into the resident set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreOutcome {
    pub id: ChunkId,
    /// Whether this call moved the chunk into the resident set
    pub newly_attached: bool,
}

/// Summary of one resident buffer
#[derive(Clone, Copy, Debug)]
pub struct BufferInfo {
    pub key: BufferKey,
    pub pool: u16,
    pub chunks: usize,
    pub attached: usize,
    pub footprint: usize,
    pub last_used: u64,
    pub dirty: bool,
}

struct Resident {
    buffer: ChunkBuffer,
    last_used: AtomicU64,
}

#[derive(Default)]
struct StorageInner {
    pools: Vec<Option<Resident>>,
    by_key: HashMap<BufferKey, u16>,
    /// Evicted buffers whose edits could not be saved
    parked: HashMap<BufferKey, ChunkBuffer>,
}

impl StorageInner {
    fn resident(&self, pool: u16) -> Option<&Resident> {
        self.pools.get(pool as usize)?.as_ref()
    }

    fn resident_mut(&mut self, pool: u16, key: BufferKey) -> Option<&mut Resident> {
        self.pools
            .get_mut(pool as usize)?
            .as_mut()
            .filter(|r| r.buffer.key() == key)
    }

    /// Take the least recently used buffer out if the pool is full,
    /// preferring one with nothing attached.
    fn make_room(&mut self, max_buffers: usize) -> Option<(u16, ChunkBuffer)> {
        if self.by_key.len() < max_buffers {
            return None;
        }
        let lru = |attached_ok: bool| {
            self.pools
                .iter()
                .enumerate()
                .filter_map(|(i, r)| r.as_ref().map(|r| (i, r)))
                .filter(|(_, r)| attached_ok || r.buffer.attached_count() == 0)
                .min_by_key(|(_, r)| r.last_used.load(Ordering::Relaxed))
                .map(|(i, _)| i)
        };
        let victim = lru(false).or_else(|| lru(true))?;
        let resident = self.pools[victim].take()?;
        self.by_key.remove(&resident.buffer.key());
        Some((victim as u16, resident.buffer))
    }

    fn install(&mut self, buffer: ChunkBuffer, tick: u64) -> u16 {
        let key = buffer.key();
        let resident = Resident {
            buffer,
            last_used: AtomicU64::new(tick),
        };
        let index = match self.pools.iter().position(Option::is_none) {
            Some(i) => {
                self.pools[i] = Some(resident);
                i
            }
            None => {
                self.pools.push(Some(resident));
                self.pools.len() - 1
            }
        };
        let pool = index as u16;
        self.by_key.insert(key, pool);
        pool
    }
}

fn snapshot(pool: u16, view: SlotView<'_>) -> ChunkSnapshot {
    ChunkSnapshot {
        id: ChunkId::new(pool, view.slot),
        coord: view.coord,
        encoding: view.kind,
        payload: view.payload.to_vec(),
    }
}

/// Pool of resident chunk buffers backed by a persistence collaborator.
pub struct ChunkStorage {
    inner: RwLock<StorageInner>,
    persistence: Arc<dyn ChunkPersistence>,
    memory: Arc<MemoryManager>,
    buffer_side: u32,
    max_buffers: usize,
    clock: AtomicU64,
}

impl ChunkStorage {
    pub fn new(
        config: &WorldConfig,
        persistence: Arc<dyn ChunkPersistence>,
        memory: Arc<MemoryManager>,
    ) -> Self {
        Self {
            inner: RwLock::new(StorageInner::default()),
            persistence,
            memory,
            buffer_side: config.buffer_side,
            max_buffers: config.max_buffers,
            clock: AtomicU64::new(0),
        }
    }

    pub fn buffer_side(&self) -> u32 {
        self.buffer_side
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn reserve(&self, bytes: usize, admission: Admission) -> Result<()> {
        match admission {
            Admission::Hard => self.memory.reserve(bytes as u64),
            Admission::Soft => self.memory.reserve_soft(bytes as u64),
        }
    }

    /// Resident chunk id for a coordinate, if it holds data.
    pub fn lookup(&self, coord: ChunkCoord) -> Option<ChunkId> {
        let (key, slot) = coord.buffer_location(self.buffer_side);
        let inner = self.inner.read();
        let pool = *inner.by_key.get(&key)?;
        let resident = inner.resident(pool)?;
        (resident.buffer.state(slot) != SlotState::Empty).then(|| ChunkId::new(pool, slot))
    }

    pub fn state(&self, coord: ChunkCoord) -> SlotState {
        let (key, slot) = coord.buffer_location(self.buffer_side);
        let inner = self.inner.read();
        inner
            .by_key
            .get(&key)
            .and_then(|&pool| inner.resident(pool))
            .map_or(SlotState::Empty, |r| r.buffer.state(slot))
    }

    /// Copy of the chunk behind a stable id.
    pub fn get_chunk(&self, id: ChunkId) -> Option<ChunkSnapshot> {
        let inner = self.inner.read();
        let resident = inner.resident(id.pool)?;
        resident.last_used.store(self.tick(), Ordering::Relaxed);
        resident.buffer.get(id.slot).map(|view| snapshot(id.pool, view))
    }

    /// Decoded blocks of a chunk. Unreadable data reads as empty.
    pub fn blocks(&self, id: ChunkId) -> Option<Vec<MaterialId>> {
        let chunk = self.get_chunk(id)?;
        match chunk.blocks() {
            Ok(blocks) => Some(blocks),
            Err(e) => {
                warn!("Chunk {:?} is unreadable, treating as empty: {}", chunk.coord, e);
                Some(vec![EMPTY_MATERIAL; CHUNK_VOLUME])
            }
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.inner.read().by_key.len()
    }

    pub fn parked_count(&self) -> usize {
        self.inner.read().parked.len()
    }

    pub fn resident_buffers(&self) -> Vec<BufferInfo> {
        let inner = self.inner.read();
        inner
            .pools
            .iter()
            .enumerate()
            .filter_map(|(pool, r)| {
                let r = r.as_ref()?;
                Some(BufferInfo {
                    key: r.buffer.key(),
                    pool: pool as u16,
                    chunks: r.buffer.chunk_count(),
                    attached: r.buffer.attached_count(),
                    footprint: r.buffer.footprint(),
                    last_used: r.last_used.load(Ordering::Relaxed),
                    dirty: r.buffer.is_dirty(),
                })
            })
            .collect()
    }

    /// Least recently used buffer accepted by `filter`.
    pub fn select_victim(&self, filter: impl Fn(&BufferInfo) -> bool) -> Option<BufferKey> {
        self.resident_buffers()
            .into_iter()
            .filter(|info| filter(info))
            .min_by_key(|info| info.last_used)
            .map(|info| info.key)
    }

    /// Load a buffer from persistence, or start an empty one.
    fn load_or_create(&self, key: BufferKey) -> ChunkBuffer {
        match self.persistence.load_chunks(key) {
            Ok(Some(mut buffer)) if buffer.side() == self.buffer_side => {
                buffer.mark_clean();
                let repaired = buffer.repair();
                if repaired > 0 {
                    warn!("Buffer {}: {} unreadable chunks replaced with empty ones", key, repaired);
                }
                trace!("Buffer {} loaded with {} chunks", key, buffer.chunk_count());
                buffer
            }
            Ok(Some(buffer)) => {
                warn!(
                    "Buffer {} was saved with side {}, expected {}; starting empty",
                    key,
                    buffer.side(),
                    self.buffer_side
                );
                ChunkBuffer::new(key, self.buffer_side)
            }
            Ok(None) => ChunkBuffer::new(key, self.buffer_side),
            Err(e) => {
                warn!("Failed to load buffer {}, starting empty: {}", key, e);
                ChunkBuffer::new(key, self.buffer_side)
            }
        }
    }

    /// Make the buffer for `key` resident, loading it from persistence if
    /// needed. A full pool first persists and frees its least recently used
    /// buffer, so the budget never carries the victim and the newcomer at
    /// once.
    pub fn ensure_buffer(
        &self,
        key: BufferKey,
        admission: Admission,
        on_unload: &dyn Fn(&ChunkSnapshot),
    ) -> Result<u16> {
        {
            let inner = self.inner.read();
            if let Some(&pool) = inner.by_key.get(&key) {
                if let Some(resident) = inner.resident(pool) {
                    resident.last_used.store(self.tick(), Ordering::Relaxed);
                }
                return Ok(pool);
            }
        }

        let victim = {
            let mut inner = self.inner.write();
            if let Some(&pool) = inner.by_key.get(&key) {
                return Ok(pool);
            }
            // A parked buffer is already charged and newer than its saved image
            if let Some(buffer) = inner.parked.remove(&key) {
                let victim = inner.make_room(self.max_buffers);
                let pool = inner.install(buffer, self.tick());
                drop(inner);
                debug!("Buffer {} restored from the unsaved set", key);
                if let Some((victim_pool, victim)) = victim {
                    self.finish_eviction(victim_pool, victim, on_unload);
                }
                return Ok(pool);
            }
            inner.make_room(self.max_buffers)
        };
        if let Some((victim_pool, victim)) = victim {
            self.finish_eviction(victim_pool, victim, on_unload);
        }

        let buffer = self.load_or_create(key);
        let charged = buffer.footprint();
        self.reserve(charged, admission)?;

        let (pool, victim) = {
            let mut inner = self.inner.write();
            if let Some(&pool) = inner.by_key.get(&key) {
                drop(inner);
                self.memory.release(charged as u64);
                return Ok(pool);
            }
            let buffer = match inner.parked.remove(&key) {
                Some(parked) => {
                    self.memory.release(charged as u64);
                    parked
                }
                None => buffer,
            };
            // Only when another thread filled the freed slot meanwhile
            let victim = inner.make_room(self.max_buffers);
            (inner.install(buffer, self.tick()), victim)
        };
        if let Some((victim_pool, victim)) = victim {
            self.finish_eviction(victim_pool, victim, on_unload);
        }
        debug!("Buffer {} resident in pool {}", key, pool);
        Ok(pool)
    }

    /// Move a stored chunk into the resident set, loading its buffer first.
    /// `Ok(None)` when the buffer holds no data for the coordinate.
    pub fn attach(
        &self,
        coord: ChunkCoord,
        admission: Admission,
        on_unload: &dyn Fn(&ChunkSnapshot),
    ) -> Result<Option<StoreOutcome>> {
        let (key, slot) = coord.buffer_location(self.buffer_side);
        loop {
            let pool = self.ensure_buffer(key, admission, on_unload)?;
            let mut inner = self.inner.write();
            let Some(resident) = inner.resident_mut(pool, key) else {
                // Evicted between ensure and lock
                continue;
            };
            if resident.buffer.state(slot) == SlotState::Empty {
                return Ok(None);
            }
            let newly_attached = resident.buffer.attach(slot);
            return Ok(Some(StoreOutcome {
                id: ChunkId::new(pool, slot),
                newly_attached,
            }));
        }
    }

    /// Write a chunk, replacing any previous data (last write wins), and
    /// attach it.
    pub fn store(
        &self,
        coord: ChunkCoord,
        chunk: &EncodedChunk,
        origin: ChunkOrigin,
        admission: Admission,
        on_unload: &dyn Fn(&ChunkSnapshot),
    ) -> Result<StoreOutcome> {
        let (key, slot) = coord.buffer_location(self.buffer_side);
        self.reserve(chunk.len(), admission)?;
        let (outcome, excess) = loop {
            let pool = match self.ensure_buffer(key, admission, on_unload) {
                Ok(pool) => pool,
                Err(e) => {
                    self.memory.release(chunk.len() as u64);
                    return Err(e);
                }
            };
            let tick = self.tick();
            let mut inner = self.inner.write();
            let Some(resident) = inner.resident_mut(pool, key) else {
                continue;
            };
            let before = resident.buffer.footprint();
            resident.buffer.put(slot, coord, chunk, origin);
            let newly_attached = resident.buffer.attach(slot);
            resident.last_used.store(tick, Ordering::Relaxed);
            let after = resident.buffer.footprint();
            break (
                StoreOutcome {
                    id: ChunkId::new(pool, slot),
                    newly_attached,
                },
                (before + chunk.len()).saturating_sub(after),
            );
        };
        if excess > 0 {
            self.memory.release(excess as u64);
        }
        trace!("Stored chunk {:?} as {} ({} bytes)", coord, chunk.kind, chunk.len());
        Ok(outcome)
    }

    /// Take a chunk out of the resident set, keeping its data. Returns its
    /// snapshot only on the transition from attached.
    pub fn detach(&self, coord: ChunkCoord) -> Option<ChunkSnapshot> {
        let (key, slot) = coord.buffer_location(self.buffer_side);
        let mut inner = self.inner.write();
        let pool = *inner.by_key.get(&key)?;
        let resident = inner.resident_mut(pool, key)?;
        if !resident.buffer.detach(slot) {
            return None;
        }
        resident.buffer.get(slot).map(|view| snapshot(pool, view))
    }

    /// Persist and free one buffer. Attached chunks are reported through
    /// `on_unload` first. Returns `false` if the buffer was not resident.
    pub fn evict(&self, key: BufferKey, on_unload: &dyn Fn(&ChunkSnapshot)) -> bool {
        let buffer = {
            let mut inner = self.inner.write();
            let Some(pool) = inner.by_key.remove(&key) else {
                return false;
            };
            inner
                .pools
                .get_mut(pool as usize)
                .and_then(Option::take)
                .map(|r| (pool, r.buffer))
        };
        match buffer {
            Some((pool, buffer)) => {
                self.finish_eviction(pool, buffer, on_unload);
                true
            }
            None => false,
        }
    }

    /// Evict the buffer `key` only if none of its chunks is attached. The
    /// check and the removal happen under one lock, so a chunk attached
    /// concurrently keeps its buffer resident.
    pub fn evict_if_unattached(&self, key: BufferKey, on_unload: &dyn Fn(&ChunkSnapshot)) -> bool {
        let buffer = {
            let mut inner = self.inner.write();
            let Some(&pool) = inner.by_key.get(&key) else {
                return false;
            };
            if inner.resident(pool).is_some_and(|r| r.buffer.attached_count() > 0) {
                return false;
            }
            inner.by_key.remove(&key);
            inner.pools.get_mut(pool as usize).and_then(Option::take).map(|r| (pool, r.buffer))
        };
        match buffer {
            Some((pool, buffer)) => {
                self.finish_eviction(pool, buffer, on_unload);
                true
            }
            None => false,
        }
    }

    /// Second half of an eviction, run with no lock held.
    fn finish_eviction(&self, pool: u16, mut buffer: ChunkBuffer, on_unload: &dyn Fn(&ChunkSnapshot)) {
        let key = buffer.key();
        // Ids carry the pool index the chunks had while resident
        for view in buffer.iter().filter(|v| v.state == SlotState::Attached) {
            on_unload(&snapshot(pool, view));
        }
        buffer.detach_all();

        let footprint = buffer.footprint() as u64;
        if buffer.is_dirty() {
            match self.persistence.save_chunks(key, &buffer) {
                Ok(()) => trace!("Buffer {} saved on eviction", key),
                Err(e) if buffer.has_unsaved_edits() => {
                    error!("Failed to save buffer {}, keeping it for retry: {}", key, e);
                    self.inner.write().parked.insert(key, buffer);
                    return;
                }
                Err(e) => warn!("Failed to save buffer {}, dropping regenerable data: {}", key, e),
            }
        }
        self.memory.release(footprint);
        debug!("Evicted buffer {} ({} bytes)", key, footprint);

        if self.parked_count() > 0 {
            self.retry_parked();
        }
    }

    /// Save one resident buffer if it is dirty. Returns whether it was
    /// written.
    pub fn save_buffer(&self, key: BufferKey) -> Result<bool> {
        let snapshot = {
            let inner = self.inner.read();
            inner
                .by_key
                .get(&key)
                .and_then(|&pool| inner.resident(pool).map(|r| (pool, r)))
                .filter(|(_, r)| r.buffer.is_dirty())
                .map(|(pool, r)| (pool, r.buffer.revision(), r.buffer.clone()))
        };
        let Some((pool, revision, buffer)) = snapshot else {
            return Ok(false);
        };
        self.persistence.save_chunks(key, &buffer)?;
        if let Some(resident) = self.inner.write().resident_mut(pool, key) {
            resident.buffer.mark_saved(revision);
        }
        trace!("Buffer {} saved at revision {}", key, revision);
        Ok(true)
    }

    /// Try again to save buffers whose eviction save failed. Returns the
    /// number saved.
    pub fn retry_parked(&self) -> usize {
        let parked: Vec<(BufferKey, ChunkBuffer)> = self.inner.write().parked.drain().collect();
        let mut saved = 0;
        for (key, buffer) in parked {
            match self.persistence.save_chunks(key, &buffer) {
                Ok(()) => {
                    self.memory.release(buffer.footprint() as u64);
                    saved += 1;
                }
                Err(e) => {
                    warn!("Buffer {} still cannot be saved: {}", key, e);
                    self.inner.write().parked.entry(key).or_insert(buffer);
                }
            }
        }
        saved
    }

    /// Save every dirty resident buffer. Returns the number saved.
    pub fn flush(&self) -> Result<usize> {
        let mut saved = self.retry_parked();

        let dirty: Vec<(u16, u64, ChunkBuffer)> = {
            let inner = self.inner.read();
            inner
                .pools
                .iter()
                .enumerate()
                .filter_map(|(pool, r)| {
                    let r = r.as_ref()?;
                    r.buffer
                        .is_dirty()
                        .then(|| (pool as u16, r.buffer.revision(), r.buffer.clone()))
                })
                .collect()
        };

        let results: Vec<(u16, BufferKey, u64, Result<()>)> = dirty
            .par_iter()
            .map(|(pool, revision, buffer)| {
                let result = self.persistence.save_chunks(buffer.key(), buffer);
                (*pool, buffer.key(), *revision, result)
            })
            .collect();

        let mut first_error = None;
        {
            let mut inner = self.inner.write();
            for (pool, key, revision, result) in results {
                match result {
                    Ok(()) => {
                        saved += 1;
                        if let Some(resident) = inner.resident_mut(pool, key) {
                            resident.buffer.mark_saved(revision);
                        }
                    }
                    Err(e) => {
                        error!("Failed to flush buffer {}: {}", key, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(Error::PersistenceUnavailable(e.to_string())),
            None => {
                if saved > 0 {
                    info!("Flushed {} chunk buffers", saved);
                }
                Ok(saved)
            }
        }
    }
}

impl Drop for ChunkStorage {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let resident: usize = inner.pools.iter().flatten().map(|r| r.buffer.footprint()).sum();
        let parked: usize = inner.parked.values().map(ChunkBuffer::footprint).sum();
        self.memory.release((resident + parked) as u64);
    }
}
