//! Fixed-capacity chunk buffers
//!
//! A buffer covers a cubic region of `side³` chunk coordinates. Compressed
//! payloads live back to back in one byte vector; a header table indexed by
//! slot records where each payload currently sits. Slots never move, so a
//! [`ChunkId`](crate::voxel::chunk::ChunkId) stays valid across compaction.

use log::{debug, warn};

use crate::voxel::chunk::{CHUNK_VOLUME, ChunkCoord, BufferKey};
use crate::voxel::encoding::{self, ChunkType, EncodedChunk};

/// Residency state of one slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// No data
    Empty,
    /// Inside some marker region, listener informed
    Attached,
    /// Data retained but outside every marker region
    Detached,
}

/// How a chunk's data came to be; decides whether losing it is acceptable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkOrigin {
    /// Produced by the generator pipeline, can be produced again
    Generated,
    /// Written by a caller; lost for good if never persisted
    Edited,
}

#[derive(Clone, Copy, Debug)]
struct SlotHeader {
    kind: ChunkType,
    offset: usize,
    len: usize,
    coord: ChunkCoord,
    state: SlotState,
}

/// Bytes charged per header table entry.
const HEADER_BYTES: usize = std::mem::size_of::<Option<SlotHeader>>();

/// Borrowed view of one stored chunk.
#[derive(Clone, Copy, Debug)]
pub struct SlotView<'a> {
    pub slot: u16,
    pub coord: ChunkCoord,
    pub kind: ChunkType,
    pub payload: &'a [u8],
    pub state: SlotState,
}

#[derive(Clone)]
pub struct ChunkBuffer {
    key: BufferKey,
    side: u32,
    headers: Vec<Option<SlotHeader>>,
    data: Vec<u8>,
    dead: usize,
    attached: usize,
    /// Bumped on every content change
    revision: u64,
    saved_revision: u64,
    /// Holds edited data that has not reached persistence yet
    edited: bool,
}

impl ChunkBuffer {
    pub fn new(key: BufferKey, side: u32) -> Self {
        let capacity = (side * side * side) as usize;
        Self {
            key,
            side,
            headers: vec![None; capacity],
            data: Vec::new(),
            dead: 0,
            attached: 0,
            revision: 1,
            saved_revision: 0,
            edited: false,
        }
    }

    pub fn key(&self) -> BufferKey {
        self.key
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    pub fn capacity(&self) -> usize {
        self.headers.len()
    }

    /// Bytes this buffer accounts for against the memory budget.
    pub fn footprint(&self) -> usize {
        self.data.len() + self.headers.len() * HEADER_BYTES
    }

    /// Footprint of a freshly created buffer with the given side.
    pub fn empty_footprint(side: u32) -> usize {
        (side * side * side) as usize * HEADER_BYTES
    }

    pub fn live_bytes(&self) -> usize {
        self.data.len() - self.dead
    }

    pub fn dead_bytes(&self) -> usize {
        self.dead
    }

    pub fn attached_count(&self) -> usize {
        self.attached
    }

    pub fn chunk_count(&self) -> usize {
        self.headers.iter().flatten().count()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Content changed since the last successful save.
    pub fn is_dirty(&self) -> bool {
        self.revision != self.saved_revision
    }

    /// Dirty and holding data that cannot be regenerated.
    pub fn has_unsaved_edits(&self) -> bool {
        self.edited && self.is_dirty()
    }

    /// Record that the content as of `revision` reached persistence.
    pub fn mark_saved(&mut self, revision: u64) {
        self.saved_revision = revision;
        if revision == self.revision {
            self.edited = false;
        }
    }

    /// Treat the current content as already persisted (freshly loaded).
    pub fn mark_clean(&mut self) {
        self.saved_revision = self.revision;
        self.edited = false;
    }

    pub fn state(&self, slot: u16) -> SlotState {
        self.headers
            .get(slot as usize)
            .and_then(|h| h.as_ref())
            .map_or(SlotState::Empty, |h| h.state)
    }

    pub fn get(&self, slot: u16) -> Option<SlotView<'_>> {
        let header = self.headers.get(slot as usize)?.as_ref()?;
        Some(SlotView {
            slot,
            coord: header.coord,
            kind: header.kind,
            payload: &self.data[header.offset..header.offset + header.len],
            state: header.state,
        })
    }

    /// Store a chunk in `slot`, replacing what was there. The previous
    /// payload becomes dead space; the slot keeps its residency state, or
    /// starts out detached.
    pub fn put(&mut self, slot: u16, coord: ChunkCoord, chunk: &EncodedChunk, origin: ChunkOrigin) {
        let Some(entry) = self.headers.get_mut(slot as usize) else {
            warn!("Slot {} out of range for buffer {}", slot, self.key);
            return;
        };
        let state = match entry.take() {
            Some(old) => {
                self.dead += old.len;
                old.state
            }
            None => SlotState::Detached,
        };
        let offset = self.data.len();
        self.data.extend_from_slice(&chunk.data);
        *entry = Some(SlotHeader {
            kind: chunk.kind,
            offset,
            len: chunk.data.len(),
            coord,
            state,
        });
        self.revision += 1;
        if origin == ChunkOrigin::Edited {
            self.edited = true;
        }
        if self.should_compact() {
            self.compact();
        }
    }

    /// Move a stored chunk into the resident set. Returns `true` only on the
    /// transition from detached.
    pub fn attach(&mut self, slot: u16) -> bool {
        match self.headers.get_mut(slot as usize).and_then(|h| h.as_mut()) {
            Some(header) if header.state == SlotState::Detached => {
                header.state = SlotState::Attached;
                self.attached += 1;
                true
            }
            _ => false,
        }
    }

    /// Take a chunk out of the resident set, keeping its data. Returns
    /// `true` only on the transition from attached.
    pub fn detach(&mut self, slot: u16) -> bool {
        match self.headers.get_mut(slot as usize).and_then(|h| h.as_mut()) {
            Some(header) if header.state == SlotState::Attached => {
                header.state = SlotState::Detached;
                self.attached -= 1;
                true
            }
            _ => false,
        }
    }

    /// Detach every attached slot. Returns the number detached.
    pub fn detach_all(&mut self) -> usize {
        let detached = self.attached;
        for header in self.headers.iter_mut().flatten() {
            if header.state == SlotState::Attached {
                header.state = SlotState::Detached;
            }
        }
        self.attached = 0;
        detached
    }

    fn should_compact(&self) -> bool {
        self.dead > 0 && self.dead * 2 > self.data.len()
    }

    /// Rewrite the payload region so that live payloads are contiguous in
    /// slot order. Returns the number of bytes reclaimed.
    pub fn compact(&mut self) -> usize {
        let before = self.data.len();
        let mut packed = Vec::with_capacity(self.live_bytes());
        for header in self.headers.iter_mut().flatten() {
            let start = packed.len();
            packed.extend_from_slice(&self.data[header.offset..header.offset + header.len]);
            header.offset = start;
        }
        self.data = packed;
        self.dead = 0;
        let reclaimed = before - self.data.len();
        debug!("Compacted buffer {}: {} bytes reclaimed", self.key, reclaimed);
        reclaimed
    }

    /// Replace every payload that fails to decode with an empty chunk.
    /// Returns the number of repaired slots.
    pub fn repair(&mut self) -> usize {
        let broken: Vec<(u16, ChunkCoord)> = self
            .iter()
            .filter_map(|view| match encoding::decode(view.kind, view.payload, CHUNK_VOLUME) {
                Ok(_) => None,
                Err(e) => {
                    warn!("Chunk {:?} in buffer {} is unreadable, treating as empty: {}", view.coord, self.key, e);
                    Some((view.slot, view.coord))
                }
            })
            .collect();
        for &(slot, coord) in &broken {
            self.put(slot, coord, &EncodedChunk::empty(), ChunkOrigin::Generated);
        }
        broken.len()
    }

    /// Every occupied slot in slot order.
    pub fn iter(&self) -> impl Iterator<Item = SlotView<'_>> {
        self.headers.iter().enumerate().filter_map(|(slot, header)| {
            let header = header.as_ref()?;
            Some(SlotView {
                slot: slot as u16,
                coord: header.coord,
                kind: header.kind,
                payload: &self.data[header.offset..header.offset + header.len],
                state: header.state,
            })
        })
    }
}

impl std::fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("key", &self.key)
            .field("chunks", &self.chunk_count())
            .field("attached", &self.attached)
            .field("bytes", &self.data.len())
            .field("dead", &self.dead)
            .finish()
    }
}
