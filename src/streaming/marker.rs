//! Load markers and the chunk regions they keep resident

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use glam::{IVec3, Vec3};
use parking_lot::Mutex;

use crate::voxel::chunk::{BufferKey, ChunkCoord};

/// Axis-aligned cube of chunk coordinates, `min` inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRegion {
    pub min: IVec3,
    /// Chunks per edge
    pub side: i32,
}

impl ChunkRegion {
    /// Chunks within `radius` chunks of `position`: per axis
    /// `floor((p - r*s) / s) <= c < floor((p - r*s) / s) + 2r`.
    pub fn around(position: Vec3, radius: u32, chunk_world_size: f32) -> Self {
        let r = radius as f32 * chunk_world_size;
        let min = ((position - Vec3::splat(r)) / chunk_world_size).floor().as_ivec3();
        Self {
            min,
            side: radius as i32 * 2,
        }
    }

    pub fn max(&self) -> IVec3 {
        self.min + IVec3::splat(self.side)
    }

    pub fn contains(&self, coord: ChunkCoord) -> bool {
        let c = coord.as_ivec3();
        c.cmpge(self.min).all() && c.cmplt(self.max()).all()
    }

    /// Whether any chunk of the buffer region `key` lies inside.
    pub fn overlaps_buffer(&self, key: BufferKey, buffer_side: u32) -> bool {
        let side = buffer_side as i32;
        let lo = key.region() * side;
        let hi = lo + IVec3::splat(side);
        lo.cmplt(self.max()).all() && hi.cmpgt(self.min).all()
    }

    pub fn len(&self) -> usize {
        (self.side.max(0) as usize).pow(3)
    }

    pub fn is_empty(&self) -> bool {
        self.side <= 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ChunkCoord> + '_ {
        let side = self.side.max(0);
        let min = self.min;
        (0..side).flat_map(move |z| {
            (0..side).flat_map(move |y| {
                (0..side).map(move |x| ChunkCoord::new(min.x + x, min.y + y, min.z + z))
            })
        })
    }
}

/// The two regions a marker asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkerRegions {
    /// Must stay resident
    pub hard: ChunkRegion,
    /// Should stay resident, loaded at lower priority
    pub soft: ChunkRegion,
}

impl MarkerRegions {
    pub fn wants(&self, coord: ChunkCoord) -> bool {
        self.hard.contains(coord) || self.soft.contains(coord)
    }

    pub fn requires(&self, coord: ChunkCoord) -> bool {
        self.hard.contains(coord)
    }

    pub fn overlaps_buffer(&self, key: BufferKey, buffer_side: u32) -> bool {
        self.hard.overlaps_buffer(key, buffer_side) || self.soft.overlaps_buffer(key, buffer_side)
    }

    /// Every wanted coordinate once, hard ones first.
    pub fn iter(&self) -> impl Iterator<Item = ChunkCoord> + '_ {
        self.hard
            .iter()
            .chain(self.soft.iter().filter(|c| !self.hard.contains(*c)))
    }
}

#[derive(Debug)]
struct MarkerPosition {
    current: Vec3,
    /// Position at the last completed update
    anchor: Vec3,
}

/// Captured at the start of an update; completing the update clears the
/// moved flag only if the marker has not moved since.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MarkerTicket {
    pub generation: u64,
    pub position: Vec3,
}

/// Observer position with the radii (in chunks) it keeps loaded.
///
/// Shared between the caller, who moves it, and the world, which reads it
/// on every update.
#[derive(Debug)]
pub struct LoadMarker {
    position: Mutex<MarkerPosition>,
    hard_radius: u32,
    soft_radius: u32,
    move_threshold: f32,
    moved: AtomicBool,
    generation: AtomicU64,
}

impl LoadMarker {
    /// A soft radius smaller than the hard radius is raised to match it.
    /// New markers start out moved.
    pub fn new(position: Vec3, hard_radius: u32, soft_radius: u32) -> Self {
        Self {
            position: Mutex::new(MarkerPosition {
                current: position,
                anchor: position,
            }),
            hard_radius,
            soft_radius: soft_radius.max(hard_radius),
            move_threshold: 0.0,
            moved: AtomicBool::new(true),
            generation: AtomicU64::new(1),
        }
    }

    /// Moves shorter than `threshold` world units (from the position of the
    /// last completed update) do not trigger a reload.
    pub fn with_move_threshold(mut self, threshold: f32) -> Self {
        self.move_threshold = threshold.max(0.0);
        self
    }

    pub fn position(&self) -> Vec3 {
        self.position.lock().current
    }

    pub fn hard_radius(&self) -> u32 {
        self.hard_radius
    }

    pub fn soft_radius(&self) -> u32 {
        self.soft_radius
    }

    pub fn move_threshold(&self) -> f32 {
        self.move_threshold
    }

    /// Importance used to order markers: bigger first.
    pub fn importance(&self) -> (u32, u32) {
        (self.soft_radius, self.hard_radius)
    }

    /// Move the marker. Returns whether the move counts as a move.
    pub fn move_to(&self, position: Vec3) -> bool {
        let mut pos = self.position.lock();
        pos.current = position;
        if pos.anchor.distance(position) < self.move_threshold {
            return false;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.moved.store(true, Ordering::Release);
        true
    }

    pub fn has_moved(&self) -> bool {
        self.moved.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn begin_update(&self) -> MarkerTicket {
        let pos = self.position.lock();
        MarkerTicket {
            generation: self.generation.load(Ordering::Acquire),
            position: pos.current,
        }
    }

    /// Mark the update described by `ticket` complete. Returns `false` if a
    /// newer move arrived meanwhile; the marker then stays moved.
    pub fn complete_update(&self, ticket: MarkerTicket) -> bool {
        let mut pos = self.position.lock();
        if self.generation.load(Ordering::Acquire) != ticket.generation {
            return false;
        }
        pos.anchor = ticket.position;
        self.moved.store(false, Ordering::Release);
        true
    }

    /// Regions around the current position.
    pub fn regions(&self, chunk_world_size: f32) -> MarkerRegions {
        self.regions_at(self.position(), chunk_world_size)
    }

    pub fn regions_at(&self, position: Vec3, chunk_world_size: f32) -> MarkerRegions {
        MarkerRegions {
            hard: ChunkRegion::around(position, self.hard_radius, chunk_world_size),
            soft: ChunkRegion::around(position, self.soft_radius, chunk_world_size),
        }
    }
}
