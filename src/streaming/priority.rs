//! Load ordering within one marker update: hard before soft, then nearer
//! before farther

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use glam::Vec3;

use crate::streaming::marker::MarkerRegions;
use crate::voxel::chunk::ChunkCoord;
use crate::voxel::storage::Admission;

/// Priority information for one wanted chunk
#[derive(Clone, Copy, Debug)]
pub struct ChunkPriority {
    pub coord: ChunkCoord,
    pub admission: Admission,
    /// Squared distance from the marker to the chunk center
    pub distance_sq: f32,
}

impl ChunkPriority {
    pub fn calculate(coord: ChunkCoord, admission: Admission, center: Vec3, chunk_world_size: f32) -> Self {
        Self {
            coord,
            admission,
            distance_sq: center.distance_squared(coord.world_center(chunk_world_size)),
        }
    }

    fn rank(&self) -> u8 {
        match self.admission {
            Admission::Hard => 1,
            Admission::Soft => 0,
        }
    }
}

impl Eq for ChunkPriority {}

impl PartialEq for ChunkPriority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for ChunkPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: hard first, then the smaller distance; coordinate breaks
        // ties so the order is total
        self.rank()
            .cmp(&other.rank())
            .then_with(|| other.distance_sq.total_cmp(&self.distance_sq))
            .then_with(|| other.coord.cmp(&self.coord))
    }
}

impl PartialOrd for ChunkPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of chunks one marker wants loaded
#[derive(Debug, Default)]
pub struct ChunkPriorityQueue {
    heap: BinaryHeap<ChunkPriority>,
}

impl ChunkPriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue every coordinate of `regions` for which `skip` is false.
    pub fn for_regions(
        regions: &MarkerRegions,
        center: Vec3,
        chunk_world_size: f32,
        skip: impl Fn(ChunkCoord) -> bool,
    ) -> Self {
        let mut queue = Self::new();
        for coord in regions.iter().filter(|c| !skip(*c)) {
            let admission = if regions.requires(coord) {
                Admission::Hard
            } else {
                Admission::Soft
            };
            queue.push(ChunkPriority::calculate(coord, admission, center, chunk_world_size));
        }
        queue
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn push(&mut self, priority: ChunkPriority) {
        self.heap.push(priority);
    }

    pub fn pop(&mut self) -> Option<ChunkPriority> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drain in priority order.
    pub fn into_sorted(self) -> Vec<ChunkPriority> {
        let mut sorted = self.heap.into_sorted_vec();
        sorted.reverse();
        sorted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::marker::LoadMarker;

    #[test]
    fn test_nearer_first() {
        let center = Vec3::splat(8.0);
        let near = ChunkPriority::calculate(ChunkCoord::new(0, 0, 0), Admission::Hard, center, 16.0);
        let far = ChunkPriority::calculate(ChunkCoord::new(5, 0, 0), Admission::Hard, center, 16.0);
        assert!(near > far);
    }

    #[test]
    fn test_hard_before_soft() {
        let center = Vec3::ZERO;
        let soft_near = ChunkPriority::calculate(ChunkCoord::new(0, 0, 0), Admission::Soft, center, 16.0);
        let hard_far = ChunkPriority::calculate(ChunkCoord::new(9, 9, 9), Admission::Hard, center, 16.0);
        assert!(hard_far > soft_near);
    }

    #[test]
    fn test_queue_from_regions() {
        let marker = LoadMarker::new(Vec3::ZERO, 1, 2);
        let regions = marker.regions(16.0);
        let skipped = ChunkCoord::new(0, 0, 0);
        let queue = ChunkPriorityQueue::for_regions(&regions, marker.position(), 16.0, |c| c == skipped);
        assert_eq!(queue.len(), 63);

        let order = queue.into_sorted();
        assert!(order.iter().all(|p| p.coord != skipped));
        assert!(order[..7].iter().all(|p| p.admission == Admission::Hard));
        assert!(order[7..].iter().all(|p| p.admission == Admission::Soft));
        assert!(order.windows(2).skip(7).all(|w| w[0].distance_sq <= w[1].distance_sq));
    }

    #[test]
    fn test_pop_order_and_clear() {
        let mut queue = ChunkPriorityQueue::new();
        let center = Vec3::ZERO;
        for x in [3, 1, 2] {
            queue.push(ChunkPriority::calculate(ChunkCoord::new(x, 0, 0), Admission::Hard, center, 16.0));
        }
        assert_eq!(queue.pop().unwrap().coord, ChunkCoord::new(1, 0, 0));
        assert_eq!(queue.len(), 2);
        queue.clear();
        assert!(queue.is_empty());
    }
}
