//! Master octree nodes and node addressing

use glam::Vec3;
use rkyv::{Archive, Deserialize, Serialize};

use crate::voxel::chunk::{ChunkCoord, ChunkId, ChunkSnapshot};
use crate::voxel::material::MaterialId;

/// Index of a node in the grouped node pool: `group * group_size + offset`
pub type NodeIndex = u32;

/// Bit that marks a [`NodeId`] as referring to a chunk
const CHUNK_FLAG: u32 = 0x8000_0000;

/// One child of an internal node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Archive, Deserialize, Serialize)]
pub enum ChildSlot {
    Empty,
    Node(NodeIndex),
    /// Chunk-sized cell filled with one material, stored without a leaf node
    Uniform(MaterialId),
}

/// Octree node
///
/// Internal nodes split their cube into eight octants (bit 0 = x, bit 1 = y,
/// bit 2 = z). Leaves sit one level below the deepest internal nodes and
/// each covers exactly one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Archive, Deserialize, Serialize)]
pub enum OctreeNode {
    Internal {
        children: [ChildSlot; 8],
    },
    Leaf {
        /// World-space minimum corner of the chunk
        origin: [f32; 3],
        /// Morton key of the chunk relative to the root cube
        key: u64,
        /// Resident chunk, if any
        chunk: Option<ChunkId>,
    },
}

impl OctreeNode {
    /// Internal node with no children
    pub const fn empty() -> Self {
        OctreeNode::Internal {
            children: [ChildSlot::Empty; 8],
        }
    }

    pub fn leaf(origin: Vec3, key: u64, chunk: Option<ChunkId>) -> Self {
        OctreeNode::Leaf {
            origin: origin.to_array(),
            key,
            chunk,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, OctreeNode::Leaf { .. })
    }

    /// Internal node whose children are all empty
    pub fn is_empty(&self) -> bool {
        match self {
            OctreeNode::Internal { children } => children.iter().all(|c| *c == ChildSlot::Empty),
            OctreeNode::Leaf { .. } => false,
        }
    }

    pub fn child(&self, octant: u8) -> ChildSlot {
        debug_assert!(octant < 8);
        match self {
            OctreeNode::Internal { children } => children[octant as usize],
            OctreeNode::Leaf { .. } => ChildSlot::Empty,
        }
    }

    pub fn set_child(&mut self, octant: u8, slot: ChildSlot) {
        debug_assert!(octant < 8);
        if let OctreeNode::Internal { children } = self {
            children[octant as usize] = slot;
        }
    }

    pub fn child_count(&self) -> u8 {
        match self {
            OctreeNode::Internal { children } => {
                children.iter().filter(|c| **c != ChildSlot::Empty).count() as u8
            }
            OctreeNode::Leaf { .. } => 0,
        }
    }

    /// Chunk referenced by a leaf
    pub fn chunk(&self) -> Option<ChunkId> {
        match self {
            OctreeNode::Leaf { chunk, .. } => *chunk,
            OctreeNode::Internal { .. } => None,
        }
    }

    pub fn origin(&self) -> Option<Vec3> {
        match self {
            OctreeNode::Leaf { origin, .. } => Some(Vec3::from_array(*origin)),
            OctreeNode::Internal { .. } => None,
        }
    }
}

impl Default for OctreeNode {
    fn default() -> Self {
        Self::empty()
    }
}

/// Packed reference to either an octree node or a resident chunk.
///
/// The top bit is the discriminator; the remaining 31 bits hold a
/// [`NodeIndex`] or a packed [`ChunkId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn octree(index: NodeIndex) -> Self {
        debug_assert!(index & CHUNK_FLAG == 0);
        Self(index & !CHUNK_FLAG)
    }

    pub fn chunk(id: ChunkId) -> Self {
        Self(id.pack() | CHUNK_FLAG)
    }

    pub fn is_chunk(self) -> bool {
        self.0 & CHUNK_FLAG != 0
    }

    pub fn target(self) -> NodeTarget {
        if self.is_chunk() {
            NodeTarget::Chunk(ChunkId::unpack(self.0 & !CHUNK_FLAG))
        } else {
            NodeTarget::Octree(self.0)
        }
    }
}

/// Decoded form of a [`NodeId`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeTarget {
    Octree(NodeIndex),
    Chunk(ChunkId),
}

/// What a world query resolves to.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    /// Structural node; for an unloaded leaf the chunk reference is `None`
    Octree { index: NodeIndex, node: OctreeNode },
    /// Chunk-sized cell of a single material
    Uniform { coord: ChunkCoord, material: MaterialId },
    /// Resident chunk data
    Chunk(ChunkSnapshot),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_slots() {
        let mut node = OctreeNode::empty();
        assert!(node.is_empty());

        node.set_child(0, ChildSlot::Node(12));
        node.set_child(3, ChildSlot::Uniform(4));
        node.set_child(7, ChildSlot::Node(13));

        assert_eq!(node.child(0), ChildSlot::Node(12));
        assert_eq!(node.child(1), ChildSlot::Empty);
        assert_eq!(node.child(3), ChildSlot::Uniform(4));
        assert_eq!(node.child_count(), 3);
        assert!(!node.is_empty());
    }

    #[test]
    fn test_leaf_accessors() {
        let id = ChunkId::new(2, 9);
        let leaf = OctreeNode::leaf(Vec3::new(16.0, 0.0, -32.0), 77, Some(id));
        assert!(leaf.is_leaf());
        assert!(!leaf.is_empty());
        assert_eq!(leaf.chunk(), Some(id));
        assert_eq!(leaf.origin(), Some(Vec3::new(16.0, 0.0, -32.0)));
        assert_eq!(leaf.child_count(), 0);
    }

    #[test]
    fn test_node_id_discriminator() {
        let id = ChunkId::new(0x7fff, 0xffff);
        let packed = NodeId::chunk(id);
        assert!(packed.is_chunk());
        assert_eq!(packed.target(), NodeTarget::Chunk(id));

        let node = NodeId::octree(513);
        assert!(!node.is_chunk());
        assert_eq!(node.target(), NodeTarget::Octree(513));
    }
}
