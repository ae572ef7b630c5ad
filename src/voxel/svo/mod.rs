//! Master octree: node types and grouped node storage

pub mod node;
pub mod storage;

pub use node::{ChildSlot, Node, NodeId, NodeIndex, NodeTarget, OctreeNode};
pub use storage::{
    ArchivedNodeGroupImage, LeafContent, Located, MasterOctree, NodeGroupImage, OctreeMeta,
    OctreeStorage,
};
