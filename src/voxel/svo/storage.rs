//! Grouped octree node storage and the master octree
//!
//! Nodes live in fixed-size groups so memory can be charged and returned a
//! group at a time. The root cube is measured in chunks: `2^depth` chunks per
//! edge starting at `base`. Leaves always sit at chunk granularity, so growing
//! the root never moves an existing node.

use std::collections::HashMap;
use std::sync::Arc;

use glam::{IVec3, Vec3};
use log::{debug, info, trace, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::node::{ChildSlot, NodeIndex, OctreeNode};
use crate::core::config::WorldConfig;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::math::morton::{MAX_DEPTH, MortonKey};
use crate::streaming::budget::MemoryManager;
use crate::streaming::persistence::OctreePersistence;
use crate::voxel::chunk::{ChunkCoord, ChunkId};
use crate::voxel::material::MaterialId;

/// Root node, world-space extent and depth of the octree
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MasterOctree {
    pub root: NodeIndex,
    /// Edge length of the root cube in world units
    pub scale: f32,
    /// World-space center of the root cube
    pub center: Vec3,
    /// Levels between the root and chunk-sized leaves
    pub depth: u8,
    /// Minimum chunk coordinate covered by the root
    pub base: IVec3,
}

impl MasterOctree {
    fn compute(root: NodeIndex, depth: u8, base: IVec3, chunk_world_size: f32) -> Self {
        let side = (1u32 << depth) as f32;
        Self {
            root,
            scale: side * chunk_world_size,
            center: (base.as_vec3() + Vec3::splat(side * 0.5)) * chunk_world_size,
            depth,
            base,
        }
    }

    /// Chunks per root cube edge
    pub fn side(&self) -> i64 {
        1i64 << self.depth
    }

    pub fn contains(&self, coord: ChunkCoord) -> bool {
        contains(self.base, self.depth, coord)
    }
}

fn contains(base: IVec3, depth: u8, coord: ChunkCoord) -> bool {
    let side = 1i64 << depth;
    let local = [
        coord.x as i64 - base.x as i64,
        coord.y as i64 - base.y as i64,
        coord.z as i64 - base.z as i64,
    ];
    local.iter().all(|&v| (0..side).contains(&v))
}

/// Base and octant of the old root after one growth step toward `coord`.
fn grow_step(base: IVec3, depth: u8, coord: ChunkCoord) -> (IVec3, u8) {
    let side = 1i32 << depth;
    let mut new_base = base;
    let mut octant = 0u8;
    for (axis, (value, start)) in [(coord.x, base.x), (coord.y, base.y), (coord.z, base.z)]
        .into_iter()
        .enumerate()
    {
        if value < start {
            octant |= 1 << axis;
            new_base[axis] -= side;
        }
    }
    (new_base, octant)
}

/// What occupies a chunk-sized cell
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeafContent {
    /// Resident chunk
    Chunk(ChunkId),
    /// Chunk of one material, stored inline in its parent
    Uniform(MaterialId),
    /// Leaf restored from persistence whose chunk is not resident
    Unloaded,
}

/// Deepest structure found at a world position
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Located {
    Node(NodeIndex),
    Uniform { coord: ChunkCoord, material: MaterialId },
}

/// Serializable node group
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct NodeGroupImage {
    pub index: u32,
    pub nodes: Vec<Option<OctreeNode>>,
}

/// Master octree metadata, persisted as JSON next to the groups
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OctreeMeta {
    pub root: NodeIndex,
    pub depth: u8,
    pub base: [i32; 3],
    pub group_size: u32,
    /// Indices of the groups that were saved
    pub groups: Vec<u32>,
}

struct NodeGroup {
    nodes: Vec<Option<OctreeNode>>,
    live: usize,
}

struct OctreeInner {
    groups: Vec<Option<NodeGroup>>,
    free: Vec<NodeIndex>,
    root: NodeIndex,
    depth: u8,
    base: IVec3,
    /// Leaf nodes by chunk coordinate
    leaves: HashMap<ChunkCoord, NodeIndex>,
    group_size: u32,
}

impl OctreeInner {
    fn split(&self, index: NodeIndex) -> (usize, usize) {
        ((index / self.group_size) as usize, (index % self.group_size) as usize)
    }

    fn node(&self, index: NodeIndex) -> Option<&OctreeNode> {
        let (g, o) = self.split(index);
        self.groups.get(g)?.as_ref()?.nodes.get(o)?.as_ref()
    }

    fn node_mut(&mut self, index: NodeIndex) -> Option<&mut OctreeNode> {
        let (g, o) = self.split(index);
        self.groups.get_mut(g)?.as_mut()?.nodes.get_mut(o)?.as_mut()
    }

    fn child(&self, index: NodeIndex, octant: u8) -> ChildSlot {
        self.node(index).map_or(ChildSlot::Empty, |n| n.child(octant))
    }

    fn set_child(&mut self, index: NodeIndex, octant: u8, slot: ChildSlot) {
        if let Some(node) = self.node_mut(index) {
            node.set_child(octant, slot);
        }
    }

    /// Install a new empty group. Returns its group index.
    fn add_group(&mut self) -> u32 {
        let group = NodeGroup {
            nodes: vec![None; self.group_size as usize],
            live: 0,
        };
        let slot = match self.groups.iter().position(Option::is_none) {
            Some(i) => {
                self.groups[i] = Some(group);
                i
            }
            None => {
                self.groups.push(Some(group));
                self.groups.len() - 1
            }
        };
        let index = slot as u32;
        let first = index * self.group_size;
        self.free.extend((first..first + self.group_size).rev());
        index
    }

    fn alloc(&mut self, node: OctreeNode) -> Result<NodeIndex> {
        let index = self
            .free
            .pop()
            .ok_or_else(|| Error::InvalidConfig("octree node pool exhausted".into()))?;
        let (g, o) = self.split(index);
        match self.groups.get_mut(g).and_then(Option::as_mut) {
            Some(group) => {
                group.nodes[o] = Some(node);
                group.live += 1;
                Ok(index)
            }
            None => Err(Error::InvalidConfig(format!("free node {} has no group", index))),
        }
    }

    fn release(&mut self, index: NodeIndex) {
        let (g, o) = self.split(index);
        if let Some(group) = self.groups.get_mut(g).and_then(Option::as_mut) {
            if group.nodes[o].take().is_some() {
                group.live -= 1;
                self.free.push(index);
            }
        }
    }

    fn key_of(&self, coord: ChunkCoord) -> MortonKey {
        let local = coord.as_ivec3() - self.base;
        MortonKey::encode(local.x as u32, local.y as u32, local.z as u32)
    }

    /// Upper bound on nodes an insertion at `coord` allocates.
    fn nodes_needed(&self, coord: ChunkCoord) -> Result<usize> {
        let (mut base, mut depth) = (self.base, self.depth);
        let mut growth = 0usize;
        while !contains(base, depth, coord) {
            if depth >= MAX_DEPTH {
                return Err(Error::OutOfWorld(coord));
            }
            base = grow_step(base, depth, coord).0;
            depth += 1;
            growth += 1;
        }
        Ok(growth + depth as usize + 1)
    }

    /// Double the root cube toward `coord`.
    fn grow_toward(&mut self, coord: ChunkCoord) -> Result<()> {
        let (new_base, octant) = grow_step(self.base, self.depth, coord);
        let old_root = self.root;
        let old_empty = self.node(old_root).is_none_or(OctreeNode::is_empty);
        let mut root = OctreeNode::empty();
        if !old_empty {
            root.set_child(octant, ChildSlot::Node(old_root));
        }
        self.root = self.alloc(root)?;
        if old_empty {
            self.release(old_root);
        }
        self.depth += 1;
        self.base = new_base;
        Ok(())
    }

    fn rekey_leaves(&mut self) {
        let leaves: Vec<(ChunkCoord, NodeIndex)> =
            self.leaves.iter().map(|(c, i)| (*c, *i)).collect();
        for (coord, index) in leaves {
            let new_key = self.key_of(coord).raw();
            if let Some(OctreeNode::Leaf { key, .. }) = self.node_mut(index) {
                *key = new_key;
            }
        }
    }

    /// Internal nodes from the root down to the parent of `coord`'s cell,
    /// each with the octant taken. `None` if the path is incomplete.
    fn path_to(&self, coord: ChunkCoord) -> Option<Vec<(NodeIndex, u8)>> {
        if !contains(self.base, self.depth, coord) {
            return None;
        }
        let key = self.key_of(coord);
        let mut path = Vec::with_capacity(self.depth as usize);
        let mut current = self.root;
        for level in (1..self.depth).rev() {
            let octant = key.octant_at(level);
            path.push((current, octant));
            match self.child(current, octant) {
                ChildSlot::Node(next) => current = next,
                _ => return None,
            }
        }
        path.push((current, key.octant_at(0)));
        Some(path)
    }

    fn insert(&mut self, coord: ChunkCoord, content: LeafContent, chunk_world_size: f32) -> Result<bool> {
        let mut grew = false;
        while !contains(self.base, self.depth, coord) {
            self.grow_toward(coord)?;
            grew = true;
        }
        if grew {
            self.rekey_leaves();
            debug!(
                "Master octree grew to depth {} at base {:?}",
                self.depth, self.base
            );
        }

        let key = self.key_of(coord);
        let mut current = self.root;
        for level in (1..self.depth).rev() {
            let octant = key.octant_at(level);
            current = match self.child(current, octant) {
                ChildSlot::Node(next) => next,
                ChildSlot::Empty | ChildSlot::Uniform(_) => {
                    let next = self.alloc(OctreeNode::empty())?;
                    self.set_child(current, octant, ChildSlot::Node(next));
                    next
                }
            };
        }

        let octant = key.octant_at(0);
        let existing = match self.child(current, octant) {
            ChildSlot::Node(index) => Some(index),
            _ => None,
        };
        match content {
            LeafContent::Uniform(material) => {
                if let Some(index) = existing {
                    self.release(index);
                    self.leaves.remove(&coord);
                }
                self.set_child(current, octant, ChildSlot::Uniform(material));
            }
            LeafContent::Chunk(_) | LeafContent::Unloaded => {
                let chunk = match content {
                    LeafContent::Chunk(id) => Some(id),
                    _ => None,
                };
                let leaf = OctreeNode::leaf(coord.world_origin(chunk_world_size), key.raw(), chunk);
                let index = match existing {
                    Some(index) => {
                        if let Some(node) = self.node_mut(index) {
                            *node = leaf;
                        }
                        index
                    }
                    None => {
                        let index = self.alloc(leaf)?;
                        self.set_child(current, octant, ChildSlot::Node(index));
                        index
                    }
                };
                self.leaves.insert(coord, index);
            }
        }
        Ok(grew)
    }

    fn content(&self, coord: ChunkCoord) -> Option<LeafContent> {
        let path = self.path_to(coord)?;
        let &(parent, octant) = path.last()?;
        match self.child(parent, octant) {
            ChildSlot::Empty => None,
            ChildSlot::Uniform(material) => Some(LeafContent::Uniform(material)),
            ChildSlot::Node(index) => match self.node(index)?.chunk() {
                Some(id) => Some(LeafContent::Chunk(id)),
                None => Some(LeafContent::Unloaded),
            },
        }
    }

    fn remove(&mut self, coord: ChunkCoord) -> Option<LeafContent> {
        let content = self.content(coord)?;
        let path = self.path_to(coord)?;
        let &(parent, octant) = path.last()?;
        if let ChildSlot::Node(index) = self.child(parent, octant) {
            self.release(index);
        }
        self.set_child(parent, octant, ChildSlot::Empty);
        self.leaves.remove(&coord);

        // Prune internal nodes left empty, never the root
        for i in (1..path.len()).rev() {
            let node = path[i].0;
            if !self.node(node).is_some_and(OctreeNode::is_empty) {
                break;
            }
            self.release(node);
            let (above, above_octant) = path[i - 1];
            self.set_child(above, above_octant, ChildSlot::Empty);
        }
        Some(content)
    }

    fn locate(&self, coord: ChunkCoord) -> Option<Located> {
        if !contains(self.base, self.depth, coord) {
            return None;
        }
        let key = self.key_of(coord);
        let mut current = self.root;
        for level in (1..self.depth).rev() {
            match self.child(current, key.octant_at(level)) {
                ChildSlot::Node(next) => current = next,
                _ => return Some(Located::Node(current)),
            }
        }
        Some(match self.child(current, key.octant_at(0)) {
            ChildSlot::Node(leaf) => Located::Node(leaf),
            ChildSlot::Uniform(material) => Located::Uniform { coord, material },
            ChildSlot::Empty => Located::Node(current),
        })
    }
}

/// Pool-allocated master octree shared by the loader and the world.
pub struct OctreeStorage {
    inner: RwLock<OctreeInner>,
    memory: Arc<MemoryManager>,
    group_size: u32,
    chunk_world_size: f32,
}

impl OctreeStorage {
    /// Create an octree with an empty root cube centered on the origin.
    pub fn new(config: &WorldConfig, memory: Arc<MemoryManager>) -> Result<Self> {
        let group_size = config.octree_group_size;
        memory.reserve(Self::group_bytes_for(group_size))?;
        let half = 1i32 << (config.initial_depth - 1);
        let mut inner = OctreeInner {
            groups: Vec::new(),
            free: Vec::new(),
            root: 0,
            depth: config.initial_depth,
            base: IVec3::splat(-half),
            leaves: HashMap::new(),
            group_size,
        };
        inner.add_group();
        inner.root = inner.alloc(OctreeNode::empty())?;
        Ok(Self {
            inner: RwLock::new(inner),
            memory,
            group_size,
            chunk_world_size: config.chunk_world_size,
        })
    }

    fn group_bytes_for(group_size: u32) -> u64 {
        group_size as u64 * std::mem::size_of::<Option<OctreeNode>>() as u64
    }

    fn group_bytes(&self) -> u64 {
        Self::group_bytes_for(self.group_size)
    }

    pub fn master(&self) -> MasterOctree {
        let inner = self.inner.read();
        MasterOctree::compute(inner.root, inner.depth, inner.base, self.chunk_world_size)
    }

    pub fn node(&self, index: NodeIndex) -> Option<OctreeNode> {
        self.inner.read().node(index).copied()
    }

    /// Reserve one more node group and install it.
    fn grow_pool(&self) -> Result<()> {
        self.memory.reserve(self.group_bytes())?;
        let index = self.inner.write().add_group();
        trace!("Allocated octree node group {}", index);
        Ok(())
    }

    /// Place `content` at `coord`, growing the root cube if needed. Returns
    /// `true` when the master geometry changed.
    pub fn insert(&self, coord: ChunkCoord, content: LeafContent) -> Result<bool> {
        loop {
            {
                let mut inner = self.inner.write();
                if inner.free.len() >= inner.nodes_needed(coord)? {
                    return inner.insert(coord, content, self.chunk_world_size);
                }
            }
            self.grow_pool()?;
        }
    }

    /// Remove the cell at `coord`, pruning emptied internal nodes.
    pub fn remove(&self, coord: ChunkCoord) -> Option<LeafContent> {
        self.inner.write().remove(coord)
    }

    pub fn content(&self, coord: ChunkCoord) -> Option<LeafContent> {
        self.inner.read().content(coord)
    }

    /// Deepest node containing a world position.
    pub fn locate(&self, pos: Vec3) -> Option<Located> {
        let coord = ChunkCoord::from_world_pos(pos, self.chunk_world_size);
        self.inner.read().locate(coord)
    }

    pub fn leaf_count(&self) -> usize {
        self.inner.read().leaves.len()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().groups.iter().flatten().map(|g| g.live).sum()
    }

    pub fn group_count(&self) -> usize {
        self.inner.read().groups.iter().flatten().count()
    }

    /// Return fully free node groups to the memory manager. Returns the
    /// number of bytes released.
    pub fn trim(&self) -> u64 {
        let released = {
            let mut inner = self.inner.write();
            let group_size = inner.group_size;
            let empty: Vec<usize> = inner
                .groups
                .iter()
                .enumerate()
                .filter(|(_, g)| g.as_ref().is_some_and(|g| g.live == 0))
                .map(|(i, _)| i)
                .collect();
            for &g in &empty {
                inner.groups[g] = None;
            }
            inner
                .free
                .retain(|index| !empty.contains(&((index / group_size) as usize)));
            while matches!(inner.groups.last(), Some(None)) {
                inner.groups.pop();
            }
            empty.len() as u64 * self.group_bytes()
        };
        if released > 0 {
            self.memory.release(released);
            debug!("Trimmed {} bytes of octree node groups", released);
        }
        released
    }

    /// Write every node group and the master metadata.
    pub fn save(&self, persistence: &dyn OctreePersistence) -> Result<()> {
        let (meta, images) = {
            let inner = self.inner.read();
            let images: Vec<NodeGroupImage> = inner
                .groups
                .iter()
                .enumerate()
                .filter_map(|(i, g)| {
                    g.as_ref().map(|g| NodeGroupImage {
                        index: i as u32,
                        nodes: g.nodes.clone(),
                    })
                })
                .collect();
            let meta = OctreeMeta {
                root: inner.root,
                depth: inner.depth,
                base: inner.base.to_array(),
                group_size: inner.group_size,
                groups: images.iter().map(|g| g.index).collect(),
            };
            (meta, images)
        };
        for image in &images {
            persistence.save_group(image.index, image)?;
        }
        persistence.save_meta(&meta)?;
        debug!("Saved {} octree node groups", images.len());
        Ok(())
    }

    /// Restore an octree saved with [`OctreeStorage::save`]. Chunk references
    /// are cleared since no chunk is resident yet. `Ok(None)` when nothing
    /// was saved.
    pub fn load(
        config: &WorldConfig,
        memory: Arc<MemoryManager>,
        persistence: &dyn OctreePersistence,
    ) -> Result<Option<Self>> {
        let Some(meta) = persistence.load_meta()? else {
            return Ok(None);
        };
        if meta.group_size != config.octree_group_size {
            return Err(Error::InvalidConfig(format!(
                "octree was saved with group size {}, configured {}",
                meta.group_size, config.octree_group_size
            )));
        }
        if meta.depth == 0 || meta.depth > MAX_DEPTH {
            return Err(Error::Serialization(format!("octree depth {} out of range", meta.depth)));
        }

        let group_size = meta.group_size;
        let mut inner = OctreeInner {
            groups: Vec::new(),
            free: Vec::new(),
            root: meta.root,
            depth: meta.depth,
            base: IVec3::from_array(meta.base),
            leaves: HashMap::new(),
            group_size,
        };

        let mut reserved = 0u64;
        for &index in &meta.groups {
            let Some(image) = persistence.load_group(index)? else {
                warn!("Octree node group {} is missing, skipping", index);
                continue;
            };
            if image.nodes.len() != group_size as usize {
                warn!("Octree node group {} has wrong size, skipping", index);
                continue;
            }
            if let Err(e) = memory.reserve(Self::group_bytes_for(group_size)) {
                memory.release(reserved);
                return Err(e);
            }
            reserved += Self::group_bytes_for(group_size);

            let slot = index as usize;
            if inner.groups.len() <= slot {
                inner.groups.resize_with(slot + 1, || None);
            }
            let mut nodes = image.nodes;
            let mut live = 0;
            for node in nodes.iter_mut().flatten() {
                live += 1;
                if let OctreeNode::Leaf { chunk, .. } = node {
                    *chunk = None;
                }
            }
            inner.groups[slot] = Some(NodeGroup { nodes, live });
        }

        if inner.node(inner.root).is_none() {
            memory.release(reserved);
            return Err(Error::Serialization("octree root node is missing".into()));
        }

        for (g, group) in inner.groups.iter().enumerate() {
            let Some(group) = group else { continue };
            for (o, node) in group.nodes.iter().enumerate().rev() {
                let index = g as u32 * group_size + o as u32;
                match node {
                    None => inner.free.push(index),
                    Some(OctreeNode::Leaf { key, .. }) => {
                        let (x, y, z) = MortonKey(*key).decode();
                        let coord = ChunkCoord::from(inner.base + IVec3::new(x as i32, y as i32, z as i32));
                        inner.leaves.insert(coord, index);
                    }
                    Some(OctreeNode::Internal { .. }) => {}
                }
            }
        }

        info!(
            "Loaded octree: depth {}, {} groups, {} leaves",
            inner.depth,
            meta.groups.len(),
            inner.leaves.len()
        );
        Ok(Some(Self {
            inner: RwLock::new(inner),
            memory,
            group_size,
            chunk_world_size: config.chunk_world_size,
        }))
    }
}

impl Drop for OctreeStorage {
    fn drop(&mut self) {
        let groups = self.inner.get_mut().groups.iter().flatten().count() as u64;
        self.memory.release(groups * self.group_bytes());
    }
}
