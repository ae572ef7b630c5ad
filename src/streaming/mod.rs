//! Memory budgeting, persistence and marker-driven chunk streaming

pub mod budget;
pub mod persistence;
pub mod disk_io;
pub mod marker;
pub mod priority;
pub mod chunk_loader;

pub use budget::{MemoryManager, MemoryPanicHandler, MemoryUsage, Reclaim, ReclaimOnPanic};
pub use chunk_loader::{LogListener, UpdateHandle, UpdateReport, WorldListener, WorldLoader};
pub use disk_io::DiskPersistence;
pub use marker::{ChunkRegion, LoadMarker, MarkerRegions};
pub use persistence::{ChunkPersistence, MemoryPersistence, NullPersistence, OctreePersistence};
pub use priority::{ChunkPriority, ChunkPriorityQueue};
