//! Voxel data structures: chunks, their encodings and buffers, and the
//! octree that indexes them

pub mod chunk;
pub mod material;
pub mod encoding;
pub mod buffer;
pub mod storage;
pub mod svo;

pub use buffer::{ChunkBuffer, ChunkOrigin, SlotState};
pub use chunk::{BufferKey, ChunkCoord, ChunkId, ChunkSnapshot, CHUNK_SIDE, CHUNK_VOLUME};
pub use encoding::{ChunkType, EncodedChunk};
pub use material::{MaterialId, MaterialRegistry, EMPTY_MATERIAL};
pub use storage::{Admission, BufferInfo, ChunkStorage, StoreOutcome};
