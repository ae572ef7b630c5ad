//! Error types for the terra streaming engine

use thiserror::Error;

use crate::voxel::chunk::ChunkCoord;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    /// A low-priority reservation was refused because usage is above the
    /// preferred budget. Eviction has been queued.
    #[error("allocation of {requested} bytes denied: {allocated} allocated, {preferred} preferred")]
    AllocationDenied {
        requested: u64,
        allocated: u64,
        preferred: u64,
    },

    /// The hard budget would be exceeded and the panic handler freed too little.
    #[error("memory exhausted: {requested} bytes requested, {allocated} of {max} allocated")]
    MemoryExhausted {
        requested: u64,
        allocated: u64,
        max: u64,
    },

    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("malformed chunk encoding (type {encoding}): {reason}")]
    MalformedEncoding { encoding: u8, reason: String },

    #[error("generation failed for chunk {coord:?}: {reason}")]
    Generation { coord: ChunkCoord, reason: String },

    /// The coordinate lies beyond the deepest octree the engine can address.
    #[error("chunk {0:?} is outside the addressable world")]
    OutOfWorld(ChunkCoord),

    /// Caller-supplied block data of the wrong size.
    #[error("chunk {coord:?} written with {len} blocks")]
    BlockCount { coord: ChunkCoord, len: usize },

    #[error("unknown material: {0}")]
    UnknownMaterial(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("background task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error came from the memory budget rather than the data path.
    pub fn is_memory_pressure(&self) -> bool {
        matches!(self, Error::AllocationDenied { .. } | Error::MemoryExhausted { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::TaskFailed(err.to_string())
    }
}
