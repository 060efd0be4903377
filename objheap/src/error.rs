use std::fmt;

use thiserror::Error;

use crate::{Handle, Offset};

/// Bounded resources a heap can run out of.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Resource {
    /// The free-handle stack is empty.
    Handles,
    /// No partially filled space is left to become the current space.
    HeapSpace,
    /// A single record does not fit into one space (or scan window).
    ObjectSize,
    /// The requested per-space size exceeds the 32-bit limit.
    SpaceSize,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Handles => "no more handles",
            Resource::HeapSpace => "no space available",
            Resource::ObjectSize => "object too large",
            Resource::SpaceSize => "space size above 32-bit limit",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum HeapError {
    /// Negative offset, out of range, or disagreeing with the space it is
    /// claimed to belong to.
    #[error("invalid offset {offset:?}: {detail}")]
    InvalidOffset { offset: Offset, detail: &'static str },

    #[error("invalid handle {handle:?}: {detail}")]
    InvalidHandle { handle: Handle, detail: &'static str },

    #[error("metadata must always be {expected} bytes long, got {actual}")]
    MetadataLengthMismatch { expected: usize, actual: usize },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(Resource),

    /// Guard bytes or a length prefix at a record boundary are wrong.
    #[error("corrupted record at byte {position}: {detail}")]
    CorruptedRecord { position: u64, detail: String },

    #[error("double remap of handle {0:?}")]
    DoubleRemap(Handle),

    #[error("space {0} is the active write space and cannot be compacted")]
    InvalidCompactionTarget(usize),

    #[error("no data stored yet, metadata length is not fixed")]
    NoDataStored,

    #[error("operation requires a remap in progress")]
    NotRemapping,

    #[error("a remap is already in progress")]
    AlreadyRemapping,

    #[error("cannot switch the current space during a remap")]
    RemapWriteUnsupported,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("invalid heap description: {0}")]
    InvalidDescription(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HeapError {
    /// True for errors caused by damaged stored bytes rather than by the
    /// caller breaking the heap protocol.
    pub fn is_corruption(&self) -> bool {
        matches!(self, HeapError::CorruptedRecord { .. })
    }
}

pub type Result<T> = std::result::Result<T, HeapError>;
