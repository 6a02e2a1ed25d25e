//! # Memory Error Types
//!
//! All errors that can occur while allocating or releasing memory.

use crate::context::UsageClass;
use thiserror::Error;

/// Errors that can occur in the allocator framework.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The upstream allocator (or the external heap) could not provide memory.
    #[error("out of memory: request of {requested} bytes could not be satisfied")]
    OutOfMemory {
        /// Size of the request that failed, in bytes.
        requested: u64,
    },

    /// The requested alignment exceeds the allocator's declared ceiling.
    #[error("alignment {requested} exceeds allocator maximum of {max}")]
    AlignmentTooLarge {
        /// Alignment that was asked for.
        requested: u64,
        /// The allocator's `max_alignment`.
        max: u64,
    },

    /// The requested alignment is not a power of two.
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(u64),

    /// The handle was not produced by this allocator instance, or was already freed.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// A leaf allocator was asked for a second extent while its first is still live.
    #[error("leaf allocator already owns a live extent of {size} bytes")]
    AlreadyAllocated {
        /// Size of the live extent.
        size: u64,
    },

    /// A pool allocator was asked for more than one block.
    #[error("request of {requested} bytes exceeds pool block size of {block_size}")]
    SizeExceedsBlock {
        /// Size that was asked for.
        requested: u64,
        /// The pool's fixed block size.
        block_size: u64,
    },

    /// Invalid configuration value or file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No device allocator is configured for the usage class.
    #[error("usage class {0} is not configured")]
    UnknownUsageClass(UsageClass),
}

impl MemoryError {
    /// Builds an `InvalidHandle` error from any debuggable address.
    pub(crate) fn invalid_handle(address: impl std::fmt::Debug) -> Self {
        Self::InvalidHandle(format!("{address:?}"))
    }
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
