#![forbid(unsafe_code)]
//! Error types for blkdev.
//!
//! # Error Taxonomy
//!
//! Every failure of the block layer falls into one of five classes
//! ([`ErrorClass`]):
//!
//! | Class | Meaning | Variants |
//! |-------|---------|----------|
//! | `DeviceUnavailable` | backing store cannot be opened or sized | `Unavailable` |
//! | `Addressing` | the computed position is outside the device | `OutOfRange`, `OffsetOverflow` |
//! | `Transfer` | the host primitive failed or moved fewer bytes than asked | `Transfer`, `ShortTransfer`, `ReadOnly`, `Io` |
//! | `InvalidState` | I/O on an unopened or closed device | `InvalidState` |
//! | `Argument` | caller-supplied geometry or buffer is unusable | `BufferSize`, `InvalidArgument`, `InvalidGeometry` |
//!
//! None of these are retried inside the block layer. Callers treat any error
//! as fatal to the in-flight operation.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`BlkError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Unavailable` | host errno, else `EIO` |
//! | `OutOfRange` | `ERANGE` |
//! | `OffsetOverflow` | `ERANGE` |
//! | `Transfer` | host errno, else `EIO` |
//! | `ShortTransfer` | `EIO` |
//! | `ReadOnly` | `EROFS` |
//! | `InvalidState` | `EBADF` |
//! | `BufferSize` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `Io` | host errno, else `EIO` |

use std::fmt;
use thiserror::Error;

/// Block-layer operation named in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoOp {
    Open,
    Read,
    Write,
    Sync,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Read => "read",
            Self::Write => "write",
            Self::Sync => "sync",
        })
    }
}

/// Coarse failure class, one per row of the taxonomy table above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    DeviceUnavailable,
    Addressing,
    Transfer,
    InvalidState,
    Argument,
}

/// Unified error type for all blkdev operations.
#[derive(Debug, Error)]
pub enum BlkError {
    /// The backing file or device could not be opened or its size queried.
    #[error("device unavailable: {path}: {source}")]
    Unavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Request touches blocks at or beyond the end of the device or window.
    #[error("{op} out of range: block={block} count={count} limit={limit}")]
    OutOfRange {
        op: IoOp,
        block: u64,
        count: u64,
        limit: u64,
    },

    /// `block * block_size` does not fit in a 64-bit byte offset.
    #[error("{op} byte offset overflows u64 at block {block}")]
    OffsetOverflow { op: IoOp, block: u64 },

    /// The host read/write primitive reported failure.
    #[error("{op} failed at block {block}: {source}")]
    Transfer {
        op: IoOp,
        block: u64,
        #[source]
        source: std::io::Error,
    },

    /// The host primitive moved fewer bytes than requested.
    #[error("short {op} at block {block}: expected {expected} bytes, transferred {actual}")]
    ShortTransfer {
        op: IoOp,
        block: u64,
        expected: usize,
        actual: usize,
    },

    /// The backing store was opened read-only and a write was attempted.
    #[error("write to read-only device at block {block}")]
    ReadOnly { block: u64 },

    /// Operation attempted on a device that is not open.
    ///
    /// `block` is set for reads and writes, unset for open and sync.
    #[error(
        "cannot {op}{}: device is {state}",
        .block.map_or_else(String::new, |id| format!(" block {id}"))
    )]
    InvalidState {
        op: IoOp,
        block: Option<u64>,
        state: &'static str,
    },

    /// Caller buffer does not match the size of the request.
    #[error("{op} buffer at block {block} holds {actual} bytes, need {expected}")]
    BufferSize {
        op: IoOp,
        block: u64,
        expected: usize,
        actual: usize,
    },

    /// Caller-supplied argument is unusable (e.g. a request too large for memory).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Block size or partition window is invalid.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Operating system I/O error outside a block transfer (e.g. sync).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlkError {
    /// Class of this error in the block-layer taxonomy.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable { .. } => ErrorClass::DeviceUnavailable,
            Self::OutOfRange { .. } | Self::OffsetOverflow { .. } => ErrorClass::Addressing,
            Self::Transfer { .. }
            | Self::ShortTransfer { .. }
            | Self::ReadOnly { .. }
            | Self::Io(_) => ErrorClass::Transfer,
            Self::InvalidState { .. } => ErrorClass::InvalidState,
            Self::BufferSize { .. } | Self::InvalidArgument(_) | Self::InvalidGeometry(_) => {
                ErrorClass::Argument
            }
        }
    }

    /// Block id the failure refers to, when there is one.
    #[must_use]
    pub fn block(&self) -> Option<u64> {
        match self {
            Self::OutOfRange { block, .. }
            | Self::OffsetOverflow { block, .. }
            | Self::Transfer { block, .. }
            | Self::ShortTransfer { block, .. }
            | Self::ReadOnly { block }
            | Self::BufferSize { block, .. } => Some(*block),
            Self::InvalidState { block, .. } => *block,
            Self::Unavailable { .. }
            | Self::InvalidArgument(_)
            | Self::InvalidGeometry(_)
            | Self::Io(_) => None,
        }
    }

    /// Convert this error into a POSIX errno.
    ///
    /// Policy notes:
    /// - host errors keep their raw errno when the OS supplied one.
    /// - `InvalidState` → `EBADF`: the handle is closed or not yet opened.
    /// - addressing failures → `ERANGE`, matching lwext4's range check.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Unavailable { source, .. } | Self::Transfer { source, .. } => {
                source.raw_os_error().unwrap_or(libc::EIO)
            }
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::OutOfRange { .. } | Self::OffsetOverflow { .. } => libc::ERANGE,
            Self::ShortTransfer { .. } => libc::EIO,
            Self::ReadOnly { .. } => libc::EROFS,
            Self::InvalidState { .. } => libc::EBADF,
            Self::BufferSize { .. } | Self::InvalidArgument(_) | Self::InvalidGeometry(_) => {
                libc::EINVAL
            }
        }
    }
}

/// Result alias using `BlkError`.
pub type Result<T> = std::result::Result<T, BlkError>;
