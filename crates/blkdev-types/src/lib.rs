#![forbid(unsafe_code)]
//! Unit-carrying address types and device geometry.
//!
//! Block numbers and byte offsets are distinct newtypes so that a block id is
//! never used where a byte position is expected. All address arithmetic is
//! checked 64-bit arithmetic: a block id above `u32::MAX` is ordinary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Physical block size of the reference file backend.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Physical block number on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Byte offset on a `ByteDevice` (pread/pwrite semantics).
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

/// Validated block size (a power of two in `512..=65536`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct BlockSize(u32);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
    #[error(
        "partition window out of range: offset={offset} size={size} block_count={block_count}"
    )]
    WindowOutOfRange {
        offset: u64,
        size: u64,
        block_count: u64,
    },
}

impl BlockSize {
    pub const MIN: u32 = 512;
    pub const MAX: u32 = 65536;

    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, GeometryError> {
        if !value.is_power_of_two() || !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(GeometryError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a `usize` buffer length.
    #[must_use]
    pub fn as_usize(self) -> usize {
        // At most 65536, which fits every supported `usize`.
        self.0 as usize
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Convert a byte offset to a block number (truncating).
    #[must_use]
    pub fn byte_to_block(self, byte_offset: ByteOffset) -> BlockNumber {
        BlockNumber(byte_offset.0 >> self.shift())
    }

    /// Byte position inside its block.
    #[must_use]
    pub fn offset_in_block(self, byte_offset: ByteOffset) -> usize {
        // Masked to below the block size.
        (byte_offset.0 & u64::from(self.0 - 1)) as usize
    }

    /// Number of whole blocks in `len_bytes`; a trailing partial block is dropped.
    #[must_use]
    pub fn whole_blocks(self, len_bytes: u64) -> u64 {
        len_bytes >> self.shift()
    }

    /// Byte length of `count` blocks, `None` on overflow.
    #[must_use]
    pub fn span_bytes(self, count: u64) -> Option<u64> {
        count.checked_mul(u64::from(self.0))
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(DEFAULT_BLOCK_SIZE)
    }
}

impl TryFrom<u32> for BlockSize {
    type Error = GeometryError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BlockSize> for u32 {
    fn from(value: BlockSize) -> Self {
        value.0
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Checked arithmetic helpers ──────────────────────────────────────────────

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Convert this block number to its byte offset using the given block size.
    ///
    /// The full 64-bit product is kept; returns `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self, block_size: BlockSize) -> Option<ByteOffset> {
        checked_mul_block(self, block_size)
    }
}

impl ByteOffset {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Compute the byte offset of a block number given a block size.
///
/// Returns `None` on overflow.
#[must_use]
pub fn checked_mul_block(block: BlockNumber, block_size: BlockSize) -> Option<ByteOffset> {
    block
        .0
        .checked_mul(u64::from(block_size.get()))
        .map(ByteOffset)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, GeometryError> {
    usize::try_from(value).map_err(|_| GeometryError::IntegerConversion { field })
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Sub-region of a physical device exposed as a logical device.
///
/// Both fields count physical blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionWindow {
    pub offset: BlockNumber,
    pub size: u64,
}

impl PartitionWindow {
    /// Window spanning a whole device of `block_count` blocks.
    #[must_use]
    pub fn whole(block_count: u64) -> Self {
        Self {
            offset: BlockNumber(0),
            size: block_count,
        }
    }

    /// One past the last physical block of the window, `None` on overflow.
    #[must_use]
    pub fn end(self) -> Option<BlockNumber> {
        self.offset.checked_add(self.size)
    }

    /// Check that the window fits inside a device of `block_count` blocks.
    pub fn validate(self, block_count: u64) -> Result<(), GeometryError> {
        let out_of_range = GeometryError::WindowOutOfRange {
            offset: self.offset.0,
            size: self.size,
            block_count,
        };
        match self.end() {
            Some(end) if end.0 <= block_count => Ok(()),
            _ => Err(out_of_range),
        }
    }

    /// Map a window-relative block range onto physical blocks.
    ///
    /// Returns `None` when `lba + count` leaves the window.
    #[must_use]
    pub fn translate(self, lba: BlockNumber, count: u64) -> Option<BlockNumber> {
        let end = lba.checked_add(count)?;
        if end.0 > self.size {
            return None;
        }
        self.offset.checked_add(lba.0)
    }
}

/// Geometry of an acquired device. Immutable once the device is built,
/// except for the partition window which the engine may narrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGeometry {
    pub block_size: BlockSize,
    pub block_count: u64,
    pub partition: PartitionWindow,
}

impl DeviceGeometry {
    /// Derive geometry from a backing store length.
    ///
    /// A trailing partial block is excluded from the addressable range: a store
    /// of `N * block_size + r` bytes (with `r < block_size`) has `N` blocks.
    #[must_use]
    pub fn from_len(len_bytes: u64, block_size: BlockSize) -> Self {
        let block_count = block_size.whole_blocks(len_bytes);
        Self {
            block_size,
            block_count,
            partition: PartitionWindow::whole(block_count),
        }
    }

    /// Bytes that fall outside the last whole block.
    #[must_use]
    pub fn trailing_bytes(len_bytes: u64, block_size: BlockSize) -> u64 {
        len_bytes & u64::from(block_size.get() - 1)
    }

    /// Replace the partition window after checking it against the device.
    pub fn with_partition(self, partition: PartitionWindow) -> Result<Self, GeometryError> {
        partition.validate(self.block_count)?;
        Ok(Self { partition, ..self })
    }

    /// Whether `[block, block + count)` lies inside the physical device.
    #[must_use]
    pub fn contains(&self, block: BlockNumber, count: u64) -> bool {
        block
            .checked_add(count)
            .is_some_and(|end| end.0 <= self.block_count)
    }

    /// Size of the partition window in bytes, `None` on overflow.
    #[must_use]
    pub fn partition_bytes(&self) -> Option<u64> {
        self.block_size.span_bytes(self.partition.size)
    }
}
