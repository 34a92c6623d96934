#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the [`BlockDevice`] trait a filesystem engine programs against,
//! and [`ByteBlockDevice`], which maps that trait onto any byte-addressed
//! [`ByteDevice`] host store. [`FileBlockDevice`] is the file-backed
//! instance used for raw disk images and device nodes.
//!
//! Every call is a direct pass-through to the host store: there is no cache
//! and no internal locking. Operations take `&mut self`, so one owner
//! serializes all I/O on a device.

mod host;

pub use host::{ByteDevice, FileByteDevice, MemBacking, MemByteDevice};

use blkdev_error::{BlkError, IoOp, Result};
use blkdev_types::{
    BlockNumber, BlockSize, ByteOffset, DEFAULT_BLOCK_SIZE, DeviceGeometry, PartitionWindow,
    u64_to_usize,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, trace, warn};

/// How the backing file is opened at acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
    /// Read-write when permitted, read-only otherwise.
    ReadWriteOrReadOnly,
}

/// Options controlling how a device is acquired.
///
/// Passed explicitly at acquisition; there is no process-wide switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// Physical block size in bytes (power of two, 512..=65536).
    pub block_size: u32,
    pub access: AccessMode,
    /// Partition window to install instead of the whole device.
    pub partition: Option<PartitionWindow>,
    /// Emit a `trace!` event for every block transfer.
    pub trace_io: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            access: AccessMode::ReadWrite,
            partition: None,
            trace_io: false,
        }
    }
}

/// Lifecycle of a device: `Unopened -> Open -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    Unopened,
    Open,
    Closed,
}

impl DeviceState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unopened => "unopened",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-device I/O counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
    pub blocks_read: u64,
    pub blocks_written: u64,
}

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

/// Block-addressed I/O interface.
///
/// Block numbers passed to `read_blocks`/`write_blocks` are physical. The
/// `*_partition` helpers take addresses relative to the partition window.
pub trait BlockDevice {
    /// Prepare the device for I/O. Only valid once, from `Unopened`.
    fn open(&mut self) -> Result<()>;

    /// Read `count` blocks starting at `block` into `buf`.
    ///
    /// `buf` must hold at least `count * block_size()` bytes. A transfer that
    /// moves fewer bytes than requested is an error.
    fn read_blocks(&mut self, block: BlockNumber, count: u32, buf: &mut [u8]) -> Result<()>;

    /// Write `count` blocks starting at `block` from `buf`.
    fn write_blocks(&mut self, block: BlockNumber, count: u32, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&mut self) -> Result<()>;

    /// Release the host resource. Idempotent; never fails.
    fn close(&mut self) -> Result<()>;

    fn state(&self) -> DeviceState;

    fn geometry(&self) -> DeviceGeometry;

    /// Install a partition window. It must fit inside the physical device.
    fn set_partition(&mut self, window: PartitionWindow) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32 {
        self.geometry().block_size.get()
    }

    /// Total number of physical blocks.
    fn block_count(&self) -> u64 {
        self.geometry().block_count
    }

    fn partition(&self) -> PartitionWindow {
        self.geometry().partition
    }

    /// Read a single block.
    fn read_block(&mut self, block: BlockNumber) -> Result<BlockBuf> {
        let mut bytes = vec![0_u8; self.geometry().block_size.as_usize()];
        self.read_blocks(block, 1, &mut bytes)?;
        Ok(BlockBuf::new(bytes))
    }

    /// Write a single block. `data.len()` MUST equal `block_size()`.
    fn write_block(&mut self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = self.geometry().block_size.as_usize();
        if data.len() != expected {
            return Err(BlkError::BufferSize {
                op: IoOp::Write,
                block: block.0,
                expected,
                actual: data.len(),
            });
        }
        self.write_blocks(block, 1, data)
    }

    /// Read `count` blocks at window-relative address `lba`.
    fn read_partition(&mut self, lba: BlockNumber, count: u32, buf: &mut [u8]) -> Result<()> {
        let block = partition_block(self.partition(), IoOp::Read, lba, count)?;
        self.read_blocks(block, count, buf)
    }

    /// Write `count` blocks at window-relative address `lba`.
    fn write_partition(&mut self, lba: BlockNumber, count: u32, buf: &[u8]) -> Result<()> {
        let block = partition_block(self.partition(), IoOp::Write, lba, count)?;
        self.write_blocks(block, count, buf)
    }
}

fn partition_block(
    window: PartitionWindow,
    op: IoOp,
    lba: BlockNumber,
    count: u32,
) -> Result<BlockNumber> {
    let count = u64::from(count);
    window
        .translate(lba, count)
        .filter(|_| lba.0 < window.size)
        .ok_or(BlkError::OutOfRange {
            op,
            block: lba.0,
            count,
            limit: window.size,
        })
}

/// Block device over a byte-addressed host store.
///
/// Owns the store exclusively, plus a one-block scratch buffer used to stage
/// the unaligned edges of [`read_bytes`](Self::read_bytes) and
/// [`write_bytes`](Self::write_bytes).
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: Option<D>,
    geometry: DeviceGeometry,
    state: DeviceState,
    scratch: Vec<u8>,
    stats: IoStats,
    trace_io: bool,
}

/// Block device backed by a host file or device node.
pub type FileBlockDevice = ByteBlockDevice<FileByteDevice>;

impl ByteBlockDevice<FileByteDevice> {
    /// Open the file or device at `path` and build a device over it.
    ///
    /// The device is returned `Unopened`; call [`BlockDevice::open`] before
    /// I/O. If anything after the file open fails, the file is closed before
    /// the error is returned.
    pub fn acquire(path: impl AsRef<Path>, options: &DeviceOptions) -> Result<Self> {
        let path = path.as_ref();
        let store = FileByteDevice::open(path, options.access).map_err(|source| {
            BlkError::Unavailable {
                path: path.display().to_string(),
                source,
            }
        })?;
        debug!(
            path = %path.display(),
            writable = store.is_writable(),
            "backing file opened"
        );
        Self::new(store, options)
    }
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    /// Build a device over `inner`, deriving geometry from its length.
    ///
    /// `block_count = len / block_size`: a trailing partial block is not
    /// addressable. The partition window defaults to the whole device.
    pub fn new(inner: D, options: &DeviceOptions) -> Result<Self> {
        let block_size = BlockSize::new(options.block_size)
            .map_err(|err| BlkError::InvalidGeometry(err.to_string()))?;
        let len = inner
            .len_bytes()
            .map_err(|source| BlkError::Unavailable {
                path: inner.location(),
                source,
            })?;

        let mut geometry = DeviceGeometry::from_len(len, block_size);
        if let Some(window) = options.partition {
            geometry = geometry
                .with_partition(window)
                .map_err(|err| BlkError::InvalidGeometry(err.to_string()))?;
        }

        let trailing = DeviceGeometry::trailing_bytes(len, block_size);
        if trailing != 0 {
            debug!(
                location = %inner.location(),
                trailing_bytes = trailing,
                "trailing partial block excluded from device"
            );
        }
        debug!(
            location = %inner.location(),
            block_size = block_size.get(),
            block_count = geometry.block_count,
            partition_offset = geometry.partition.offset.0,
            partition_size = geometry.partition.size,
            "block device acquired"
        );

        Ok(Self {
            inner: Some(inner),
            geometry,
            state: DeviceState::Unopened,
            scratch: vec![0_u8; block_size.as_usize()],
            stats: IoStats::default(),
            trace_io: options.trace_io,
        })
    }

    /// Host store, if the device has not been closed.
    #[must_use]
    pub fn inner(&self) -> Option<&D> {
        self.inner.as_ref()
    }

    #[must_use]
    pub fn stats(&self) -> IoStats {
        self.stats
    }

    /// Release the device and everything it owns.
    pub fn release(mut self) {
        self.release_host();
    }

    fn release_host(&mut self) {
        if let Some(inner) = self.inner.take() {
            debug!(location = %inner.location(), stats = ?self.stats, "host store released");
            drop(inner);
        }
        self.state = DeviceState::Closed;
    }

    fn host(&self, op: IoOp, block: Option<u64>) -> Result<&D> {
        match (self.state, self.inner.as_ref()) {
            (DeviceState::Open, Some(inner)) => Ok(inner),
            (state, _) => Err(BlkError::InvalidState {
                op,
                block,
                state: state.as_str(),
            }),
        }
    }

    /// Physical block holding window-relative byte `offset`.
    fn window_block(&self, offset: ByteOffset) -> u64 {
        let relative = self.geometry.block_size.byte_to_block(offset).0;
        self.geometry.partition.offset.0.saturating_add(relative)
    }

    /// Validate a block request and return its byte offset and length.
    fn locate(
        &self,
        op: IoOp,
        block: BlockNumber,
        count: u32,
        buf_len: usize,
    ) -> Result<(ByteOffset, usize)> {
        let count = u64::from(count);
        let block_count = self.geometry.block_count;
        // `contains` alone would accept a zero-count request at `block_count`.
        if block.0 >= block_count || !self.geometry.contains(block, count) {
            return Err(BlkError::OutOfRange {
                op,
                block: block.0,
                count,
                limit: block_count,
            });
        }

        let bytes = self
            .geometry
            .block_size
            .span_bytes(count)
            .ok_or(BlkError::OffsetOverflow { op, block: block.0 })?;
        let len = u64_to_usize(bytes, "request length").map_err(|err| {
            BlkError::InvalidArgument(format!("{op} at block {block}: {err}"))
        })?;
        if buf_len < len {
            return Err(BlkError::BufferSize {
                op,
                block: block.0,
                expected: len,
                actual: buf_len,
            });
        }

        let offset = block
            .to_byte_offset(self.geometry.block_size)
            .ok_or(BlkError::OffsetOverflow { op, block: block.0 })?;
        Ok((offset, len))
    }

    /// Absolute byte offset of a window-relative byte range.
    fn window_span(&self, op: IoOp, offset: ByteOffset, len: usize) -> Result<ByteOffset> {
        let block_size = self.geometry.block_size;
        let window = self.geometry.partition;
        let limit = self.geometry.partition_bytes().ok_or_else(|| {
            BlkError::InvalidGeometry("partition window overflows u64".to_owned())
        })?;

        let len = len as u64;
        if offset.checked_add(len).is_none_or(|end| end.0 > limit) {
            return Err(BlkError::OutOfRange {
                op,
                block: block_size.byte_to_block(offset).0,
                count: len.div_ceil(u64::from(block_size.get())),
                limit: window.size,
            });
        }

        window
            .offset
            .to_byte_offset(block_size)
            .and_then(|base| base.checked_add(offset.0))
            .ok_or(BlkError::OffsetOverflow {
                op,
                block: window.offset.0,
            })
    }

    /// Read `buf.len()` bytes at window-relative byte `offset`.
    ///
    /// Unaligned head and tail bytes are staged through the scratch buffer;
    /// whole blocks are read straight into `buf`.
    pub fn read_bytes(&mut self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        self.host(IoOp::Read, Some(self.window_block(offset)))?;
        let start = self.window_span(IoOp::Read, offset, buf.len())?;
        let mut scratch = std::mem::take(&mut self.scratch);
        let result = self.staged_read(&mut scratch, start, buf);
        self.scratch = scratch;
        result
    }

    /// Write `buf` at window-relative byte `offset`.
    ///
    /// Partial blocks are read, patched in the scratch buffer, and written
    /// back, so bytes outside `buf` are preserved.
    pub fn write_bytes(&mut self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        self.host(IoOp::Write, Some(self.window_block(offset)))?;
        let start = self.window_span(IoOp::Write, offset, buf.len())?;
        let mut scratch = std::mem::take(&mut self.scratch);
        let result = self.staged_write(&mut scratch, start, buf);
        self.scratch = scratch;
        result
    }

    fn staged_read(&mut self, scratch: &mut [u8], start: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let block_size = self.geometry.block_size;
        let bs = block_size.as_usize();
        let mut done = 0_usize;
        while done < buf.len() {
            let pos = ByteOffset(start.0 + done as u64);
            let block = block_size.byte_to_block(pos);
            let skip = block_size.offset_in_block(pos);
            let remaining = buf.len() - done;

            if skip == 0 && remaining >= bs {
                let count = whole_block_count(remaining, bs);
                let len = count as usize * bs;
                self.read_blocks(block, count, &mut buf[done..done + len])?;
                done += len;
            } else {
                self.read_blocks(block, 1, scratch)?;
                let take = (bs - skip).min(remaining);
                buf[done..done + take].copy_from_slice(&scratch[skip..skip + take]);
                done += take;
            }
        }
        Ok(())
    }

    fn staged_write(&mut self, scratch: &mut [u8], start: ByteOffset, buf: &[u8]) -> Result<()> {
        let block_size = self.geometry.block_size;
        let bs = block_size.as_usize();
        let mut done = 0_usize;
        while done < buf.len() {
            let pos = ByteOffset(start.0 + done as u64);
            let block = block_size.byte_to_block(pos);
            let skip = block_size.offset_in_block(pos);
            let remaining = buf.len() - done;

            if skip == 0 && remaining >= bs {
                let count = whole_block_count(remaining, bs);
                let len = count as usize * bs;
                self.write_blocks(block, count, &buf[done..done + len])?;
                done += len;
            } else {
                let take = (bs - skip).min(remaining);
                self.read_blocks(block, 1, scratch)?;
                scratch[skip..skip + take].copy_from_slice(&buf[done..done + take]);
                self.write_blocks(block, 1, scratch)?;
                done += take;
            }
        }
        Ok(())
    }

    fn short_transfer(&self, op: IoOp, block: BlockNumber, expected: usize, actual: usize) -> BlkError {
        warn!(
            location = %self.inner.as_ref().map_or_else(String::new, D::location),
            %op,
            block = block.0,
            expected,
            actual,
            "short transfer"
        );
        BlkError::ShortTransfer {
            op,
            block: block.0,
            expected,
            actual,
        }
    }
}

/// Largest whole-block chunk of `remaining` bytes that fits a `u32` count.
fn whole_block_count(remaining: usize, block_size: usize) -> u32 {
    u32::try_from(remaining / block_size).unwrap_or(u32::MAX)
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn open(&mut self) -> Result<()> {
        match self.state {
            DeviceState::Unopened => {
                self.state = DeviceState::Open;
                debug!(block_count = self.geometry.block_count, "block device opened");
                Ok(())
            }
            state @ (DeviceState::Open | DeviceState::Closed) => Err(BlkError::InvalidState {
                op: IoOp::Open,
                block: None,
                state: state.as_str(),
            }),
        }
    }

    fn read_blocks(&mut self, block: BlockNumber, count: u32, buf: &mut [u8]) -> Result<()> {
        let inner = self.host(IoOp::Read, Some(block.0))?;
        let (offset, len) = self.locate(IoOp::Read, block, count, buf.len())?;
        if len == 0 {
            return Ok(());
        }

        let actual = inner
            .read_at(offset, &mut buf[..len])
            .map_err(|source| BlkError::Transfer {
                op: IoOp::Read,
                block: block.0,
                source,
            })?;
        if actual != len {
            return Err(self.short_transfer(IoOp::Read, block, len, actual));
        }
        if self.trace_io {
            trace!(block = block.0, count, offset = offset.0, "read");
        }

        self.stats.reads += 1;
        self.stats.blocks_read += u64::from(count);
        Ok(())
    }

    fn write_blocks(&mut self, block: BlockNumber, count: u32, buf: &[u8]) -> Result<()> {
        let inner = self.host(IoOp::Write, Some(block.0))?;
        if !inner.is_writable() {
            return Err(BlkError::ReadOnly { block: block.0 });
        }
        let (offset, len) = self.locate(IoOp::Write, block, count, buf.len())?;
        if len == 0 {
            return Ok(());
        }

        let actual = inner
            .write_at(offset, &buf[..len])
            .map_err(|source| BlkError::Transfer {
                op: IoOp::Write,
                block: block.0,
                source,
            })?;
        if actual != len {
            return Err(self.short_transfer(IoOp::Write, block, len, actual));
        }
        if self.trace_io {
            trace!(block = block.0, count, offset = offset.0, "write");
        }

        self.stats.writes += 1;
        self.stats.blocks_written += u64::from(count);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.host(IoOp::Sync, None)?.sync()?;
        self.stats.syncs += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.release_host();
        Ok(())
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn set_partition(&mut self, window: PartitionWindow) -> Result<()> {
        self.geometry = self
            .geometry
            .with_partition(window)
            .map_err(|err| BlkError::InvalidGeometry(err.to_string()))?;
        debug!(
            offset = window.offset.0,
            size = window.size,
            "partition window installed"
        );
        Ok(())
    }
}

impl<D: ByteDevice> Drop for ByteBlockDevice<D> {
    fn drop(&mut self) {
        self.release_host();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blkdev_error::ErrorClass;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::io;
    use std::sync::Arc;

    const MIB: usize = 1 << 20;

    fn open_mem(len: usize) -> (ByteBlockDevice<MemByteDevice>, MemBacking) {
        let mem = MemByteDevice::new(len);
        let backing = mem.backing();
        let mut dev = ByteBlockDevice::new(mem, &DeviceOptions::default()).expect("device");
        dev.open().expect("open");
        (dev, backing)
    }

    /// Store that pretends to be huge and records the offsets it is asked for.
    #[derive(Debug)]
    struct RecordingByteDevice {
        len: u64,
        offsets: Arc<Mutex<Vec<u64>>>,
    }

    impl ByteDevice for RecordingByteDevice {
        fn len_bytes(&self) -> io::Result<u64> {
            Ok(self.len)
        }

        fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> io::Result<usize> {
            self.offsets.lock().push(offset.0);
            buf.fill(0xEE);
            Ok(buf.len())
        }

        fn write_at(&self, offset: ByteOffset, buf: &[u8]) -> io::Result<usize> {
            self.offsets.lock().push(offset.0);
            Ok(buf.len())
        }

        fn sync(&self) -> io::Result<()> {
            Ok(())
        }

        fn location(&self) -> String {
            "recording".to_owned()
        }
    }

    #[derive(Debug)]
    struct UnsizedByteDevice;

    impl ByteDevice for UnsizedByteDevice {
        fn len_bytes(&self) -> io::Result<u64> {
            Err(io::Error::other("size query failed"))
        }

        fn read_at(&self, _offset: ByteOffset, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn write_at(&self, _offset: ByteOffset, _buf: &[u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn sync(&self) -> io::Result<()> {
            Ok(())
        }

        fn location(&self) -> String {
            "unsized".to_owned()
        }
    }

    #[test]
    fn one_mib_scenario() {
        let (mut dev, backing) = open_mem(MIB);
        assert_eq!(dev.block_size(), 512);
        assert_eq!(dev.block_count(), 2048);

        dev.write_block(BlockNumber(0), &[0xAA; 512]).expect("write 0");
        dev.write_block(BlockNumber(2047), &[0x55; 512])
            .expect("write 2047");

        assert_eq!(dev.read_block(BlockNumber(0)).unwrap().as_slice(), &[0xAA; 512]);
        assert_eq!(
            dev.read_block(BlockNumber(2047)).unwrap().as_slice(),
            &[0x55; 512]
        );

        let err = dev.read_block(BlockNumber(2048)).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Addressing);
        assert_eq!(err.block(), Some(2048));

        let bytes = backing.snapshot();
        assert!(bytes[..512].iter().all(|b| *b == 0xAA));
        assert!(bytes[MIB - 512..].iter().all(|b| *b == 0x55));
        assert!(bytes[512..MIB - 512].iter().all(|b| *b == 0));
    }

    #[test]
    fn multi_block_round_trip() {
        let (mut dev, _) = open_mem(64 * 512);
        let pattern: Vec<u8> = (0..8 * 512).map(|i| (i % 251) as u8).collect();
        dev.write_blocks(BlockNumber(56), 8, &pattern).expect("write");

        let mut out = vec![0_u8; 8 * 512];
        dev.read_blocks(BlockNumber(56), 8, &mut out).expect("read");
        assert_eq!(out, pattern);
    }

    #[test]
    fn range_crossing_end_is_rejected() {
        let (mut dev, backing) = open_mem(64 * 512);
        let mut buf = vec![0_u8; 2 * 512];
        let err = dev.read_blocks(BlockNumber(63), 2, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            BlkError::OutOfRange {
                op: IoOp::Read,
                block: 63,
                count: 2,
                limit: 64
            }
        ));

        let err = dev
            .write_blocks(BlockNumber(u64::MAX), 1, &buf)
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Addressing);
        assert!(backing.snapshot().iter().all(|b| *b == 0));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let (mut dev, _) = open_mem(8 * 512);
        let mut buf = vec![0_u8; 10];
        let err = dev.read_blocks(BlockNumber(3), 2, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            BlkError::BufferSize {
                op: IoOp::Read,
                block: 3,
                expected: 1024,
                actual: 10
            }
        ));
        assert_eq!(err.block(), Some(3));
        assert_eq!(
            err.to_string(),
            "read buffer at block 3 holds 10 bytes, need 1024"
        );

        let err = dev.write_block(BlockNumber(4), &[0; 1000]).unwrap_err();
        assert_eq!(err.block(), Some(4));
        assert_eq!(err.class(), ErrorClass::Argument);
    }

    #[test]
    fn zero_count_in_range_is_noop() {
        let (mut dev, _) = open_mem(8 * 512);
        dev.read_blocks(BlockNumber(3), 0, &mut []).expect("empty read");
        dev.write_blocks(BlockNumber(3), 0, &[]).expect("empty write");
        assert_eq!(dev.stats(), IoStats::default());
        assert!(dev.read_blocks(BlockNumber(8), 0, &mut []).is_err());
    }

    #[test]
    fn larger_buffer_only_uses_requested_prefix() {
        let (mut dev, _) = open_mem(8 * 512);
        dev.write_block(BlockNumber(1), &[7; 512]).unwrap();
        let mut buf = vec![0xFF_u8; 700];
        dev.read_blocks(BlockNumber(1), 1, &mut buf).unwrap();
        assert!(buf[..512].iter().all(|b| *b == 7));
        assert!(buf[512..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn offset_translation_keeps_high_bits() {
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let store = RecordingByteDevice {
            len: 0x1_0000_0010 * 512,
            offsets: Arc::clone(&offsets),
        };
        let mut dev = ByteBlockDevice::new(store, &DeviceOptions::default()).unwrap();
        dev.open().unwrap();

        let block = BlockNumber(0x1_0000_0001);
        dev.read_block(block).unwrap();
        dev.write_block(block, &[0; 512]).unwrap();

        let expected = 0x1_0000_0001_u64 * 512;
        assert_eq!(*offsets.lock(), vec![expected, expected]);
        assert_ne!(expected, u64::from(expected as u32));
    }

    #[test]
    fn trailing_partial_block_is_excluded() {
        let dev = ByteBlockDevice::new(MemByteDevice::new(2048 * 512), &DeviceOptions::default())
            .unwrap();
        assert_eq!(dev.block_count(), 2048);

        let mut dev =
            ByteBlockDevice::new(MemByteDevice::new(2048 * 512 + 37), &DeviceOptions::default())
                .unwrap();
        assert_eq!(dev.block_count(), 2048);
        assert_eq!(dev.partition(), PartitionWindow::whole(2048));
        dev.open().unwrap();
        assert!(dev.read_block(BlockNumber(2048)).is_err());
    }

    #[test]
    fn io_before_open_is_invalid_state() {
        let mut dev =
            ByteBlockDevice::new(MemByteDevice::new(4096), &DeviceOptions::default()).unwrap();
        assert_eq!(dev.state(), DeviceState::Unopened);
        let err = dev.read_block(BlockNumber(0)).unwrap_err();
        assert!(matches!(
            err,
            BlkError::InvalidState {
                op: IoOp::Read,
                block: Some(0),
                state: "unopened"
            }
        ));
        assert_eq!(err.class(), ErrorClass::InvalidState);
        assert!(matches!(
            dev.sync(),
            Err(BlkError::InvalidState { block: None, .. })
        ));
    }

    #[test]
    fn io_after_close_is_invalid_state() {
        let (mut dev, _) = open_mem(4096);
        dev.close().expect("close");
        assert_eq!(dev.state(), DeviceState::Closed);
        assert!(dev.inner().is_none());

        let err = dev.read_block(BlockNumber(7)).unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvalidState);
        assert_eq!(err.block(), Some(7));
        assert_eq!(err.to_string(), "cannot read block 7: device is closed");
        let err = dev.write_block(BlockNumber(0), &[0; 512]).unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvalidState);
        let mut buf = [0_u8; 4];
        let err = dev.read_bytes(ByteOffset(1030), &mut buf).unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvalidState);
        assert_eq!(err.block(), Some(2));
    }

    #[test]
    fn close_is_idempotent() {
        let (mut dev, _) = open_mem(4096);
        assert!(dev.close().is_ok());
        assert!(dev.close().is_ok());
        assert_eq!(dev.state(), DeviceState::Closed);

        let mut never_opened =
            ByteBlockDevice::new(MemByteDevice::new(4096), &DeviceOptions::default()).unwrap();
        assert!(never_opened.close().is_ok());
        assert!(never_opened.close().is_ok());
    }

    #[test]
    fn open_is_not_reentrant() {
        let (mut dev, _) = open_mem(4096);
        let err = dev.open().unwrap_err();
        assert!(matches!(
            err,
            BlkError::InvalidState {
                op: IoOp::Open,
                block: None,
                state: "open"
            }
        ));
        assert_eq!(dev.state(), DeviceState::Open);

        dev.close().unwrap();
        assert!(dev.open().is_err());
        assert_eq!(dev.state(), DeviceState::Closed);
    }

    #[test]
    fn release_drops_host_store() {
        let mem = MemByteDevice::new(4096);
        let backing = mem.backing();
        let mut dev = ByteBlockDevice::new(mem, &DeviceOptions::default()).unwrap();
        dev.open().unwrap();
        dev.write_block(BlockNumber(1), &[3; 512]).unwrap();
        dev.release();
        assert_eq!(backing.snapshot()[512], 3);
    }

    #[test]
    fn short_read_after_store_shrinks() {
        let (mut dev, backing) = open_mem(8 * 512);
        backing.truncate(7 * 512 + 100);

        let err = dev.read_block(BlockNumber(7)).unwrap_err();
        assert!(matches!(
            err,
            BlkError::ShortTransfer {
                op: IoOp::Read,
                block: 7,
                expected: 512,
                actual: 100
            }
        ));
        assert_eq!(err.class(), ErrorClass::Transfer);

        let err = dev.write_block(BlockNumber(7), &[1; 512]).unwrap_err();
        assert!(matches!(err, BlkError::ShortTransfer { op: IoOp::Write, .. }));
        assert!(dev.read_block(BlockNumber(6)).is_ok());
    }

    #[test]
    fn read_only_store_rejects_writes() {
        let store = MemByteDevice::new(4096).read_only();
        let mut dev = ByteBlockDevice::new(store, &DeviceOptions::default()).unwrap();
        dev.open().unwrap();
        let err = dev.write_block(BlockNumber(5), &[0; 512]).unwrap_err();
        assert!(matches!(err, BlkError::ReadOnly { block: 5 }));
        assert_eq!(err.block(), Some(5));
        assert_eq!(err.to_string(), "write to read-only device at block 5");
        assert!(dev.read_block(BlockNumber(0)).is_ok());
    }

    #[test]
    fn unsized_store_is_unavailable() {
        let err = ByteBlockDevice::new(UnsizedByteDevice, &DeviceOptions::default()).unwrap_err();
        assert_eq!(err.class(), ErrorClass::DeviceUnavailable);
        assert!(err.to_string().contains("unsized"));
    }

    #[test]
    fn invalid_options_are_rejected() {
        let options = DeviceOptions {
            block_size: 1000,
            ..DeviceOptions::default()
        };
        let err = ByteBlockDevice::new(MemByteDevice::new(4096), &options).unwrap_err();
        assert!(matches!(err, BlkError::InvalidGeometry(_)));

        let options = DeviceOptions {
            partition: Some(PartitionWindow {
                offset: BlockNumber(4),
                size: 5,
            }),
            ..DeviceOptions::default()
        };
        let err = ByteBlockDevice::new(MemByteDevice::new(4096), &options).unwrap_err();
        assert!(matches!(err, BlkError::InvalidGeometry(_)));
    }

    #[test]
    fn larger_block_size_option() {
        let options = DeviceOptions {
            block_size: 4096,
            ..DeviceOptions::default()
        };
        let mut dev = ByteBlockDevice::new(MemByteDevice::new(MIB + 4000), &options).unwrap();
        assert_eq!(dev.block_count(), 256);
        dev.open().unwrap();
        dev.write_block(BlockNumber(255), &[9; 4096]).unwrap();
        assert_eq!(dev.read_block(BlockNumber(255)).unwrap().as_slice(), &[9; 4096]);
    }

    #[test]
    fn partition_access_is_window_relative() {
        let (mut dev, backing) = open_mem(64 * 512);
        dev.set_partition(PartitionWindow {
            offset: BlockNumber(16),
            size: 8,
        })
        .unwrap();

        dev.write_partition(BlockNumber(0), 1, &[0x11; 512]).unwrap();
        dev.write_partition(BlockNumber(7), 1, &[0x77; 512]).unwrap();
        assert_eq!(backing.snapshot()[16 * 512], 0x11);
        assert_eq!(backing.snapshot()[23 * 512], 0x77);

        let mut buf = vec![0_u8; 512];
        dev.read_partition(BlockNumber(7), 1, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0x77));

        let err = dev.read_partition(BlockNumber(8), 1, &mut buf).unwrap_err();
        assert!(matches!(err, BlkError::OutOfRange { limit: 8, .. }));
        let err = dev
            .write_partition(BlockNumber(6), 3, &[0; 3 * 512])
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Addressing);

        // Physical addressing is unaffected by the window.
        dev.read_block(BlockNumber(40)).unwrap();
        assert!(
            dev.set_partition(PartitionWindow {
                offset: BlockNumber(60),
                size: 5
            })
            .is_err()
        );
    }

    #[test]
    fn unaligned_bytes_round_trip_and_preserve_neighbours() {
        let (mut dev, backing) = open_mem(16 * 512);
        dev.write_blocks(BlockNumber(0), 16, &vec![0xCC; 16 * 512])
            .unwrap();

        let payload: Vec<u8> = (0..1500).map(|i| (i % 200) as u8 + 1).collect();
        dev.write_bytes(ByteOffset(300), &payload).unwrap();

        let mut out = vec![0_u8; payload.len()];
        dev.read_bytes(ByteOffset(300), &mut out).unwrap();
        assert_eq!(out, payload);

        let bytes = backing.snapshot();
        assert!(bytes[..300].iter().all(|b| *b == 0xCC));
        assert_eq!(&bytes[300..1800], payload.as_slice());
        assert!(bytes[1800..].iter().all(|b| *b == 0xCC));
    }

    #[test]
    fn byte_io_stays_inside_window() {
        let (mut dev, backing) = open_mem(16 * 512);
        dev.set_partition(PartitionWindow {
            offset: BlockNumber(4),
            size: 2,
        })
        .unwrap();

        dev.write_bytes(ByteOffset(510), &[1, 2, 3, 4]).unwrap();
        assert_eq!(&backing.snapshot()[4 * 512 + 510..4 * 512 + 514], &[1, 2, 3, 4]);

        let mut buf = [0_u8; 4];
        dev.read_bytes(ByteOffset(510), &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        let err = dev.write_bytes(ByteOffset(1022), &[0; 3]).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Addressing);
        let mut whole = vec![0_u8; 1024];
        dev.read_bytes(ByteOffset(0), &mut whole).unwrap();
    }

    #[test]
    fn stats_count_calls_and_blocks() {
        let (mut dev, _) = open_mem(16 * 512);
        dev.write_blocks(BlockNumber(0), 4, &[0; 4 * 512]).unwrap();
        dev.read_block(BlockNumber(2)).unwrap();
        dev.sync().unwrap();
        assert_eq!(
            dev.stats(),
            IoStats {
                reads: 1,
                writes: 1,
                syncs: 1,
                blocks_read: 1,
                blocks_written: 4,
            }
        );
    }

    #[test]
    fn trait_object_dispatch() {
        let (dev, _) = open_mem(4 * 512);
        let mut boxed: Box<dyn BlockDevice> = Box::new(dev);
        boxed.write_block(BlockNumber(3), &[4; 512]).unwrap();
        assert_eq!(boxed.read_block(BlockNumber(3)).unwrap().as_slice(), &[4; 512]);
        boxed.close().unwrap();
        assert_eq!(boxed.state(), DeviceState::Closed);
    }

    #[test]
    fn options_default_and_display() {
        let options = DeviceOptions::default();
        assert_eq!(options.block_size, 512);
        assert_eq!(options.access, AccessMode::ReadWrite);
        assert!(!options.trace_io);
        assert_eq!(DeviceState::Unopened.to_string(), "unopened");
    }

    const PROP_BLOCKS: u64 = 64;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn in_range_blocks_round_trip(
            block in 0_u64..PROP_BLOCKS,
            count in 1_u32..=16,
            seed in any::<u8>(),
        ) {
            prop_assume!(block + u64::from(count) <= PROP_BLOCKS);
            let (mut dev, backing) = open_mem(PROP_BLOCKS as usize * 512);
            let len = count as usize * 512;
            let payload: Vec<u8> = (0..len).map(|i| (i as u8) ^ seed).collect();

            dev.write_blocks(BlockNumber(block), count, &payload).unwrap();
            let mut out = vec![0_u8; len];
            dev.read_blocks(BlockNumber(block), count, &mut out).unwrap();
            prop_assert_eq!(&out, &payload);

            let start = block as usize * 512;
            let snapshot = backing.snapshot();
            prop_assert!(snapshot[..start].iter().all(|b| *b == 0));
            prop_assert!(snapshot[start + len..].iter().all(|b| *b == 0));
        }

        #[test]
        fn requests_past_the_end_are_rejected(
            block in prop_oneof![0_u64..2 * PROP_BLOCKS, any::<u64>()],
            count in 0_u32..40,
        ) {
            let (mut dev, backing) = open_mem(PROP_BLOCKS as usize * 512);
            let in_range = block < PROP_BLOCKS
                && block.checked_add(u64::from(count)).is_some_and(|end| end <= PROP_BLOCKS);
            let mut buf = vec![0x5A_u8; count as usize * 512];

            let write = dev.write_blocks(BlockNumber(block), count, &buf);
            let read = dev.read_blocks(BlockNumber(block), count, &mut buf);
            if in_range {
                prop_assert!(write.is_ok());
                prop_assert!(read.is_ok());
            } else {
                let write = write.unwrap_err();
                prop_assert_eq!(write.class(), ErrorClass::Addressing);
                prop_assert_eq!(write.block(), Some(block));
                prop_assert_eq!(read.unwrap_err().class(), ErrorClass::Addressing);
                prop_assert!(backing.snapshot().iter().all(|b| *b == 0));
            }
        }

        #[test]
        fn byte_io_touches_only_its_range(
            offset in 0_u64..32 * 512,
            len in 0_usize..3000,
            fill in any::<u8>(),
        ) {
            prop_assume!(offset + len as u64 <= 32 * 512);
            let original = patterned(32 * 512);
            let mem = MemByteDevice::from_bytes(original.clone());
            let backing = mem.backing();
            let mut dev = ByteBlockDevice::new(mem, &DeviceOptions::default()).unwrap();
            dev.open().unwrap();

            let payload = vec![fill; len];
            dev.write_bytes(ByteOffset(offset), &payload).unwrap();

            let start = offset as usize;
            let mut expected = original;
            expected[start..start + len].copy_from_slice(&payload);
            prop_assert_eq!(backing.snapshot(), expected);

            let mut out = vec![0_u8; len];
            dev.read_bytes(ByteOffset(offset), &mut out).unwrap();
            prop_assert_eq!(out, payload);
        }
    }
}
