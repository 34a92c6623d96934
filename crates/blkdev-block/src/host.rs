//! Host storage primitives behind a block device.
//!
//! A [`ByteDevice`] is the platform resource a block device owns: something
//! that can report its length and move bytes at an absolute 64-bit offset.
//!
//! - **[`FileByteDevice`]**: a regular file or a raw device node, using
//!   positioned I/O (`pread`/`pwrite` on Unix, `seek_read`/`seek_write` on
//!   Windows). No shared seek position, no 32-bit offset halves.
//! - **[`MemByteDevice`]**: a RAM-backed store for tests and RAM disks.
//!
//! Transfers report the number of bytes actually moved. They stop early only
//! at end of store, which the block layer turns into a short-transfer error.

use crate::AccessMode;
use blkdev_types::ByteOffset;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Byte-addressed host store for fixed-offset I/O (pread/pwrite semantics).
///
/// Dropping the value releases the host resource.
pub trait ByteDevice: Send {
    /// Total length in bytes.
    fn len_bytes(&self) -> io::Result<u64>;

    /// Read up to `buf.len()` bytes from `offset`.
    ///
    /// Returns the number of bytes read; less than `buf.len()` only when the
    /// store ends first.
    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> io::Result<usize>;

    /// Write up to `buf.len()` bytes at `offset`, returning the count written.
    ///
    /// Never extends the store: like `read_at`, the count falls short of
    /// `buf.len()` when the store ends first.
    fn write_at(&self, offset: ByteOffset, buf: &[u8]) -> io::Result<usize>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> io::Result<()>;

    /// Whether writes are permitted on this store.
    fn is_writable(&self) -> bool {
        true
    }

    /// Human-readable location for diagnostics.
    fn location(&self) -> String;
}

/// Drive a positioned primitive until `len` bytes moved or it reports 0.
fn transfer_loop(
    offset: ByteOffset,
    len: usize,
    mut step: impl FnMut(usize, u64) -> io::Result<usize>,
) -> io::Result<usize> {
    let mut done = 0_usize;
    while done < len {
        let pos = offset
            .checked_add(done as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset overflows u64"))?;
        match step(done, pos.0) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(done)
}

// ── File-backed store ──────────────────────────────────────────────────────

/// Regular file or device node accessed with positioned I/O.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    path: PathBuf,
    writable: bool,
}

impl FileByteDevice {
    /// Open `path` according to `access`.
    ///
    /// `ReadWriteOrReadOnly` tries read-write first and falls back to
    /// read-only; the resulting store reports which one it got.
    pub fn open(path: impl AsRef<Path>, access: AccessMode) -> io::Result<Self> {
        let path = path.as_ref();
        let read_write = || OpenOptions::new().read(true).write(true).open(path);
        let read_only = || OpenOptions::new().read(true).open(path);

        let (file, writable) = match access {
            AccessMode::ReadWrite => (read_write()?, true),
            AccessMode::ReadOnly => (read_only()?, false),
            AccessMode::ReadWriteOrReadOnly => read_write()
                .map(|file| (file, true))
                .or_else(|_| read_only().map(|file| (file, false)))?,
        };

        Ok(Self {
            file,
            path: path.to_path_buf(),
            writable,
        })
    }


    #[cfg(unix)]
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)
    }

    #[cfg(unix)]
    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(&self.file, buf, offset)
    }

    #[cfg(windows)]
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset)
    }

    #[cfg(windows)]
    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(&self.file, buf, offset)
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> io::Result<u64> {
        let metadata = self.file.metadata()?;
        if metadata.is_file() {
            return Ok(metadata.len());
        }
        // Device nodes report a zero metadata length; ask the device itself.
        (&self.file).seek(SeekFrom::End(0))
    }

    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len();
        transfer_loop(offset, len, |done, pos| self.pread(&mut buf[done..], pos))
    }

    fn write_at(&self, offset: ByteOffset, buf: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "store opened read-only",
            ));
        }
        // The image may have shrunk since acquisition; stop at its current end.
        let room = self.len_bytes()?.saturating_sub(offset.0);
        let len = usize::try_from(room).map_or(buf.len(), |room| room.min(buf.len()));
        transfer_loop(offset, len, |done, pos| self.pwrite(&buf[done..len], pos))
    }

    fn sync(&self) -> io::Result<()> {
        if self.writable {
            self.file.sync_all()
        } else {
            Ok(())
        }
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

// ── In-memory store ────────────────────────────────────────────────────────

/// RAM-backed store.
///
/// The bytes live behind a [`MemBacking`] so a test can keep a view of the
/// contents after the store itself has been handed to a block device.
#[derive(Debug)]
pub struct MemByteDevice {
    backing: MemBacking,
    writable: bool,
}

/// Shared view of a [`MemByteDevice`]'s bytes.
#[derive(Debug, Clone)]
pub struct MemBacking {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemByteDevice {
    /// Zero-filled store of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            backing: MemBacking {
                bytes: Arc::new(Mutex::new(bytes)),
            },
            writable: true,
        }
    }

    /// Same store, refusing writes.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    #[must_use]
    pub fn backing(&self) -> MemBacking {
        self.backing.clone()
    }
}

impl MemBacking {
    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Shrink (or grow) the store underneath whoever owns it.
    pub fn truncate(&self, len: usize) {
        self.bytes.lock().resize(len, 0);
    }

    fn len(&self) -> usize {
        self.bytes.lock().len()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> io::Result<u64> {
        u64::try_from(self.backing.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "length overflows u64"))
    }

    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = self.backing.bytes.lock();
        let Ok(start) = usize::try_from(offset.0) else {
            return Ok(0);
        };
        if start >= bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        drop(bytes);
        Ok(n)
    }

    fn write_at(&self, offset: ByteOffset, buf: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "store is read-only",
            ));
        }
        let mut bytes = self.backing.bytes.lock();
        let Ok(start) = usize::try_from(offset.0) else {
            return Ok(0);
        };
        if start >= bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(bytes.len() - start);
        bytes[start..start + n].copy_from_slice(&buf[..n]);
        drop(bytes);
        Ok(n)
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn location(&self) -> String {
        "memory".to_owned()
    }
}
