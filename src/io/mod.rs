//! File I/O Module
//!
//! Positional access to the single backing file.
//!
//! ## Responsibilities
//! - Positional reads/writes at arbitrary byte offsets (no shared cursor)
//! - File growth and fsync
//! - The fixed header at the start of page 0
//! - Reusable page buffers
//!
//! ## File Layout
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Page 0: header slot A (512) | slot B (512)   │
//! ├──────────────────────────────────────────────┤
//! │ Pages 1..=W: WAL region                      │
//! ├──────────────────────────────────────────────┤
//! │ Pages W+1..: allocator-managed               │
//! │   registry region, FSM region,               │
//! │   data pages, overflow pages                 │
//! └──────────────────────────────────────────────┘
//! ```

pub mod buffer_pool;
pub mod header;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use header::{FileHeader, Region};

/// The backing file, addressed by byte offset
///
/// Reads and writes are positional (`pread`/`pwrite` style), so callers
/// touching disjoint ranges never contend on a shared cursor.
#[derive(Debug)]
pub struct PagedFile {
    file: File,
    path: PathBuf,
    page_size: u32,
    /// Cached file length in bytes
    len: AtomicU64,
}

impl PagedFile {
    /// Create (or truncate) a file
    pub fn create(path: &Path, page_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
            len: AtomicU64::new(0),
        })
    }

    /// Open an existing file
    pub fn open(path: &Path, page_size: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
            len: AtomicU64::new(len),
        })
    }

    /// Rebind the page size once the header has been read
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Current file length in bytes
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of whole pages in the file
    pub fn total_pages(&self) -> u64 {
        self.len() / self.page_size as u64
    }

    /// Byte offset of a page index
    pub fn page_offset(&self, page: u64) -> u64 {
        page * self.page_size as u64
    }

    /// Read exactly `buf.len()` bytes at `offset`
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        read_at(&self.file, buf, offset)?;
        Ok(())
    }

    /// Write all of `buf` at `offset`
    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        write_at(&self.file, buf, offset)?;
        self.len.fetch_max(offset + buf.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Resize the file
    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.len.store(len, Ordering::Release);
        Ok(())
    }

    /// Flush file data and metadata to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// =============================================================================
// Platform helpers
// =============================================================================

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}
