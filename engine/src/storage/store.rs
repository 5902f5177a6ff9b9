//! Block store abstraction.
//!
//! The buffer cache reads and writes whole pages through a `BlockStore`.
//! Production code uses [`FileStore`] (one file, 8KB blocks, positional I/O)
//! and tests use [`MemoryStore`] or the fault-injecting store from the
//! simulation module.
//!
//! Implementations must ensure:
//! - `read_block` returns the last written content for a block
//! - blocks at or beyond `block_count()` do not exist
//! - `allocate_block` extends the store by exactly one zeroed block

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::storage::page::{BlockId, PAGE_SIZE, PAGE_SIZE_U64};

/// Errors that can occur during block store operations.
#[derive(Debug)]
pub enum StoreError {
    /// I/O error.
    Io(std::io::Error),
    /// Block out of bounds.
    OutOfBounds { block_id: BlockId, block_count: u64 },
    /// The file already exists (on create).
    AlreadyExists(std::path::PathBuf),
    /// The file length is not a whole number of blocks.
    TruncatedFile { len: u64 },
    /// Byte offset past the end of a block.
    OffsetOutOfBounds { offset: usize },
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::OutOfBounds {
                block_id,
                block_count,
            } => write!(
                f,
                "block {block_id} out of bounds (total blocks: {block_count})"
            ),
            Self::AlreadyExists(path) => write!(f, "file already exists: {}", path.display()),
            Self::TruncatedFile { len } => {
                write!(f, "file length {len} is not a multiple of {PAGE_SIZE}")
            }
            Self::OffsetOutOfBounds { offset } => {
                write!(f, "offset {offset} is past the end of a {PAGE_SIZE}-byte block")
            }
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abstraction over block-addressed storage.
pub trait BlockStore: Send + Sync {
    /// Read block `block_id` into `buf` (`PAGE_SIZE` bytes).
    fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> Result<(), StoreError>;

    /// Overwrite block `block_id` with `buf` (`PAGE_SIZE` bytes).
    fn write_block(&self, block_id: BlockId, buf: &[u8]) -> Result<(), StoreError>;

    /// Append one zeroed block and return its id.
    fn allocate_block(&self) -> Result<BlockId, StoreError>;

    /// Number of blocks currently in the store.
    fn block_count(&self) -> u64;

    /// Make all previous writes durable.
    fn sync(&self) -> Result<(), StoreError>;
}

fn check_bounds(block_id: BlockId, block_count: u64) -> Result<(), StoreError> {
    if block_id < block_count {
        Ok(())
    } else {
        Err(StoreError::OutOfBounds {
            block_id,
            block_count,
        })
    }
}

/// In-memory block store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: Mutex<Vec<Box<[u8]>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn blocks(&self) -> std::sync::MutexGuard<'_, Vec<Box<[u8]>>> {
        self.blocks.lock().expect("lock poisoned")
    }

    /// Flip the bits of one byte of a stored block in place.
    ///
    /// Used by tests to simulate media corruption. Fails with
    /// `OffsetOutOfBounds` when `offset` is not inside the block.
    pub fn corrupt_byte(&self, block_id: BlockId, offset: usize) -> Result<(), StoreError> {
        let mut blocks = self.blocks();
        check_bounds(block_id, blocks.len() as u64)?;
        let index = usize::try_from(block_id).map_err(|_| StoreError::OutOfBounds {
            block_id,
            block_count: blocks.len() as u64,
        })?;
        let byte = blocks[index]
            .get_mut(offset)
            .ok_or(StoreError::OffsetOutOfBounds { offset })?;
        *byte ^= 0xFF;
        Ok(())
    }
}

impl BlockStore for MemoryStore {
    fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> Result<(), StoreError> {
        let blocks = self.blocks();
        check_bounds(block_id, blocks.len() as u64)?;
        #[allow(clippy::cast_possible_truncation)] // bounded by blocks.len()
        buf.copy_from_slice(&blocks[block_id as usize]);
        Ok(())
    }

    fn write_block(&self, block_id: BlockId, buf: &[u8]) -> Result<(), StoreError> {
        let mut blocks = self.blocks();
        check_bounds(block_id, blocks.len() as u64)?;
        #[allow(clippy::cast_possible_truncation)] // bounded by blocks.len()
        blocks[block_id as usize].copy_from_slice(buf);
        Ok(())
    }

    fn allocate_block(&self) -> Result<BlockId, StoreError> {
        let mut blocks = self.blocks();
        blocks.push(vec![0u8; PAGE_SIZE].into_boxed_slice());
        Ok(blocks.len() as u64 - 1)
    }

    fn block_count(&self) -> u64 {
        self.blocks().len() as u64
    }

    fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A single-file block store.
///
/// Reads and writes use positional I/O on unix so concurrent traversals do
/// not serialize on a shared file cursor.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    block_count: AtomicU64,
    /// Serializes file growth.
    grow: Mutex<()>,
    /// Serializes seek+read/write pairs where positional I/O is unavailable.
    #[cfg(not(unix))]
    cursor: Mutex<()>,
}

impl FileStore {
    /// Create a new, empty store file. Fails if the path already exists.
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        if path.exists() {
            return Err(StoreError::AlreadyExists(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        Ok(Self::from_file(file, 0))
    }

    /// Open an existing store file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % PAGE_SIZE_U64 != 0 {
            return Err(StoreError::TruncatedFile { len });
        }

        Ok(Self::from_file(file, len / PAGE_SIZE_U64))
    }

    fn from_file(file: File, block_count: u64) -> Self {
        Self {
            file,
            block_count: AtomicU64::new(block_count),
            grow: Mutex::new(()),
            #[cfg(not(unix))]
            cursor: Mutex::new(()),
        }
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(not(unix))]
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let _cursor = self.cursor.lock().expect("lock poisoned");
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    #[cfg(not(unix))]
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let _cursor = self.cursor.lock().expect("lock poisoned");
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }
}

impl BlockStore for FileStore {
    fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> Result<(), StoreError> {
        check_bounds(block_id, self.block_count())?;
        self.read_at(buf, block_id * PAGE_SIZE_U64)?;
        Ok(())
    }

    fn write_block(&self, block_id: BlockId, buf: &[u8]) -> Result<(), StoreError> {
        check_bounds(block_id, self.block_count())?;
        self.write_at(buf, block_id * PAGE_SIZE_U64)?;
        Ok(())
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn allocate_block(&self) -> Result<BlockId, StoreError> {
        let _grow = self.grow.lock().expect("lock poisoned");
        let block_id = self.block_count.load(Ordering::Acquire);
        self.file.set_len((block_id + 1) * PAGE_SIZE_U64)?;
        self.block_count.store(block_id + 1, Ordering::Release);
        Ok(block_id)
    }

    fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Acquire)
    }

    fn sync(&self) -> Result<(), StoreError> {
        self.file.sync_all().map_err(StoreError::Io)
    }
}
