//! File-based storage backend for persistent storage.

use crate::backend::{FsSpace, StorageBackend};
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// A file-based storage backend.
///
/// This backend provides persistent storage using positioned reads and
/// writes on an OS file. Growth goes through `fs2`'s `allocate`, so the
/// reserved region is backed by real blocks and a later write cannot fail
/// with `ENOSPC` halfway through an object.
///
/// # Durability
///
/// - `sync()` calls `File::sync_all()` to ensure data is on disk
///
/// # Faults
///
/// A read that was in bounds according to the last observed size but hits
/// end-of-file means another process truncated the file. The backend
/// records this as a sticky fault, reported by
/// [`StorageBackend::bus_fault_seen`].
///
/// # Example
///
/// ```no_run
/// use jrnl_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("system.journal"), true).unwrap();
/// backend.write_at(0, b"persistent data").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
    writable: bool,
    fault: AtomicBool,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// A writable backend creates the file if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path, writable: bool) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .truncate(false)
            .open(path)?;

        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
            writable,
            fault: AtomicBool::new(false),
        })
    }

    /// Opens or creates a writable file backend, creating parent
    /// directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path, true)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns whether the file was opened for writing.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn mark_fault(&self, offset: u64) -> StorageError {
        self.fault.store(true, Ordering::SeqCst);
        StorageError::Fault { offset }
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; len];
        match file.read_exact(&mut buffer) {
            Ok(()) => Ok(buffer),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(self.mark_fault(offset)),
            Err(e) => Err(e.into()),
        }
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut file = self.file.write();
        let mut size = self.size.write();

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        *size = (*size).max(offset + data.len() as u64);

        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        let file = self.file.read();
        let observed = file.metadata()?.len();
        *self.size.write() = observed;
        Ok(observed)
    }

    fn allocate(&self, offset: u64, len: u64) -> StorageResult<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "allocation overflows"))?;

        let file = self.file.write();
        let mut size = self.size.write();

        if end <= *size {
            return Ok(());
        }

        match file.allocate(end) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Unsupported => file.set_len(end)?,
            Err(e) => return Err(e.into()),
        }
        *size = end;

        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        let file = self.file.read();
        file.sync_all()?;
        Ok(())
    }

    fn touch(&self) -> StorageResult<()> {
        // Re-truncating to the current length bumps mtime, which wakes
        // inotify watchers without changing content.
        let file = self.file.write();
        let size = *self.size.read();
        file.set_len(size)?;
        Ok(())
    }

    fn bus_fault_seen(&self) -> bool {
        self.fault.load(Ordering::SeqCst)
    }

    fn space(&self) -> StorageResult<Option<FsSpace>> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let available = fs2::available_space(dir)?;
        let total = fs2::total_space(dir)?;
        Ok(Some(FsSpace { available, total }))
    }

    #[cfg(unix)]
    fn is_unlinked(&self) -> StorageResult<bool> {
        use std::os::unix::fs::MetadataExt;

        let file = self.file.read();
        Ok(file.metadata()?.nlink() == 0)
    }

    #[cfg(not(unix))]
    fn is_unlinked(&self) -> StorageResult<bool> {
        Ok(!self.path.exists())
    }
}
