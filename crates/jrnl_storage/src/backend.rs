//! Storage backend trait definition.

use crate::error::StorageResult;

/// Size information about the filesystem holding a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsSpace {
    /// Bytes available to unprivileged writers.
    pub available: u64,
    /// Total size of the filesystem in bytes.
    pub total: u64,
}

/// A random-access byte store backing one journal file.
///
/// Backends are **opaque byte stores**. The journal engine owns all file
/// format interpretation; backends only move bytes between positions and
/// report the state of the underlying medium.
///
/// All methods take `&self`: a backend is shared between the thread that
/// owns a journal file and the background thread that syncs it offline,
/// so implementations lock internally.
///
/// # Invariants
///
/// - `read_at` returns exactly the bytes previously written at that offset
/// - bytes that were never written but lie below `size()` read as zero
/// - `allocate` never shrinks the store
/// - once `bus_fault_seen` returns `true` it keeps returning `true`
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` at `offset`, growing the store if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Returns the current size of the store in bytes.
    ///
    /// File-backed stores re-query the medium, so growth or truncation by
    /// another process is observed.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Ensures the store covers `[offset, offset + len)`, zero-filled.
    ///
    /// # Errors
    ///
    /// Returns an error if space cannot be reserved.
    fn allocate(&self, offset: u64, len: u64) -> StorageResult<()>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&self) -> StorageResult<()>;

    /// Nudges watchers of the underlying medium that content changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium rejects the nudge.
    fn touch(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Returns `true` once a read has hit bytes that vanished from under
    /// the store (the equivalent of a bus fault on a memory mapping).
    fn bus_fault_seen(&self) -> bool;

    /// Returns filesystem space figures, if the store lives on one.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem cannot be queried.
    fn space(&self) -> StorageResult<Option<FsSpace>> {
        Ok(None)
    }

    /// Returns `true` if the store's backing file has been unlinked.
    ///
    /// # Errors
    ///
    /// Returns an error if the file metadata cannot be read.
    fn is_unlinked(&self) -> StorageResult<bool> {
        Ok(false)
    }
}
