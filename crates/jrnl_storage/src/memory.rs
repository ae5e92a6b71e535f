//! In-memory storage backend for testing.

use crate::backend::{FsSpace, StorageBackend};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// An in-memory storage backend.
///
/// This backend stores all data in memory and is suitable for:
/// - Unit tests
/// - Fault-injection tests (external truncation, bus faults)
/// - Ephemeral journals that don't need persistence
///
/// Like [`super::FileBackend`] it remembers the last observed size, so a
/// read that was in bounds by that measure but hits missing bytes raises
/// the sticky fault flag.
///
/// # Example
///
/// ```rust
/// use jrnl_storage::{StorageBackend, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.write_at(0, b"test data").unwrap();
/// assert_eq!(backend.size().unwrap(), 9);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
    observed: AtomicU64,
    fault: AtomicBool,
    space: RwLock<Option<FsSpace>>,
    syncs: AtomicU64,
    touches: AtomicU64,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend with pre-existing data.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        let len = data.len() as u64;
        Self {
            data: RwLock::new(data),
            observed: AtomicU64::new(len),
            ..Self::default()
        }
    }

    /// Pretends the backend lives on a filesystem with the given figures.
    #[must_use]
    pub fn with_space(self, available: u64, total: u64) -> Self {
        *self.space.write() = Some(FsSpace { available, total });
        self
    }

    /// Returns a copy of all data in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Shrinks the data without updating the observed size, as another
    /// process truncating the file would.
    pub fn truncate_externally(&self, new_len: usize) {
        self.data.write().truncate(new_len);
    }

    /// Overwrites bytes without any bookkeeping, as a stray writer would.
    pub fn corrupt(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.write();
        if data.len() < offset + bytes.len() {
            data.resize(offset + bytes.len(), 0);
        }
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Raises the fault flag directly.
    pub fn inject_fault(&self) {
        self.fault.store(true, Ordering::SeqCst);
    }

    /// Returns how many times `sync` was called.
    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Returns how many times `touch` was called.
    #[must_use]
    pub fn touch_count(&self) -> u64 {
        self.touches.load(Ordering::SeqCst)
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let observed = self.observed.load(Ordering::SeqCst);
        let end = offset.saturating_add(len as u64);

        if offset > observed || end > observed {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: observed,
            });
        }

        if end > data.len() as u64 {
            self.fault.store(true, Ordering::SeqCst);
            return Err(StorageError::Fault { offset });
        }

        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        self.observed.fetch_max(end as u64, Ordering::SeqCst);
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        let len = self.data.read().len() as u64;
        self.observed.store(len, Ordering::SeqCst);
        Ok(len)
    }

    fn allocate(&self, offset: u64, len: u64) -> StorageResult<()> {
        let end = offset.saturating_add(len) as usize;
        let mut data = self.data.write();
        if data.len() < end {
            data.resize(end, 0);
        }
        self.observed.fetch_max(end as u64, Ordering::SeqCst);
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn touch(&self) -> StorageResult<()> {
        self.touches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn bus_fault_seen(&self) -> bool {
        self.fault.load(Ordering::SeqCst)
    }

    fn space(&self) -> StorageResult<Option<FsSpace>> {
        Ok(*self.space.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_new_is_empty() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(backend.data().is_empty());
    }

    #[test]
    fn memory_write_extends() {
        let backend = InMemoryBackend::new();
        backend.write_at(4, b"abcd").unwrap();

        assert_eq!(backend.size().unwrap(), 8);
        assert_eq!(backend.read_at(0, 8).unwrap(), b"\0\0\0\0abcd");
    }

    #[test]
    fn memory_read_at_past_end_fails() {
        let backend = InMemoryBackend::new();
        backend.write_at(0, b"hello").unwrap();

        let result = backend.read_at(3, 10);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn memory_empty_read() {
        let backend = InMemoryBackend::new();
        backend.write_at(0, b"hello").unwrap();

        assert!(backend.read_at(2, 0).unwrap().is_empty());
    }

    #[test]
    fn memory_with_data() {
        let backend = InMemoryBackend::with_data(b"preloaded".to_vec());
        assert_eq!(backend.size().unwrap(), 9);
        assert_eq!(backend.read_at(0, 9).unwrap(), b"preloaded");
    }

    #[test]
    fn memory_allocate_zero_fills() {
        let backend = InMemoryBackend::new();
        backend.allocate(0, 64).unwrap();
        assert_eq!(backend.read_at(0, 64).unwrap(), vec![0u8; 64]);
    }

    #[test]
    fn memory_external_truncation_faults() {
        let backend = InMemoryBackend::new();
        backend.allocate(0, 128).unwrap();
        backend.truncate_externally(16);

        let result = backend.read_at(32, 8);
        assert!(matches!(result, Err(StorageError::Fault { offset: 32 })));
        assert!(backend.bus_fault_seen());

        // Re-observing the size turns further reads into plain bounds errors.
        assert_eq!(backend.size().unwrap(), 16);
        let result = backend.read_at(32, 8);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn memory_counts_syncs_and_touches() {
        let backend = InMemoryBackend::new();
        backend.sync().unwrap();
        backend.sync().unwrap();
        backend.touch().unwrap();

        assert_eq!(backend.sync_count(), 2);
        assert_eq!(backend.touch_count(), 1);
    }

    #[test]
    fn memory_space_is_configurable() {
        let backend = InMemoryBackend::new();
        assert!(backend.space().unwrap().is_none());

        let backend = backend.with_space(10, 100);
        assert_eq!(
            backend.space().unwrap(),
            Some(FsSpace {
                available: 10,
                total: 100
            })
        );
    }

    #[test]
    fn memory_corrupt_overwrites() {
        let backend = InMemoryBackend::new();
        backend.write_at(0, b"abcdef").unwrap();
        backend.corrupt(2, b"ZZ");
        assert_eq!(backend.read_at(0, 6).unwrap(), b"abZZef");
    }
}
