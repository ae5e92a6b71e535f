//! The object arena: growth, appends and checked object access.
//!
//! Every object read goes through [`JournalFile::read_object`], which
//! checks the offset, re-reads the file size when the object seems to lie
//! past the end, and decodes the object header before handing out bytes.

use super::JournalFile;
use crate::error::{JournalError, JournalResult};
use crate::format::{
    align8, check_entry_array_size, check_hash_table_size, valid_offset, DataObject,
    EntryObject, FieldObject, ObjectHeader, ObjectType, TagObject, OBJECT_HEADER_SIZE,
};
use crate::config::page_align;
use jrnl_storage::StorageError;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Files grow in steps of this many bytes.
pub(crate) const FILE_SIZE_INCREASE: u64 = 8 * 1024 * 1024;

/// How long a deleted-file check stays fresh.
const STAT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

impl JournalFile {
    /// Reads raw bytes, mapping vanished bytes to a bus fault.
    pub(crate) fn read_bytes(&self, offset: u64, len: usize) -> JournalResult<Vec<u8>> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| JournalError::malformed(format!("read at {offset} overflows")))?;

        if end > self.file_size.load(Ordering::SeqCst) {
            // Another process may have grown the file.
            let size = self.backend.size()?;
            self.file_size.store(size, Ordering::SeqCst);
            if end > size {
                return Err(JournalError::malformed(format!(
                    "object at {offset} ends at {end}, past end of file at {size}"
                )));
            }
        }

        self.backend.read_at(offset, len).map_err(|e| match e {
            StorageError::Fault { .. } => JournalError::BusFault,
            other => other.into(),
        })
    }

    /// Reads and checks the object header at `offset`.
    ///
    /// `ObjectType::Unused` accepts any type.
    pub(crate) fn read_object_header(
        &self,
        offset: u64,
        expected: ObjectType,
    ) -> JournalResult<ObjectHeader> {
        if offset == 0 || !valid_offset(offset) {
            return Err(JournalError::malformed(format!(
                "invalid object offset {offset}"
            )));
        }
        if offset < self.header.header_size {
            return Err(JournalError::malformed(format!(
                "object offset {offset} lies inside the header"
            )));
        }

        let raw = self.read_bytes(offset, OBJECT_HEADER_SIZE as usize)?;
        let header = ObjectHeader::decode(&raw, offset)?;

        if expected != ObjectType::Unused && header.object_type != expected {
            return Err(JournalError::malformed(format!(
                "expected {expected} object at {offset}, found {}",
                header.object_type
            )));
        }

        match header.object_type {
            ObjectType::EntryArray => check_entry_array_size(header.size, offset)?,
            ObjectType::DataHashTable | ObjectType::FieldHashTable => {
                check_hash_table_size(header.size, offset)?;
            }
            _ => {}
        }

        Ok(header)
    }

    /// Reads the full encoding of the object at `offset`.
    pub(crate) fn read_object(
        &self,
        offset: u64,
        expected: ObjectType,
    ) -> JournalResult<(ObjectHeader, Vec<u8>)> {
        let header = self.read_object_header(offset, expected)?;
        let len = usize::try_from(header.size).map_err(|_| {
            JournalError::malformed(format!("object at {offset} too large to read"))
        })?;
        let bytes = self.read_bytes(offset, len)?;
        Ok((header, bytes))
    }

    pub(crate) fn read_data(&self, offset: u64) -> JournalResult<DataObject> {
        let (_, bytes) = self.read_object(offset, ObjectType::Data)?;
        DataObject::decode(&bytes, offset)
    }

    pub(crate) fn read_field(&self, offset: u64) -> JournalResult<FieldObject> {
        let (_, bytes) = self.read_object(offset, ObjectType::Field)?;
        FieldObject::decode(&bytes, offset)
    }

    /// Reads the entry at `offset`.
    ///
    /// # Errors
    ///
    /// Returns a malformed error if no valid entry lives there.
    pub fn read_entry(&self, offset: u64) -> JournalResult<EntryObject> {
        let (_, bytes) = self.read_object(offset, ObjectType::Entry)?;
        EntryObject::decode(&bytes, offset)
    }

    /// Reads the tag at `offset`.
    ///
    /// # Errors
    ///
    /// Returns a malformed error if no valid tag lives there.
    pub fn read_tag(&self, offset: u64) -> JournalResult<TagObject> {
        let (_, bytes) = self.read_object(offset, ObjectType::Tag)?;
        TagObject::decode(&bytes, offset)
    }

    pub(crate) fn write_u64_at(&self, offset: u64, value: u64) -> JournalResult<()> {
        self.backend.write_at(offset, &value.to_le_bytes())?;
        Ok(())
    }

    /// Makes sure the file covers `[offset, offset + size)`, growing it in
    /// large steps within the configured limits.
    pub(crate) fn allocate(&mut self, offset: u64, size: u64) -> JournalResult<()> {
        let old_size = self.header.header_size + self.header.arena_size;
        let wanted = offset.checked_add(size).ok_or_else(|| {
            JournalError::resource_exhausted(format!("allocation at {offset} overflows"))
        })?;
        let new_size = page_align(wanted);

        if new_size <= old_size {
            return self.check_deleted();
        }

        if new_size > self.metrics.max_size {
            debug!(
                new_size,
                max_size = self.metrics.max_size,
                "journal file reached its size limit"
            );
            return Err(JournalError::quota_exceeded(format!(
                "growing to {new_size} bytes exceeds limit of {}",
                self.metrics.max_size
            )));
        }

        if new_size > self.metrics.min_size && self.metrics.keep_free > 0 {
            match self.backend.space() {
                Ok(Some(space)) => {
                    let available = space.available.saturating_sub(self.metrics.keep_free);
                    if new_size - old_size > available {
                        debug!(
                            available = space.available,
                            keep_free = self.metrics.keep_free,
                            "refusing to eat into kept free space"
                        );
                        return Err(JournalError::quota_exceeded(format!(
                            "only {available} bytes may be used before the keep-free floor"
                        )));
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "failed to query free space"),
            }
        }

        let new_size = new_size
            .div_ceil(FILE_SIZE_INCREASE)
            .saturating_mul(FILE_SIZE_INCREASE)
            .min(self.metrics.max_size);

        self.backend.allocate(old_size, new_size - old_size)?;
        self.header.arena_size = new_size - self.header.header_size;
        self.file_size.fetch_max(new_size, Ordering::SeqCst);
        self.refresh_stat()
    }

    fn check_deleted(&mut self) -> JournalResult<()> {
        if self
            .last_stat
            .is_some_and(|t| t.elapsed() < STAT_REFRESH_INTERVAL)
        {
            return Ok(());
        }
        self.refresh_stat()
    }

    fn refresh_stat(&mut self) -> JournalResult<()> {
        let size = self.backend.size()?;
        self.file_size.store(size, Ordering::SeqCst);
        self.last_stat = Some(Instant::now());

        if self.backend.is_unlinked()? {
            warn!(path = ?self.path, "journal file was deleted, refusing to append");
            return Err(JournalError::Deleted);
        }
        Ok(())
    }

    /// Appends an object given its full encoding and returns its offset.
    pub(crate) fn append_object(&mut self, object_type: ObjectType, bytes: &[u8]) -> JournalResult<u64> {
        if !self.writable {
            return Err(JournalError::ReadOnly);
        }
        self.set_online()?;

        let offset = if self.header.tail_object_offset == 0 {
            self.header.header_size
        } else {
            let tail = self.header.tail_object_offset;
            let tail_header = self.read_object_header(tail, ObjectType::Unused)?;
            align8(tail_header.size)
                .and_then(|size| tail.checked_add(size))
                .ok_or_else(|| {
                    JournalError::resource_exhausted(format!("object at {tail} too large"))
                })?
        };
        let offset = align8(offset)
            .ok_or_else(|| JournalError::resource_exhausted("arena offset overflows"))?;

        self.allocate(offset, bytes.len() as u64)?;
        self.backend.write_at(offset, bytes)?;

        self.header.tail_object_offset = offset;
        self.header.n_objects += 1;

        debug_assert_eq!(bytes.first().copied(), Some(object_type.as_byte()));
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{JournalConfig, JournalMetrics};
    use crate::error::JournalError;
    use crate::format::{DataObject, ObjectType};
    use crate::journal::JournalFile;
    use crate::types::Id128;
    use jrnl_storage::{InMemoryBackend, StorageBackend};
    use std::sync::Arc;

    fn open(backend: &Arc<InMemoryBackend>, metrics: JournalMetrics) -> JournalFile {
        let config = JournalConfig::writer()
            .machine_id(Id128::from_bytes([7; 16]))
            .metrics(metrics);
        JournalFile::open_backend(backend.clone(), None, &config, None, None).unwrap()
    }

    #[test]
    fn objects_are_aligned_and_chained() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut file = open(&backend, JournalMetrics::new().keep_free(0));

        let a = DataObject::new(1, b"A=1".to_vec(), 0).encode();
        let first = file.append_object(ObjectType::Data, &a).unwrap();
        let second = file.append_object(ObjectType::Data, &a).unwrap();

        assert_eq!(first % 8, 0);
        assert_eq!(second, first + 72);
        assert_eq!(file.header().tail_object_offset, second);
        assert_eq!(file.read_data(first).unwrap().payload, b"A=1");
    }

    #[test]
    fn growth_is_stepped() {
        let backend = Arc::new(InMemoryBackend::new());
        let file = open(&backend, JournalMetrics::new().keep_free(0));

        let total = file.header().header_size + file.header().arena_size;
        assert_eq!(total, super::FILE_SIZE_INCREASE);
    }

    #[test]
    fn max_size_enforced() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut file = open(
            &backend,
            JournalMetrics::new().max_size(1 << 20).keep_free(0),
        );

        let big = DataObject::new(1, vec![b'x'; 2 << 20], 0).encode();
        let err = file.append_object(ObjectType::Data, &big).unwrap_err();
        assert!(matches!(err, JournalError::QuotaExceeded { .. }));
    }

    #[test]
    fn keep_free_enforced() {
        let backend = Arc::new(InMemoryBackend::new().with_space(1 << 20, 1 << 40));
        let mut file = open(
            &backend,
            JournalMetrics::new()
                .max_size(64 << 20)
                .min_size(512 << 10)
                .keep_free(4 << 20),
        );

        let big = DataObject::new(1, vec![b'x'; 9 << 20], 0).encode();
        let err = file.append_object(ObjectType::Data, &big).unwrap_err();
        assert!(matches!(err, JournalError::QuotaExceeded { .. }));
    }

    #[test]
    fn object_reads_are_checked() {
        let backend = Arc::new(InMemoryBackend::new());
        let file = open(&backend, JournalMetrics::new().keep_free(0));

        assert!(file.read_data(0).unwrap_err().is_malformed());
        assert!(file.read_data(13).unwrap_err().is_malformed());
        assert!(file.read_data(8).unwrap_err().is_malformed());

        // The first object is the field hash table.
        let table = file.header().field_hash_table_offset - 16;
        assert!(file.read_data(table).unwrap_err().is_malformed());
        assert!(file
            .read_object_header(table, ObjectType::Unused)
            .is_ok());

        assert!(file.read_data(1 << 40).unwrap_err().is_malformed());
    }

    #[test]
    fn external_truncation_is_a_bus_fault() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut file = open(&backend, JournalMetrics::new().keep_free(0));
        let obj = DataObject::new(1, b"A=1".to_vec(), 0).encode();
        let offset = file.append_object(ObjectType::Data, &obj).unwrap();

        backend.truncate_externally(offset as usize);
        assert!(matches!(file.read_data(offset), Err(JournalError::BusFault)));
        assert!(backend.bus_fault_seen());
    }
}
