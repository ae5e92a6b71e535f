//! The DATA and FIELD hash tables.
//!
//! Both tables are arrays of `{head, tail}` buckets with chains threaded
//! through the objects' `next_hash_offset`. Objects are only ever added at
//! a chain's tail and chains only point forward in the file, so a
//! backwards link means corruption.

use super::JournalFile;
use crate::codec::Codec;
use crate::error::{JournalError, JournalResult};
use crate::format::{
    data, field, hash_table, DataObject, EntryObject, FieldObject, HashItem, ObjectHeader,
    ObjectType, OBJECT_COMPRESSED_LZ4, OBJECT_HEADER_SIZE,
};
use tracing::{debug, warn};

/// Bucket count of the DATA table in small files.
pub const DEFAULT_DATA_HASH_TABLE_SIZE: u64 = 2047;

/// Bucket count of the FIELD table.
pub const DEFAULT_FIELD_HASH_TABLE_SIZE: u64 = 333;

/// Chains longer than this suggest someone is forcing collisions.
pub const HASH_CHAIN_DEPTH_MAX: u64 = 100;

/// Largest payload accepted after decompression.
pub(crate) const DATA_SIZE_MAX: usize = 768 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Data,
    Field,
}

impl Table {
    fn object_type(self) -> ObjectType {
        match self {
            Self::Data => ObjectType::DataHashTable,
            Self::Field => ObjectType::FieldHashTable,
        }
    }
}

impl JournalFile {
    fn table_location(&self, table: Table) -> (u64, u64) {
        match table {
            Table::Data => (
                self.header.data_hash_table_offset,
                self.header.data_hash_table_size,
            ),
            Table::Field => (
                self.header.field_hash_table_offset,
                self.header.field_hash_table_size,
            ),
        }
    }

    fn setup_hash_table(&mut self, table: Table, buckets: u64) -> JournalResult<()> {
        let size = buckets * hash_table::ITEM_SIZE;
        let header = ObjectHeader {
            object_type: table.object_type(),
            flags: 0,
            size: hash_table::ITEMS + size,
        };
        let mut bytes = vec![0u8; header.size as usize];
        bytes[..OBJECT_HEADER_SIZE as usize].copy_from_slice(&header.encode());

        let offset = self.append_object(table.object_type(), &bytes)?;
        let items = offset + hash_table::ITEMS;
        match table {
            Table::Data => {
                self.header.data_hash_table_offset = items;
                self.header.data_hash_table_size = size;
            }
            Table::Field => {
                self.header.field_hash_table_offset = items;
                self.header.field_hash_table_size = size;
            }
        }
        Ok(())
    }

    /// Creates the DATA table, sized for about one bucket per 768 bytes of
    /// a maximally grown file at 75% fill.
    pub(crate) fn setup_data_hash_table(&mut self) -> JournalResult<()> {
        let buckets = (self.metrics.max_size * 4 / 768 / 3).max(DEFAULT_DATA_HASH_TABLE_SIZE);
        self.setup_hash_table(Table::Data, buckets)
    }

    pub(crate) fn setup_field_hash_table(&mut self) -> JournalResult<()> {
        self.setup_hash_table(Table::Field, DEFAULT_FIELD_HASH_TABLE_SIZE)
    }

    /// Returns the number of buckets in the DATA table.
    #[must_use]
    pub fn data_bucket_count(&self) -> u64 {
        self.header.data_hash_table_size / hash_table::ITEM_SIZE
    }

    /// Returns the number of buckets in the FIELD table.
    #[must_use]
    pub fn field_bucket_count(&self) -> u64 {
        self.header.field_hash_table_size / hash_table::ITEM_SIZE
    }

    fn bucket_offset(&self, table: Table, hash: u64) -> JournalResult<Option<u64>> {
        let (offset, size) = self.table_location(table);
        let n = size / hash_table::ITEM_SIZE;
        if offset == 0 || n == 0 {
            return Ok(None);
        }
        Ok(Some(offset + (hash % n) * hash_table::ITEM_SIZE))
    }

    fn read_bucket(&self, at: u64) -> JournalResult<HashItem> {
        let raw = self.read_bytes(at, hash_table::ITEM_SIZE as usize)?;
        HashItem::decode(&raw, at)
    }

    /// Steps to the next object of a chain, refusing backwards links.
    fn next_hash_offset(&self, current: u64, next: u64, depth: &mut u64) -> JournalResult<u64> {
        if next > 0 {
            if next <= current {
                warn!(offset = current, next, "detected hash chain loop");
                return Err(JournalError::malformed(format!(
                    "hash chain loops from {current} back to {next}"
                )));
            }
            *depth += 1;
        }
        Ok(next)
    }

    /// Returns `payload` as stored in a DATA object, decompressed.
    pub(crate) fn data_payload_of(&self, obj: &DataObject) -> JournalResult<Vec<u8>> {
        if obj.is_compressed() {
            self.codec.decompress(&obj.payload, DATA_SIZE_MAX)
        } else {
            Ok(obj.payload.clone())
        }
    }

    fn lookup_data(
        &self,
        payload: &[u8],
        hash: u64,
    ) -> JournalResult<(Option<(u64, DataObject)>, u64)> {
        let Some(at) = self.bucket_offset(Table::Data, hash)? else {
            return Ok((None, 0));
        };

        let mut depth = 0;
        let mut p = self.read_bucket(at)?.head_hash_offset;
        while p > 0 {
            let obj = self.read_data(p)?;
            if obj.hash == hash {
                let matches = if obj.is_compressed() {
                    self.data_payload_of(&obj)? == payload
                } else {
                    obj.payload == payload
                };
                if matches {
                    return Ok((Some((p, obj)), depth));
                }
            }
            p = self.next_hash_offset(p, obj.next_hash_offset, &mut depth)?;
        }
        Ok((None, depth))
    }

    fn lookup_field(
        &self,
        name: &[u8],
        hash: u64,
    ) -> JournalResult<(Option<(u64, FieldObject)>, u64)> {
        let Some(at) = self.bucket_offset(Table::Field, hash)? else {
            return Ok((None, 0));
        };

        let mut depth = 0;
        let mut p = self.read_bucket(at)?.head_hash_offset;
        while p > 0 {
            let obj = self.read_field(p)?;
            if obj.hash == hash && obj.payload == name {
                return Ok((Some((p, obj)), depth));
            }
            p = self.next_hash_offset(p, obj.next_hash_offset, &mut depth)?;
        }
        Ok((None, depth))
    }

    /// Looks up the DATA object holding `payload`, comparing against the
    /// uncompressed form of stored payloads.
    ///
    /// # Errors
    ///
    /// Returns an error if a chain is corrupt.
    pub fn find_data_object(&self, payload: &[u8]) -> JournalResult<Option<(u64, DataObject)>> {
        let hash = self.hash.hash(payload);
        Ok(self.lookup_data(payload, hash)?.0)
    }

    /// Looks up the FIELD object named `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if a chain is corrupt.
    pub fn find_field_object(&self, name: &[u8]) -> JournalResult<Option<(u64, FieldObject)>> {
        let hash = self.hash.hash(name);
        Ok(self.lookup_field(name, hash)?.0)
    }

    fn link_into_table(&mut self, table: Table, offset: u64, hash: u64) -> JournalResult<()> {
        let at = self.bucket_offset(table, hash)?.ok_or_else(|| {
            JournalError::malformed("file has no hash table to link into")
        })?;
        let mut bucket = self.read_bucket(at)?;

        if bucket.tail_hash_offset == 0 {
            bucket.head_hash_offset = offset;
        } else {
            // DATA and FIELD keep their chain link at the same place.
            debug_assert_eq!(data::NEXT_HASH_OFFSET, field::NEXT_HASH_OFFSET);
            self.write_u64_at(bucket.tail_hash_offset + data::NEXT_HASH_OFFSET, offset)?;
        }
        bucket.tail_hash_offset = offset;
        self.backend.write_at(at, &bucket.encode())?;

        match table {
            Table::Data => self.header.n_data += 1,
            Table::Field => self.header.n_fields += 1,
        }
        Ok(())
    }

    fn record_depth(&mut self, table: Table, depth: u64) {
        let slot = match table {
            Table::Data => &mut self.header.data_hash_chain_depth,
            Table::Field => &mut self.header.field_hash_chain_depth,
        };
        *slot = (*slot).max(depth);
    }

    /// Returns the FIELD object named `name`, appending it if missing.
    pub(crate) fn find_or_append_field(&mut self, name: &[u8]) -> JournalResult<(u64, FieldObject)> {
        let hash = self.hash.hash(name);
        let (found, depth) = self.lookup_field(name, hash)?;
        self.record_depth(Table::Field, depth);
        if let Some(found) = found {
            return Ok(found);
        }

        let obj = FieldObject::new(hash, name.to_vec());
        let bytes = obj.encode();
        let offset = self.append_object(ObjectType::Field, &bytes)?;
        self.link_into_table(Table::Field, offset, hash)?;
        self.hmac_put(ObjectType::Field, offset, &bytes);
        Ok((offset, obj))
    }

    /// Returns the offset and hash of the DATA object holding `payload`,
    /// appending it (and its FIELD) if missing.
    pub(crate) fn find_or_append_data(&mut self, payload: &[u8]) -> JournalResult<(u64, u64)> {
        let hash = self.hash.hash(payload);
        let (found, depth) = self.lookup_data(payload, hash)?;
        self.record_depth(Table::Data, depth);
        if let Some((offset, _)) = found {
            return Ok((offset, hash));
        }

        let (flags, stored) = if self.compress && payload.len() >= self.config.compress_threshold {
            match self.codec.compress(payload) {
                Some(compressed) => (OBJECT_COMPRESSED_LZ4, compressed),
                None => {
                    debug!(size = payload.len(), "payload did not compress, storing as is");
                    (0, payload.to_vec())
                }
            }
        } else {
            (0, payload.to_vec())
        };

        let mut obj = DataObject::new(hash, stored, flags);
        let bytes = obj.encode();
        let offset = self.append_object(ObjectType::Data, &bytes)?;
        self.link_into_table(Table::Data, offset, hash)?;
        self.hmac_put(ObjectType::Data, offset, &bytes);

        if let Some(eq) = payload.iter().position(|&b| b == b'=') {
            if eq > 0 {
                let (field_offset, field) = self.find_or_append_field(&payload[..eq])?;
                obj.next_field_offset = field.head_data_offset;
                self.write_u64_at(offset + data::NEXT_FIELD_OFFSET, obj.next_field_offset)?;
                self.write_u64_at(field_offset + field::HEAD_DATA_OFFSET, offset)?;
            }
        }

        Ok((offset, hash))
    }

    fn hash_chain(&self, table: Table, bucket: u64) -> JournalResult<Vec<u64>> {
        let (offset, size) = self.table_location(table);
        let n = size / hash_table::ITEM_SIZE;
        if bucket >= n {
            return Err(JournalError::invalid_argument(format!(
                "bucket {bucket} out of range 0..{n}"
            )));
        }

        let item = self.read_bucket(offset + bucket * hash_table::ITEM_SIZE)?;
        let mut chain = Vec::new();
        let mut depth = 0;
        let mut p = item.head_hash_offset;
        while p > 0 {
            chain.push(p);
            let next = match table {
                Table::Data => self.read_data(p)?.next_hash_offset,
                Table::Field => self.read_field(p)?.next_hash_offset,
            };
            p = self.next_hash_offset(p, next, &mut depth)?;
        }

        if chain.last().copied().unwrap_or(0) != item.tail_hash_offset {
            return Err(JournalError::malformed(format!(
                "bucket {bucket} tail {} is not the end of its chain",
                item.tail_hash_offset
            )));
        }
        Ok(chain)
    }

    /// Walks one DATA bucket's chain from head to tail.
    ///
    /// # Errors
    ///
    /// Returns a malformed error if the chain loops or does not end at the
    /// bucket's recorded tail.
    pub fn data_hash_chain(&self, bucket: u64) -> JournalResult<Vec<u64>> {
        self.hash_chain(Table::Data, bucket)
    }

    /// Walks one FIELD bucket's chain from head to tail.
    ///
    /// # Errors
    ///
    /// Returns a malformed error if the chain loops or does not end at the
    /// bucket's recorded tail.
    pub fn field_hash_chain(&self, bucket: u64) -> JournalResult<Vec<u64>> {
        self.hash_chain(Table::Field, bucket)
    }

    /// Returns the DATA objects carrying field `name`, newest first.
    ///
    /// # Errors
    ///
    /// Returns a malformed error if the field chain does not point
    /// strictly backwards.
    pub fn field_data_objects(&self, name: &[u8]) -> JournalResult<Vec<u64>> {
        let Some((_, field)) = self.find_field_object(name)? else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        let mut p = field.head_data_offset;
        while p > 0 {
            out.push(p);
            let next = self.read_data(p)?.next_field_offset;
            if next != 0 && next >= p {
                return Err(JournalError::malformed(format!(
                    "field chain of data object at {p} points forward to {next}"
                )));
            }
            p = next;
        }
        Ok(out)
    }

    /// Returns the uncompressed payload of the DATA object at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if no valid DATA object lives there.
    pub fn data_payload(&self, offset: u64) -> JournalResult<Vec<u8>> {
        let obj = self.read_data(offset)?;
        self.data_payload_of(&obj)
    }

    /// Returns the payloads of an entry in item order.
    ///
    /// # Errors
    ///
    /// Returns an error if an item does not point at a valid DATA object.
    pub fn entry_payloads(&self, entry: &EntryObject) -> JournalResult<Vec<Vec<u8>>> {
        entry
            .items
            .iter()
            .map(|item| self.data_payload(item.object_offset))
            .collect()
    }
}
