//! Object encodings.
//!
//! Each object type has a value type with `encode` and `decode`. Decoding
//! validates the object against the structural rules of its type, so a
//! decoded value can be trusted to have aligned links and plausible
//! timestamps. Links are plain integers; following them goes back through
//! the arena.
//!
//! The submodules hold field offsets relative to the start of an object,
//! used when a single link field is rewritten in place.

use super::{read_u64, valid_offset, write_u64, OBJECT_COMPRESSED_LZ4};
use crate::error::{JournalError, JournalResult};
use crate::seal::TAG_LENGTH;
use crate::types::{valid_monotonic, valid_realtime, Id128, TIMESTAMP_LIMIT};
use std::fmt;

/// Size of the common object header.
pub const OBJECT_HEADER_SIZE: u64 = 16;

/// DATA field offsets.
pub mod data {
    #![allow(missing_docs)]
    pub const HASH: u64 = 16;
    pub const NEXT_HASH_OFFSET: u64 = 24;
    pub const NEXT_FIELD_OFFSET: u64 = 32;
    pub const ENTRY_OFFSET: u64 = 40;
    pub const ENTRY_ARRAY_OFFSET: u64 = 48;
    pub const N_ENTRIES: u64 = 56;
    pub const PAYLOAD: u64 = 64;
}

/// FIELD field offsets.
pub mod field {
    #![allow(missing_docs)]
    pub const HASH: u64 = 16;
    pub const NEXT_HASH_OFFSET: u64 = 24;
    pub const HEAD_DATA_OFFSET: u64 = 32;
    pub const PAYLOAD: u64 = 40;
}

/// ENTRY field offsets.
pub mod entry {
    #![allow(missing_docs)]
    pub const SEQNUM: u64 = 16;
    pub const REALTIME: u64 = 24;
    pub const MONOTONIC: u64 = 32;
    pub const BOOT_ID: u64 = 40;
    pub const XOR_HASH: u64 = 56;
    pub const ITEMS: u64 = 64;
    pub const ITEM_SIZE: u64 = 16;
}

/// ENTRY_ARRAY field offsets.
pub mod entry_array {
    #![allow(missing_docs)]
    pub const NEXT_ENTRY_ARRAY_OFFSET: u64 = 16;
    pub const ITEMS: u64 = 24;
    pub const ITEM_SIZE: u64 = 8;
}

/// Hash table layout.
pub mod hash_table {
    #![allow(missing_docs)]
    pub const ITEMS: u64 = 16;
    pub const ITEM_SIZE: u64 = 16;
}

/// TAG field offsets.
pub mod tag {
    #![allow(missing_docs)]
    pub const SEQNUM: u64 = 16;
    pub const EPOCH: u64 = 24;
    pub const TAG: u64 = 32;
    pub const SIZE: u64 = 64;
}

/// Type of an arena object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectType {
    /// Never written by this implementation; matches any type on lookup.
    Unused = 0,
    /// A field=value payload.
    Data = 1,
    /// A field name.
    Field = 2,
    /// A log record.
    Entry = 3,
    /// The DATA hash table.
    DataHashTable = 4,
    /// The FIELD hash table.
    FieldHashTable = 5,
    /// One link of an entry array chain.
    EntryArray = 6,
    /// A sealing tag.
    Tag = 7,
}

impl ObjectType {
    /// Converts a byte to an object type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Unused),
            1 => Some(Self::Data),
            2 => Some(Self::Field),
            3 => Some(Self::Entry),
            4 => Some(Self::DataHashTable),
            5 => Some(Self::FieldHashTable),
            6 => Some(Self::EntryArray),
            7 => Some(Self::Tag),
            _ => None,
        }
    }

    /// Converts the object type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Smallest `size` an object of this type may record.
    #[must_use]
    pub const fn min_size(self) -> u64 {
        match self {
            Self::Unused => OBJECT_HEADER_SIZE,
            Self::Data => data::PAYLOAD,
            Self::Field => field::PAYLOAD,
            Self::Entry => entry::ITEMS,
            Self::DataHashTable | Self::FieldHashTable => hash_table::ITEMS,
            Self::EntryArray => entry_array::ITEMS,
            Self::Tag => tag::SIZE,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unused => "unused",
            Self::Data => "data",
            Self::Field => "field",
            Self::Entry => "entry",
            Self::DataHashTable => "data hash table",
            Self::FieldHashTable => "field hash table",
            Self::EntryArray => "entry array",
            Self::Tag => "tag",
        })
    }
}

/// The common header every object starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Object type.
    pub object_type: ObjectType,
    /// Per-object flags.
    pub flags: u8,
    /// Size including this header, excluding trailing alignment padding.
    pub size: u64,
}

impl ObjectHeader {
    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; OBJECT_HEADER_SIZE as usize] {
        let mut buf = [0u8; OBJECT_HEADER_SIZE as usize];
        buf[0] = self.object_type.as_byte();
        buf[1] = self.flags;
        write_u64(&mut buf, 8, self.size);
        buf
    }

    /// Decodes and checks the header found at `offset`.
    ///
    /// # Errors
    ///
    /// Returns a malformed error for an unknown type, a size below the
    /// type's minimum or flags the type does not allow.
    pub fn decode(bytes: &[u8], offset: u64) -> JournalResult<Self> {
        if bytes.len() < OBJECT_HEADER_SIZE as usize {
            return Err(JournalError::truncated(format!(
                "object header at {offset} cut short"
            )));
        }

        let object_type = ObjectType::from_byte(bytes[0]).ok_or_else(|| {
            JournalError::malformed(format!("unknown object type {} at {offset}", bytes[0]))
        })?;
        let flags = bytes[1];
        let size = read_u64(bytes, 8);

        if object_type == ObjectType::Unused {
            return Err(JournalError::malformed(format!(
                "unused object at {offset}"
            )));
        }
        if size < object_type.min_size() {
            return Err(JournalError::malformed(format!(
                "{object_type} object at {offset} has size {size}, below {}",
                object_type.min_size()
            )));
        }
        if flags & !OBJECT_COMPRESSED_LZ4 != 0
            || (flags != 0 && object_type != ObjectType::Data)
        {
            return Err(JournalError::malformed(format!(
                "{object_type} object at {offset} has invalid flags {flags:#x}"
            )));
        }

        Ok(Self {
            object_type,
            flags,
            size,
        })
    }
}

fn check_link(name: &str, value: u64, offset: u64) -> JournalResult<()> {
    if valid_offset(value) {
        Ok(())
    } else {
        Err(JournalError::malformed(format!(
            "object at {offset} has misaligned {name} {value}"
        )))
    }
}

/// A field=value payload shared by every entry carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataObject {
    /// Object flags (compression).
    pub flags: u8,
    /// Hash of the uncompressed payload.
    pub hash: u64,
    /// Next DATA object in the same hash bucket.
    pub next_hash_offset: u64,
    /// Next DATA object with the same field name.
    pub next_field_offset: u64,
    /// First entry referencing this payload.
    pub entry_offset: u64,
    /// Entry array chain holding the remaining references.
    pub entry_array_offset: u64,
    /// Number of entries referencing this payload.
    pub n_entries: u64,
    /// Payload as stored, possibly compressed.
    pub payload: Vec<u8>,
}

impl DataObject {
    /// Creates an unlinked DATA object.
    #[must_use]
    pub fn new(hash: u64, payload: Vec<u8>, flags: u8) -> Self {
        Self {
            flags,
            hash,
            next_hash_offset: 0,
            next_field_offset: 0,
            entry_offset: 0,
            entry_array_offset: 0,
            n_entries: 0,
            payload,
        }
    }

    /// Returns `true` if the payload is compressed.
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.flags & OBJECT_COMPRESSED_LZ4 != 0
    }

    /// Size of the encoded object.
    #[must_use]
    pub fn size(&self) -> u64 {
        data::PAYLOAD + self.payload.len() as u64
    }

    /// Encodes the object including its header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size() as usize];
        let header = ObjectHeader {
            object_type: ObjectType::Data,
            flags: self.flags,
            size: self.size(),
        };
        buf[..OBJECT_HEADER_SIZE as usize].copy_from_slice(&header.encode());
        write_u64(&mut buf, data::HASH as usize, self.hash);
        write_u64(&mut buf, data::NEXT_HASH_OFFSET as usize, self.next_hash_offset);
        write_u64(&mut buf, data::NEXT_FIELD_OFFSET as usize, self.next_field_offset);
        write_u64(&mut buf, data::ENTRY_OFFSET as usize, self.entry_offset);
        write_u64(&mut buf, data::ENTRY_ARRAY_OFFSET as usize, self.entry_array_offset);
        write_u64(&mut buf, data::N_ENTRIES as usize, self.n_entries);
        buf[data::PAYLOAD as usize..].copy_from_slice(&self.payload);
        buf
    }

    /// Decodes a DATA object from its full encoding.
    ///
    /// # Errors
    ///
    /// Returns a malformed error if the object violates DATA invariants.
    pub fn decode(bytes: &[u8], offset: u64) -> JournalResult<Self> {
        let header = ObjectHeader::decode(bytes, offset)?;
        if header.object_type != ObjectType::Data || bytes.len() as u64 != header.size {
            return Err(JournalError::malformed(format!(
                "expected data object at {offset}"
            )));
        }
        if header.size == data::PAYLOAD {
            return Err(JournalError::malformed(format!(
                "data object at {offset} has empty payload"
            )));
        }

        let obj = Self {
            flags: header.flags,
            hash: read_u64(bytes, data::HASH as usize),
            next_hash_offset: read_u64(bytes, data::NEXT_HASH_OFFSET as usize),
            next_field_offset: read_u64(bytes, data::NEXT_FIELD_OFFSET as usize),
            entry_offset: read_u64(bytes, data::ENTRY_OFFSET as usize),
            entry_array_offset: read_u64(bytes, data::ENTRY_ARRAY_OFFSET as usize),
            n_entries: read_u64(bytes, data::N_ENTRIES as usize),
            payload: bytes[data::PAYLOAD as usize..].to_vec(),
        };

        if (obj.entry_offset == 0) != (obj.n_entries == 0) {
            return Err(JournalError::malformed(format!(
                "data object at {offset} has {} entries but entry offset {}",
                obj.n_entries, obj.entry_offset
            )));
        }
        check_link("next hash offset", obj.next_hash_offset, offset)?;
        check_link("next field offset", obj.next_field_offset, offset)?;
        check_link("entry offset", obj.entry_offset, offset)?;
        check_link("entry array offset", obj.entry_array_offset, offset)?;

        Ok(obj)
    }
}

/// A field name, heading the chain of DATA objects with that name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldObject {
    /// Hash of the name.
    pub hash: u64,
    /// Next FIELD object in the same hash bucket.
    pub next_hash_offset: u64,
    /// Most recently added DATA object with this field name.
    pub head_data_offset: u64,
    /// The field name.
    pub payload: Vec<u8>,
}

impl FieldObject {
    /// Creates an unlinked FIELD object.
    #[must_use]
    pub fn new(hash: u64, payload: Vec<u8>) -> Self {
        Self {
            hash,
            next_hash_offset: 0,
            head_data_offset: 0,
            payload,
        }
    }

    /// Size of the encoded object.
    #[must_use]
    pub fn size(&self) -> u64 {
        field::PAYLOAD + self.payload.len() as u64
    }

    /// Encodes the object including its header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size() as usize];
        let header = ObjectHeader {
            object_type: ObjectType::Field,
            flags: 0,
            size: self.size(),
        };
        buf[..OBJECT_HEADER_SIZE as usize].copy_from_slice(&header.encode());
        write_u64(&mut buf, field::HASH as usize, self.hash);
        write_u64(&mut buf, field::NEXT_HASH_OFFSET as usize, self.next_hash_offset);
        write_u64(&mut buf, field::HEAD_DATA_OFFSET as usize, self.head_data_offset);
        buf[field::PAYLOAD as usize..].copy_from_slice(&self.payload);
        buf
    }

    /// Decodes a FIELD object from its full encoding.
    ///
    /// # Errors
    ///
    /// Returns a malformed error if the object violates FIELD invariants.
    pub fn decode(bytes: &[u8], offset: u64) -> JournalResult<Self> {
        let header = ObjectHeader::decode(bytes, offset)?;
        if header.object_type != ObjectType::Field || bytes.len() as u64 != header.size {
            return Err(JournalError::malformed(format!(
                "expected field object at {offset}"
            )));
        }
        if header.size == field::PAYLOAD {
            return Err(JournalError::malformed(format!(
                "field object at {offset} has empty name"
            )));
        }

        let obj = Self {
            hash: read_u64(bytes, field::HASH as usize),
            next_hash_offset: read_u64(bytes, field::NEXT_HASH_OFFSET as usize),
            head_data_offset: read_u64(bytes, field::HEAD_DATA_OFFSET as usize),
            payload: bytes[field::PAYLOAD as usize..].to_vec(),
        };
        check_link("next hash offset", obj.next_hash_offset, offset)?;
        check_link("head data offset", obj.head_data_offset, offset)?;

        Ok(obj)
    }
}

/// One field=value reference of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryItem {
    /// Offset of the DATA object.
    pub object_offset: u64,
    /// The DATA object's hash, copied for cheap comparisons.
    pub hash: u64,
}

/// A log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryObject {
    /// Sequence number, unique within the file's sequence domain.
    pub seqnum: u64,
    /// Wall-clock time in microseconds.
    pub realtime: u64,
    /// Monotonic time in microseconds, relative to `boot_id`.
    pub monotonic: u64,
    /// Boot the monotonic time belongs to.
    pub boot_id: Id128,
    /// XOR of the unkeyed hashes of all payloads.
    pub xor_hash: u64,
    /// Referenced payloads, sorted by offset without duplicates.
    pub items: Vec<EntryItem>,
}

impl EntryObject {
    /// Size of the encoded object.
    #[must_use]
    pub fn size(&self) -> u64 {
        entry::ITEMS + self.items.len() as u64 * entry::ITEM_SIZE
    }

    /// Encodes the object including its header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size() as usize];
        let header = ObjectHeader {
            object_type: ObjectType::Entry,
            flags: 0,
            size: self.size(),
        };
        buf[..OBJECT_HEADER_SIZE as usize].copy_from_slice(&header.encode());
        write_u64(&mut buf, entry::SEQNUM as usize, self.seqnum);
        write_u64(&mut buf, entry::REALTIME as usize, self.realtime);
        write_u64(&mut buf, entry::MONOTONIC as usize, self.monotonic);
        let boot = entry::BOOT_ID as usize;
        buf[boot..boot + 16].copy_from_slice(self.boot_id.as_bytes());
        write_u64(&mut buf, entry::XOR_HASH as usize, self.xor_hash);

        for (i, item) in self.items.iter().enumerate() {
            let at = (entry::ITEMS + i as u64 * entry::ITEM_SIZE) as usize;
            write_u64(&mut buf, at, item.object_offset);
            write_u64(&mut buf, at + 8, item.hash);
        }
        buf
    }

    /// Decodes an ENTRY object from its full encoding.
    ///
    /// # Errors
    ///
    /// Returns a malformed error if the object violates ENTRY invariants.
    pub fn decode(bytes: &[u8], offset: u64) -> JournalResult<Self> {
        let header = ObjectHeader::decode(bytes, offset)?;
        if header.object_type != ObjectType::Entry || bytes.len() as u64 != header.size {
            return Err(JournalError::malformed(format!(
                "expected entry object at {offset}"
            )));
        }

        let items_len = header.size - entry::ITEMS;
        if items_len == 0 || items_len % entry::ITEM_SIZE != 0 {
            return Err(JournalError::malformed(format!(
                "entry object at {offset} has {items_len} bytes of items"
            )));
        }

        let mut boot = [0u8; 16];
        let at = entry::BOOT_ID as usize;
        boot.copy_from_slice(&bytes[at..at + 16]);

        let items = bytes[entry::ITEMS as usize..]
            .chunks_exact(entry::ITEM_SIZE as usize)
            .map(|chunk| EntryItem {
                object_offset: read_u64(chunk, 0),
                hash: read_u64(chunk, 8),
            })
            .collect::<Vec<_>>();

        let obj = Self {
            seqnum: read_u64(bytes, entry::SEQNUM as usize),
            realtime: read_u64(bytes, entry::REALTIME as usize),
            monotonic: read_u64(bytes, entry::MONOTONIC as usize),
            boot_id: Id128::from_bytes(boot),
            xor_hash: read_u64(bytes, entry::XOR_HASH as usize),
            items,
        };

        if obj.seqnum == 0 {
            return Err(JournalError::malformed(format!(
                "entry object at {offset} has sequence number 0"
            )));
        }
        if !valid_realtime(obj.realtime) || !valid_monotonic(obj.monotonic) {
            return Err(JournalError::malformed(format!(
                "entry object at {offset} has invalid timestamps {}/{}",
                obj.realtime, obj.monotonic
            )));
        }
        if obj.boot_id.is_null() {
            return Err(JournalError::malformed(format!(
                "entry object at {offset} has no boot id"
            )));
        }
        for item in &obj.items {
            if item.object_offset == 0 || !valid_offset(item.object_offset) {
                return Err(JournalError::malformed(format!(
                    "entry object at {offset} has invalid item offset {}",
                    item.object_offset
                )));
            }
        }
        if obj
            .items
            .windows(2)
            .any(|w| w[0].object_offset >= w[1].object_offset)
        {
            return Err(JournalError::malformed(format!(
                "entry object at {offset} has unsorted or repeated items"
            )));
        }

        Ok(obj)
    }
}

/// One link of an entry array chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryArrayObject {
    /// Next link, or zero.
    pub next_entry_array_offset: u64,
    /// Entry offsets; unused slots are zero.
    pub items: Vec<u64>,
}

impl EntryArrayObject {
    /// Number of items a link of `size` bytes holds.
    #[must_use]
    pub const fn capacity_for_size(size: u64) -> u64 {
        size.saturating_sub(entry_array::ITEMS) / entry_array::ITEM_SIZE
    }

    /// Size of a link holding `capacity` items.
    #[must_use]
    pub const fn size_for_capacity(capacity: u64) -> u64 {
        entry_array::ITEMS + capacity * entry_array::ITEM_SIZE
    }

    /// Creates an empty link.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            next_entry_array_offset: 0,
            items: vec![0; capacity as usize],
        }
    }

    /// Encodes the object including its header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let size = Self::size_for_capacity(self.items.len() as u64);
        let mut buf = vec![0u8; size as usize];
        let header = ObjectHeader {
            object_type: ObjectType::EntryArray,
            flags: 0,
            size,
        };
        buf[..OBJECT_HEADER_SIZE as usize].copy_from_slice(&header.encode());
        write_u64(
            &mut buf,
            entry_array::NEXT_ENTRY_ARRAY_OFFSET as usize,
            self.next_entry_array_offset,
        );
        for (i, item) in self.items.iter().enumerate() {
            write_u64(
                &mut buf,
                (entry_array::ITEMS + i as u64 * entry_array::ITEM_SIZE) as usize,
                *item,
            );
        }
        buf
    }

    /// Decodes an ENTRY_ARRAY object from its full encoding.
    ///
    /// # Errors
    ///
    /// Returns a malformed error if the object violates ENTRY_ARRAY
    /// invariants.
    pub fn decode(bytes: &[u8], offset: u64) -> JournalResult<Self> {
        let header = ObjectHeader::decode(bytes, offset)?;
        if header.object_type != ObjectType::EntryArray || bytes.len() as u64 != header.size {
            return Err(JournalError::malformed(format!(
                "expected entry array object at {offset}"
            )));
        }
        check_entry_array_size(header.size, offset)?;

        let next_entry_array_offset =
            read_u64(bytes, entry_array::NEXT_ENTRY_ARRAY_OFFSET as usize);
        check_link("next entry array offset", next_entry_array_offset, offset)?;

        let items = bytes[entry_array::ITEMS as usize..]
            .chunks_exact(entry_array::ITEM_SIZE as usize)
            .map(|chunk| read_u64(chunk, 0))
            .collect();

        Ok(Self {
            next_entry_array_offset,
            items,
        })
    }
}

pub(crate) fn check_entry_array_size(size: u64, offset: u64) -> JournalResult<()> {
    let items_len = size - entry_array::ITEMS;
    if items_len == 0 || items_len % entry_array::ITEM_SIZE != 0 {
        return Err(JournalError::malformed(format!(
            "entry array at {offset} has {items_len} bytes of items"
        )));
    }
    Ok(())
}

pub(crate) fn check_hash_table_size(size: u64, offset: u64) -> JournalResult<()> {
    let items_len = size - hash_table::ITEMS;
    if items_len == 0 || items_len % hash_table::ITEM_SIZE != 0 {
        return Err(JournalError::malformed(format!(
            "hash table at {offset} has {items_len} bytes of buckets"
        )));
    }
    Ok(())
}

/// A hash table bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashItem {
    /// First object in the bucket's chain.
    pub head_hash_offset: u64,
    /// Last object in the bucket's chain.
    pub tail_hash_offset: u64,
}

impl HashItem {
    /// Encodes the bucket.
    #[must_use]
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        write_u64(&mut buf, 0, self.head_hash_offset);
        write_u64(&mut buf, 8, self.tail_hash_offset);
        buf
    }

    /// Decodes a bucket.
    ///
    /// # Errors
    ///
    /// Returns a malformed error if either link is misaligned.
    pub fn decode(bytes: &[u8], offset: u64) -> JournalResult<Self> {
        let item = Self {
            head_hash_offset: read_u64(bytes, 0),
            tail_hash_offset: read_u64(bytes, 8),
        };
        check_link("bucket head", item.head_hash_offset, offset)?;
        check_link("bucket tail", item.tail_hash_offset, offset)?;
        Ok(item)
    }
}

/// A sealing tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagObject {
    /// Sequence number of the tag.
    pub seqnum: u64,
    /// Sealing epoch the tag closes.
    pub epoch: u64,
    /// Authentication digest.
    pub tag: [u8; TAG_LENGTH],
}

impl TagObject {
    /// Encodes the object including its header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; tag::SIZE as usize];
        let header = ObjectHeader {
            object_type: ObjectType::Tag,
            flags: 0,
            size: tag::SIZE,
        };
        buf[..OBJECT_HEADER_SIZE as usize].copy_from_slice(&header.encode());
        write_u64(&mut buf, tag::SEQNUM as usize, self.seqnum);
        write_u64(&mut buf, tag::EPOCH as usize, self.epoch);
        buf[tag::TAG as usize..].copy_from_slice(&self.tag);
        buf
    }

    /// Decodes a TAG object from its full encoding.
    ///
    /// # Errors
    ///
    /// Returns a malformed error if the object violates TAG invariants.
    pub fn decode(bytes: &[u8], offset: u64) -> JournalResult<Self> {
        let header = ObjectHeader::decode(bytes, offset)?;
        if header.object_type != ObjectType::Tag
            || header.size != tag::SIZE
            || bytes.len() as u64 != header.size
        {
            return Err(JournalError::malformed(format!(
                "expected tag object at {offset}"
            )));
        }
        let epoch = read_u64(bytes, tag::EPOCH as usize);
        if epoch >= TIMESTAMP_LIMIT {
            return Err(JournalError::malformed(format!(
                "tag object at {offset} has invalid epoch {epoch}"
            )));
        }
        let mut digest = [0u8; TAG_LENGTH];
        digest.copy_from_slice(&bytes[tag::TAG as usize..]);

        Ok(Self {
            seqnum: read_u64(bytes, tag::SEQNUM as usize),
            epoch,
            tag: digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_header_rejects_bad_type_and_size() {
        let mut raw = ObjectHeader {
            object_type: ObjectType::Entry,
            flags: 0,
            size: 32,
        }
        .encode();
        assert!(ObjectHeader::decode(&raw, 264).unwrap_err().is_malformed());

        raw[0] = 42;
        assert!(ObjectHeader::decode(&raw, 264).is_err());
    }

    #[test]
    fn object_header_flags_only_on_data() {
        let raw = ObjectHeader {
            object_type: ObjectType::Field,
            flags: OBJECT_COMPRESSED_LZ4,
            size: 48,
        }
        .encode();
        assert!(ObjectHeader::decode(&raw, 264).is_err());

        let raw = ObjectHeader {
            object_type: ObjectType::Data,
            flags: OBJECT_COMPRESSED_LZ4,
            size: 72,
        }
        .encode();
        assert!(ObjectHeader::decode(&raw, 264).is_ok());
    }

    #[test]
    fn data_object_encoding() {
        let mut obj = DataObject::new(0xfeed, b"MESSAGE=hi".to_vec(), 0);
        obj.entry_offset = 512;
        obj.n_entries = 1;
        let bytes = obj.encode();

        assert_eq!(bytes.len() as u64, obj.size());
        assert_eq!(bytes[0], ObjectType::Data.as_byte());
        assert_eq!(DataObject::decode(&bytes, 264).unwrap(), obj);
    }

    #[test]
    fn data_object_entry_count_must_match_link() {
        let mut obj = DataObject::new(1, b"A=b".to_vec(), 0);
        obj.n_entries = 2;
        assert!(DataObject::decode(&obj.encode(), 264).is_err());

        obj.n_entries = 0;
        obj.entry_offset = 512;
        assert!(DataObject::decode(&obj.encode(), 264).is_err());
    }

    #[test]
    fn data_object_rejects_misaligned_links() {
        let mut obj = DataObject::new(1, b"A=b".to_vec(), 0);
        obj.next_hash_offset = 13;
        assert!(DataObject::decode(&obj.encode(), 264).is_err());
    }

    #[test]
    fn entry_object_encoding() {
        let obj = EntryObject {
            seqnum: 7,
            realtime: 1_700_000_000_000_000,
            monotonic: 12,
            boot_id: Id128::from_bytes([3; 16]),
            xor_hash: 99,
            items: vec![
                EntryItem {
                    object_offset: 264,
                    hash: 1,
                },
                EntryItem {
                    object_offset: 400,
                    hash: 2,
                },
            ],
        };
        let bytes = obj.encode();
        assert_eq!(bytes.len(), 64 + 32);
        assert_eq!(EntryObject::decode(&bytes, 1024).unwrap(), obj);
    }

    #[test]
    fn entry_object_validation() {
        let good = EntryObject {
            seqnum: 1,
            realtime: 1,
            monotonic: 0,
            boot_id: Id128::from_bytes([1; 16]),
            xor_hash: 0,
            items: vec![EntryItem {
                object_offset: 264,
                hash: 0,
            }],
        };
        assert!(EntryObject::decode(&good.encode(), 512).is_ok());

        let mut bad = good.clone();
        bad.seqnum = 0;
        assert!(EntryObject::decode(&bad.encode(), 512).is_err());

        let mut bad = good.clone();
        bad.realtime = 0;
        assert!(EntryObject::decode(&bad.encode(), 512).is_err());

        let mut bad = good.clone();
        bad.boot_id = Id128::NULL;
        assert!(EntryObject::decode(&bad.encode(), 512).is_err());

        let mut bad = good.clone();
        bad.items.clear();
        assert!(EntryObject::decode(&bad.encode(), 512).is_err());

        let mut bad = good;
        bad.items[0].object_offset = 0;
        assert!(EntryObject::decode(&bad.encode(), 512).is_err());
    }

    #[test]
    fn entry_items_must_be_sorted_and_unique() {
        let item = |object_offset| EntryItem {
            object_offset,
            hash: object_offset,
        };
        let mut obj = EntryObject {
            seqnum: 3,
            realtime: 1,
            monotonic: 0,
            boot_id: Id128::from_bytes([1; 16]),
            xor_hash: 0,
            items: vec![item(264), item(400), item(512)],
        };
        assert!(EntryObject::decode(&obj.encode(), 1024).is_ok());

        obj.items.swap(0, 1);
        let err = EntryObject::decode(&obj.encode(), 1024).unwrap_err();
        assert!(err.is_malformed());

        obj.items = vec![item(264), item(264)];
        assert!(EntryObject::decode(&obj.encode(), 1024)
            .unwrap_err()
            .is_malformed());
    }

    #[test]
    fn entry_array_capacity() {
        assert_eq!(EntryArrayObject::size_for_capacity(4), 56);
        assert_eq!(EntryArrayObject::capacity_for_size(56), 4);

        let mut link = EntryArrayObject::with_capacity(4);
        link.items[0] = 264;
        link.next_entry_array_offset = 4096;
        let bytes = link.encode();
        assert_eq!(EntryArrayObject::decode(&bytes, 512).unwrap(), link);
    }

    #[test]
    fn tag_object_encoding() {
        let obj = TagObject {
            seqnum: 1,
            epoch: 5,
            tag: [9; TAG_LENGTH],
        };
        let bytes = obj.encode();
        assert_eq!(bytes.len(), 64);
        assert_eq!(TagObject::decode(&bytes, 264).unwrap(), obj);
    }
}
