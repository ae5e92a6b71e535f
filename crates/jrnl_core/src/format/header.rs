//! The file header.

use super::{read_u32, read_u64, write_u32, write_u64};
use crate::error::{JournalError, JournalResult};
use crate::types::Id128;

/// Magic bytes at offset 0.
pub const HEADER_SIGNATURE: [u8; 8] = *b"JRNLOBJS";

/// Header size written by this revision.
pub const HEADER_SIZE: u64 = 264;

/// Smallest header accepted on open. Files written by earlier revisions
/// stop after `tail_monotonic`.
pub const HEADER_SIZE_MIN: u64 = 208;

const SIGNATURE: usize = 0;
const COMPATIBLE_FLAGS: usize = 8;
const INCOMPATIBLE_FLAGS: usize = 12;
/// Offset of the state byte, which the offline worker rewrites on its own.
pub(crate) const STATE: usize = 16;
const FILE_ID: usize = 24;
const MACHINE_ID: usize = 40;
const TAIL_ENTRY_BOOT_ID: usize = 56;
const SEQNUM_ID: usize = 72;
const HEADER_SIZE_FIELD: usize = 88;
const ARENA_SIZE: usize = 96;
const DATA_HASH_TABLE_OFFSET: usize = 104;
const DATA_HASH_TABLE_SIZE: usize = 112;
const FIELD_HASH_TABLE_OFFSET: usize = 120;
const FIELD_HASH_TABLE_SIZE: usize = 128;
const TAIL_OBJECT_OFFSET: usize = 136;
const N_OBJECTS: usize = 144;
const N_ENTRIES: usize = 152;
const TAIL_ENTRY_SEQNUM: usize = 160;
const HEAD_ENTRY_SEQNUM: usize = 168;
const ENTRY_ARRAY_OFFSET: usize = 176;
const HEAD_ENTRY_REALTIME: usize = 184;
const TAIL_ENTRY_REALTIME: usize = 192;
const TAIL_ENTRY_MONOTONIC: usize = 200;
const N_DATA: usize = 208;
const N_FIELDS: usize = 216;
const N_TAGS: usize = 224;
const N_ENTRY_ARRAYS: usize = 232;
const DATA_HASH_CHAIN_DEPTH: usize = 240;
const FIELD_HASH_CHAIN_DEPTH: usize = 248;
const TAIL_ENTRY_OFFSET: usize = 256;

/// Lifecycle state recorded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileState {
    /// Fully synced and not being written.
    Offline = 0,
    /// A writer holds the file open; content past the last sync may be
    /// partially written.
    Online = 1,
    /// Rotated away; never written again.
    Archived = 2,
}

impl FileState {
    /// Converts a byte to a state.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Offline),
            1 => Some(Self::Online),
            2 => Some(Self::Archived),
            _ => None,
        }
    }

    /// Converts the state to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// The decoded file header.
///
/// Hash table offsets point at the first bucket, sixteen bytes past the
/// start of the table object.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Header {
    pub signature: [u8; 8],
    pub compatible_flags: u32,
    pub incompatible_flags: u32,
    pub state: u8,
    pub file_id: Id128,
    pub machine_id: Id128,
    pub tail_entry_boot_id: Id128,
    pub seqnum_id: Id128,
    pub header_size: u64,
    pub arena_size: u64,
    pub data_hash_table_offset: u64,
    pub data_hash_table_size: u64,
    pub field_hash_table_offset: u64,
    pub field_hash_table_size: u64,
    pub tail_object_offset: u64,
    pub n_objects: u64,
    pub n_entries: u64,
    pub tail_entry_seqnum: u64,
    pub head_entry_seqnum: u64,
    pub entry_array_offset: u64,
    pub head_entry_realtime: u64,
    pub tail_entry_realtime: u64,
    pub tail_entry_monotonic: u64,
    pub n_data: u64,
    pub n_fields: u64,
    pub n_tags: u64,
    pub n_entry_arrays: u64,
    pub data_hash_chain_depth: u64,
    pub field_hash_chain_depth: u64,
    pub tail_entry_offset: u64,
}

impl Header {
    /// Creates the header of an empty file.
    #[must_use]
    pub fn new(
        file_id: Id128,
        seqnum_id: Id128,
        compatible_flags: u32,
        incompatible_flags: u32,
    ) -> Self {
        Self {
            signature: HEADER_SIGNATURE,
            compatible_flags,
            incompatible_flags,
            state: FileState::Offline.as_byte(),
            file_id,
            machine_id: Id128::NULL,
            tail_entry_boot_id: Id128::NULL,
            seqnum_id,
            header_size: HEADER_SIZE,
            arena_size: 0,
            data_hash_table_offset: 0,
            data_hash_table_size: 0,
            field_hash_table_offset: 0,
            field_hash_table_size: 0,
            tail_object_offset: 0,
            n_objects: 0,
            n_entries: 0,
            tail_entry_seqnum: 0,
            head_entry_seqnum: 0,
            entry_array_offset: 0,
            head_entry_realtime: 0,
            tail_entry_realtime: 0,
            tail_entry_monotonic: 0,
            n_data: 0,
            n_fields: 0,
            n_tags: 0,
            n_entry_arrays: 0,
            data_hash_chain_depth: 0,
            field_hash_chain_depth: 0,
            tail_entry_offset: 0,
        }
    }

    /// Returns `true` if the header records `field_end` bytes or more,
    /// i.e. the field ending there was written by the file's creator.
    #[must_use]
    pub const fn contains(&self, field_end: u64) -> bool {
        self.header_size >= field_end
    }

    /// Returns `true` if the header predates the current revision.
    #[must_use]
    pub const fn is_short(&self) -> bool {
        self.header_size < HEADER_SIZE
    }

    /// Returns `true` if the counters added after the minimal header are
    /// present.
    #[must_use]
    pub const fn has_counters(&self) -> bool {
        self.contains(N_ENTRY_ARRAYS as u64 + 8)
    }

    /// Returns `true` if the chain depth fields are present.
    #[must_use]
    pub const fn has_chain_depths(&self) -> bool {
        self.contains(FIELD_HASH_CHAIN_DEPTH as u64 + 8)
    }

    /// Returns `true` if the tail entry offset field is present.
    #[must_use]
    pub const fn has_tail_entry_offset(&self) -> bool {
        self.contains(TAIL_ENTRY_OFFSET as u64 + 8)
    }

    /// Returns the decoded state, if it is one this revision knows.
    #[must_use]
    pub fn file_state(&self) -> Option<FileState> {
        FileState::from_byte(self.state)
    }

    /// Encodes the header into its full current-revision form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE as usize];

        buf[SIGNATURE..SIGNATURE + 8].copy_from_slice(&self.signature);
        write_u32(&mut buf, COMPATIBLE_FLAGS, self.compatible_flags);
        write_u32(&mut buf, INCOMPATIBLE_FLAGS, self.incompatible_flags);
        buf[STATE] = self.state;
        buf[FILE_ID..FILE_ID + 16].copy_from_slice(self.file_id.as_bytes());
        buf[MACHINE_ID..MACHINE_ID + 16].copy_from_slice(self.machine_id.as_bytes());
        buf[TAIL_ENTRY_BOOT_ID..TAIL_ENTRY_BOOT_ID + 16]
            .copy_from_slice(self.tail_entry_boot_id.as_bytes());
        buf[SEQNUM_ID..SEQNUM_ID + 16].copy_from_slice(self.seqnum_id.as_bytes());

        for (at, value) in [
            (HEADER_SIZE_FIELD, self.header_size),
            (ARENA_SIZE, self.arena_size),
            (DATA_HASH_TABLE_OFFSET, self.data_hash_table_offset),
            (DATA_HASH_TABLE_SIZE, self.data_hash_table_size),
            (FIELD_HASH_TABLE_OFFSET, self.field_hash_table_offset),
            (FIELD_HASH_TABLE_SIZE, self.field_hash_table_size),
            (TAIL_OBJECT_OFFSET, self.tail_object_offset),
            (N_OBJECTS, self.n_objects),
            (N_ENTRIES, self.n_entries),
            (TAIL_ENTRY_SEQNUM, self.tail_entry_seqnum),
            (HEAD_ENTRY_SEQNUM, self.head_entry_seqnum),
            (ENTRY_ARRAY_OFFSET, self.entry_array_offset),
            (HEAD_ENTRY_REALTIME, self.head_entry_realtime),
            (TAIL_ENTRY_REALTIME, self.tail_entry_realtime),
            (TAIL_ENTRY_MONOTONIC, self.tail_entry_monotonic),
            (N_DATA, self.n_data),
            (N_FIELDS, self.n_fields),
            (N_TAGS, self.n_tags),
            (N_ENTRY_ARRAYS, self.n_entry_arrays),
            (DATA_HASH_CHAIN_DEPTH, self.data_hash_chain_depth),
            (FIELD_HASH_CHAIN_DEPTH, self.field_hash_chain_depth),
            (TAIL_ENTRY_OFFSET, self.tail_entry_offset),
        ] {
            write_u64(&mut buf, at, value);
        }

        buf
    }

    /// Decodes a header from the first bytes of a file.
    ///
    /// `bytes` may be shorter than [`HEADER_SIZE`]; fields past the
    /// recorded header size decode as zero.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than [`HEADER_SIZE_MIN`] bytes are given
    /// or the recorded header size is below the minimum.
    pub fn decode(bytes: &[u8]) -> JournalResult<Self> {
        if (bytes.len() as u64) < HEADER_SIZE_MIN {
            return Err(JournalError::truncated(format!(
                "file holds {} header bytes, need at least {HEADER_SIZE_MIN}",
                bytes.len()
            )));
        }

        let header_size = read_u64(bytes, HEADER_SIZE_FIELD);
        if header_size < HEADER_SIZE_MIN {
            return Err(JournalError::malformed(format!(
                "header size {header_size} below minimum {HEADER_SIZE_MIN}"
            )));
        }

        let mut buf = vec![0u8; HEADER_SIZE as usize];
        let used = bytes.len().min(HEADER_SIZE as usize).min(header_size as usize);
        buf[..used].copy_from_slice(&bytes[..used]);

        let id = |at: usize| {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&buf[at..at + 16]);
            Id128::from_bytes(raw)
        };
        let mut signature = [0u8; 8];
        signature.copy_from_slice(&buf[SIGNATURE..SIGNATURE + 8]);

        Ok(Self {
            signature,
            compatible_flags: read_u32(&buf, COMPATIBLE_FLAGS),
            incompatible_flags: read_u32(&buf, INCOMPATIBLE_FLAGS),
            state: buf[STATE],
            file_id: id(FILE_ID),
            machine_id: id(MACHINE_ID),
            tail_entry_boot_id: id(TAIL_ENTRY_BOOT_ID),
            seqnum_id: id(SEQNUM_ID),
            header_size,
            arena_size: read_u64(&buf, ARENA_SIZE),
            data_hash_table_offset: read_u64(&buf, DATA_HASH_TABLE_OFFSET),
            data_hash_table_size: read_u64(&buf, DATA_HASH_TABLE_SIZE),
            field_hash_table_offset: read_u64(&buf, FIELD_HASH_TABLE_OFFSET),
            field_hash_table_size: read_u64(&buf, FIELD_HASH_TABLE_SIZE),
            tail_object_offset: read_u64(&buf, TAIL_OBJECT_OFFSET),
            n_objects: read_u64(&buf, N_OBJECTS),
            n_entries: read_u64(&buf, N_ENTRIES),
            tail_entry_seqnum: read_u64(&buf, TAIL_ENTRY_SEQNUM),
            head_entry_seqnum: read_u64(&buf, HEAD_ENTRY_SEQNUM),
            entry_array_offset: read_u64(&buf, ENTRY_ARRAY_OFFSET),
            head_entry_realtime: read_u64(&buf, HEAD_ENTRY_REALTIME),
            tail_entry_realtime: read_u64(&buf, TAIL_ENTRY_REALTIME),
            tail_entry_monotonic: read_u64(&buf, TAIL_ENTRY_MONOTONIC),
            n_data: read_u64(&buf, N_DATA),
            n_fields: read_u64(&buf, N_FIELDS),
            n_tags: read_u64(&buf, N_TAGS),
            n_entry_arrays: read_u64(&buf, N_ENTRY_ARRAYS),
            data_hash_chain_depth: read_u64(&buf, DATA_HASH_CHAIN_DEPTH),
            field_hash_chain_depth: read_u64(&buf, FIELD_HASH_CHAIN_DEPTH),
            tail_entry_offset: read_u64(&buf, TAIL_ENTRY_OFFSET),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        let mut h = Header::new(Id128::random(), Id128::random(), 0, 0b110);
        h.machine_id = Id128::random();
        h.arena_size = 4096;
        h.n_entries = 3;
        h.tail_entry_seqnum = 9;
        h.tail_entry_offset = 1024;
        h
    }

    #[test]
    fn encode_decode() {
        let h = sample();
        let bytes = h.encode();
        assert_eq!(bytes.len(), HEADER_SIZE as usize);
        assert_eq!(&bytes[..8], b"JRNLOBJS");
        assert_eq!(Header::decode(&bytes).unwrap(), h);
    }

    #[test]
    fn short_header_zero_fills() {
        let mut h = sample();
        h.header_size = HEADER_SIZE_MIN;
        let bytes = h.encode();

        let decoded = Header::decode(&bytes[..HEADER_SIZE_MIN as usize]).unwrap();
        assert!(decoded.is_short());
        assert!(!decoded.has_counters());
        assert_eq!(decoded.tail_entry_offset, 0);
        assert_eq!(decoded.n_entries, 3);

        // Bytes past the recorded size are ignored even when present.
        let decoded = Header::decode(&bytes).unwrap();
        assert_eq!(decoded.tail_entry_offset, 0);
    }

    #[test]
    fn rejects_tiny_header() {
        let mut h = sample();
        h.header_size = 100;
        assert!(Header::decode(&h.encode()).unwrap_err().is_malformed());
        assert!(Header::decode(&[0u8; 64]).unwrap_err().is_malformed());
    }

    #[test]
    fn state_bytes() {
        assert_eq!(FileState::from_byte(2), Some(FileState::Archived));
        assert_eq!(FileState::from_byte(9), None);
        assert_eq!(FileState::Online.as_byte(), 1);
    }
}
