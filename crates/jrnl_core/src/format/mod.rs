//! On-disk format of a journal file.
//!
//! ## Layout
//!
//! ```text
//! | header (264) | object | object | ... | object |
//! ```
//!
//! Every object starts with a 16-byte object header and is followed by
//! padding up to the next 8-byte boundary:
//!
//! ```text
//! | type (1) | flags (1) | reserved (6) | size (8) | body (size - 16) |
//! ```
//!
//! All integers are little-endian. All offsets are absolute, 8-byte
//! aligned, and zero means "none".
//!
//! ## Compatibility
//!
//! The header carries two flag words. Every *incompatible* flag must be
//! understood by anyone touching the file. *Compatible* flags may be
//! ignored by readers but writers refuse files carrying flags they do not
//! know, since they could not maintain the structures those flags imply.

mod header;
mod object;

pub use header::{FileState, Header, HEADER_SIZE, HEADER_SIZE_MIN, HEADER_SIGNATURE};
pub use object::{
    data, entry, entry_array, field, hash_table, tag, DataObject, EntryArrayObject, EntryItem,
    EntryObject, FieldObject, HashItem, ObjectHeader, ObjectType, TagObject, OBJECT_HEADER_SIZE,
};

pub(crate) use header::STATE as HEADER_STATE_OFFSET;
pub(crate) use object::{check_entry_array_size, check_hash_table_size};

/// Compatible flag: the file carries TAG objects.
pub const COMPATIBLE_SEALED: u32 = 1 << 0;

/// All compatible flags this implementation maintains.
pub const COMPATIBLE_SUPPORTED: u32 = COMPATIBLE_SEALED;

/// Incompatible flag: DATA payloads may be LZ4 compressed.
pub const INCOMPATIBLE_COMPRESSED_LZ4: u32 = 1 << 1;

/// Incompatible flag: hash tables use SipHash keyed by the file id.
pub const INCOMPATIBLE_KEYED_HASH: u32 = 1 << 2;

/// All incompatible flags this implementation understands.
pub const INCOMPATIBLE_SUPPORTED: u32 = INCOMPATIBLE_COMPRESSED_LZ4 | INCOMPATIBLE_KEYED_HASH;

/// Object flag: the DATA payload is LZ4 compressed.
pub const OBJECT_COMPRESSED_LZ4: u8 = 1 << 1;

/// Rounds `n` up to the next multiple of 8.
///
/// Returns `None` on overflow.
#[must_use]
pub const fn align8(n: u64) -> Option<u64> {
    match n.checked_add(7) {
        Some(v) => Some(v & !7),
        None => None,
    }
}

/// Returns `true` if `offset` is usable as a link (zero or 8-aligned).
#[must_use]
pub const fn valid_offset(offset: u64) -> bool {
    offset & 7 == 0
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(word)
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(word)
}

pub(crate) fn write_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(align8(0), Some(0));
        assert_eq!(align8(1), Some(8));
        assert_eq!(align8(8), Some(8));
        assert_eq!(align8(65), Some(72));
        assert_eq!(align8(u64::MAX), None);
    }

    #[test]
    fn offsets() {
        assert!(valid_offset(0));
        assert!(valid_offset(264));
        assert!(!valid_offset(265));
    }

    #[test]
    fn flags_are_disjoint() {
        assert_eq!(INCOMPATIBLE_COMPRESSED_LZ4 & INCOMPATIBLE_KEYED_HASH, 0);
        assert_eq!(INCOMPATIBLE_SUPPORTED, 0b110);
    }
}
