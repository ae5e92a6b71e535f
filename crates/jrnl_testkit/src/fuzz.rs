//! Fuzz testing harnesses for journal files.
//!
//! This module provides fuzz targets that can be used with cargo-fuzz
//! or other fuzzing frameworks. Every target must return normally for
//! any input; errors are fine, panics and hangs are not.

use crate::fixtures::{test_config, test_timestamp, TEST_BOOT_ID};
use jrnl_core::format::{
    DataObject, EntryArrayObject, EntryObject, FieldObject, Header, ObjectHeader, TagObject,
    HEADER_SIGNATURE,
};
use jrnl_core::{Direction, JournalConfig, JournalFile};
use jrnl_storage::InMemoryBackend;
use std::sync::Arc;

/// Upper bound on entries walked per direction, so corrupt chains cannot
/// stall a fuzz run.
const WALK_LIMIT: usize = 10_000;

/// Fuzz target for header decoding.
pub fn fuzz_header_decode(data: &[u8]) {
    let _ = Header::decode(data);
}

/// Fuzz target for object decoding.
///
/// Tries every object decoder on the same bytes.
pub fn fuzz_object_decode(data: &[u8]) {
    let _ = ObjectHeader::decode(data, 0);
    let _ = DataObject::decode(data, 0);
    let _ = FieldObject::decode(data, 0);
    let _ = EntryObject::decode(data, 0);
    let _ = EntryArrayObject::decode(data, 0);
    let _ = TagObject::decode(data, 0);
}

/// Walks every entry of `file` both ways and looks at their payloads.
fn exercise_reader(file: &JournalFile) {
    for direction in [Direction::Down, Direction::Up] {
        let mut p = 0;
        for _ in 0..WALK_LIMIT {
            match file.next_entry(p, direction) {
                Ok(Some((offset, entry))) => {
                    let _ = file.entry_payloads(&entry);
                    p = offset;
                }
                _ => break,
            }
        }
    }

    for needle in [0, 1, 2, u64::MAX / 2, u64::MAX] {
        let _ = file.move_to_entry_by_seqnum(needle, Direction::Down);
        let _ = file.move_to_entry_by_realtime(needle, Direction::Up);
    }
    let _ = file.cutoff_monotonic(&TEST_BOOT_ID);

    for bucket in 0..file.data_bucket_count().min(64) {
        let _ = file.data_hash_chain(bucket);
    }
}

/// Fuzz target for opening arbitrary bytes as a journal file.
pub fn fuzz_open_file(data: &[u8]) {
    let backend = Arc::new(InMemoryBackend::with_data(data.to_vec()));
    if let Ok(file) = JournalFile::open_backend(backend, None, &JournalConfig::new(), None, None) {
        exercise_reader(&file);
    }
}

/// Builds a small valid journal image.
pub fn sample_journal_image(entries: u64) -> Vec<u8> {
    let backend = Arc::new(InMemoryBackend::new());
    let Ok(mut file) = JournalFile::open_backend(backend.clone(), None, &test_config(), None, None)
    else {
        return Vec::new();
    };
    for n in 1..=entries {
        let items = [
            format!("MESSAGE=sample {n}"),
            format!("PRIORITY={}", n % 4),
        ];
        if file
            .append_entry(Some(test_timestamp(n)), Some(TEST_BOOT_ID), &items, None)
            .is_err()
        {
            break;
        }
    }
    let _ = file.close();
    backend.data()
}

/// Fuzz target for damaged journal files.
///
/// Interprets `data` as `(offset: u16 le, value: u8)` triples and writes
/// each value into a valid journal image before opening it.
pub fn fuzz_corrupted_file(data: &[u8]) {
    let mut image = sample_journal_image(32);
    if image.is_empty() {
        return;
    }
    for chunk in data.chunks_exact(3) {
        let offset = usize::from(u16::from_le_bytes([chunk[0], chunk[1]])) % image.len();
        image[offset] = chunk[2];
    }
    fuzz_open_file(&image);
}

/// Structured fuzzing input for journal operations.
#[derive(Debug, Clone)]
pub enum FuzzOp {
    /// Append an entry.
    Append {
        /// Raw items; each is made into a payload with a field name.
        items: Vec<Vec<u8>>,
    },
    /// Look up an entry by sequence number.
    Seek {
        /// Sequence number to look for.
        seqnum: u64,
        /// Whether to search upwards.
        up: bool,
    },
    /// Take the file offline in the background.
    Offline,
    /// Walk every entry.
    Walk,
}

impl FuzzOp {
    /// Parse operations from fuzzer input.
    pub fn parse_sequence(data: &[u8]) -> Vec<FuzzOp> {
        let mut ops = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            let op_type = data[offset];
            offset += 1;

            let op = match op_type % 4 {
                0 => {
                    let Some(&count) = data.get(offset) else {
                        break;
                    };
                    offset += 1;

                    let mut items = Vec::new();
                    for _ in 0..(count % 8) {
                        let Some(&len) = data.get(offset) else {
                            break;
                        };
                        offset += 1;
                        let end = (offset + usize::from(len % 64)).min(data.len());
                        items.push(data[offset..end].to_vec());
                        offset = end;
                    }
                    FuzzOp::Append { items }
                }
                1 => {
                    if offset + 9 > data.len() {
                        break;
                    }
                    let mut seqnum = [0u8; 8];
                    seqnum.copy_from_slice(&data[offset..offset + 8]);
                    let up = data[offset + 8] & 1 == 1;
                    offset += 9;
                    FuzzOp::Seek {
                        seqnum: u64::from_le_bytes(seqnum),
                        up,
                    }
                }
                2 => FuzzOp::Offline,
                3 => FuzzOp::Walk,
                _ => break,
            };

            ops.push(op);
        }

        ops
    }

    /// Execute operations on a journal open for writing.
    pub fn execute_sequence(ops: &[FuzzOp], file: &mut JournalFile) {
        let mut n = file.n_entries();
        for op in ops {
            match op {
                FuzzOp::Append { items } => {
                    n += 1;
                    let payloads: Vec<Vec<u8>> = items
                        .iter()
                        .enumerate()
                        .map(|(i, value)| {
                            let mut payload = format!("F{i}=").into_bytes();
                            payload.extend_from_slice(value);
                            payload
                        })
                        .collect();
                    let _ = file.append_entry(
                        Some(test_timestamp(n)),
                        Some(TEST_BOOT_ID),
                        &payloads,
                        None,
                    );
                }
                FuzzOp::Seek { seqnum, up } => {
                    let direction = if *up { Direction::Up } else { Direction::Down };
                    let _ = file.move_to_entry_by_seqnum(*seqnum, direction);
                }
                FuzzOp::Offline => {
                    let _ = file.set_offline(false);
                }
                FuzzOp::Walk => exercise_reader(file),
            }
        }
    }
}

/// Fuzz target for operation sequences on a writer.
pub fn fuzz_journal_operations(data: &[u8]) {
    let backend = Arc::new(InMemoryBackend::new());
    let Ok(mut file) = JournalFile::open_backend(backend, None, &test_config(), None, None) else {
        return;
    };
    let ops = FuzzOp::parse_sequence(data);
    FuzzOp::execute_sequence(&ops, &mut file);
    let _ = file.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::{DefaultHasher, Hash, Hasher};

    /// Generate pseudo-random data for fuzzing based on a seed.
    fn generate_random_data(seed: u64, len: usize) -> Vec<u8> {
        let mut hasher = DefaultHasher::new();
        let mut result = Vec::with_capacity(len);
        let mut state = seed;

        for _ in 0..len {
            state.hash(&mut hasher);
            state = hasher.finish();
            hasher = DefaultHasher::new();
            result.push((state & 0xFF) as u8);
        }

        result
    }

    #[test]
    fn test_fuzz_header_decode_empty() {
        fuzz_header_decode(&[]);
    }

    #[test]
    fn test_fuzz_open_file_garbage() {
        fuzz_open_file(&[0xff; 300]);
        fuzz_open_file(&HEADER_SIGNATURE);
    }

    #[test]
    fn test_sample_image_opens() {
        let image = sample_journal_image(8);
        let backend = Arc::new(InMemoryBackend::with_data(image));
        let file =
            JournalFile::open_backend(backend, None, &JournalConfig::new(), None, None).unwrap();
        assert_eq!(file.n_entries(), 8);
    }

    #[test]
    fn test_parse_fuzz_ops() {
        let data = [
            0, 2, 3, b'a', b'b', b'c', 0, // append "abc" and an empty item
            1, 2, 0, 0, 0, 0, 0, 0, 0, 1, // seek to 2 upwards
            2, 3,
        ];
        let ops = FuzzOp::parse_sequence(&data);
        assert_eq!(ops.len(), 4);
        assert!(matches!(&ops[0], FuzzOp::Append { items } if items.len() == 2));
        assert!(matches!(ops[1], FuzzOp::Seek { seqnum: 2, up: true }));
        assert!(matches!(ops[2], FuzzOp::Offline));
        assert!(matches!(ops[3], FuzzOp::Walk));
    }

    #[test]
    fn fuzz_object_decode_random_iterations() {
        for seed in 0..200 {
            fuzz_object_decode(&generate_random_data(seed, (seed as usize * 7) % 256));
        }
    }

    #[test]
    fn fuzz_open_file_random_iterations() {
        for seed in 0..100 {
            let mut data = generate_random_data(seed, 512);
            data[..8].copy_from_slice(&HEADER_SIGNATURE);
            fuzz_open_file(&data);
        }
    }

    #[test]
    fn fuzz_corrupted_file_random_iterations() {
        for seed in 0..50 {
            fuzz_corrupted_file(&generate_random_data(seed, 30));
        }
    }

    #[test]
    fn fuzz_journal_operations_random_iterations() {
        for seed in 0..50 {
            fuzz_journal_operations(&generate_random_data(seed, 200));
        }
    }
}
