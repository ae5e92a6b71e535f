//! Benchmark utilities.

use jrnl_core::{DualTimestamp, Id128, JournalConfig, JournalFile, JournalMetrics};
use jrnl_storage::InMemoryBackend;
use rand::Rng;
use std::sync::Arc;

/// Boot id stamped on every benchmark entry.
pub const BENCH_BOOT_ID: Id128 = Id128::from_bytes([0xbe; 16]);

/// Generate random bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate a `MESSAGE=` payload whose value is `size` random
/// alphanumeric characters.
pub fn random_message(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut payload = b"MESSAGE=".to_vec();
    payload.extend((0..size).map(|_| rng.sample(rand::distributions::Alphanumeric)));
    payload
}

/// Timestamp of the `n`th benchmark entry.
pub fn timestamp(n: u64) -> DualTimestamp {
    DualTimestamp::new(1_000_000 + n, 1 + n)
}

/// Writer configuration for benchmarks: no notification coalescing and
/// room for large files.
pub fn bench_config(compress: bool) -> JournalConfig {
    JournalConfig::writer()
        .compress(compress)
        .post_change_interval(None)
        .metrics(JournalMetrics::new().max_size(1 << 30).keep_free(0))
}

/// Opens a fresh in-memory writer.
pub fn memory_journal(compress: bool) -> JournalFile {
    let backend = Arc::new(InMemoryBackend::new());
    JournalFile::open_backend(backend, None, &bench_config(compress), None, None)
        .expect("Failed to open in-memory journal")
}

/// Opens an in-memory writer holding `count` entries. Every entry has a
/// unique message and one of `units` shared unit names.
pub fn populated_journal(count: u64, units: u64) -> JournalFile {
    let mut file = memory_journal(true);
    for n in 1..=count {
        let items = [
            format!("MESSAGE=entry {n}"),
            format!("UNIT=unit-{}.service", n % units.max(1)),
        ];
        file.append_entry(Some(timestamp(n)), Some(BENCH_BOOT_ID), &items, None)
            .expect("Failed to append entry");
    }
    file
}

/// Replaces `file` with a fresh in-memory writer once it has grown past
/// `limit` bytes, so long benchmark runs stay within memory.
pub fn recycle(file: &mut JournalFile, compress: bool, limit: u64) {
    let header = file.header();
    if header.header_size + header.arena_size > limit {
        *file = memory_journal(compress);
    }
}
