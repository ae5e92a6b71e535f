//! Stress tests for journal files.
//!
//! These tests verify behavior under heavy load, concurrent readers and
//! repeated rotation.

use crate::fixtures::{test_config, test_timestamp, TEST_BOOT_ID};
use jrnl_core::{
    Direction, JournalConfig, JournalError, JournalFile, JournalMetrics, JournalResult,
};
use jrnl_storage::InMemoryBackend;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent reader threads.
    pub threads: usize,
    /// Size of each `MESSAGE` value in bytes.
    pub payload_size: usize,
    /// Number of distinct values cycled through a shared field.
    pub distinct_values: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            payload_size: 256,
            distinct_values: 100,
        }
    }
}

fn stress_items(i: usize, config: &StressConfig) -> [String; 3] {
    let fill = "x".repeat(config.payload_size.saturating_sub(8));
    [
        format!("MESSAGE={i:08}{fill}"),
        format!("UNIT=unit-{}.service", i % config.distinct_values.max(1)),
        format!("PRIORITY={}", i % 8),
    ]
}

fn append_stress(file: &mut JournalFile, i: usize, config: &StressConfig) -> JournalResult<()> {
    file.append_entry(
        Some(test_timestamp(i as u64 + 1)),
        Some(TEST_BOOT_ID),
        &stress_items(i, config),
        None,
    )
    .map(|_| ())
}

/// Run a sequential append stress test.
pub fn stress_sequential_appends(file: &mut JournalFile, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        match append_stress(file, i, config) {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a sequence-number lookup stress test against a populated file.
pub fn stress_seqnum_lookups(file: &JournalFile, config: &StressConfig) -> StressTestResult {
    let n = file.n_entries().max(1);
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let needle = (i as u64 * 7919) % n + 1;
        let direction = if i % 2 == 0 {
            Direction::Down
        } else {
            Direction::Up
        };
        match file.move_to_entry_by_seqnum(needle, direction) {
            Ok(Some((_, entry))) if entry.seqnum == needle => successful += 1,
            _ => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run concurrent readers, each with its own view of `backend`, walking
/// the entries of one payload while nothing writes.
pub fn stress_concurrent_readers(
    backend: Arc<InMemoryBackend>,
    config: &StressConfig,
) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let ops_per_thread = config.operations / config.threads.max(1);
    let distinct = config.distinct_values.max(1);

    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let backend = Arc::clone(&backend);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);

            thread::spawn(move || {
                let reader = match JournalFile::open_backend(
                    backend,
                    None,
                    &JournalConfig::new(),
                    None,
                    None,
                ) {
                    Ok(reader) => reader,
                    Err(_) => {
                        failed.fetch_add(ops_per_thread, Ordering::Relaxed);
                        return;
                    }
                };

                for i in 0..ops_per_thread {
                    let unit = format!("UNIT=unit-{}.service", (t + i) % distinct);
                    let found = reader
                        .find_data_object(unit.as_bytes())
                        .and_then(|found| match found {
                            Some((offset, _)) => {
                                reader.next_entry_for_data(offset, 0, Direction::Up)
                            }
                            None => Ok(None),
                        });
                    match found {
                        Ok(Some(_)) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Run an append stress test that rotates `dir/system.journal` whenever
/// the file fills up or asks to be rotated. Returns the result and the
/// number of rotations.
pub fn stress_rotation(
    dir: &Path,
    max_size: u64,
    config: &StressConfig,
) -> JournalResult<(StressTestResult, usize)> {
    let journal_config = test_config()
        .compress(false)
        .metrics(JournalMetrics::new().max_size(max_size).keep_free(0));
    let mut file = JournalFile::open(dir.join("system.journal"), &journal_config)?;
    let mut rotations = 0;

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        if file.rotate_suggested(None).is_some() {
            file = file.rotate(None)?;
            rotations += 1;
        }
        match append_stress(&mut file, i, config) {
            Ok(()) => successful += 1,
            Err(JournalError::QuotaExceeded { .. }) => {
                file = file.rotate(None)?;
                rotations += 1;
                match append_stress(&mut file, i, config) {
                    Ok(()) => successful += 1,
                    Err(_) => failed += 1,
                }
            }
            Err(_) => failed += 1,
        }
    }
    file.close()?;

    Ok((
        StressTestResult::new(successful, failed, start.elapsed()),
        rotations,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestJournal;

    #[test]
    fn test_sequential_appends() {
        let mut journal = TestJournal::memory();
        let config = StressConfig {
            operations: 1_000,
            payload_size: 64,
            ..Default::default()
        };

        let result = stress_sequential_appends(&mut journal, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 1_000);
        assert_eq!(journal.n_entries(), 1_000);
    }

    #[test]
    fn test_seqnum_lookups() {
        let mut journal = TestJournal::memory();
        let config = StressConfig {
            operations: 2_000,
            payload_size: 32,
            ..Default::default()
        };
        stress_sequential_appends(&mut journal, &config);

        let result = stress_seqnum_lookups(&journal, &config);
        assert_eq!(result.failed_ops, 0);
    }

    #[test]
    fn test_concurrent_readers() {
        let mut journal = TestJournal::memory();
        let config = StressConfig {
            operations: 1_000,
            threads: 4,
            payload_size: 32,
            distinct_values: 20,
        };
        stress_sequential_appends(&mut journal, &config);
        let backend = journal.backend().unwrap().clone();

        let result = stress_concurrent_readers(backend, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 1_000);
    }

    #[test]
    fn test_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let config = StressConfig {
            operations: 3_000,
            payload_size: 512,
            ..Default::default()
        };

        let (result, rotations) = stress_rotation(dir.path(), 1 << 20, &config).unwrap();
        assert_eq!(result.failed_ops, 0);
        assert!(rotations > 0);

        let archived = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains('@'))
            .count();
        assert_eq!(archived, rotations);
    }
}
