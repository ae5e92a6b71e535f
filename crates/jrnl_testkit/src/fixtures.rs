//! Test fixtures and journal helpers.
//!
//! Provides convenience functions for setting up journal files
//! and common test scenarios.

use jrnl_core::{DualTimestamp, Id128, JournalConfig, JournalFile, JournalMetrics};
use jrnl_storage::InMemoryBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Machine id written into every fixture file.
pub const TEST_MACHINE_ID: Id128 = Id128::from_bytes([0x4d; 16]);

/// Boot id used by fixture entries unless a scenario picks its own.
pub const TEST_BOOT_ID: Id128 = Id128::from_bytes([0xb0; 16]);

/// Returns a writer configuration with deterministic ids and no
/// coalescing of change notifications.
#[must_use]
pub fn test_config() -> JournalConfig {
    JournalConfig::writer()
        .machine_id(TEST_MACHINE_ID)
        .post_change_interval(None)
        .metrics(JournalMetrics::new().max_size(64 << 20).keep_free(0))
}

/// Timestamp for the `n`th fixture entry: one millisecond apart.
#[must_use]
pub fn test_timestamp(n: u64) -> DualTimestamp {
    DualTimestamp::new(1_000_000 + n * 1_000, 1_000 + n * 1_000)
}

/// A test journal with automatic cleanup.
pub struct TestJournal {
    /// The journal file, open for writing.
    pub file: JournalFile,
    backend: Option<Arc<InMemoryBackend>>,
    path: Option<PathBuf>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestJournal {
    /// Creates a new in-memory test journal.
    pub fn memory() -> Self {
        Self::memory_with(&test_config())
    }

    /// Creates an in-memory test journal with a custom configuration.
    pub fn memory_with(config: &JournalConfig) -> Self {
        let backend = Arc::new(InMemoryBackend::new());
        let file = JournalFile::open_backend(backend.clone(), None, config, None, None)
            .expect("Failed to open in-memory journal");
        Self {
            file,
            backend: Some(backend),
            path: None,
            _temp_dir: None,
        }
    }

    /// Creates a new file-based test journal named `system.journal`.
    pub fn file() -> Self {
        Self::file_with(&test_config())
    }

    /// Creates a file-based test journal with a custom configuration.
    pub fn file_with(config: &JournalConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("system.journal");
        let file = JournalFile::open(&path, config).expect("Failed to open journal file");
        Self {
            file,
            backend: None,
            path: Some(path),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the in-memory backend, if the journal has one.
    pub fn backend(&self) -> Option<&Arc<InMemoryBackend>> {
        self.backend.as_ref()
    }

    /// Returns the journal path if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the temporary directory holding a file-based journal.
    pub fn dir(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(TempDir::path)
    }

    /// Appends `items` stamped as the `n`th fixture entry.
    pub fn append_nth<I: AsRef<[u8]>>(&mut self, n: u64, items: &[I]) -> u64 {
        self.file
            .append_entry(Some(test_timestamp(n)), Some(TEST_BOOT_ID), items, None)
            .expect("Failed to append entry")
            .offset
    }

    /// Opens a second, read-only view of the same journal.
    pub fn reader(&self) -> JournalFile {
        let config = JournalConfig::new();
        match (&self.backend, &self.path) {
            (Some(backend), _) => {
                JournalFile::open_backend(backend.clone(), None, &config, None, None)
                    .expect("Failed to open in-memory reader")
            }
            (None, Some(path)) => {
                JournalFile::open(path, &config).expect("Failed to open journal reader")
            }
            (None, None) => unreachable!("test journal has neither backend nor path"),
        }
    }
}

impl std::ops::Deref for TestJournal {
    type Target = JournalFile;

    fn deref(&self) -> &Self::Target {
        &self.file
    }
}

impl std::ops::DerefMut for TestJournal {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.file
    }
}

/// Runs a test with a temporary in-memory journal.
///
/// # Example
///
/// ```rust,ignore
/// use jrnl_testkit::with_temp_journal;
///
/// #[test]
/// fn my_test() {
///     with_temp_journal(|file| {
///         file.append_entry(None, None, &["MESSAGE=hi"], None).unwrap();
///     });
/// }
/// ```
pub fn with_temp_journal<F, R>(f: F) -> R
where
    F: FnOnce(&mut JournalFile) -> R,
{
    let mut journal = TestJournal::memory();
    f(&mut journal.file)
}

/// Runs a test with a temporary file-based journal.
pub fn with_file_journal<F, R>(f: F) -> R
where
    F: FnOnce(&mut JournalFile, &Path) -> R,
{
    let mut journal = TestJournal::file();
    let path = journal
        .path()
        .expect("File journal should have a path")
        .to_path_buf();
    f(&mut journal.file, &path)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a journal with `entry_count` entries. Every entry carries a
    /// unique `MESSAGE` and one of three `PRIORITY` values.
    pub fn populated_journal(entry_count: u64) -> TestJournal {
        let mut journal = TestJournal::memory();
        for n in 1..=entry_count {
            let message = format!("MESSAGE=entry {n}");
            let priority = format!("PRIORITY={}", n % 3);
            journal.append_nth(n, &[message, priority]);
        }
        journal
    }

    /// Creates a journal spanning several boots. Returns the boot ids in
    /// append order.
    pub fn multi_boot_journal(boots: u8, per_boot: u64) -> (TestJournal, Vec<Id128>) {
        let mut journal = TestJournal::memory();
        let mut ids = Vec::with_capacity(usize::from(boots));
        let mut realtime = 1_000_000;

        for b in 0..boots {
            let boot_id = Id128::from_bytes([b + 1; 16]);
            ids.push(boot_id);
            for m in 1..=per_boot {
                realtime += 1_000;
                journal
                    .file
                    .append_entry(
                        Some(DualTimestamp::new(realtime, m * 1_000)),
                        Some(boot_id),
                        &[format!("MESSAGE=boot {b} entry {m}")],
                        None,
                    )
                    .expect("Failed to append entry");
            }
        }

        (journal, ids)
    }
}
