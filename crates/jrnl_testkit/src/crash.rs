//! Crash recovery testing for journal files.
//!
//! This module simulates writers dying at various points and verifies
//! that readers still see every completed append and that writers
//! recover by disposing of the damaged file.
//!
//! ## Test Strategy
//!
//! 1. **Abandoned writer** - The process dies with the file online
//! 2. **Crash mid-append** - Writes stop landing partway through an entry
//! 3. **Crash before offline** - Entries are complete but the state flip is lost
//! 4. **Reliable reopen** - A writer replaces an unclean file with a fresh one
//!
//! ## Usage
//!
//! ```rust,ignore
//! use jrnl_testkit::crash::CrashRecoveryHarness;
//!
//! let mut harness = CrashRecoveryHarness::with_temp_dir()?;
//! assert!(harness.run_all().iter().all(|r| r.passed));
//! ```

use crate::fixtures::{test_config, test_timestamp, TEST_BOOT_ID};
use jrnl_core::{Direction, JournalConfig, JournalError, JournalFile, JournalResult};
use jrnl_storage::{FsSpace, InMemoryBackend, StorageBackend, StorageError, StorageResult};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Entries expected to be readable after recovery.
    pub expected_entries: u64,
    /// Entries actually readable after recovery.
    pub actual_entries: u64,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, entries: u64) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected_entries: entries,
            actual_entries: entries,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: u64, actual: u64, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected_entries: expected,
            actual_entries: actual,
            error: Some(error.to_string()),
        }
    }

    fn compare(description: &str, expected: u64, actual: u64) -> Self {
        if expected == actual {
            Self::pass(description, expected)
        } else {
            Self::fail(description, expected, actual, "entry count mismatch")
        }
    }
}

/// A storage backend wrapper that can simulate crashes.
///
/// Once crashed, every write is refused whole; nothing written before the
/// crash is lost.
pub struct CrashableBackend {
    inner: Arc<dyn StorageBackend>,
    crash_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    crashed: AtomicBool,
    fail_on_sync: AtomicBool,
}

impl CrashableBackend {
    /// Creates a new crashable backend wrapping an inner backend.
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            crash_after_bytes: AtomicUsize::new(usize::MAX),
            bytes_written: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
            fail_on_sync: AtomicBool::new(false),
        }
    }

    /// Sets the backend to crash once `bytes` more bytes have been written.
    pub fn crash_after(&self, bytes: usize) {
        let written = self.bytes_written.load(Ordering::SeqCst);
        self.crash_after_bytes
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Crashes the backend now.
    pub fn crash_now(&self) {
        self.crashed.store(true, Ordering::SeqCst);
    }

    /// Sets whether sync should fail.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Resets the crash state.
    pub fn reset(&self) {
        self.crash_after_bytes.store(usize::MAX, Ordering::SeqCst);
        self.bytes_written.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.fail_on_sync.store(false, Ordering::SeqCst);
    }

    /// Returns whether the backend has crashed.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Returns the number of bytes written through this wrapper.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written.load(Ordering::SeqCst)
    }

    fn crash_error(what: &str) -> StorageError {
        StorageError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("simulated crash during {what}"),
        ))
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if self.has_crashed() {
            return Err(Self::crash_error("write"));
        }
        let current = self.bytes_written.fetch_add(data.len(), Ordering::SeqCst);
        let threshold = self.crash_after_bytes.load(Ordering::SeqCst);

        if current.saturating_add(data.len()) > threshold {
            self.crashed.store(true, Ordering::SeqCst);
            return Err(Self::crash_error("write"));
        }
        self.inner.write_at(offset, data)
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn allocate(&self, offset: u64, len: u64) -> StorageResult<()> {
        if self.has_crashed() {
            return Err(Self::crash_error("allocation"));
        }
        self.inner.allocate(offset, len)
    }

    fn sync(&self) -> StorageResult<()> {
        if self.has_crashed() || self.fail_on_sync.load(Ordering::SeqCst) {
            return Err(Self::crash_error("sync"));
        }
        self.inner.sync()
    }

    fn touch(&self) -> StorageResult<()> {
        self.inner.touch()
    }

    fn bus_fault_seen(&self) -> bool {
        self.inner.bus_fault_seen()
    }

    fn space(&self) -> StorageResult<Option<FsSpace>> {
        self.inner.space()
    }

    fn is_unlinked(&self) -> StorageResult<bool> {
        self.inner.is_unlinked()
    }
}

/// Counts the entries a fresh reader can walk on `backend`.
pub fn readable_entries(backend: Arc<dyn StorageBackend>) -> JournalResult<u64> {
    let reader = JournalFile::open_backend(backend, None, &JournalConfig::new(), None, None)?;
    let mut count = 0;
    let mut p = 0;
    while let Some((offset, _)) = reader.next_entry(p, Direction::Down)? {
        count += 1;
        p = offset;
    }
    Ok(count)
}

fn append_fixture(file: &mut JournalFile, n: u64) -> JournalResult<()> {
    let items = [
        format!("MESSAGE=crash test {n}"),
        format!("PRIORITY={}", n % 8),
    ];
    file.append_entry(Some(test_timestamp(n)), Some(TEST_BOOT_ID), &items, None)
        .map(|_| ())
}

/// Test harness for crash recovery scenarios.
pub struct CrashRecoveryHarness {
    /// Directory holding file-based scenarios.
    pub dir: PathBuf,
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
    _temp_dir: Option<TempDir>,
}

impl CrashRecoveryHarness {
    /// Creates a new crash recovery harness working in `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            results: Vec::new(),
            _temp_dir: None,
        }
    }

    /// Creates a new harness with a temporary directory.
    pub fn with_temp_dir() -> io::Result<Self> {
        let temp_dir = TempDir::new()?;
        let mut harness = Self::new(temp_dir.path());
        harness._temp_dir = Some(temp_dir);
        Ok(harness)
    }

    fn record(&mut self, result: CrashRecoveryResult) -> CrashRecoveryResult {
        self.results.push(result.clone());
        result
    }

    /// Tests that a writer dying with the file online leaves every entry
    /// readable and blocks a plain writer reopen.
    pub fn test_abandoned_writer(&mut self) -> CrashRecoveryResult {
        const DESCRIPTION: &str = "Abandoned writer leaves entries readable";
        let result = (|| -> JournalResult<CrashRecoveryResult> {
            let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
            let mut file =
                JournalFile::open_backend(backend.clone(), None, &test_config(), None, None)?;
            for n in 1..=25 {
                append_fixture(&mut file, n)?;
            }
            std::mem::forget(file);

            match JournalFile::open_backend(backend.clone(), None, &test_config(), None, None) {
                Err(JournalError::Unclean) => {}
                Err(e) => return Ok(CrashRecoveryResult::fail(DESCRIPTION, 25, 0, &e.to_string())),
                Ok(_) => {
                    return Ok(CrashRecoveryResult::fail(
                        DESCRIPTION,
                        25,
                        0,
                        "writer reopened an online file",
                    ))
                }
            }

            Ok(CrashRecoveryResult::compare(
                DESCRIPTION,
                25,
                readable_entries(backend)?,
            ))
        })();

        let result = result
            .unwrap_or_else(|e| CrashRecoveryResult::fail(DESCRIPTION, 25, 0, &e.to_string()));
        self.record(result)
    }

    /// Tests that an append cut off partway leaves exactly the completed
    /// appends visible.
    pub fn test_crash_mid_append(&mut self, crash_after: usize) -> CrashRecoveryResult {
        const DESCRIPTION: &str = "Crash mid-append keeps completed entries";
        let inner: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let result = (|| -> JournalResult<CrashRecoveryResult> {
            let crashable = Arc::new(CrashableBackend::new(inner.clone()));
            let mut file =
                JournalFile::open_backend(crashable.clone(), None, &test_config(), None, None)?;
            for n in 1..=10 {
                append_fixture(&mut file, n)?;
            }

            crashable.crash_after(crash_after);
            let mut completed = 10;
            for n in 11..=200 {
                if append_fixture(&mut file, n).is_err() {
                    break;
                }
                completed += 1;
            }
            drop(file);

            if !crashable.has_crashed() {
                return Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    completed,
                    completed,
                    "crash point was never reached",
                ));
            }
            Ok(CrashRecoveryResult::compare(
                DESCRIPTION,
                completed,
                readable_entries(inner.clone())?,
            ))
        })();

        let result = result
            .unwrap_or_else(|e| CrashRecoveryResult::fail(DESCRIPTION, 0, 0, &e.to_string()));
        self.record(result)
    }

    /// Tests that entries survive when the final header write and the
    /// offline transition never land.
    pub fn test_crash_before_offline(&mut self) -> CrashRecoveryResult {
        const DESCRIPTION: &str = "Crash before offline keeps entries";
        let inner: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let result = (|| -> JournalResult<CrashRecoveryResult> {
            let crashable = Arc::new(CrashableBackend::new(inner.clone()));
            let mut file =
                JournalFile::open_backend(crashable.clone(), None, &test_config(), None, None)?;
            for n in 1..=15 {
                append_fixture(&mut file, n)?;
            }

            crashable.crash_now();
            if file.close().is_ok() {
                return Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    15,
                    15,
                    "close succeeded on a crashed backend",
                ));
            }

            Ok(CrashRecoveryResult::compare(
                DESCRIPTION,
                15,
                readable_entries(inner.clone())?,
            ))
        })();

        let result = result
            .unwrap_or_else(|e| CrashRecoveryResult::fail(DESCRIPTION, 15, 0, &e.to_string()));
        self.record(result)
    }

    /// Tests that a writer reopening an unclean file disposes of it and
    /// continues the sequence in a fresh one.
    pub fn test_open_reliably(&mut self) -> CrashRecoveryResult {
        const DESCRIPTION: &str = "Reliable reopen replaces an unclean file";
        let path = self.dir.join("system.journal");
        let dir = self.dir.clone();
        let result = (|| -> JournalResult<CrashRecoveryResult> {
            let _ = std::fs::remove_file(&path);
            let mut file = JournalFile::open(&path, &test_config())?;
            for n in 1..=12 {
                append_fixture(&mut file, n)?;
            }
            std::mem::forget(file);

            let mut file = JournalFile::open_reliably(&path, &test_config(), None, || None)?;
            if file.n_entries() != 0 {
                return Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    0,
                    file.n_entries(),
                    "replacement file is not empty",
                ));
            }
            let appended = file.append_entry(
                Some(test_timestamp(13)),
                Some(TEST_BOOT_ID),
                &["MESSAGE=after recovery"],
                None,
            )?;
            file.close()?;

            let disposed = std::fs::read_dir(&dir)?
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().ends_with(".journal~"))
                .count();
            if disposed != 1 {
                return Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    1,
                    disposed as u64,
                    "expected exactly one disposed file",
                ));
            }
            if appended.seqnum != 13 {
                return Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    13,
                    appended.seqnum,
                    "sequence numbers restarted",
                ));
            }
            Ok(CrashRecoveryResult::pass(DESCRIPTION, 1))
        })();

        let result = result
            .unwrap_or_else(|e| CrashRecoveryResult::fail(DESCRIPTION, 1, 0, &e.to_string()));
        self.record(result)
    }

    /// Runs every scenario.
    pub fn run_all(&mut self) -> Vec<CrashRecoveryResult> {
        vec![
            self.test_abandoned_writer(),
            self.test_crash_mid_append(1),
            self.test_crash_mid_append(100),
            self.test_crash_mid_append(4_000),
            self.test_crash_before_offline(),
            self.test_open_reliably(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_passed(result: &CrashRecoveryResult) {
        assert!(
            result.passed,
            "{}: expected {}, got {} ({:?})",
            result.description, result.expected_entries, result.actual_entries, result.error
        );
    }

    #[test]
    fn crashable_backend_refuses_writes_after_crash() {
        let inner: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let backend = CrashableBackend::new(inner.clone());

        backend.write_at(0, b"abcd").unwrap();
        backend.crash_after(6);
        backend.write_at(4, b"efgh").unwrap();
        assert!(backend.write_at(8, b"ijkl").is_err());
        assert!(backend.has_crashed());
        assert!(backend.sync().is_err());
        assert_eq!(inner.read_at(0, 8).unwrap(), b"abcdefgh");

        backend.reset();
        backend.write_at(8, b"ijkl").unwrap();
        assert_eq!(inner.size().unwrap(), 12);
    }

    #[test]
    fn abandoned_writer() {
        let mut harness = CrashRecoveryHarness::with_temp_dir().unwrap();
        assert_passed(&harness.test_abandoned_writer());
    }

    #[test]
    fn crash_mid_append_at_several_points() {
        let mut harness = CrashRecoveryHarness::with_temp_dir().unwrap();
        for crash_after in [1, 8, 64, 300, 1_000, 10_000] {
            assert_passed(&harness.test_crash_mid_append(crash_after));
        }
    }

    #[test]
    fn crash_before_offline() {
        let mut harness = CrashRecoveryHarness::with_temp_dir().unwrap();
        assert_passed(&harness.test_crash_before_offline());
    }

    #[test]
    fn open_reliably() {
        let mut harness = CrashRecoveryHarness::with_temp_dir().unwrap();
        assert_passed(&harness.test_open_reliably());
    }

    #[test]
    fn run_all_records_results() {
        let mut harness = CrashRecoveryHarness::with_temp_dir().unwrap();
        let results = harness.run_all();
        assert_eq!(results.len(), harness.results.len());
        results.iter().for_each(assert_passed);
    }
}
