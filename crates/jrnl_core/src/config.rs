//! Journal file configuration.

use crate::codec::{DEFAULT_COMPRESS_THRESHOLD, MIN_COMPRESS_THRESHOLD};
use crate::types::Id128;
use std::time::Duration;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

const PAGE_SIZE: u64 = 4096;

const DEFAULT_MAX_USE_LOWER: u64 = MIB;
const DEFAULT_MAX_USE_UPPER: u64 = 4 * GIB;
const DEFAULT_MIN_USE: u64 = MIB;
const DEFAULT_MAX_SIZE_UPPER: u64 = 128 * MIB;
const MIN_SIZE_FLOOR: u64 = 512 * KIB;
const DEFAULT_KEEP_FREE_UPPER: u64 = 4 * GIB;
const DEFAULT_KEEP_FREE: u64 = MIB;
const DEFAULT_N_MAX_FILES: u64 = 100;

/// Rounds `n` up to a page boundary.
#[must_use]
pub const fn page_align(n: u64) -> u64 {
    n.saturating_add(PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

const fn page_align_down(n: u64) -> u64 {
    n & !(PAGE_SIZE - 1)
}

/// Size and space limits for a journal file.
///
/// Unset fields are derived from the filesystem size by
/// [`JournalMetrics::fix_defaults`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JournalMetrics {
    /// Total disk space all files of a journal may use.
    pub max_use: Option<u64>,
    /// Space that may always be used regardless of `keep_free`.
    pub min_use: Option<u64>,
    /// Largest size a single file may grow to.
    pub max_size: Option<u64>,
    /// Size a file may always grow to regardless of `keep_free`.
    pub min_size: Option<u64>,
    /// Free space to leave on the filesystem.
    pub keep_free: Option<u64>,
    /// Maximum number of files in a journal directory.
    pub n_max_files: Option<u64>,
}

impl JournalMetrics {
    /// Creates metrics with every value unset.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_use: None,
            min_use: None,
            max_size: None,
            min_size: None,
            keep_free: None,
            n_max_files: None,
        }
    }

    /// Sets the per-file size limit.
    #[must_use]
    pub const fn max_size(mut self, bytes: u64) -> Self {
        self.max_size = Some(bytes);
        self
    }

    /// Sets the size a file may always reach.
    #[must_use]
    pub const fn min_size(mut self, bytes: u64) -> Self {
        self.min_size = Some(bytes);
        self
    }

    /// Sets the total usage limit.
    #[must_use]
    pub const fn max_use(mut self, bytes: u64) -> Self {
        self.max_use = Some(bytes);
        self
    }

    /// Sets the guaranteed usage.
    #[must_use]
    pub const fn min_use(mut self, bytes: u64) -> Self {
        self.min_use = Some(bytes);
        self
    }

    /// Sets the free-space floor.
    #[must_use]
    pub const fn keep_free(mut self, bytes: u64) -> Self {
        self.keep_free = Some(bytes);
        self
    }

    /// Sets the file count limit.
    #[must_use]
    pub const fn n_max_files(mut self, n: u64) -> Self {
        self.n_max_files = Some(n);
        self
    }

    /// Fills every unset value, deriving it from `fs_size` (the total size
    /// of the filesystem, if known), and clamps the result into a
    /// consistent shape.
    #[must_use]
    pub fn fix_defaults(self, fs_size: Option<u64>) -> ResolvedMetrics {
        let mut max_use = match self.max_use {
            Some(v) => page_align(v),
            None => fs_size.map_or(DEFAULT_MAX_USE_UPPER, |fs| {
                page_align(fs / 10).clamp(DEFAULT_MAX_USE_LOWER, DEFAULT_MAX_USE_UPPER)
            }),
        };
        max_use = max_use.max(DEFAULT_MAX_USE_LOWER);

        let mut max_size = match self.max_size {
            Some(v) => page_align(v),
            None => page_align(max_use / 8).min(DEFAULT_MAX_SIZE_UPPER),
        };
        max_size = max_size.max(MIN_SIZE_FLOOR);

        if max_use < max_size * 2 {
            max_use = max_size * 2;
        }

        let min_use = match self.min_use {
            Some(v) => page_align(v),
            None => fs_size.map_or(DEFAULT_MIN_USE, |fs| page_align(fs / 50)),
        }
        .clamp(DEFAULT_MIN_USE.min(max_use), max_use);

        let min_size = match self.min_size {
            Some(v) => page_align(v).max(MIN_SIZE_FLOOR),
            None => MIN_SIZE_FLOOR,
        }
        .min(max_size);

        let keep_free = match self.keep_free {
            Some(v) => page_align(v),
            None => fs_size.map_or(DEFAULT_KEEP_FREE, |fs| {
                page_align_down(fs / 20).min(DEFAULT_KEEP_FREE_UPPER)
            }),
        };

        ResolvedMetrics {
            max_use,
            min_use,
            max_size,
            min_size,
            keep_free,
            n_max_files: self.n_max_files.unwrap_or(DEFAULT_N_MAX_FILES),
        }
    }
}

/// Metrics with every value decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMetrics {
    /// Total disk space all files of a journal may use.
    pub max_use: u64,
    /// Space that may always be used regardless of `keep_free`.
    pub min_use: u64,
    /// Largest size a single file may grow to.
    pub max_size: u64,
    /// Size a file may always grow to regardless of `keep_free`.
    pub min_size: u64,
    /// Free space to leave on the filesystem.
    pub keep_free: u64,
    /// Maximum number of files in a journal directory.
    pub n_max_files: u64,
}

/// Configuration for opening or creating a journal file.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Open for appending.
    pub writable: bool,

    /// Create the file if it does not exist. Requires `writable`.
    pub create: bool,

    /// Compress large DATA payloads in new files.
    pub compress: bool,

    /// Payload size from which compression is attempted.
    pub compress_threshold: usize,

    /// Mark new files as sealed. A sealer must be supplied on open.
    pub seal: bool,

    /// Index new files with the keyed hash.
    pub keyed_hash: bool,

    /// Machine id to stamp into new files and to check on open.
    /// `None` reads the host's id.
    pub machine_id: Option<Id128>,

    /// Minimum spacing of change notifications. `None` fires on every
    /// append.
    pub post_change_interval: Option<Duration>,

    /// Size and space limits.
    pub metrics: JournalMetrics,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            writable: false,
            create: false,
            compress: true,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            seal: false,
            keyed_hash: true,
            machine_id: None,
            post_change_interval: Some(Duration::from_millis(250)),
            metrics: JournalMetrics::new(),
        }
    }
}

impl JournalConfig {
    /// Creates a read-only configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration for appending, creating the file if needed.
    #[must_use]
    pub fn writer() -> Self {
        Self::default().writable(true).create(true)
    }

    /// Sets whether the file is opened for appending.
    #[must_use]
    pub const fn writable(mut self, value: bool) -> Self {
        self.writable = value;
        self
    }

    /// Sets whether a missing file is created.
    #[must_use]
    pub const fn create(mut self, value: bool) -> Self {
        self.create = value;
        self
    }

    /// Sets whether new files compress large payloads.
    #[must_use]
    pub const fn compress(mut self, value: bool) -> Self {
        self.compress = value;
        self
    }

    /// Sets the compression threshold. Values below 8 bytes are raised.
    #[must_use]
    pub const fn compress_threshold(mut self, bytes: usize) -> Self {
        self.compress_threshold = if bytes < MIN_COMPRESS_THRESHOLD {
            MIN_COMPRESS_THRESHOLD
        } else {
            bytes
        };
        self
    }

    /// Sets whether new files are sealed.
    #[must_use]
    pub const fn seal(mut self, value: bool) -> Self {
        self.seal = value;
        self
    }

    /// Sets whether new files use the keyed hash.
    #[must_use]
    pub const fn keyed_hash(mut self, value: bool) -> Self {
        self.keyed_hash = value;
        self
    }

    /// Overrides the machine id.
    #[must_use]
    pub const fn machine_id(mut self, id: Id128) -> Self {
        self.machine_id = Some(id);
        self
    }

    /// Sets the change notification interval.
    #[must_use]
    pub const fn post_change_interval(mut self, interval: Option<Duration>) -> Self {
        self.post_change_interval = interval;
        self
    }

    /// Sets the size and space limits.
    #[must_use]
    pub const fn metrics(mut self, metrics: JournalMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = JournalConfig::default();
        assert!(!config.writable);
        assert!(config.compress);
        assert!(config.keyed_hash);
        assert_eq!(config.compress_threshold, 512);
        assert_eq!(
            config.post_change_interval,
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn builder_pattern() {
        let config = JournalConfig::new()
            .writable(true)
            .create(true)
            .compress(false)
            .compress_threshold(2)
            .post_change_interval(None);

        assert!(config.writable && config.create);
        assert!(!config.compress);
        assert_eq!(config.compress_threshold, MIN_COMPRESS_THRESHOLD);
        assert!(config.post_change_interval.is_none());
    }

    #[test]
    fn defaults_from_filesystem_size() {
        let m = JournalMetrics::new().fix_defaults(Some(100 * GIB));

        assert_eq!(m.max_use, 4 * GIB);
        assert_eq!(m.min_use, 2 * GIB);
        assert_eq!(m.max_size, 128 * MIB);
        assert_eq!(m.min_size, 512 * KIB);
        assert_eq!(m.keep_free, 4 * GIB);
        assert_eq!(m.n_max_files, 100);
    }

    #[test]
    fn defaults_on_small_filesystem() {
        let m = JournalMetrics::new().fix_defaults(Some(20 * MIB));

        // an eighth of 2 MiB is below the floor
        assert_eq!(m.max_size, 512 * KIB);
        assert_eq!(m.max_use, 2 * MIB);
        assert_eq!(m.min_use, MIB);
        assert_eq!(m.keep_free, MIB);
    }

    #[test]
    fn defaults_without_filesystem() {
        let m = JournalMetrics::new().fix_defaults(None);
        assert_eq!(m.keep_free, MIB);
        assert_eq!(m.max_size, 128 * MIB);
    }

    #[test]
    fn explicit_values_win() {
        let m = JournalMetrics::new()
            .max_size(64 * MIB)
            .min_size(MIB)
            .keep_free(0)
            .fix_defaults(Some(GIB));

        assert_eq!(m.max_size, 64 * MIB);
        assert_eq!(m.min_size, MIB);
        assert_eq!(m.keep_free, 0);
        assert!(m.max_use >= 2 * m.max_size);
    }

    #[test]
    fn page_alignment() {
        assert_eq!(page_align(0), 0);
        assert_eq!(page_align(1), 4096);
        assert_eq!(page_align(4096), 4096);
        assert_eq!(page_align(u64::MAX), u64::MAX & !4095);
    }
}
