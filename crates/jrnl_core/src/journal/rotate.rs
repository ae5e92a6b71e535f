//! Archiving, rotation and recovery from broken files.

use super::{JournalFile, DISPOSED_SUFFIX, HASH_CHAIN_DEPTH_MAX, JOURNAL_SUFFIX};
use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use crate::seal::Sealer;
use crate::types::{now_realtime, Id128};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Why a file should be replaced by a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    /// The header was written by an older revision.
    OutdatedHeader,
    /// The DATA table is more than 75% full.
    DataHashTableFull {
        /// Number of DATA objects.
        n_data: u64,
        /// Number of buckets.
        buckets: u64,
    },
    /// The FIELD table is more than 75% full.
    FieldHashTableFull {
        /// Number of FIELD objects.
        n_fields: u64,
        /// Number of buckets.
        buckets: u64,
    },
    /// A DATA chain grew suspiciously long.
    DataHashChainTooDeep {
        /// Longest chain walked.
        depth: u64,
    },
    /// A FIELD chain grew suspiciously long.
    FieldHashChainTooDeep {
        /// Longest chain walked.
        depth: u64,
    },
    /// The file has DATA but no FIELD objects, as written by an old
    /// revision that did not maintain fields.
    MissingFields,
    /// The first entry is older than the configured file age.
    TooOld {
        /// Age of the first entry in microseconds.
        age: u64,
    },
}

impl fmt::Display for RotationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutdatedHeader => f.write_str("header uses an outdated layout"),
            Self::DataHashTableFull { n_data, buckets } => {
                write!(f, "data hash table holds {n_data} objects in {buckets} buckets")
            }
            Self::FieldHashTableFull { n_fields, buckets } => {
                write!(f, "field hash table holds {n_fields} objects in {buckets} buckets")
            }
            Self::DataHashChainTooDeep { depth } => {
                write!(f, "data hash chain reached depth {depth}")
            }
            Self::FieldHashChainTooDeep { depth } => {
                write!(f, "field hash chain reached depth {depth}")
            }
            Self::MissingFields => f.write_str("data objects without field objects"),
            Self::TooOld { age } => write!(f, "first entry is {age}us old"),
        }
    }
}

fn journal_prefix(path: &Path) -> JournalResult<(&str, &Path)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| n.ends_with(JOURNAL_SUFFIX))
        .ok_or_else(|| {
            JournalError::invalid_argument(format!(
                "{} is not an active journal file",
                path.display()
            ))
        })?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    Ok((&name[..name.len() - JOURNAL_SUFFIX.len()], parent))
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> io::Result<()> {
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn rename_ignoring_missing(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %from.display(), "file already moved away");
            Ok(())
        }
        other => other,
    }
}

/// Moves a broken journal file aside as `<name>@<time>-<random>.journal~`.
///
/// Returns the new path.
///
/// # Errors
///
/// Returns an error if `path` does not end in `.journal` or the rename
/// fails.
pub fn dispose(path: impl AsRef<Path>) -> JournalResult<PathBuf> {
    let path = path.as_ref();
    let (prefix, parent) = journal_prefix(path)?;

    let random = Id128::random();
    let mut low = [0u8; 8];
    low.copy_from_slice(&random.as_bytes()[..8]);

    let target = path.with_file_name(format!(
        "{prefix}@{:016x}-{:016x}{DISPOSED_SUFFIX}",
        now_realtime(),
        u64::from_le_bytes(low)
    ));
    fs::rename(path, &target)?;
    sync_directory(parent)?;

    info!(from = %path.display(), to = %target.display(), "disposed of journal file");
    debug!(path = %target.display(), "skipping defragmentation of disposed file");
    Ok(target)
}

impl JournalFile {
    /// Renames the file to its archived name and marks it for archiving on
    /// the next offline transition. Returns the previous path.
    ///
    /// The archived name records the sequence-number domain and the first
    /// entry: `<name>@<seqnum id>-<head seqnum>-<head realtime>.journal`.
    ///
    /// # Errors
    ///
    /// Returns an error for readers, files without a path and names not
    /// ending in `.journal`.
    pub fn archive(&mut self) -> JournalResult<PathBuf> {
        if !self.writable {
            return Err(JournalError::ReadOnly);
        }
        let path = self
            .path
            .clone()
            .ok_or_else(|| JournalError::invalid_argument("file has no path to archive"))?;
        let (prefix, parent) = journal_prefix(&path)?;

        let target = path.with_file_name(format!(
            "{prefix}@{}-{:016x}-{:016x}{JOURNAL_SUFFIX}",
            self.header.seqnum_id.to_hex(),
            self.header.head_entry_seqnum,
            self.header.head_entry_realtime
        ));
        rename_ignoring_missing(&path, &target)?;
        sync_directory(parent)?;

        self.offline.set_archive();
        self.defrag_on_close = true;
        self.path = Some(target);
        Ok(path)
    }

    /// Archives the file and opens a fresh one under the old name,
    /// continuing its sequence-number domain.
    ///
    /// The archived file is closed before this returns, also when opening
    /// the new file fails.
    ///
    /// # Errors
    ///
    /// Returns an error if archiving or opening the new file fails.
    pub fn rotate(mut self, sealer: Option<Box<dyn Sealer>>) -> JournalResult<JournalFile> {
        let previous = self.archive()?;
        let config = self.config.clone().writable(true).create(true);
        let next = Self::open_with(&previous, &config, Some(&self), sealer);

        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close archived journal file");
        }
        let next = next?;
        info!(path = %previous.display(), "rotated journal file");
        Ok(next)
    }

    /// Opens a journal file, replacing it with a fresh one if it turns out
    /// to be broken or uncleanly shut down.
    ///
    /// Only writers creating `.journal` files are recovered. The broken
    /// file is moved aside with [`dispose`]. Without a `template`, the
    /// broken file is opened read-only to carry its sequence-number domain
    /// over to the replacement. `sealer` is asked for a sealer for each
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns the open error if it is not recoverable, or the error of the
    /// second attempt.
    pub fn open_reliably<F>(
        path: impl AsRef<Path>,
        config: &JournalConfig,
        template: Option<&JournalFile>,
        mut sealer: F,
    ) -> JournalResult<Self>
    where
        F: FnMut() -> Option<Box<dyn Sealer>>,
    {
        let path = path.as_ref();
        let err = match Self::open_with(path, config, template, sealer()) {
            Ok(file) => return Ok(file),
            Err(e) => e,
        };

        let recoverable = err.is_recoverable_on_open()
            && config.writable
            && config.create
            && path.to_string_lossy().ends_with(JOURNAL_SUFFIX);
        if !recoverable {
            return Err(err);
        }
        warn!(
            path = %path.display(),
            error = %err,
            "journal file corrupted or uncleanly shut down, renaming and replacing"
        );

        let fallback = match template {
            Some(_) => None,
            None => Self::open(path, &JournalConfig::new()).ok(),
        };
        let template = template.or(fallback.as_ref());

        dispose(path)?;
        Self::open_with(path, config, template, sealer())
    }

    /// Returns why the file should be rotated, if it should.
    ///
    /// `max_file_age` is the age in microseconds after which the first
    /// entry makes the file due for rotation.
    #[must_use]
    pub fn rotate_suggested(&self, max_file_age: Option<u64>) -> Option<RotationReason> {
        let reason = self.rotation_reason(max_file_age);
        if let Some(reason) = reason {
            debug!(path = ?self.path, %reason, "journal file should be rotated");
        }
        reason
    }

    fn rotation_reason(&self, max_file_age: Option<u64>) -> Option<RotationReason> {
        let header = &self.header;
        if header.is_short() {
            return Some(RotationReason::OutdatedHeader);
        }

        let buckets = self.data_bucket_count();
        if header.n_data * 4 > buckets * 3 {
            return Some(RotationReason::DataHashTableFull {
                n_data: header.n_data,
                buckets,
            });
        }
        let buckets = self.field_bucket_count();
        if header.n_fields * 4 > buckets * 3 {
            return Some(RotationReason::FieldHashTableFull {
                n_fields: header.n_fields,
                buckets,
            });
        }

        if header.data_hash_chain_depth > HASH_CHAIN_DEPTH_MAX {
            return Some(RotationReason::DataHashChainTooDeep {
                depth: header.data_hash_chain_depth,
            });
        }
        if header.field_hash_chain_depth > HASH_CHAIN_DEPTH_MAX {
            return Some(RotationReason::FieldHashChainTooDeep {
                depth: header.field_hash_chain_depth,
            });
        }

        if header.n_data > 0 && header.n_fields == 0 {
            return Some(RotationReason::MissingFields);
        }

        if let Some(max) = max_file_age.filter(|&max| max > 0) {
            let head = header.head_entry_realtime;
            let age = now_realtime().saturating_sub(head);
            if head > 0 && age > max {
                return Some(RotationReason::TooOld { age });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalMetrics;
    use crate::format::FileState;
    use crate::types::{DualTimestamp, Direction};

    fn config() -> JournalConfig {
        JournalConfig::writer()
            .machine_id(Id128::from_bytes([7; 16]))
            .metrics(JournalMetrics::new().max_size(8 << 20).keep_free(0))
    }

    const BOOT: Id128 = Id128::from_bytes([3; 16]);

    fn append(file: &mut JournalFile, realtime: u64) {
        file.append_entry(
            Some(DualTimestamp::new(realtime, realtime)),
            Some(BOOT),
            &["MESSAGE=rotate me"],
            None,
        )
        .unwrap();
    }

    fn state_of(path: &Path) -> FileState {
        let reader = JournalFile::open(path, &JournalConfig::new()).unwrap();
        reader.state().unwrap()
    }

    #[test]
    fn archive_renames_and_marks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.journal");
        let mut file = JournalFile::open(&path, &config()).unwrap();
        append(&mut file, 1_000);

        let previous = file.archive().unwrap();
        assert_eq!(previous, path);
        let archived = file.path().unwrap().to_path_buf();
        let name = archived.file_name().unwrap().to_str().unwrap().to_owned();
        assert!(name.starts_with(&format!(
            "system@{}-{:016x}-{:016x}",
            file.header().seqnum_id.to_hex(),
            1,
            1_000
        )));
        assert!(name.ends_with(".journal"));
        assert!(file.wants_defrag());

        file.close().unwrap();
        assert!(!path.exists());
        assert_eq!(state_of(&archived), FileState::Archived);
    }

    #[test]
    fn rotate_continues_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.journal");
        let mut file = JournalFile::open(&path, &config()).unwrap();
        append(&mut file, 1_000);
        append(&mut file, 2_000);
        let seqnum_id = file.header().seqnum_id;

        let mut next = file.rotate(None).unwrap();
        assert_eq!(next.path(), Some(path.as_path()));
        assert_eq!(next.header().seqnum_id, seqnum_id);
        assert_eq!(next.n_entries(), 0);

        append(&mut next, 3_000);
        let (_, entry) = next.next_entry(0, Direction::Down).unwrap().unwrap();
        assert_eq!(entry.seqnum, 3);
        next.close().unwrap();

        let archived: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p != &path)
            .collect();
        assert_eq!(archived.len(), 1);
        assert_eq!(state_of(&archived[0]), FileState::Archived);
    }

    #[test]
    fn archived_file_refuses_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.journal");
        let mut file = JournalFile::open(&path, &config()).unwrap();
        file.archive().unwrap();
        let archived = file.path().unwrap().to_path_buf();
        file.close().unwrap();

        assert!(matches!(
            JournalFile::open(&archived, &config().create(false)),
            Err(JournalError::Archived)
        ));
    }

    #[test]
    fn dispose_renames_with_tilde() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user-1000.journal");
        fs::write(&path, b"garbage").unwrap();

        let target = dispose(&path).unwrap();
        let name = target.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("user-1000@"));
        assert!(name.ends_with(".journal~"));
        assert!(!path.exists());
        assert!(target.exists());

        assert!(dispose(dir.path().join("notes.txt")).is_err());
    }

    #[test]
    fn open_reliably_replaces_unclean_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.journal");
        let mut file = JournalFile::open(&path, &config()).unwrap();
        append(&mut file, 1_000);
        let seqnum_id = file.header().seqnum_id;
        // Abandon the writer while online.
        std::mem::forget(file);

        assert!(matches!(
            JournalFile::open(&path, &config()),
            Err(JournalError::Unclean)
        ));

        let mut file = JournalFile::open_reliably(&path, &config(), None, || None).unwrap();
        assert_eq!(file.n_entries(), 0);
        assert_eq!(file.header().seqnum_id, seqnum_id);
        append(&mut file, 2_000);
        assert_eq!(file.header().tail_entry_seqnum, 2);
        file.close().unwrap();

        let disposed = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".journal~"))
            .count();
        assert_eq!(disposed, 1);
    }

    #[test]
    fn open_reliably_keeps_file_on_environment_errors() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("var");
        fs::write(&blocker, b"not a directory").unwrap();
        let path = blocker.join("system.journal");

        let err = JournalFile::open_reliably(&path, &config(), None, || None).unwrap_err();
        assert!(!err.is_recoverable_on_open());
        assert_eq!(fs::read(&blocker).unwrap(), b"not a directory");

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["var".to_string()]);
    }

    #[test]
    fn open_reliably_leaves_readers_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.journal");
        fs::write(&path, vec![0u8; 300]).unwrap();

        let err = JournalFile::open_reliably(&path, &JournalConfig::new(), None, || None)
            .unwrap_err();
        assert!(err.is_malformed());
        assert!(path.exists());
    }

    #[test]
    fn suggestions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.journal");
        let mut file = JournalFile::open(&path, &config()).unwrap();
        assert_eq!(file.rotate_suggested(None), None);

        append(&mut file, 1_000);
        assert!(matches!(
            file.rotate_suggested(Some(1)),
            Some(RotationReason::TooOld { .. })
        ));
        assert_eq!(file.rotate_suggested(Some(0)), None);

        file.header.data_hash_chain_depth = HASH_CHAIN_DEPTH_MAX + 1;
        assert_eq!(
            file.rotate_suggested(None),
            Some(RotationReason::DataHashChainTooDeep {
                depth: HASH_CHAIN_DEPTH_MAX + 1
            })
        );

        file.header.n_data = file.data_bucket_count();
        assert!(matches!(
            file.rotate_suggested(None),
            Some(RotationReason::DataHashTableFull { .. })
        ));

        file.header.header_size = 208;
        assert_eq!(file.rotate_suggested(None), Some(RotationReason::OutdatedHeader));
        file.header.header_size = crate::format::HEADER_SIZE;
    }
}
