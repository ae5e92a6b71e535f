//! Error types for the journal engine.

use jrnl_storage::StorageError;
use std::io;
use thiserror::Error;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Broad classification of a [`JournalError`].
///
/// Callers use this to decide between retrying, disposing of a file and
/// recreating it, or giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A system call failed or the backing store faulted.
    Io,
    /// The file content violates the format.
    Malformed,
    /// The file is sound but policy forbids the operation.
    Policy,
    /// A size or count ran out of range.
    Resource,
    /// The caller passed something unusable.
    InvalidInput,
}

/// Errors that can occur in journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The backing store faulted underneath a read.
    #[error("bus fault on journal backing store")]
    BusFault,

    /// File content violates the format.
    #[error("malformed journal: {message}")]
    Malformed {
        /// Description of the problem.
        message: String,
    },

    /// File is shorter than its header claims.
    #[error("truncated journal: {message}")]
    Truncated {
        /// Description of the problem.
        message: String,
    },

    /// Growing the file would exceed the size limit or keep-free floor.
    #[error("journal quota exceeded: {message}")]
    QuotaExceeded {
        /// Description of the limit hit.
        message: String,
    },

    /// The newest entry carries a timestamp later than the current time.
    #[error("journal tail timestamp {tail_realtime} is in the future (now {now})")]
    FromTheFuture {
        /// Realtime of the newest entry.
        tail_realtime: u64,
        /// The current realtime clock.
        now: u64,
    },

    /// The file was archived and is no longer writable.
    #[error("journal file is archived")]
    Archived,

    /// The file was left online by a previous writer.
    #[error("journal file was not shut down cleanly")]
    Unclean,

    /// The file belongs to another machine.
    #[error("journal file belongs to another machine")]
    WrongMachine,

    /// The file uses flags this implementation does not understand.
    #[error("unsupported journal feature: {message}")]
    UnsupportedFeature {
        /// Description of the offending flags.
        message: String,
    },

    /// The backing file has been unlinked.
    #[error("journal file has been deleted")]
    Deleted,

    /// A write was attempted on a read-only file.
    #[error("journal file is read-only")]
    ReadOnly,

    /// A timestamp went backwards relative to the newest entry.
    #[error("timestamp regression: {message}")]
    TimestampRegression {
        /// Description of the regression.
        message: String,
    },

    /// An external sequence counter belongs to another domain.
    #[error("sequence number domain mismatch")]
    SequenceDomainMismatch,

    /// A size or count ran out of range.
    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        /// Description of the limit.
        message: String,
    },

    /// The caller passed an unusable argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },
}

impl JournalError {
    /// Creates a malformed-data error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Creates a truncation error.
    pub fn truncated(message: impl Into<String>) -> Self {
        Self::Truncated {
            message: message.into(),
        }
    }

    /// Creates a quota error.
    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            message: message.into(),
        }
    }

    /// Creates an unsupported-feature error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedFeature {
            message: message.into(),
        }
    }

    /// Creates a timestamp regression error.
    pub fn timestamp_regression(message: impl Into<String>) -> Self {
        Self::TimestampRegression {
            message: message.into(),
        }
    }

    /// Creates a resource exhaustion error.
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Classifies the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(StorageError::ReadPastEnd { .. }) => ErrorKind::Malformed,
            Self::Storage(_) | Self::Io(_) | Self::BusFault => ErrorKind::Io,
            Self::Malformed { .. } | Self::Truncated { .. } => ErrorKind::Malformed,
            Self::QuotaExceeded { .. }
            | Self::FromTheFuture { .. }
            | Self::Archived
            | Self::Unclean
            | Self::WrongMachine
            | Self::UnsupportedFeature { .. }
            | Self::Deleted
            | Self::ReadOnly
            | Self::TimestampRegression { .. }
            | Self::SequenceDomainMismatch => ErrorKind::Policy,
            Self::ResourceExhausted { .. } => ErrorKind::Resource,
            Self::InvalidArgument { .. } => ErrorKind::InvalidInput,
        }
    }

    /// Returns `true` for data corruption, where skipping the object or
    /// disposing of the file is the right response.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        self.kind() == ErrorKind::Malformed
    }

    /// Returns `true` for open failures after which the file should be
    /// renamed out of the way and recreated.
    #[must_use]
    pub fn is_recoverable_on_open(&self) -> bool {
        matches!(
            self,
            Self::Malformed { .. }
                | Self::Truncated { .. }
                | Self::WrongMachine
                | Self::UnsupportedFeature { .. }
                | Self::Unclean
                | Self::Archived
                | Self::BusFault
                | Self::Deleted
                | Self::FromTheFuture { .. }
        ) || match self {
            Self::Storage(StorageError::Io(e)) | Self::Io(e) => is_read_failure(e),
            Self::Storage(StorageError::ReadPastEnd { .. } | StorageError::Fault { .. }) => true,
            _ => false,
        }
    }
}

/// `EIO` has the same value on every unix.
const EIO: i32 = 5;

/// Whether `e` says the file's bytes could not be read back, as opposed to
/// the process lacking permission, descriptors or space.
fn is_read_failure(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData
    ) || (cfg!(unix) && e.raw_os_error() == Some(EIO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(JournalError::BusFault.kind(), ErrorKind::Io);
        assert_eq!(JournalError::malformed("x").kind(), ErrorKind::Malformed);
        assert_eq!(JournalError::truncated("x").kind(), ErrorKind::Malformed);
        assert_eq!(JournalError::Archived.kind(), ErrorKind::Policy);
        assert_eq!(JournalError::quota_exceeded("x").kind(), ErrorKind::Policy);
        assert_eq!(
            JournalError::resource_exhausted("x").kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            JournalError::invalid_argument("x").kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn short_reads_count_as_malformed() {
        let err = JournalError::from(StorageError::ReadPastEnd {
            offset: 10,
            len: 4,
            size: 8,
        });
        assert!(err.is_malformed());
    }

    #[test]
    fn recoverable_open_failures() {
        assert!(JournalError::Unclean.is_recoverable_on_open());
        assert!(JournalError::WrongMachine.is_recoverable_on_open());
        assert!(JournalError::Deleted.is_recoverable_on_open());
        assert!(!JournalError::ReadOnly.is_recoverable_on_open());
        assert!(!JournalError::quota_exceeded("full").is_recoverable_on_open());
        assert!(!JournalError::invalid_argument("bad").is_recoverable_on_open());
    }

    #[test]
    fn only_read_failures_are_recoverable_io() {
        let eio = io::Error::from_raw_os_error(EIO);
        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        let full = io::Error::new(io::ErrorKind::Other, "no space left");

        if cfg!(unix) {
            assert!(JournalError::Io(eio).is_recoverable_on_open());
        }
        assert!(JournalError::Io(eof).is_recoverable_on_open());
        assert!(!JournalError::Io(denied).is_recoverable_on_open());
        assert!(!JournalError::from(StorageError::Io(full)).is_recoverable_on_open());
        assert!(JournalError::from(StorageError::Fault { offset: 8 }).is_recoverable_on_open());
        assert!(JournalError::BusFault.is_recoverable_on_open());
    }
}
