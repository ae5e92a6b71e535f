//! # jrnl Core
//!
//! Append-only, indexed journal files for structured log records.
//!
//! A journal file holds *entries*, each a set of `FIELD=value` payloads
//! stamped with a sequence number, wall-clock and monotonic time and a
//! boot id. Payloads are stored once per file and shared between entries;
//! hash tables find them by content and entry arrays find entries by
//! offset, sequence number or time.
//!
//! This crate provides:
//! - The on-disk format ([`format`])
//! - [`JournalFile`]: open, append, look up, archive and rotate
//! - The online/offline state machine that marks clean shutdowns
//! - Change notification for live readers ([`ChangeFeed`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use jrnl_core::{Direction, JournalConfig, JournalFile};
//!
//! let mut file = JournalFile::open("system.journal", &JournalConfig::writer())?;
//! file.append_entry(None, None, &["MESSAGE=hello", "PRIORITY=6"], None)?;
//!
//! let mut cursor = 0;
//! while let Some((offset, entry)) = file.next_entry(cursor, Direction::Down)? {
//!     println!("{} {}", entry.seqnum, entry.realtime);
//!     cursor = offset;
//! }
//! file.close()?;
//! # Ok::<(), jrnl_core::JournalError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod codec;
mod config;
mod error;
pub mod format;
mod hash;
mod journal;
mod seal;
mod types;

pub use change_feed::{ChangeEvent, ChangeFeed};
pub use codec::{Codec, Compression, Lz4Codec, DEFAULT_COMPRESS_THRESHOLD, MIN_COMPRESS_THRESHOLD};
pub use config::{page_align, JournalConfig, JournalMetrics, ResolvedMetrics};
pub use error::{ErrorKind, JournalError, JournalResult};
pub use hash::{jenkins_hash64, siphash24, HashAlgorithm};
pub use journal::{
    dispose, AppendedEntry, JournalFile, OfflineState, RotationReason,
    DEFAULT_DATA_HASH_TABLE_SIZE, DEFAULT_FIELD_HASH_TABLE_SIZE, DISPOSED_SUFFIX,
    HASH_CHAIN_DEPTH_MAX, JOURNAL_SUFFIX,
};
pub use seal::{Sealer, TAG_LENGTH};
pub use types::{
    boot_id_payload, now_monotonic, now_realtime, valid_monotonic, valid_realtime, Direction,
    DualTimestamp, Id128, SequenceCounter, BOOT_ID_FIELD, TIMESTAMP_LIMIT,
};
