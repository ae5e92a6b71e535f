//! Journal files.
//!
//! A [`JournalFile`] is one open file: its header, its object arena and
//! the indices inside it. Reads take `&self`; appends and state changes
//! take `&mut self`, so a file has one writer at a time. The only thread
//! besides the owner is the offline worker, which syncs the file and
//! flips the header state after a background [`JournalFile::set_offline`].
//!
//! ## Lifecycle
//!
//! ```text
//! open (writer) ──> ONLINE ──append──> ONLINE ──set_offline──> OFFLINE
//!                     ^                                           │
//!                     └──────────────── append ───────────────────┘
//! archive ──> next offline transition records ARCHIVED
//! ```
//!
//! A file found ONLINE on open was not closed cleanly and is refused for
//! writing; [`JournalFile::open_reliably`] moves such a file aside and
//! starts a fresh one.

mod append;
mod arena;
mod chain_cache;
mod entry_array;
mod hash_table;
mod lookup;
mod offline;
mod post_change;
mod rotate;

pub use append::AppendedEntry;
pub use hash_table::{
    DEFAULT_DATA_HASH_TABLE_SIZE, DEFAULT_FIELD_HASH_TABLE_SIZE, HASH_CHAIN_DEPTH_MAX,
};
pub use offline::OfflineState;
pub use rotate::{dispose, RotationReason};

use crate::change_feed::{ChangeEvent, ChangeFeed};
use crate::codec::Lz4Codec;
use crate::config::{JournalConfig, ResolvedMetrics};
use crate::error::{JournalError, JournalResult};
use crate::format::{
    check_hash_table_size, valid_offset, FileState, Header, COMPATIBLE_SEALED,
    COMPATIBLE_SUPPORTED, HEADER_SIGNATURE, HEADER_SIZE, HEADER_SIZE_MIN, HEADER_STATE_OFFSET,
    INCOMPATIBLE_COMPRESSED_LZ4, INCOMPATIBLE_KEYED_HASH, INCOMPATIBLE_SUPPORTED,
};
use crate::hash::HashAlgorithm;
use crate::seal::Sealer;
use crate::types::{now_realtime, valid_monotonic, valid_realtime, Id128};
use chain_cache::ChainCache;
use jrnl_storage::{FileBackend, StorageBackend};
use offline::Offline;
use parking_lot::Mutex;
use post_change::PostChange;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Suffix of active journal files.
pub const JOURNAL_SUFFIX: &str = ".journal";

/// Suffix of files disposed of after an unclean shutdown.
pub const DISPOSED_SUFFIX: &str = ".journal~";

/// An open journal file.
pub struct JournalFile {
    path: Option<PathBuf>,
    backend: Arc<dyn StorageBackend>,
    header: Header,
    writable: bool,
    config: JournalConfig,
    metrics: ResolvedMetrics,
    hash: HashAlgorithm,
    codec: Lz4Codec,
    compress: bool,
    sealer: Option<Box<dyn Sealer>>,
    file_size: AtomicU64,
    chain_cache: Mutex<ChainCache>,
    last_stat: Option<Instant>,
    offline: Offline,
    post_change: PostChange,
    feed: Arc<ChangeFeed>,
    defrag_on_close: bool,
    closed: bool,
}

impl JournalFile {
    /// Opens (or creates) the journal file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or fails verification.
    pub fn open(path: impl AsRef<Path>, config: &JournalConfig) -> JournalResult<Self> {
        Self::open_with(path, config, None, None)
    }

    /// Opens a journal file, inheriting the sequence-number domain, change
    /// feed and notification interval from `template`.
    ///
    /// Writers must name a file ending in `.journal` or `.journal~`.
    /// `sealer` is required when creating a sealed file and when
    /// appending to one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or fails verification.
    pub fn open_with(
        path: impl AsRef<Path>,
        config: &JournalConfig,
        template: Option<&JournalFile>,
        sealer: Option<Box<dyn Sealer>>,
    ) -> JournalResult<Self> {
        let path = path.as_ref();
        check_access(config)?;

        if config.writable {
            let name = path.to_string_lossy();
            if !name.ends_with(JOURNAL_SUFFIX) && !name.ends_with(DISPOSED_SUFFIX) {
                return Err(JournalError::invalid_argument(format!(
                    "{} is not named like a journal file",
                    path.display()
                )));
            }
            if !config.create && !path.exists() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} does not exist", path.display()),
                )
                .into());
            }
        }

        let backend = FileBackend::open(path, config.writable)?;
        Self::open_backend(
            Arc::new(backend),
            Some(path.to_path_buf()),
            config,
            template,
            sealer,
        )
    }

    /// Opens a journal file on an arbitrary backend.
    ///
    /// Files without a path cannot be archived or rotated.
    ///
    /// # Errors
    ///
    /// Returns an error if the content fails verification.
    pub fn open_backend(
        backend: Arc<dyn StorageBackend>,
        path: Option<PathBuf>,
        config: &JournalConfig,
        template: Option<&JournalFile>,
        sealer: Option<Box<dyn Sealer>>,
    ) -> JournalResult<Self> {
        check_access(config)?;

        let size = backend.size()?;
        let newly_created = size == 0 && config.writable;

        if newly_created {
            if config.seal && sealer.is_none() {
                return Err(JournalError::invalid_argument(
                    "sealing requested without a sealer",
                ));
            }
            let header = new_header(config, template);
            backend.write_at(0, &header.encode())?;
        } else if size < HEADER_SIZE_MIN {
            return Err(JournalError::truncated(format!(
                "file holds {size} bytes, need at least {HEADER_SIZE_MIN}"
            )));
        }

        let size = backend.size()?;
        let raw = backend.read_at(0, size.min(HEADER_SIZE) as usize)?;
        let header = Header::decode(&raw)?;
        let host_machine_id = config.machine_id.unwrap_or_else(Id128::machine_id);

        if !newly_created {
            verify_header(
                &header,
                size,
                config.writable,
                sealer.is_some(),
                &host_machine_id,
            )?;
            if config.writable && backend.is_unlinked()? {
                return Err(JournalError::Deleted);
            }
        }

        let metrics = if config.writable {
            let fs_size = match backend.space() {
                Ok(space) => space.map(|s| s.total),
                Err(e) => {
                    debug!(error = %e, "failed to query filesystem size");
                    None
                }
            };
            config.metrics.fix_defaults(fs_size)
        } else {
            config.metrics.fix_defaults(None)
        };

        let compress = config.writable && header.incompatible_flags & INCOMPATIBLE_COMPRESSED_LZ4 != 0;
        let hash = HashAlgorithm::for_file(
            header.incompatible_flags & INCOMPATIBLE_KEYED_HASH != 0,
            &header.file_id,
        );
        let interval = template.map_or(config.post_change_interval, |t| t.post_change.interval());
        let feed = template.map_or_else(|| Arc::new(ChangeFeed::new()), |t| Arc::clone(&t.feed));
        let state = header.state;

        let mut file = Self {
            path,
            offline: Offline::new(Arc::clone(&backend), state),
            backend,
            header,
            writable: config.writable,
            config: config.clone(),
            metrics,
            hash,
            codec: Lz4Codec,
            compress,
            sealer,
            file_size: AtomicU64::new(size),
            chain_cache: Mutex::new(ChainCache::new()),
            last_stat: Some(Instant::now()),
            post_change: PostChange::new(interval),
            feed,
            defrag_on_close: false,
            closed: false,
        };

        if file.writable {
            debug!(
                path = ?file.path,
                max_size = metrics.max_size,
                min_size = metrics.min_size,
                keep_free = metrics.keep_free,
                "opened journal file for writing"
            );
            file.refresh_header(host_machine_id)?;

            if newly_created {
                file.setup_field_hash_table()?;
                file.setup_data_hash_table()?;
                file.append_first_tag()?;
                file.flush_header()?;
            }
        }

        if file.backend.bus_fault_seen() {
            return Err(JournalError::BusFault);
        }

        Ok(file)
    }

    fn refresh_header(&mut self, machine_id: Id128) -> JournalResult<()> {
        self.header.machine_id = machine_id;
        self.flush_header()?;
        self.set_online()?;
        self.backend.sync()?;
        Ok(())
    }

    /// Writes the in-memory header back, except for the state byte, which
    /// belongs to the offline machinery.
    pub(crate) fn flush_header(&self) -> JournalResult<()> {
        let bytes = self.header.encode();
        let end = self.header.header_size.min(HEADER_SIZE) as usize;
        self.backend.write_at(0, &bytes[..HEADER_STATE_OFFSET])?;
        self.backend.write_at(24, &bytes[24..end])?;
        Ok(())
    }

    /// Re-reads the header, picking up appends made by another writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the header can no longer be decoded, or if the
    /// file is open for writing.
    pub fn reload_header(&mut self) -> JournalResult<()> {
        if self.writable {
            return Err(JournalError::invalid_argument(
                "writers own their header and never reload it",
            ));
        }
        let size = self.backend.size()?;
        self.file_size.store(size, Ordering::SeqCst);
        let raw = self.read_bytes(0, size.min(HEADER_SIZE) as usize)?;
        self.header = Header::decode(&raw)?;
        Ok(())
    }

    /// Brings the file online, waiting for or cancelling a background
    /// offline transition.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Archived`] for archived files and
    /// [`JournalError::ReadOnly`] for readers.
    pub fn set_online(&mut self) -> JournalResult<()> {
        if !self.writable {
            return Err(JournalError::ReadOnly);
        }
        let result = self.offline.set_online();
        self.header.state = self.offline.header_state();
        result
    }

    /// Syncs the file and marks it offline, inline when `wait` is set and
    /// on a background thread otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written or a previous
    /// worker ran into a fault.
    pub fn set_offline(&mut self, wait: bool) -> JournalResult<()> {
        if !self.writable {
            return Err(JournalError::ReadOnly);
        }
        self.flush_header()?;
        let result = self.offline.set_offline(wait);
        self.header.state = self.offline.header_state();
        result
    }

    /// Waits for a background offline transition to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker ran into a fault.
    pub fn join_offline(&mut self) -> JournalResult<()> {
        let result = self.offline.join();
        self.header.state = self.offline.header_state();
        result
    }

    /// Closes the file, taking it offline synchronously.
    ///
    /// Dropping a file does the same but can only log failures.
    ///
    /// # Errors
    ///
    /// Returns the first failure of the final header write or the offline
    /// transition.
    pub fn close(mut self) -> JournalResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> JournalResult<()> {
        if self.closed || !self.writable {
            self.closed = true;
            return Ok(());
        }
        self.closed = true;

        if self.is_sealed() && self.sealer.is_some() && !self.offline.is_offlining() {
            let epoch = self.sealer.as_ref().map_or(0, |s| s.epoch());
            if let Err(e) = self.append_tag(epoch) {
                warn!(error = %e, "failed to append final tag");
            }
        }

        self.flush_post_change();

        let flushed = self.flush_header();
        let offlined = self.offline.set_offline(true);
        self.header.state = self.offline.header_state();

        if self.defrag_on_close {
            debug!(path = ?self.path, "archived journal file may benefit from defragmentation");
        }

        flushed.and(offlined)
    }

    /// Fires a coalesced change notification now, if one is pending.
    pub fn flush_post_change(&mut self) {
        if self.post_change.take_pending(Instant::now()) {
            self.fire_post_change();
        }
    }

    pub(crate) fn post_change(&mut self) {
        if self.post_change.schedule(Instant::now()) {
            self.fire_post_change();
        }
    }

    fn fire_post_change(&self) {
        if let Err(e) = self.backend.touch() {
            debug!(error = %e, "failed to nudge watchers of journal file");
        }
        self.feed.emit(ChangeEvent {
            offset: self.header.tail_entry_offset,
            seqnum: self.header.tail_entry_seqnum,
        });
    }

    /// Returns the file's path, if it has one.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the header as last written or read.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Returns `true` if the file is open for appending.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns the header state.
    #[must_use]
    pub fn state(&self) -> Option<FileState> {
        FileState::from_byte(self.header.state)
    }

    /// Returns the progress of the offline machinery.
    #[must_use]
    pub fn offline_state(&self) -> OfflineState {
        self.offline.state()
    }

    /// Returns `true` while a background offline transition runs.
    #[must_use]
    pub fn is_offlining(&self) -> bool {
        self.offline.is_offlining()
    }

    /// Returns `true` once the file was archived.
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.offline.is_archive()
    }

    /// Returns `true` if the file carries sealing tags.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.header.compatible_flags & COMPATIBLE_SEALED != 0
    }

    /// Returns `true` if new DATA payloads may be compressed.
    #[must_use]
    pub fn compresses(&self) -> bool {
        self.compress
    }

    /// Returns the hash function indexing this file.
    #[must_use]
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash
    }

    /// Returns the resolved size limits.
    #[must_use]
    pub fn metrics(&self) -> &ResolvedMetrics {
        &self.metrics
    }

    /// Returns the configuration the file was opened with.
    #[must_use]
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn n_entries(&self) -> u64 {
        self.header.n_entries
    }

    /// Returns the change feed notified after appends.
    #[must_use]
    pub fn change_feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }

    /// Returns the backing store.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Returns `true` if the file was archived and would benefit from
    /// defragmentation once closed.
    #[must_use]
    pub fn wants_defrag(&self) -> bool {
        self.defrag_on_close
    }
}

impl fmt::Debug for JournalFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalFile")
            .field("path", &self.path)
            .field("writable", &self.writable)
            .field("file_id", &self.header.file_id)
            .field("n_entries", &self.header.n_entries)
            .field("offline", &self.offline.state())
            .finish_non_exhaustive()
    }
}

impl Drop for JournalFile {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(path = ?self.path, error = %e, "failed to close journal file cleanly");
        }
    }
}

fn check_access(config: &JournalConfig) -> JournalResult<()> {
    if config.create && !config.writable {
        return Err(JournalError::invalid_argument(
            "create requires a writable file",
        ));
    }
    Ok(())
}

fn new_header(config: &JournalConfig, template: Option<&JournalFile>) -> Header {
    let file_id = Id128::random();

    let mut compatible = 0;
    if config.seal {
        compatible |= COMPATIBLE_SEALED;
    }
    let mut incompatible = 0;
    if config.compress {
        incompatible |= INCOMPATIBLE_COMPRESSED_LZ4;
    }
    if config.keyed_hash {
        incompatible |= INCOMPATIBLE_KEYED_HASH;
    }

    let (seqnum_id, tail_seqnum) = template.map_or((file_id, 0), |t| {
        (t.header.seqnum_id, t.header.tail_entry_seqnum)
    });

    let mut header = Header::new(file_id, seqnum_id, compatible, incompatible);
    header.tail_entry_seqnum = tail_seqnum;
    header
}

const TABLE_ITEMS: u64 = crate::format::hash_table::ITEMS;

fn hash_table_is_valid(offset: u64, size: u64, header: &Header) -> bool {
    if (offset == 0) != (size == 0) {
        return false;
    }
    if offset == 0 {
        return true;
    }
    if offset <= TABLE_ITEMS || !valid_offset(offset) {
        return false;
    }
    let object = offset - TABLE_ITEMS;
    if object < header.header_size {
        return false;
    }
    match size.checked_add(TABLE_ITEMS) {
        Some(total) if check_hash_table_size(total, object).is_ok() => {}
        _ => return false,
    }
    offset
        .checked_add(size)
        .is_some_and(|end| end <= header.header_size + header.arena_size)
}

fn link_is_valid(offset: u64, header: &Header, limit: u64) -> bool {
    offset == 0 || (valid_offset(offset) && offset >= header.header_size && offset <= limit)
}

fn verify_header(
    header: &Header,
    file_size: u64,
    writable: bool,
    have_sealer: bool,
    machine_id: &Id128,
) -> JournalResult<()> {
    if header.signature != HEADER_SIGNATURE {
        return Err(JournalError::malformed("bad signature"));
    }

    let unknown = header.incompatible_flags & !INCOMPATIBLE_SUPPORTED;
    if unknown != 0 {
        return Err(JournalError::unsupported(format!(
            "unknown incompatible flags {unknown:#x}"
        )));
    }
    let unknown = header.compatible_flags & !COMPATIBLE_SUPPORTED;
    if writable && unknown != 0 {
        return Err(JournalError::unsupported(format!(
            "unknown compatible flags {unknown:#x}"
        )));
    }

    let sealed = header.compatible_flags & COMPATIBLE_SEALED != 0;
    if writable && sealed && !have_sealer {
        return Err(JournalError::unsupported(
            "sealed file cannot be appended to without a sealer",
        ));
    }
    if sealed && !header.has_counters() {
        return Err(JournalError::malformed("sealed file lacks header counters"));
    }

    let arena_end = header
        .header_size
        .checked_add(header.arena_size)
        .ok_or_else(|| JournalError::malformed("arena size overflows"))?;
    if arena_end > file_size {
        return Err(JournalError::truncated(format!(
            "arena ends at {arena_end} but file holds {file_size} bytes"
        )));
    }

    if !link_is_valid(header.tail_object_offset, header, arena_end) {
        return Err(JournalError::malformed(format!(
            "invalid tail object offset {}",
            header.tail_object_offset
        )));
    }
    if !link_is_valid(header.entry_array_offset, header, header.tail_object_offset) {
        return Err(JournalError::malformed(format!(
            "invalid entry array offset {}",
            header.entry_array_offset
        )));
    }
    if !hash_table_is_valid(header.data_hash_table_offset, header.data_hash_table_size, header)
        || !hash_table_is_valid(
            header.field_hash_table_offset,
            header.field_hash_table_size,
            header,
        )
    {
        return Err(JournalError::malformed("invalid hash table location"));
    }

    if header.has_tail_entry_offset() {
        let tail = header.tail_entry_offset;
        if !link_is_valid(tail, header, header.tail_object_offset) {
            return Err(JournalError::malformed(format!(
                "invalid tail entry offset {tail}"
            )));
        }
        if tail > 0 {
            if header.tail_entry_boot_id.is_null()
                || !valid_realtime(header.head_entry_realtime)
                || !valid_realtime(header.tail_entry_realtime)
                || !valid_monotonic(header.tail_entry_monotonic)
            {
                return Err(JournalError::malformed("tail entry fields unset"));
            }
        } else if !header.tail_entry_boot_id.is_null()
            || header.head_entry_realtime != 0
            || header.tail_entry_realtime != 0
            || header.tail_entry_monotonic != 0
        {
            return Err(JournalError::malformed(
                "tail entry fields set without a tail entry",
            ));
        }
    }

    let counts = [
        header.n_entries,
        header.n_data,
        header.n_fields,
        header.n_tags,
        header.n_entry_arrays,
    ];
    if counts.iter().any(|&n| n > header.n_objects) {
        return Err(JournalError::malformed("object counters exceed object count"));
    }

    if !writable {
        return Ok(());
    }

    if !machine_id.is_null() && header.machine_id != *machine_id {
        return Err(JournalError::WrongMachine);
    }

    match header.file_state() {
        Some(FileState::Offline) => {}
        Some(FileState::Online) => {
            warn!("journal file is already online, assuming unclean shutdown");
            return Err(JournalError::Unclean);
        }
        Some(FileState::Archived) => return Err(JournalError::Archived),
        None => {
            return Err(JournalError::malformed(format!(
                "unknown state {}",
                header.state
            )))
        }
    }

    if header.data_hash_table_size == 0 || header.field_hash_table_size == 0 {
        return Err(JournalError::malformed("file has no hash tables"));
    }

    let now = now_realtime();
    if header.tail_entry_realtime > now {
        return Err(JournalError::FromTheFuture {
            tail_realtime: header.tail_entry_realtime,
            now,
        });
    }

    Ok(())
}
