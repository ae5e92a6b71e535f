//! The online/offline state machine.
//!
//! Taking a file offline means syncing it, flipping the header state to
//! OFFLINE (or ARCHIVED) and syncing again. That can run inline or on a
//! worker thread. The owning thread and the worker coordinate through one
//! atomic byte with compare-and-swap transitions only:
//!
//! ```text
//!            spawn                 synced                 state written
//! JOINED ----------> SYNCING ------------> OFFLINING -------------------> DONE
//!                     |   ^                   |                            |
//!              cancel |   | restart   restart |                       join |
//!                     v   |                   v                            v
//!                   CANCEL <--- cancel --- AGAIN_FROM_OFFLINING         JOINED
//!                     |
//!           restart   +----> AGAIN_FROM_SYNCING ---> SYNCING
//! ```
//!
//! A second offline request while a worker is in flight is folded into
//! that worker through the `AGAIN_*` states, so there is never more than
//! one worker per file and no request is lost. Going online cancels a
//! worker that has not written the header yet, and otherwise waits for it.

use crate::error::{JournalError, JournalResult};
use crate::format::{FileState, HEADER_STATE_OFFSET};
use jrnl_storage::StorageBackend;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Progress of taking a file offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OfflineState {
    /// No worker exists.
    Joined = 0,
    /// The worker is syncing data.
    Syncing = 1,
    /// The worker is writing the offline header state.
    Offlining = 2,
    /// The owner went online while the worker was syncing.
    Cancel = 3,
    /// A new offline request arrived while syncing.
    AgainFromSyncing = 4,
    /// A new offline request arrived while offlining.
    AgainFromOfflining = 5,
    /// The worker finished and awaits joining.
    Done = 6,
}

impl OfflineState {
    fn from_byte(b: u8) -> Self {
        match b {
            1 => Self::Syncing,
            2 => Self::Offlining,
            3 => Self::Cancel,
            4 => Self::AgainFromSyncing,
            5 => Self::AgainFromOfflining,
            6 => Self::Done,
            _ => Self::Joined,
        }
    }
}

/// State shared between a file and its offline worker.
pub(crate) struct OfflineShared {
    state: AtomicU8,
    header_state: AtomicU8,
    archive: AtomicBool,
    backend: Arc<dyn StorageBackend>,
}

impl OfflineShared {
    fn load(&self) -> OfflineState {
        OfflineState::from_byte(self.state.load(Ordering::SeqCst))
    }

    fn store(&self, state: OfflineState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: OfflineState, to: OfflineState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn target_state(&self) -> FileState {
        if self.archive.load(Ordering::SeqCst) {
            FileState::Archived
        } else {
            FileState::Offline
        }
    }

    fn write_header_state(&self, state: FileState) -> JournalResult<()> {
        self.backend
            .write_at(HEADER_STATE_OFFSET as u64, &[state.as_byte()])?;
        self.header_state.store(state.as_byte(), Ordering::SeqCst);
        Ok(())
    }

    /// Runs the offline sequence until done, cancelled or restarted into
    /// another round.
    fn run(&self) {
        loop {
            match self.load() {
                OfflineState::Cancel => {
                    if !self.transition(OfflineState::Cancel, OfflineState::Done) {
                        continue;
                    }
                    return;
                }
                OfflineState::AgainFromSyncing => {
                    if !self.transition(OfflineState::AgainFromSyncing, OfflineState::Syncing) {
                        continue;
                    }
                }
                OfflineState::AgainFromOfflining => {
                    if !self.transition(OfflineState::AgainFromOfflining, OfflineState::Syncing) {
                        continue;
                    }
                }
                OfflineState::Syncing => {
                    if let Err(e) = self.backend.sync() {
                        warn!(error = %e, "failed to sync journal file before offlining");
                    }

                    if !self.transition(OfflineState::Syncing, OfflineState::Offlining) {
                        continue;
                    }

                    let target = self.target_state();
                    if let Err(e) = self.write_header_state(target) {
                        warn!(error = %e, "failed to write journal header state");
                    }
                    if let Err(e) = self.backend.sync() {
                        warn!(error = %e, "failed to sync journal header state");
                    }
                }
                OfflineState::Offlining => {
                    if !self.transition(OfflineState::Offlining, OfflineState::Done) {
                        continue;
                    }
                    return;
                }
                OfflineState::Done => return,
                OfflineState::Joined => {
                    debug!("offline sequence started in joined state");
                    return;
                }
            }
        }
    }

    /// Folds a new offline request into an in-flight worker.
    ///
    /// Returns `true` if a worker will pick the request up.
    fn try_restart(&self) -> bool {
        loop {
            match self.load() {
                OfflineState::AgainFromSyncing | OfflineState::AgainFromOfflining => return true,
                OfflineState::Cancel => {
                    if !self.transition(OfflineState::Cancel, OfflineState::AgainFromSyncing) {
                        continue;
                    }
                    return true;
                }
                OfflineState::Syncing => {
                    if !self.transition(OfflineState::Syncing, OfflineState::AgainFromSyncing) {
                        continue;
                    }
                    return true;
                }
                OfflineState::Offlining => {
                    if !self.transition(OfflineState::Offlining, OfflineState::AgainFromOfflining)
                    {
                        continue;
                    }
                    return true;
                }
                OfflineState::Done | OfflineState::Joined => return false,
            }
        }
    }
}

/// The owning side of the state machine.
pub(crate) struct Offline {
    shared: Arc<OfflineShared>,
    worker: Option<JoinHandle<()>>,
}

impl Offline {
    pub fn new(backend: Arc<dyn StorageBackend>, header_state: u8) -> Self {
        Self {
            shared: Arc::new(OfflineShared {
                state: AtomicU8::new(OfflineState::Joined as u8),
                header_state: AtomicU8::new(header_state),
                archive: AtomicBool::new(false),
                backend,
            }),
            worker: None,
        }
    }

    pub fn state(&self) -> OfflineState {
        self.shared.load()
    }

    /// The header state byte as last written.
    pub fn header_state(&self) -> u8 {
        self.shared.header_state.load(Ordering::SeqCst)
    }

    pub fn set_archive(&self) {
        self.shared.archive.store(true, Ordering::SeqCst);
    }

    pub fn is_archive(&self) -> bool {
        self.shared.archive.load(Ordering::SeqCst)
    }

    /// Returns `true` while a worker has not finished.
    pub fn is_offlining(&self) -> bool {
        !matches!(
            self.shared.load(),
            OfflineState::Done | OfflineState::Joined
        )
    }

    /// Waits for the worker, if any, and reports a fault it may have run
    /// into.
    pub fn join(&mut self) -> JournalResult<()> {
        if self.shared.load() == OfflineState::Joined {
            return Ok(());
        }

        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "offline worker panicked"))?;
        }
        self.shared.store(OfflineState::Joined);

        if self.shared.backend.bus_fault_seen() {
            return Err(JournalError::BusFault);
        }
        Ok(())
    }

    /// Takes the file offline, inline when `wait` is set and on a worker
    /// thread otherwise.
    pub fn set_offline(&mut self, wait: bool) -> JournalResult<()> {
        let target = self.shared.target_state();

        // A worker in flight may still rewrite the header state, so only
        // trust the header once nothing is offlining.
        if !self.is_offlining() && self.header_state() == target.as_byte() {
            return self.join();
        }

        let restarted = self.shared.try_restart();
        if !restarted || wait {
            self.join()?;
        }
        if restarted {
            return Ok(());
        }

        self.shared.store(OfflineState::Syncing);

        if wait {
            self.shared.run();
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("journal-offline".into())
            .spawn(move || shared.run());

        match spawned {
            Ok(handle) => {
                debug!("spawned journal offline worker");
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.store(OfflineState::Joined);
                Err(e.into())
            }
        }
    }

    /// Brings the file online, cancelling or waiting for any worker.
    pub fn set_online(&mut self) -> JournalResult<()> {
        loop {
            match self.shared.load() {
                OfflineState::Joined => break,
                OfflineState::Syncing => {
                    if !self
                        .shared
                        .transition(OfflineState::Syncing, OfflineState::Cancel)
                    {
                        continue;
                    }
                    break;
                }
                OfflineState::AgainFromSyncing => {
                    if !self
                        .shared
                        .transition(OfflineState::AgainFromSyncing, OfflineState::Cancel)
                    {
                        continue;
                    }
                    break;
                }
                OfflineState::AgainFromOfflining => {
                    if !self
                        .shared
                        .transition(OfflineState::AgainFromOfflining, OfflineState::Cancel)
                    {
                        continue;
                    }
                    // The header may be mid-rewrite; wait for the worker.
                    self.join()?;
                    break;
                }
                OfflineState::Offlining | OfflineState::Cancel | OfflineState::Done => {
                    self.join()?;
                    break;
                }
            }
        }

        if self.shared.backend.bus_fault_seen() {
            return Err(JournalError::BusFault);
        }

        match FileState::from_byte(self.header_state()) {
            Some(FileState::Online) => Ok(()),
            Some(FileState::Offline) => {
                self.shared.write_header_state(FileState::Online)?;
                self.shared.backend.sync()?;
                Ok(())
            }
            Some(FileState::Archived) => Err(JournalError::Archived),
            None => Err(JournalError::malformed(format!(
                "unknown header state {}",
                self.header_state()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jrnl_storage::InMemoryBackend;

    fn setup() -> (Arc<InMemoryBackend>, Offline) {
        let backend = Arc::new(InMemoryBackend::with_data(vec![0u8; 64]));
        let offline = Offline::new(backend.clone(), FileState::Offline.as_byte());
        (backend, offline)
    }

    #[test]
    fn online_then_offline_inline() {
        let (backend, mut offline) = setup();

        offline.set_online().unwrap();
        assert_eq!(backend.data()[16], FileState::Online.as_byte());

        offline.set_offline(true).unwrap();
        assert_eq!(backend.data()[16], FileState::Offline.as_byte());
        assert_eq!(offline.state(), OfflineState::Done);

        offline.join().unwrap();
        assert_eq!(offline.state(), OfflineState::Joined);
    }

    #[test]
    fn background_offline_joins() {
        let (backend, mut offline) = setup();
        offline.set_online().unwrap();

        offline.set_offline(false).unwrap();
        offline.join().unwrap();

        assert_eq!(offline.state(), OfflineState::Joined);
        assert_eq!(backend.data()[16], FileState::Offline.as_byte());
        assert!(backend.sync_count() >= 2);
    }

    #[test]
    fn double_background_offline_single_result() {
        let (backend, mut offline) = setup();
        offline.set_online().unwrap();

        offline.set_offline(false).unwrap();
        offline.set_offline(false).unwrap();
        offline.set_offline(true).unwrap();

        assert_eq!(offline.state(), OfflineState::Joined);
        assert!(!offline.is_offlining());
        assert_eq!(backend.data()[16], FileState::Offline.as_byte());
    }

    #[test]
    fn online_after_background_offline() {
        let (backend, mut offline) = setup();
        offline.set_online().unwrap();

        offline.set_offline(false).unwrap();
        offline.set_online().unwrap();

        // Either the worker was cancelled before writing, or it finished
        // and the header was flipped back; in both cases we are online.
        assert_eq!(backend.data()[16], FileState::Online.as_byte());
        offline.set_offline(true).unwrap();
        assert_eq!(backend.data()[16], FileState::Offline.as_byte());
        offline.join().unwrap();
    }

    #[test]
    fn archive_records_archived() {
        let (backend, mut offline) = setup();
        offline.set_online().unwrap();
        offline.set_archive();

        offline.set_offline(true).unwrap();
        assert_eq!(backend.data()[16], FileState::Archived.as_byte());
        assert!(matches!(offline.set_online(), Err(JournalError::Archived)));
    }

    #[test]
    fn restart_states() {
        let (_backend, offline) = setup();

        offline.shared.store(OfflineState::Syncing);
        assert!(offline.shared.try_restart());
        assert_eq!(offline.state(), OfflineState::AgainFromSyncing);

        offline.shared.store(OfflineState::Offlining);
        assert!(offline.shared.try_restart());
        assert_eq!(offline.state(), OfflineState::AgainFromOfflining);

        offline.shared.store(OfflineState::Cancel);
        assert!(offline.shared.try_restart());
        assert_eq!(offline.state(), OfflineState::AgainFromSyncing);

        offline.shared.store(OfflineState::Done);
        assert!(!offline.shared.try_restart());
    }

    #[test]
    fn cancelled_worker_leaves_header_alone() {
        let (backend, offline) = setup();
        offline.shared.write_header_state(FileState::Online).unwrap();

        offline.shared.store(OfflineState::Cancel);
        offline.shared.run();

        assert_eq!(offline.state(), OfflineState::Done);
        assert_eq!(backend.data()[16], FileState::Online.as_byte());
    }

    #[test]
    fn join_reports_fault() {
        let (backend, mut offline) = setup();
        offline.set_online().unwrap();
        offline.set_offline(false).unwrap();
        backend.inject_fault();

        assert!(matches!(offline.join(), Err(JournalError::BusFault)));
        assert_eq!(offline.state(), OfflineState::Joined);
    }
}
