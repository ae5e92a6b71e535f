//! Change feed for observing appended entries.
//!
//! Writers publish a [`ChangeEvent`] whenever a (possibly coalesced)
//! change notification fires. Readers following a file live subscribe
//! and re-scan from their last position when woken.
//!
//! # Usage
//!
//! ```rust,ignore
//! use jrnl_core::{JournalConfig, JournalFile};
//!
//! let mut file = JournalFile::open("system.journal", &JournalConfig::writer())?;
//! let receiver = file.change_feed().subscribe();
//!
//! std::thread::spawn(move || {
//!     while let Ok(event) = receiver.recv() {
//!         println!("new entries up to seqnum {}", event.seqnum);
//!     }
//! });
//! ```

use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// A change notification.
///
/// Events are emitted only after the entry they name is fully linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Offset of the newest entry at the time of the notification.
    pub offset: u64,
    /// Sequence number of that entry.
    pub seqnum: u64,
}

/// Distributes change notifications to subscribers.
///
/// A feed is shared across rotation: a file opened with another file as
/// template publishes on the template's feed.
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<ChangeEvent>>>,
    history: RwLock<Vec<ChangeEvent>>,
    max_history: usize,
}

impl ChangeFeed {
    /// Creates a new change feed.
    pub fn new() -> Self {
        Self::with_max_history(1024)
    }

    /// Creates a change feed with a specific history limit.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
        }
    }

    /// Subscribes to the change feed.
    ///
    /// Returns a receiver that will receive all future change events.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits a change event to all subscribers.
    pub fn emit(&self, event: ChangeEvent) {
        {
            let mut history = self.history.write();
            history.push(event);
            if history.len() > self.max_history {
                let to_remove = history.len() - self.max_history;
                history.drain(0..to_remove);
            }
        }

        // Drop subscribers whose receiver is gone.
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event).is_ok());
    }

    /// Returns events with a sequence number above `cursor`, up to
    /// `limit`.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<ChangeEvent> {
        let history = self.history.read();
        history
            .iter()
            .filter(|e| e.seqnum > cursor)
            .take(limit)
            .copied()
            .collect()
    }

    /// Returns the latest sequence number in history.
    pub fn latest_seqnum(&self) -> u64 {
        self.history.read().last().map_or(0, |e| e.seqnum)
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Returns the number of events in history.
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn event(seqnum: u64) -> ChangeEvent {
        ChangeEvent {
            offset: 264 + seqnum * 8,
            seqnum,
        }
    }

    #[test]
    fn emit_and_receive() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();

        feed.emit(event(1));

        let received = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(received, event(1));
    }

    #[test]
    fn multiple_subscribers() {
        let feed = ChangeFeed::new();
        let rx1 = feed.subscribe();
        let rx2 = feed.subscribe();

        feed.emit(event(1));

        assert_eq!(rx1.recv().unwrap(), event(1));
        assert_eq!(rx2.recv().unwrap(), event(1));
    }

    #[test]
    fn subscriber_cleanup() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit(event(1));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn poll_from_cursor() {
        let feed = ChangeFeed::new();
        for i in 1..=5 {
            feed.emit(event(i));
        }

        let events = feed.poll(2, 10);
        assert_eq!(
            events.iter().map(|e| e.seqnum).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        assert_eq!(feed.poll(0, 2).len(), 2);
    }

    #[test]
    fn history_truncation() {
        let feed = ChangeFeed::with_max_history(5);
        for i in 1..=10 {
            feed.emit(event(i));
        }

        assert_eq!(feed.history_len(), 5);
        assert_eq!(feed.poll(0, 100)[0].seqnum, 6);
        assert_eq!(feed.latest_seqnum(), 10);
    }

    #[test]
    fn threaded_subscribe() {
        let feed = Arc::new(ChangeFeed::new());
        let rx = feed.subscribe();

        let feed_clone = Arc::clone(&feed);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            feed_clone.emit(event(42));
        });

        let received = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(received.seqnum, 42);

        handle.join().unwrap();
    }
}
