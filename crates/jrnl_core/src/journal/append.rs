//! Appending entries and tags.

use super::JournalFile;
use crate::error::{JournalError, JournalResult};
use crate::format::{tag, EntryItem, EntryObject, ObjectType, TagObject, OBJECT_HEADER_SIZE};
use crate::hash::jenkins_hash64;
use crate::types::{
    boot_id_payload, valid_monotonic, valid_realtime, DualTimestamp, Id128, SequenceCounter,
    BOOT_ID_FIELD, TIMESTAMP_LIMIT,
};
use tracing::{debug, trace};

/// Where an appended entry landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendedEntry {
    /// Offset of the ENTRY object.
    pub offset: u64,
    /// Sequence number assigned to the entry.
    pub seqnum: u64,
}

impl JournalFile {
    /// Feeds an object to the sealer, if the file is sealed.
    pub(crate) fn hmac_put(&mut self, object_type: ObjectType, offset: u64, bytes: &[u8]) {
        if !self.is_sealed() {
            return;
        }
        if let Some(sealer) = self.sealer.as_mut() {
            sealer.hmac_put_object(object_type, offset, bytes);
        }
    }

    /// Appends an entry made of `items`, each a `FIELD=value` payload.
    ///
    /// `ts` defaults to the current time and `boot_id` to the running
    /// boot. An item `_BOOT_ID=<boot_id>` is added unless one is present.
    ///
    /// With a `seqnum` counter, the entry takes the next number of the
    /// counter's domain and the counter is advanced; a counter without a
    /// domain adopts the file's. A file with entries refuses counters of
    /// another domain.
    ///
    /// If linking the entry into the index of one of its payloads runs out
    /// of space, the remaining payloads are still linked, the entry stays
    /// in the file and [`JournalError::QuotaExceeded`] is returned.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::TimestampRegression`] if the entry would be
    /// older than the file's tail, [`JournalError::QuotaExceeded`] if the
    /// file is full, and [`JournalError::InvalidArgument`] for empty items
    /// or invalid timestamps.
    pub fn append_entry<I: AsRef<[u8]>>(
        &mut self,
        ts: Option<DualTimestamp>,
        boot_id: Option<Id128>,
        items: &[I],
        mut seqnum: Option<&mut SequenceCounter>,
    ) -> JournalResult<AppendedEntry> {
        if !self.writable {
            return Err(JournalError::ReadOnly);
        }
        if items.is_empty() {
            return Err(JournalError::invalid_argument("entry has no items"));
        }
        if items.iter().any(|item| item.as_ref().is_empty()) {
            return Err(JournalError::invalid_argument("entry has an empty item"));
        }

        let ts = ts.unwrap_or_else(DualTimestamp::now);
        if !valid_realtime(ts.realtime) || !valid_monotonic(ts.monotonic) {
            return Err(JournalError::invalid_argument(format!(
                "invalid timestamps {}/{}",
                ts.realtime, ts.monotonic
            )));
        }
        let boot_id = boot_id.unwrap_or_else(Id128::boot_id);
        if boot_id.is_null() {
            return Err(JournalError::invalid_argument("boot id is null"));
        }

        if ts.realtime < self.header.tail_entry_realtime {
            return Err(JournalError::timestamp_regression(format!(
                "realtime {} is older than tail {}",
                ts.realtime, self.header.tail_entry_realtime
            )));
        }
        if self.header.tail_entry_offset != 0
            && boot_id == self.header.tail_entry_boot_id
            && ts.monotonic < self.header.tail_entry_monotonic
        {
            return Err(JournalError::timestamp_regression(format!(
                "monotonic {} is older than tail {} of the same boot",
                ts.monotonic, self.header.tail_entry_monotonic
            )));
        }

        if let Some(counter) = seqnum.as_deref_mut() {
            if counter.id.is_null() {
                counter.id = self.header.seqnum_id;
            } else if counter.id != self.header.seqnum_id {
                if self.header.n_entries > 0 {
                    return Err(JournalError::SequenceDomainMismatch);
                }
                debug!(seqnum_id = %counter.id, "adopting sequence number domain of counter");
                self.header.seqnum_id = counter.id;
            }
        }

        self.maybe_append_tag(ts.realtime)?;

        let boot_payload = boot_id_payload(&boot_id);
        let boot_prefix = format!("{BOOT_ID_FIELD}=");
        let has_boot = items
            .iter()
            .any(|item| item.as_ref().starts_with(boot_prefix.as_bytes()));
        let payloads: Vec<&[u8]> = items
            .iter()
            .map(AsRef::as_ref)
            .chain((!has_boot).then_some(boot_payload.as_slice()))
            .collect();

        let keyed = self.hash.is_keyed();
        let mut items = Vec::with_capacity(payloads.len());
        let mut xor_hash = 0;
        for payload in &payloads {
            let (offset, hash) = self.find_or_append_data(payload)?;
            xor_hash ^= if keyed { jenkins_hash64(payload) } else { hash };
            items.push(EntryItem {
                object_offset: offset,
                hash,
            });
        }
        items.sort_unstable_by_key(|item| item.object_offset);
        items.dedup_by_key(|item| item.object_offset);

        let last = match seqnum.as_deref() {
            Some(counter) => self.header.tail_entry_seqnum.max(counter.value),
            None => self.header.tail_entry_seqnum,
        };
        let next = last
            .checked_add(1)
            .ok_or_else(|| JournalError::resource_exhausted("sequence numbers exhausted"))?;
        if let Some(counter) = seqnum {
            counter.value = next;
        }

        let entry = EntryObject {
            seqnum: next,
            realtime: ts.realtime,
            monotonic: ts.monotonic,
            boot_id,
            xor_hash,
            items,
        };
        let bytes = entry.encode();
        let offset = self.append_object(ObjectType::Entry, &bytes)?;
        self.hmac_put(ObjectType::Entry, offset, &bytes);

        self.link_entry_global(offset)?;
        self.header.tail_entry_seqnum = next;
        if self.header.head_entry_seqnum == 0 {
            self.header.head_entry_seqnum = next;
        }
        if self.header.head_entry_realtime == 0 {
            self.header.head_entry_realtime = ts.realtime;
        }
        self.header.tail_entry_realtime = ts.realtime;
        self.header.tail_entry_monotonic = ts.monotonic;
        self.header.tail_entry_boot_id = boot_id;
        self.header.tail_entry_offset = offset;

        let mut deferred = None;
        for item in &entry.items {
            match self.link_data_entry(item.object_offset, offset) {
                Ok(()) => {}
                Err(e @ JournalError::QuotaExceeded { .. }) => {
                    debug!(data = item.object_offset, "no room to index entry under payload");
                    deferred = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        self.flush_header()?;
        if self.backend.bus_fault_seen() {
            return Err(JournalError::BusFault);
        }
        self.post_change();

        trace!(offset, seqnum = next, n_items = entry.items.len(), "appended entry");
        match deferred {
            Some(e) => Err(e),
            None => Ok(AppendedEntry {
                offset,
                seqnum: next,
            }),
        }
    }

    fn maybe_append_tag(&mut self, realtime: u64) -> JournalResult<()> {
        if !self.is_sealed() {
            return Ok(());
        }
        let due = self.sealer.as_mut().and_then(|s| s.tag_due(realtime));
        match due {
            Some(epoch) => self.append_tag(epoch),
            None => Ok(()),
        }
    }

    /// Appends a TAG closing sealing epoch `epoch`.
    pub(crate) fn append_tag(&mut self, epoch: u64) -> JournalResult<()> {
        if epoch >= TIMESTAMP_LIMIT {
            return Err(JournalError::invalid_argument(format!(
                "sealing epoch {epoch} out of range"
            )));
        }
        if self.sealer.is_none() {
            return Err(JournalError::invalid_argument("file has no sealer"));
        }

        let seqnum = self.header.n_tags + 1;
        let tag_object = TagObject {
            seqnum,
            epoch,
            tag: [0; crate::seal::TAG_LENGTH],
        };
        let bytes = tag_object.encode();
        let offset = self.append_object(ObjectType::Tag, &bytes)?;
        self.header.n_tags = seqnum;

        self.hmac_put(ObjectType::Tag, offset, &bytes[..tag::TAG as usize]);
        let digest = match self.sealer.as_mut() {
            Some(sealer) => sealer.finish_tag(seqnum, epoch),
            None => return Err(JournalError::invalid_argument("file has no sealer")),
        };
        self.backend.write_at(offset + tag::TAG, &digest)?;

        debug!(seqnum, epoch, "appended tag");
        Ok(())
    }

    /// Authenticates the hash tables of a new sealed file and tags them.
    pub(crate) fn append_first_tag(&mut self) -> JournalResult<()> {
        if !self.is_sealed() || self.sealer.is_none() {
            return Ok(());
        }

        for (table_type, items) in [
            (ObjectType::FieldHashTable, self.header.field_hash_table_offset),
            (ObjectType::DataHashTable, self.header.data_hash_table_offset),
        ] {
            let object = items - OBJECT_HEADER_SIZE;
            let raw = self.read_bytes(object, OBJECT_HEADER_SIZE as usize)?;
            self.hmac_put(table_type, object, &raw);
        }

        let epoch = self.sealer.as_ref().map_or(0, |s| s.epoch());
        self.append_tag(epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JournalConfig, JournalMetrics};
    use crate::seal::{Sealer, TAG_LENGTH};
    use crate::types::Direction;
    use jrnl_storage::InMemoryBackend;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn config() -> JournalConfig {
        JournalConfig::writer()
            .machine_id(Id128::from_bytes([7; 16]))
            .metrics(JournalMetrics::new().max_size(8 << 20).keep_free(0))
    }

    fn open(config: &JournalConfig) -> JournalFile {
        JournalFile::open_backend(Arc::new(InMemoryBackend::new()), None, config, None, None)
            .unwrap()
    }

    const BOOT: Id128 = Id128::from_bytes([3; 16]);

    fn ts(realtime: u64) -> Option<DualTimestamp> {
        Some(DualTimestamp::new(realtime, realtime))
    }

    #[test]
    fn entry_fields_and_header() {
        let mut file = open(&config());
        let appended = file
            .append_entry(ts(1_000), Some(BOOT), &["MESSAGE=hi", "PRIORITY=6"], None)
            .unwrap();

        assert_eq!(appended.seqnum, 1);
        let entry = file.read_entry(appended.offset).unwrap();
        assert_eq!(entry.realtime, 1_000);
        assert_eq!(entry.boot_id, BOOT);
        // MESSAGE, PRIORITY and the implied _BOOT_ID.
        assert_eq!(entry.items.len(), 3);
        assert!(entry
            .items
            .windows(2)
            .all(|w| w[0].object_offset < w[1].object_offset));

        let header = file.header();
        assert_eq!(header.n_entries, 1);
        assert_eq!(header.head_entry_seqnum, 1);
        assert_eq!(header.tail_entry_seqnum, 1);
        assert_eq!(header.head_entry_realtime, 1_000);
        assert_eq!(header.tail_entry_offset, appended.offset);
        assert_eq!(header.tail_entry_boot_id, BOOT);
    }

    #[test]
    fn explicit_boot_id_item_kept() {
        let mut file = open(&config());
        let boot = boot_id_payload(&BOOT);
        let appended = file
            .append_entry(ts(1), Some(BOOT), &[boot.clone(), b"A=1".to_vec()], None)
            .unwrap();

        assert_eq!(file.read_entry(appended.offset).unwrap().items.len(), 2);
    }

    #[test]
    fn duplicate_items_collapse() {
        let mut file = open(&config());
        let appended = file
            .append_entry(ts(1), Some(BOOT), &["A=1", "A=1", "B=2"], None)
            .unwrap();

        let entry = file.read_entry(appended.offset).unwrap();
        assert_eq!(entry.items.len(), 3);
        assert_eq!(file.header().n_data, 3);
    }

    #[test]
    fn xor_hash_uses_unkeyed_hash() {
        let mut file = open(&config());
        assert!(file.hash_algorithm().is_keyed());
        let appended = file
            .append_entry(ts(1), Some(BOOT), &["A=1", "B=2"], None)
            .unwrap();

        let expected = jenkins_hash64(b"A=1")
            ^ jenkins_hash64(b"B=2")
            ^ jenkins_hash64(&boot_id_payload(&BOOT));
        assert_eq!(file.read_entry(appended.offset).unwrap().xor_hash, expected);
    }

    #[test]
    fn xor_hash_covers_repeated_items() {
        let mut file = open(&config());
        let repeated = file
            .append_entry(ts(1), Some(BOOT), &["A=1", "A=1"], None)
            .unwrap();
        let single = file
            .append_entry(ts(2), Some(BOOT), &["A=1"], None)
            .unwrap();

        let repeated = file.read_entry(repeated.offset).unwrap();
        let single = file.read_entry(single.offset).unwrap();
        assert_eq!(repeated.items, single.items);
        assert_eq!(repeated.xor_hash, jenkins_hash64(&boot_id_payload(&BOOT)));
        assert_ne!(repeated.xor_hash, single.xor_hash);
    }

    #[test]
    fn exhausted_sequence_numbers_refused() {
        let mut file = open(&config());
        let mut counter = SequenceCounter {
            value: u64::MAX,
            ..SequenceCounter::default()
        };

        assert!(matches!(
            file.append_entry(ts(1), Some(BOOT), &["A=1"], Some(&mut counter)),
            Err(JournalError::ResourceExhausted { .. })
        ));
        assert_eq!(file.header().n_entries, 0);
        assert_eq!(counter.value, u64::MAX);
    }

    #[test]
    fn invalid_input_rejected() {
        let mut file = open(&config());
        let empty: [&str; 0] = [];

        assert!(matches!(
            file.append_entry(ts(1), Some(BOOT), &empty, None),
            Err(JournalError::InvalidArgument { .. })
        ));
        assert!(matches!(
            file.append_entry(ts(1), Some(BOOT), &["A=1", ""], None),
            Err(JournalError::InvalidArgument { .. })
        ));
        assert!(matches!(
            file.append_entry(ts(0), Some(BOOT), &["A=1"], None),
            Err(JournalError::InvalidArgument { .. })
        ));
        assert!(matches!(
            file.append_entry(ts(1), Some(Id128::NULL), &["A=1"], None),
            Err(JournalError::InvalidArgument { .. })
        ));
        assert_eq!(file.header().n_entries, 0);
    }

    #[test]
    fn timestamps_must_not_regress() {
        let mut file = open(&config());
        file.append_entry(ts(100), Some(BOOT), &["A=1"], None)
            .unwrap();

        assert!(matches!(
            file.append_entry(ts(99), Some(BOOT), &["A=1"], None),
            Err(JournalError::TimestampRegression { .. })
        ));
        assert!(matches!(
            file.append_entry(
                Some(DualTimestamp::new(200, 50)),
                Some(BOOT),
                &["A=1"],
                None
            ),
            Err(JournalError::TimestampRegression { .. })
        ));

        // A new boot restarts monotonic time.
        let other = Id128::from_bytes([4; 16]);
        file.append_entry(Some(DualTimestamp::new(200, 50)), Some(other), &["A=1"], None)
            .unwrap();
        assert_eq!(file.header().n_entries, 2);
    }

    #[test]
    fn counter_spans_files() {
        let mut counter = SequenceCounter::default();
        let mut a = open(&config());
        a.append_entry(ts(1), Some(BOOT), &["A=1"], Some(&mut counter))
            .unwrap();
        a.append_entry(ts(2), Some(BOOT), &["A=1"], Some(&mut counter))
            .unwrap();
        assert_eq!(counter.id, a.header().seqnum_id);
        assert_eq!(counter.value, 2);

        let mut b = open(&config());
        let appended = b
            .append_entry(ts(3), Some(BOOT), &["A=1"], Some(&mut counter))
            .unwrap();
        assert_eq!(appended.seqnum, 3);
        assert_eq!(b.header().seqnum_id, a.header().seqnum_id);

        let mut stranger = SequenceCounter::new();
        assert!(matches!(
            b.append_entry(ts(4), Some(BOOT), &["A=1"], Some(&mut stranger)),
            Err(JournalError::SequenceDomainMismatch)
        ));
    }

    #[test]
    fn counter_gaps_are_kept() {
        let mut file = open(&config());
        let mut counter = SequenceCounter::default();
        file.append_entry(ts(1), Some(BOOT), &["A=1"], Some(&mut counter))
            .unwrap();
        counter.value = 10;
        let appended = file
            .append_entry(ts(2), Some(BOOT), &["A=1"], Some(&mut counter))
            .unwrap();
        assert_eq!(appended.seqnum, 11);
    }

    #[test]
    fn readers_cannot_append() {
        let backend = Arc::new(InMemoryBackend::new());
        JournalFile::open_backend(backend.clone(), None, &config(), None, None)
            .unwrap()
            .close()
            .unwrap();
        let mut reader =
            JournalFile::open_backend(backend, None, &JournalConfig::new(), None, None).unwrap();

        assert!(matches!(
            reader.append_entry(ts(1), Some(BOOT), &["A=1"], None),
            Err(JournalError::ReadOnly)
        ));
    }

    #[test]
    fn full_file_reports_quota() {
        let config = JournalConfig::writer()
            .machine_id(Id128::from_bytes([7; 16]))
            .compress(false)
            .metrics(JournalMetrics::new().max_size(1 << 20).keep_free(0));
        let mut file = open(&config);
        let big = format!("BLOB={}", "x".repeat(64 << 10));

        let mut result = Ok(());
        for i in 0..32 {
            result = file
                .append_entry(ts(i + 1), Some(BOOT), &[format!("{big}{i}")], None)
                .map(|_| ());
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(JournalError::QuotaExceeded { .. })));

        // Entries appended before the limit stay readable.
        let (_, first) = file.next_entry(0, Direction::Down).unwrap().unwrap();
        assert_eq!(first.seqnum, 1);
    }

    #[derive(Default)]
    struct Recorded {
        puts: Vec<(ObjectType, u64)>,
        tags: Vec<(u64, u64)>,
    }

    struct RecordingSealer {
        log: Arc<Mutex<Recorded>>,
        epoch: u64,
        interval: u64,
    }

    impl Sealer for RecordingSealer {
        fn hmac_put_object(&mut self, object_type: ObjectType, offset: u64, _bytes: &[u8]) {
            self.log.lock().puts.push((object_type, offset));
        }

        fn tag_due(&mut self, realtime: u64) -> Option<u64> {
            let epoch = realtime / self.interval;
            if epoch > self.epoch {
                let closing = self.epoch;
                self.epoch = epoch;
                Some(closing)
            } else {
                None
            }
        }

        fn epoch(&self) -> u64 {
            self.epoch
        }

        fn finish_tag(&mut self, seqnum: u64, epoch: u64) -> [u8; TAG_LENGTH] {
            self.log.lock().tags.push((seqnum, epoch));
            [seqnum as u8; TAG_LENGTH]
        }
    }

    #[test]
    fn sealed_file_tags_epochs() {
        let log = Arc::new(Mutex::new(Recorded::default()));
        let sealer = RecordingSealer {
            log: Arc::clone(&log),
            epoch: 0,
            interval: 1_000,
        };
        let backend = Arc::new(InMemoryBackend::new());
        let mut file = JournalFile::open_backend(
            backend,
            None,
            &config().seal(true),
            None,
            Some(Box::new(sealer)),
        )
        .unwrap();

        assert_eq!(file.header().n_tags, 1);
        {
            let log = log.lock();
            assert_eq!(log.puts[0].0, ObjectType::FieldHashTable);
            assert_eq!(log.puts[1].0, ObjectType::DataHashTable);
            assert_eq!(log.tags, vec![(1, 0)]);
        }

        file.append_entry(ts(10), Some(BOOT), &["A=1"], None)
            .unwrap();
        assert_eq!(file.header().n_tags, 1);

        file.append_entry(ts(2_500), Some(BOOT), &["A=1"], None)
            .unwrap();
        assert_eq!(file.header().n_tags, 2);
        assert_eq!(log.lock().tags[1], (2, 0));

        assert!(log
            .lock()
            .puts
            .iter()
            .any(|(t, _)| *t == ObjectType::Entry));

        file.close().unwrap();
        assert_eq!(log.lock().tags.last().copied(), Some((3, 2)));
    }
}
