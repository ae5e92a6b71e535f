//! Cross-crate integration test helpers.
//!
//! Provides a harness that remembers everything appended to a journal
//! and checks the file against it, plus a JSON export of a file's
//! entries for snapshot-style assertions.

use crate::fixtures::{test_config, TEST_BOOT_ID};
use jrnl_core::{
    boot_id_payload, Direction, DualTimestamp, JournalFile, JournalResult, SequenceCounter,
};
use jrnl_storage::InMemoryBackend;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// An entry as the harness expects to find it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedEntry {
    /// Offset the append returned.
    pub offset: u64,
    /// Wall-clock time.
    pub realtime: u64,
    /// Distinct payloads, including the implicit boot id.
    pub payloads: BTreeSet<Vec<u8>>,
}

/// A test harness for integration testing.
pub struct IntegrationHarness {
    /// The journal, open for writing.
    pub file: JournalFile,
    /// Backend the journal lives on.
    pub backend: Arc<InMemoryBackend>,
    /// Sequence counter shared by every append.
    pub counter: SequenceCounter,
    entries: BTreeMap<u64, ExpectedEntry>,
    realtime: u64,
}

impl IntegrationHarness {
    /// Creates a new integration harness with an in-memory journal.
    pub fn new() -> Self {
        let backend = Arc::new(InMemoryBackend::new());
        let file = JournalFile::open_backend(backend.clone(), None, &test_config(), None, None)
            .expect("Failed to open journal");
        Self {
            file,
            backend,
            counter: SequenceCounter::default(),
            entries: BTreeMap::new(),
            realtime: 1_000_000,
        }
    }

    /// Appends an entry and tracks it for later verification. Returns its
    /// sequence number.
    pub fn append<I: AsRef<[u8]>>(&mut self, items: &[I]) -> u64 {
        self.realtime += 1_000;
        let ts = DualTimestamp::new(self.realtime, self.realtime - 1_000_000);
        let appended = self
            .file
            .append_entry(Some(ts), Some(TEST_BOOT_ID), items, Some(&mut self.counter))
            .expect("Failed to append entry");

        let mut payloads: BTreeSet<Vec<u8>> =
            items.iter().map(|i| i.as_ref().to_vec()).collect();
        payloads.insert(boot_id_payload(&TEST_BOOT_ID));

        self.entries.insert(
            appended.seqnum,
            ExpectedEntry {
                offset: appended.offset,
                realtime: self.realtime,
                payloads,
            },
        );
        appended.seqnum
    }

    /// Skips `n` sequence numbers, as if another file had taken them.
    pub fn skip_seqnums(&mut self, n: u64) {
        self.counter.value += n;
    }

    /// Looks up an entry by sequence number and verifies it matches the
    /// tracked value.
    pub fn get_and_verify(&self, seqnum: u64) -> Option<ExpectedEntry> {
        let found = self
            .file
            .move_to_entry_by_seqnum(seqnum, Direction::Down)
            .expect("Failed to look up entry");

        let expected = self.entries.get(&seqnum)?;
        let (offset, entry) = found.expect("Tracked entry missing");
        assert_eq!(entry.seqnum, seqnum, "Wrong entry for seqnum {seqnum}");
        assert_eq!(offset, expected.offset, "Offset mismatch for seqnum {seqnum}");
        assert_eq!(entry.realtime, expected.realtime);

        let payloads: BTreeSet<Vec<u8>> = self
            .file
            .entry_payloads(&entry)
            .expect("Failed to read payloads")
            .into_iter()
            .collect();
        assert_eq!(payloads, expected.payloads, "Payload mismatch for seqnum {seqnum}");
        Some(expected.clone())
    }

    /// Verifies all tracked entries are in the journal, in order, and
    /// that every payload's entry chain lists exactly the tracked entries
    /// carrying it.
    pub fn verify_all(&self) {
        let mut p = 0;
        let mut seen = Vec::new();
        while let Some((offset, entry)) = self
            .file
            .next_entry(p, Direction::Down)
            .expect("Failed to walk entries")
        {
            seen.push(entry.seqnum);
            p = offset;
        }
        let tracked: Vec<u64> = self.entries.keys().copied().collect();
        assert_eq!(seen, tracked, "Entry sequence mismatch");

        for seqnum in &tracked {
            self.get_and_verify(*seqnum);
        }

        let mut by_payload: BTreeMap<&[u8], Vec<u64>> = BTreeMap::new();
        for (seqnum, expected) in &self.entries {
            for payload in &expected.payloads {
                by_payload.entry(payload.as_slice()).or_default().push(*seqnum);
            }
        }
        for (payload, seqnums) in by_payload {
            let (data, _) = self
                .file
                .find_data_object(payload)
                .expect("Failed to look up payload")
                .expect("Tracked payload missing");
            let mut p = 0;
            let mut linked = Vec::new();
            while let Some((offset, entry)) = self
                .file
                .next_entry_for_data(data, p, Direction::Down)
                .expect("Failed to walk payload entries")
            {
                linked.push(entry.seqnum);
                p = offset;
            }
            assert_eq!(linked, seqnums, "Entry chain mismatch for {payload:?}");
        }
    }

    /// Returns the count of tracked entries.
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// One entry in a JSON export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportedEntry {
    /// Sequence number.
    pub seqnum: u64,
    /// Wall-clock time in microseconds.
    pub realtime: u64,
    /// Monotonic time in microseconds.
    pub monotonic: u64,
    /// Boot id in hex.
    pub boot_id: String,
    /// Field values; repeated fields keep every value.
    pub fields: BTreeMap<String, Vec<String>>,
}

/// Exports every entry of `file`, oldest first.
///
/// # Errors
///
/// Returns an error if an entry or payload cannot be read.
pub fn export_entries(file: &JournalFile) -> JournalResult<Vec<ExportedEntry>> {
    let mut exported = Vec::new();
    let mut p = 0;
    while let Some((offset, entry)) = file.next_entry(p, Direction::Down)? {
        let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for payload in file.entry_payloads(&entry)? {
            let text = String::from_utf8_lossy(&payload).into_owned();
            let (name, value) = text.split_once('=').unwrap_or((text.as_str(), ""));
            fields
                .entry(name.to_string())
                .or_default()
                .push(value.to_string());
        }
        exported.push(ExportedEntry {
            seqnum: entry.seqnum,
            realtime: entry.realtime,
            monotonic: entry.monotonic,
            boot_id: entry.boot_id.to_hex(),
            fields,
        });
        p = offset;
    }
    Ok(exported)
}

/// Exports every entry of `file` as a JSON array.
///
/// # Errors
///
/// Returns an error if an entry or payload cannot be read.
pub fn export_json(file: &JournalFile) -> JournalResult<serde_json::Value> {
    let entries = export_entries(file)?;
    Ok(serde_json::to_value(entries).unwrap_or(serde_json::Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_and_verifies_entries() {
        let mut harness = IntegrationHarness::new();
        for i in 0..50 {
            harness.append(&[format!("MESSAGE=m{i}"), format!("SHARD={}", i % 4)]);
        }
        assert_eq!(harness.tracked_count(), 50);
        harness.verify_all();
    }

    #[test]
    fn verifies_across_sequence_gaps() {
        let mut harness = IntegrationHarness::new();
        harness.append(&["MESSAGE=a"]);
        harness.skip_seqnums(10);
        let seqnum = harness.append(&["MESSAGE=b"]);
        assert_eq!(seqnum, 12);
        harness.verify_all();
        assert!(harness.get_and_verify(5).is_none());
    }

    #[test]
    fn json_export_lists_fields() {
        let mut harness = IntegrationHarness::new();
        harness.append(&["MESSAGE=hello", "TAG=x", "TAG=y"]);

        let json = export_json(&harness.file).unwrap();
        let entry = &json[0];
        assert_eq!(entry["seqnum"], 1);
        assert_eq!(entry["fields"]["MESSAGE"][0], "hello");
        assert_eq!(entry["fields"]["TAG"].as_array().unwrap().len(), 2);
        assert_eq!(entry["boot_id"], TEST_BOOT_ID.to_hex());
        assert_eq!(
            entry["fields"]["_BOOT_ID"][0],
            serde_json::Value::String(TEST_BOOT_ID.to_hex())
        );
    }
}
