//! Entry array chains.
//!
//! An entry array chain is a singly linked list of ENTRY_ARRAY objects
//! holding entry offsets in append order. Each new link is about twice the
//! size of the previous one, so a chain of `n` entries has `O(log n)`
//! links.
//!
//! DATA objects index their entries "plus one": the first entry lives
//! inline in the object and only the rest go into a chain.

use super::chain_cache::ChainCacheItem;
use super::JournalFile;
use crate::error::{JournalError, JournalResult};
use crate::format::{data, entry_array, read_u64, valid_offset, EntryArrayObject, ObjectType};

/// Smallest link ever allocated.
const ENTRY_ARRAY_MIN_CAPACITY: u64 = 4;

/// The fixed part of one link.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArrayLink {
    pub next: u64,
    pub capacity: u64,
}

/// The entry-indexing fields of a DATA object.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DataEntries {
    pub entry_offset: u64,
    pub entry_array_offset: u64,
    pub n_entries: u64,
}

impl JournalFile {
    pub(crate) fn read_array_link(&self, offset: u64) -> JournalResult<ArrayLink> {
        let header = self.read_object_header(offset, ObjectType::EntryArray)?;
        let raw = self.read_bytes(offset + entry_array::NEXT_ENTRY_ARRAY_OFFSET, 8)?;
        let next = read_u64(&raw, 0);

        if next != 0 && (!valid_offset(next) || next <= offset) {
            return Err(JournalError::malformed(format!(
                "entry array at {offset} links back to {next}"
            )));
        }

        Ok(ArrayLink {
            next,
            capacity: EntryArrayObject::capacity_for_size(header.size),
        })
    }

    pub(crate) fn read_array_item(&self, link: u64, index: u64) -> JournalResult<u64> {
        let raw = self.read_bytes(
            link + entry_array::ITEMS + index * entry_array::ITEM_SIZE,
            entry_array::ITEM_SIZE as usize,
        )?;
        Ok(read_u64(&raw, 0))
    }

    pub(crate) fn read_data_entries(&self, data_offset: u64) -> JournalResult<DataEntries> {
        self.read_object_header(data_offset, ObjectType::Data)?;
        let raw = self.read_bytes(data_offset + data::ENTRY_OFFSET, 24)?;
        Ok(DataEntries {
            entry_offset: read_u64(&raw, 0),
            entry_array_offset: read_u64(&raw, 8),
            n_entries: read_u64(&raw, 16),
        })
    }

    /// Stores `p` at index `idx` of the chain starting at `first`,
    /// appending a link if the chain is full. Returns the (possibly new)
    /// first link.
    pub(crate) fn link_entry_into_array(
        &mut self,
        first: u64,
        idx: u64,
        p: u64,
    ) -> JournalResult<u64> {
        let mut a = first;
        let mut i = idx;
        let mut before = 0;
        let mut last = 0;
        let mut n_last = 0;

        if first != 0 {
            if let Some(ci) = self.chain_cache.lock().get(first) {
                if ci.total <= idx {
                    a = ci.array;
                    i = idx - ci.total;
                    before = ci.total;
                }
            }
        }

        while a > 0 {
            let link = self.read_array_link(a)?;
            if i < link.capacity {
                self.write_u64_at(a + entry_array::ITEMS + i * entry_array::ITEM_SIZE, p)?;
                return Ok(first);
            }
            i -= link.capacity;
            before += link.capacity;
            n_last = link.capacity;
            last = a;
            a = link.next;
        }

        let capacity = if idx > n_last {
            (idx + 1) * 2
        } else {
            n_last * 2
        }
        .max(ENTRY_ARRAY_MIN_CAPACITY)
        .max(i + 1);

        let mut array = EntryArrayObject::with_capacity(capacity);
        array.items[i as usize] = p;
        let bytes = array.encode();
        let offset = self.append_object(ObjectType::EntryArray, &bytes)?;
        self.hmac_put(ObjectType::EntryArray, offset, &bytes);

        if last == 0 {
            self.header.n_entry_arrays += 1;
            return Ok(offset);
        }

        self.write_u64_at(last + entry_array::NEXT_ENTRY_ARRAY_OFFSET, offset)?;
        self.header.n_entry_arrays += 1;
        // A link whose first slot stays empty has no begin to cache.
        if i == 0 {
            self.chain_cache.lock().put(ChainCacheItem {
                first,
                array: offset,
                begin: p,
                total: before,
                last_index: None,
            });
        }
        Ok(first)
    }

    /// Adds entry `p` to the global chain.
    pub(crate) fn link_entry_global(&mut self, p: u64) -> JournalResult<()> {
        let first =
            self.link_entry_into_array(self.header.entry_array_offset, self.header.n_entries, p)?;
        self.header.entry_array_offset = first;
        self.header.n_entries += 1;
        Ok(())
    }

    /// Adds entry `p` to the entries of the DATA object at `data_offset`.
    pub(crate) fn link_data_entry(&mut self, data_offset: u64, p: u64) -> JournalResult<()> {
        let current = self.read_data_entries(data_offset)?;

        let (entry_offset, entry_array_offset) = if current.n_entries == 0 {
            (p, current.entry_array_offset)
        } else {
            let first = self.link_entry_into_array(
                current.entry_array_offset,
                current.n_entries - 1,
                p,
            )?;
            (current.entry_offset, first)
        };

        let mut raw = [0u8; 24];
        raw[..8].copy_from_slice(&entry_offset.to_le_bytes());
        raw[8..16].copy_from_slice(&entry_array_offset.to_le_bytes());
        raw[16..].copy_from_slice(&(current.n_entries + 1).to_le_bytes());
        self.backend.write_at(data_offset + data::ENTRY_OFFSET, &raw)?;
        Ok(())
    }

    /// Returns the offsets of the links of the chain starting at `first`.
    ///
    /// # Errors
    ///
    /// Returns a malformed error if a link is invalid.
    pub fn entry_array_links(&self, first: u64) -> JournalResult<Vec<u64>> {
        let mut links = Vec::new();
        let mut a = first;
        while a > 0 {
            links.push(a);
            a = self.read_array_link(a)?.next;
        }
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{JournalConfig, JournalMetrics};
    use crate::format::{DataObject, EntryObject, ObjectType};
    use crate::journal::JournalFile;
    use crate::types::Id128;
    use jrnl_storage::InMemoryBackend;
    use std::sync::Arc;

    fn open() -> JournalFile {
        let config = JournalConfig::writer()
            .machine_id(Id128::from_bytes([7; 16]))
            .metrics(JournalMetrics::new().max_size(8 << 20).keep_free(0));
        JournalFile::open_backend(Arc::new(InMemoryBackend::new()), None, &config, None, None)
            .unwrap()
    }

    fn fake_entry(file: &mut JournalFile, seqnum: u64) -> u64 {
        let entry = EntryObject {
            seqnum,
            realtime: seqnum,
            monotonic: seqnum,
            boot_id: Id128::from_bytes([1; 16]),
            xor_hash: 0,
            items: Vec::new(),
        };
        file.append_object(ObjectType::Entry, &entry.encode()).unwrap()
    }

    #[test]
    fn links_grow_geometrically() {
        let mut file = open();
        let mut first = 0;
        for i in 0..30 {
            let p = fake_entry(&mut file, i + 1);
            first = file.link_entry_into_array(first, i, p).unwrap();
        }

        let links = file.entry_array_links(first).unwrap();
        let capacities: Vec<u64> = links
            .iter()
            .map(|&a| file.read_array_link(a).unwrap().capacity)
            .collect();
        // A link past the previous one's capacity is sized from the index.
        assert_eq!(capacities, vec![4, 8, 26]);
        assert_eq!(file.header().n_entry_arrays, 3);
    }

    #[test]
    fn items_keep_append_order() {
        let mut file = open();
        let mut first = 0;
        let mut expected = Vec::new();
        for i in 0..13 {
            let p = fake_entry(&mut file, i + 1);
            first = file.link_entry_into_array(first, i, p).unwrap();
            expected.push(p);
        }

        let mut got = Vec::new();
        for a in file.entry_array_links(first).unwrap() {
            let link = file.read_array_link(a).unwrap();
            for i in 0..link.capacity {
                let item = file.read_array_item(a, i).unwrap();
                if item != 0 {
                    got.push(item);
                }
            }
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn data_objects_link_plus_one() {
        let mut file = open();
        let obj = DataObject::new(1, b"A=1".to_vec(), 0).encode();
        let d = file.append_object(ObjectType::Data, &obj).unwrap();

        let e1 = fake_entry(&mut file, 1);
        file.link_data_entry(d, e1).unwrap();
        let entries = file.read_data_entries(d).unwrap();
        assert_eq!(entries.entry_offset, e1);
        assert_eq!(entries.entry_array_offset, 0);
        assert_eq!(entries.n_entries, 1);

        let e2 = fake_entry(&mut file, 2);
        file.link_data_entry(d, e2).unwrap();
        let entries = file.read_data_entries(d).unwrap();
        assert_eq!(entries.entry_offset, e1);
        assert_ne!(entries.entry_array_offset, 0);
        assert_eq!(entries.n_entries, 2);
        assert_eq!(file.read_array_item(entries.entry_array_offset, 0).unwrap(), e2);
    }

    #[test]
    fn cached_link_begins_with_its_first_item() {
        let mut file = open();
        let mut first = 0;
        for i in 0..4 {
            let p = fake_entry(&mut file, i + 1);
            first = file.link_entry_into_array(first, i, p).unwrap();
        }

        let p = fake_entry(&mut file, 5);
        file.link_entry_into_array(first, 4, p).unwrap();
        let ci = file.chain_cache.lock().get(first).unwrap();
        assert_eq!(ci.begin, p);
        assert_eq!(ci.begin, file.read_array_item(ci.array, 0).unwrap());
        assert_eq!(ci.total, 4);
    }

    #[test]
    fn link_with_leading_gap_is_not_cached() {
        let mut file = open();
        let mut first = 0;
        for i in 0..4 {
            let p = fake_entry(&mut file, i + 1);
            first = file.link_entry_into_array(first, i, p).unwrap();
        }

        let p = fake_entry(&mut file, 7);
        file.link_entry_into_array(first, 6, p).unwrap();
        let links = file.entry_array_links(first).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(file.read_array_item(links[1], 0).unwrap(), 0);
        assert_eq!(file.read_array_item(links[1], 2).unwrap(), p);
        assert!(file.chain_cache.lock().get(first).is_none());
    }

    #[test]
    fn backwards_link_is_malformed() {
        let mut file = open();
        let mut first = 0;
        for i in 0..5 {
            let p = fake_entry(&mut file, i + 1);
            first = file.link_entry_into_array(first, i, p).unwrap();
        }
        file.write_u64_at(first + 16, first).unwrap();

        assert!(file.read_array_link(first).unwrap_err().is_malformed());
    }
}
