//! Locating entries.
//!
//! Every lookup is a bisection over an entry chain: either the global
//! chain in the header, or the chain of one DATA object (its inline first
//! entry followed by its entry arrays). Entries in a chain are ordered by
//! offset, sequence number and realtime alike; monotonic time is only
//! ordered within one boot, so monotonic lookups bisect the chain of that
//! boot's `_BOOT_ID` DATA object.
//!
//! Items that cannot be read are treated as lying past the needle, so a
//! corrupt item narrows the search instead of failing it. When the item a
//! search lands on turns out unreadable, the walk moves on in the search
//! direction.

use super::chain_cache::ChainCacheItem;
use super::JournalFile;
use crate::error::{JournalError, JournalResult};
use crate::format::EntryObject;
use crate::types::{boot_id_payload, Direction, Id128};
use tracing::debug;

/// What a bisection compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Key {
    Offset(u64),
    Seqnum(u64),
    Realtime(u64),
    Monotonic(u64),
}

impl Key {
    fn needle(self) -> u64 {
        match self {
            Self::Offset(v) | Self::Seqnum(v) | Self::Realtime(v) | Self::Monotonic(v) => v,
        }
    }

    fn value_of(self, offset: u64, entry: &EntryObject) -> u64 {
        match self {
            Self::Offset(_) => offset,
            Self::Seqnum(_) => entry.seqnum,
            Self::Realtime(_) => entry.realtime,
            Self::Monotonic(_) => entry.monotonic,
        }
    }
}

/// An entry chain, optionally preceded by one inline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Chain {
    extra: Option<u64>,
    first: u64,
    n: u64,
}

impl Chain {
    fn len(&self) -> u64 {
        self.n + u64::from(self.extra.is_some())
    }
}

/// Returns `true` if a value lies on the far side of the needle.
///
/// Walking a chain, this flips from `false` to `true` exactly once.
fn is_past(value: Option<u64>, needle: u64, direction: Direction) -> bool {
    match (value, direction) {
        (None, _) => true,
        (Some(v), Direction::Down) => v >= needle,
        (Some(v), Direction::Up) => v > needle,
    }
}

type Found = Option<(u64, EntryObject)>;

impl JournalFile {
    fn global_chain(&self) -> Chain {
        Chain {
            extra: None,
            first: self.header.entry_array_offset,
            n: self.header.n_entries,
        }
    }

    fn data_chain(&self, data_offset: u64) -> JournalResult<Chain> {
        let entries = self.read_data_entries(data_offset)?;
        if entries.n_entries == 0 {
            return Ok(Chain {
                extra: None,
                first: 0,
                n: 0,
            });
        }
        Ok(Chain {
            extra: Some(entries.entry_offset),
            first: entries.entry_array_offset,
            n: entries.n_entries - 1,
        })
    }

    /// Reads the key of the entry at `p`, or `None` if it is corrupt.
    fn test_item(&self, p: u64, key: Key) -> JournalResult<Option<u64>> {
        if p == 0 {
            return Ok(None);
        }
        if let Key::Offset(_) = key {
            return Ok(Some(p));
        }
        match self.read_entry(p) {
            Ok(entry) => Ok(Some(key.value_of(p, &entry))),
            Err(e) if e.is_malformed() => {
                debug!(offset = p, error = %e, "skipping corrupt entry during bisection");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn item_is_past(&self, p: u64, key: Key, direction: Direction) -> JournalResult<bool> {
        Ok(is_past(self.test_item(p, key)?, key.needle(), direction))
    }

    /// Bisects the first `n` items of the chain at `first`. Returns the
    /// index of the first item past the needle when going down, or of the
    /// last one before it when going up.
    fn bisect_links(
        &self,
        first: u64,
        n: u64,
        key: Key,
        direction: Direction,
    ) -> JournalResult<Option<u64>> {
        if first == 0 || n == 0 {
            return Ok(None);
        }

        let mut a = first;
        let mut t = 0;
        let mut before = None;
        let mut last_index = None;

        let cached = self.chain_cache.lock().get(first);
        if let Some(ci) = cached {
            if n > ci.total && ci.begin != 0 && !self.item_is_past(ci.begin, key, direction)? {
                a = ci.array;
                t = ci.total;
                last_index = ci.last_index;
                before = Some(ci.total);
            }
        }

        while a > 0 && t < n {
            let link = self.read_array_link(a)?;
            let k = link.capacity.min(n - t);
            if k == 0 {
                break;
            }

            let last = self.read_array_item(a, k - 1)?;
            if !self.item_is_past(last, key, direction)? {
                before = Some(t + k - 1);
                t += k;
                a = link.next;
                last_index = None;
                continue;
            }

            // The flip happens in this link; `hi` is known to be past.
            let mut lo = 0;
            let mut hi = k - 1;

            if let Some(li) = last_index.filter(|&li| li < k - 1) {
                if self.item_is_past(self.read_array_item(a, li)?, key, direction)? {
                    hi = li;
                    if li > 0 && !self.item_is_past(self.read_array_item(a, li - 1)?, key, direction)? {
                        lo = li;
                    }
                } else {
                    lo = li + 1;
                    if self.item_is_past(self.read_array_item(a, li + 1)?, key, direction)? {
                        hi = li + 1;
                    }
                }
            }

            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if self.item_is_past(self.read_array_item(a, mid)?, key, direction)? {
                    hi = mid;
                } else {
                    lo = mid + 1;
                }
            }

            let begin = self.read_array_item(a, 0)?;
            self.chain_cache.lock().put(ChainCacheItem {
                first,
                array: a,
                begin,
                total: t,
                last_index: Some(lo),
            });

            return Ok(match direction {
                Direction::Down => Some(t + lo),
                Direction::Up if lo > 0 => Some(t + lo - 1),
                Direction::Up => before,
            });
        }

        Ok(match direction {
            Direction::Down => None,
            Direction::Up => before,
        })
    }

    fn bisect_chain(&self, chain: Chain, key: Key, direction: Direction) -> JournalResult<Option<u64>> {
        let Some(extra) = chain.extra else {
            return self.bisect_links(chain.first, chain.n, key, direction);
        };

        let rest = |file: &Self| -> JournalResult<Option<u64>> {
            Ok(file
                .bisect_links(chain.first, chain.n, key, direction)?
                .map(|i| i + 1))
        };

        match self.test_item(extra, key)? {
            None => rest(self),
            Some(v) if is_past(Some(v), key.needle(), direction) => Ok(match direction {
                Direction::Down => Some(0),
                Direction::Up => None,
            }),
            Some(_) => {
                let found = rest(self)?;
                Ok(match direction {
                    Direction::Down => found,
                    Direction::Up => found.or(Some(0)),
                })
            }
        }
    }

    /// Returns the entry offset at index `i` of a chain.
    fn chain_item(&self, chain: Chain, i: u64) -> JournalResult<u64> {
        let mut i = i;
        if let Some(extra) = chain.extra {
            if i == 0 {
                return Ok(extra);
            }
            i -= 1;
        }

        let mut a = chain.first;
        let mut t = 0;
        let cached = self.chain_cache.lock().get(chain.first);
        if let Some(ci) = cached {
            if ci.total <= i {
                a = ci.array;
                t = ci.total;
            }
        }

        while a > 0 {
            let link = self.read_array_link(a)?;
            if i - t < link.capacity {
                let item = self.read_array_item(a, i - t)?;
                let begin = self.read_array_item(a, 0)?;
                self.chain_cache.lock().put(ChainCacheItem {
                    first: chain.first,
                    array: a,
                    begin,
                    total: t,
                    last_index: Some(i - t),
                });
                return Ok(item);
            }
            t += link.capacity;
            a = link.next;
        }

        Err(JournalError::malformed(format!(
            "entry chain at {} ends before index {i}",
            chain.first
        )))
    }

    /// Reads the entry at index `i`, stepping over unreadable entries in
    /// `direction`.
    fn chain_get(&self, chain: Chain, i: u64, direction: Direction) -> JournalResult<Found> {
        let len = chain.len();
        let mut i = i;
        while i < len {
            let read = self
                .chain_item(chain, i)
                .and_then(|p| self.read_entry(p).map(|entry| (p, entry)));
            match read {
                Ok(found) => return Ok(Some(found)),
                Err(e) if e.is_malformed() => {
                    debug!(index = i, error = %e, "skipping unreadable entry");
                }
                Err(e) => return Err(e),
            }
            i = match direction {
                Direction::Down => i + 1,
                Direction::Up if i > 0 => i - 1,
                Direction::Up => return Ok(None),
            };
        }
        Ok(None)
    }

    fn resolve(&self, chain: Chain, key: Key, direction: Direction) -> JournalResult<Found> {
        let Some(i) = self.bisect_chain(chain, key, direction)? else {
            return Ok(None);
        };
        let Some((p, entry)) = self.chain_get(chain, i, direction)? else {
            return Ok(None);
        };

        let v = key.value_of(p, &entry);
        let ok = match direction {
            Direction::Down => v >= key.needle(),
            Direction::Up => v <= key.needle(),
        };
        Ok(ok.then_some((p, entry)))
    }

    /// Finds the entry at `offset`, or the nearest one in `direction`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry arrays cannot be read.
    pub fn move_to_entry_by_offset(&self, offset: u64, direction: Direction) -> JournalResult<Found> {
        self.resolve(self.global_chain(), Key::Offset(offset), direction)
    }

    /// Finds the entry with sequence number `seqnum`, or the nearest one in
    /// `direction`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry arrays cannot be read.
    pub fn move_to_entry_by_seqnum(&self, seqnum: u64, direction: Direction) -> JournalResult<Found> {
        self.resolve(self.global_chain(), Key::Seqnum(seqnum), direction)
    }

    /// Finds the first entry at or after `realtime` (going down) or the
    /// last one at or before it (going up).
    ///
    /// # Errors
    ///
    /// Returns an error if the entry arrays cannot be read.
    pub fn move_to_entry_by_realtime(
        &self,
        realtime: u64,
        direction: Direction,
    ) -> JournalResult<Found> {
        self.resolve(self.global_chain(), Key::Realtime(realtime), direction)
    }

    fn boot_data_offset(&self, boot_id: &Id128) -> JournalResult<Option<u64>> {
        Ok(self
            .find_data_object(&boot_id_payload(boot_id))?
            .map(|(offset, _)| offset))
    }

    /// Finds an entry of boot `boot_id` by monotonic time.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry arrays cannot be read.
    pub fn move_to_entry_by_monotonic(
        &self,
        boot_id: &Id128,
        monotonic: u64,
        direction: Direction,
    ) -> JournalResult<Found> {
        let Some(boot) = self.boot_data_offset(boot_id)? else {
            return Ok(None);
        };
        self.resolve(self.data_chain(boot)?, Key::Monotonic(monotonic), direction)
    }

    /// Like [`JournalFile::move_to_entry_by_offset`], restricted to the
    /// entries referencing the DATA object at `data_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the DATA object or its entries cannot be read.
    pub fn move_to_entry_by_offset_for_data(
        &self,
        data_offset: u64,
        offset: u64,
        direction: Direction,
    ) -> JournalResult<Found> {
        self.resolve(self.data_chain(data_offset)?, Key::Offset(offset), direction)
    }

    /// Like [`JournalFile::move_to_entry_by_seqnum`], restricted to the
    /// entries referencing the DATA object at `data_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the DATA object or its entries cannot be read.
    pub fn move_to_entry_by_seqnum_for_data(
        &self,
        data_offset: u64,
        seqnum: u64,
        direction: Direction,
    ) -> JournalResult<Found> {
        self.resolve(self.data_chain(data_offset)?, Key::Seqnum(seqnum), direction)
    }

    /// Like [`JournalFile::move_to_entry_by_realtime`], restricted to the
    /// entries referencing the DATA object at `data_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the DATA object or its entries cannot be read.
    pub fn move_to_entry_by_realtime_for_data(
        &self,
        data_offset: u64,
        realtime: u64,
        direction: Direction,
    ) -> JournalResult<Found> {
        self.resolve(self.data_chain(data_offset)?, Key::Realtime(realtime), direction)
    }

    /// Finds an entry of boot `boot_id` by monotonic time among the entries
    /// referencing the DATA object at `data_offset`.
    ///
    /// Alternates between the boot's chain and the DATA object's chain
    /// until both agree on an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if either chain cannot be read.
    pub fn move_to_entry_by_monotonic_for_data(
        &self,
        data_offset: u64,
        boot_id: &Id128,
        monotonic: u64,
        direction: Direction,
    ) -> JournalResult<Found> {
        let Some(boot) = self.boot_data_offset(boot_id)? else {
            return Ok(None);
        };
        let boot_chain = self.data_chain(boot)?;
        let data_chain = self.data_chain(data_offset)?;

        let Some((mut p, _)) = self.resolve(boot_chain, Key::Monotonic(monotonic), direction)?
        else {
            return Ok(None);
        };

        loop {
            let Some((q, entry)) = self.resolve(data_chain, Key::Offset(p), direction)? else {
                return Ok(None);
            };
            if q == p {
                return Ok(Some((q, entry)));
            }
            let Some((r, entry)) = self.resolve(boot_chain, Key::Offset(q), direction)? else {
                return Ok(None);
            };
            if r == q {
                return Ok(Some((r, entry)));
            }
            p = r;
        }
    }

    fn next_in_chain(&self, chain: Chain, p: u64, direction: Direction) -> JournalResult<Found> {
        let len = chain.len();
        if len == 0 {
            return Ok(None);
        }

        let i = if p == 0 {
            match direction {
                Direction::Down => 0,
                Direction::Up => len - 1,
            }
        } else {
            let Some(i) = self.bisect_chain(chain, Key::Offset(p), direction)? else {
                return Ok(None);
            };
            if self.chain_item(chain, i)? != p {
                i
            } else {
                match direction {
                    Direction::Down => i + 1,
                    Direction::Up if i > 0 => i - 1,
                    Direction::Up => return Ok(None),
                }
            }
        };

        let Some((q, entry)) = self.chain_get(chain, i, direction)? else {
            return Ok(None);
        };

        let ordered = match direction {
            Direction::Down => p == 0 || q > p,
            Direction::Up => p == 0 || q < p,
        };
        if !ordered {
            return Err(JournalError::malformed(format!(
                "entry chain out of order around {p}"
            )));
        }
        Ok(Some((q, entry)))
    }

    /// Returns the entry after (or before) the one at `p`.
    ///
    /// With `p == 0` returns the first entry going down and the last one
    /// going up. `p` need not be an entry offset; the nearest entry past
    /// it is returned.
    ///
    /// # Errors
    ///
    /// Returns a malformed error if the entry arrays are not ordered.
    pub fn next_entry(&self, p: u64, direction: Direction) -> JournalResult<Found> {
        self.next_in_chain(self.global_chain(), p, direction)
    }

    /// Like [`JournalFile::next_entry`], restricted to the entries
    /// referencing the DATA object at `data_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the DATA object or its entries cannot be read.
    pub fn next_entry_for_data(
        &self,
        data_offset: u64,
        p: u64,
        direction: Direction,
    ) -> JournalResult<Found> {
        self.next_in_chain(self.data_chain(data_offset)?, p, direction)
    }

    /// Returns the number of entries referencing the DATA object at
    /// `data_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if no DATA object lives there.
    pub fn data_entry_count(&self, data_offset: u64) -> JournalResult<u64> {
        Ok(self.read_data_entries(data_offset)?.n_entries)
    }

    /// Returns the realtime range covered by the file's entries.
    #[must_use]
    pub fn cutoff_realtime(&self) -> Option<(u64, u64)> {
        if self.header.head_entry_realtime == 0 {
            return None;
        }
        Some((
            self.header.head_entry_realtime,
            self.header.tail_entry_realtime,
        ))
    }

    /// Returns the monotonic range covered by the entries of boot
    /// `boot_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the boot's entries cannot be read.
    pub fn cutoff_monotonic(&self, boot_id: &Id128) -> JournalResult<Option<(u64, u64)>> {
        let Some(boot) = self.boot_data_offset(boot_id)? else {
            return Ok(None);
        };
        let chain = self.data_chain(boot)?;
        if chain.len() == 0 {
            return Ok(None);
        }

        let first = self.chain_get(chain, 0, Direction::Down)?;
        let last = self.chain_get(chain, chain.len() - 1, Direction::Up)?;
        Ok(first
            .zip(last)
            .map(|((_, first), (_, last))| (first.monotonic, last.monotonic)))
    }
}
