//! Remembers where recent walks of entry array chains ended.
//!
//! Sequential readers bisect the same chain over and over with slowly
//! moving needles. Caching the link a walk ended in (and the index it
//! looked at last) lets the next walk start there instead of at the head
//! of the chain.

use std::collections::VecDeque;

/// Number of chains remembered at once.
pub(crate) const CHAIN_CACHE_MAX: usize = 20;

/// Position of the last walk over one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChainCacheItem {
    /// Offset of the first link; the key.
    pub first: u64,
    /// Offset of the link the walk ended in.
    pub array: u64,
    /// First entry offset stored in `array`.
    pub begin: u64,
    /// Number of items in the links before `array`.
    pub total: u64,
    /// Index within `array` examined last.
    pub last_index: Option<u64>,
}

/// Bounded cache of chain positions, evicting the oldest chain first.
#[derive(Debug, Default)]
pub(crate) struct ChainCache {
    items: VecDeque<ChainCacheItem>,
}

impl ChainCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, first: u64) -> Option<ChainCacheItem> {
        self.items.iter().find(|ci| ci.first == first).copied()
    }

    /// Records the position of a walk.
    ///
    /// A walk that ended in the first link of a chain not cached yet is
    /// not worth remembering: the next walk starts there anyway.
    pub fn put(&mut self, item: ChainCacheItem) {
        if let Some(existing) = self.items.iter_mut().find(|ci| ci.first == item.first) {
            *existing = item;
            return;
        }

        if item.array == item.first {
            return;
        }

        if self.items.len() >= CHAIN_CACHE_MAX {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }
}
