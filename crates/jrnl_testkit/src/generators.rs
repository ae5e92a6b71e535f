//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random journal content
//! that maintains the invariants appends require.

use jrnl_core::{DualTimestamp, Id128};
use proptest::prelude::*;

/// Strategy for generating non-null 128-bit ids.
pub fn id128_strategy() -> impl Strategy<Value = Id128> {
    prop::array::uniform16(any::<u8>())
        .prop_filter("Id must not be null", |bytes| bytes.iter().any(|&b| b != 0))
        .prop_map(Id128::from_bytes)
}

/// Strategy for generating field names as journald accepts them.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][A-Z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating field values (arbitrary bytes).
pub fn field_value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..128)
}

/// Strategy for generating `NAME=value` payloads.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    (field_name_strategy(), field_value_strategy()).prop_map(|(name, value)| {
        let mut payload = name.into_bytes();
        payload.push(b'=');
        payload.extend(value);
        payload
    })
}

/// Strategy for generating payloads large and repetitive enough to be
/// stored compressed.
pub fn compressible_payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    (field_name_strategy(), "[a-z]{1,8}", 128usize..512).prop_map(|(name, word, repeat)| {
        format!("{name}={}", word.repeat(repeat)).into_bytes()
    })
}

/// Strategy for generating the item list of one entry.
pub fn entry_items_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(
        prop_oneof![
            8 => payload_strategy(),
            1 => compressible_payload_strategy(),
        ],
        1..8,
    )
}

/// Strategy for generating strictly increasing timestamps within one boot.
pub fn timestamps_strategy(len: usize) -> impl Strategy<Value = Vec<DualTimestamp>> {
    prop::collection::vec((1u64..10_000, 0u64..10_000), len).prop_map(|steps| {
        let mut realtime = 1_000_000;
        let mut monotonic = 1_000;
        steps
            .into_iter()
            .map(|(r, m)| {
                realtime += r;
                monotonic += m;
                DualTimestamp::new(realtime, monotonic)
            })
            .collect()
    })
}

/// An entry to append, with the timestamp it should carry.
#[derive(Debug, Clone)]
pub struct GeneratedEntry {
    /// Wall-clock and monotonic time.
    pub ts: DualTimestamp,
    /// Payloads of the entry.
    pub items: Vec<Vec<u8>>,
}

/// Strategy for generating a sequence of appendable entries.
pub fn entry_sequence_strategy(
    min_entries: usize,
    max_entries: usize,
) -> impl Strategy<Value = Vec<GeneratedEntry>> {
    (min_entries..max_entries)
        .prop_flat_map(|len| {
            (
                timestamps_strategy(len),
                prop::collection::vec(entry_items_strategy(), len),
            )
        })
        .prop_map(|(timestamps, items)| {
            timestamps
                .into_iter()
                .zip(items)
                .map(|(ts, items)| GeneratedEntry { ts, items })
                .collect()
        })
}

/// Strategy for generating strictly increasing sequence numbers with gaps.
pub fn seqnum_strategy(max_len: usize) -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..8, 1..max_len).prop_map(|gaps| {
        gaps.iter()
            .scan(0, |s, g| {
                *s += g;
                Some(*s)
            })
            .collect()
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jrnl_core::{valid_monotonic, valid_realtime};

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn id_is_not_null(id in id128_strategy()) {
            prop_assert!(!id.is_null());
        }

        #[test]
        fn payload_has_a_field_name(payload in payload_strategy()) {
            let eq = payload.iter().position(|&b| b == b'=');
            prop_assert!(matches!(eq, Some(p) if p > 0));
        }

        #[test]
        fn timestamps_increase(ts in timestamps_strategy(20)) {
            for pair in ts.windows(2) {
                prop_assert!(pair[0].realtime < pair[1].realtime);
                prop_assert!(pair[0].monotonic <= pair[1].monotonic);
            }
            prop_assert!(ts.iter().all(|t| valid_realtime(t.realtime) && valid_monotonic(t.monotonic)));
        }

        #[test]
        fn seqnums_increase(seqnums in seqnum_strategy(50)) {
            prop_assert!(seqnums[0] >= 1);
            prop_assert!(seqnums.windows(2).all(|w| w[0] < w[1]));
        }

        #[test]
        fn entries_are_never_empty(entries in entry_sequence_strategy(1, 10)) {
            prop_assert!(!entries.is_empty());
            prop_assert!(entries.iter().all(|e| !e.items.is_empty()));
        }
    }
}
