//! Core type definitions for jrnl.

use std::fmt;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// A 128-bit identifier (file, machine, boot and sequence-domain ids).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id128([u8; 16]);

impl Id128 {
    /// The all-zero identifier, meaning "unset".
    pub const NULL: Self = Self([0; 16]);

    /// Creates an identifier from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates a new random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns `true` for the all-zero identifier.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Formats as 32 lowercase hex digits.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parses 32 hex digits, optionally with UUID dashes.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let digits: Vec<u8> = s.trim().bytes().filter(|&b| b != b'-').collect();
        if digits.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, pair) in digits.chunks(2).enumerate() {
            let text = std::str::from_utf8(pair).ok()?;
            bytes[i] = u8::from_str_radix(text, 16).ok()?;
        }
        Some(Self(bytes))
    }

    /// Reads the host machine id from `/etc/machine-id`.
    ///
    /// Returns [`Id128::NULL`] when the host has none.
    #[must_use]
    pub fn machine_id() -> Self {
        std::fs::read_to_string("/etc/machine-id")
            .ok()
            .and_then(|s| Self::parse(&s))
            .unwrap_or(Self::NULL)
    }

    /// Returns the id of the running boot.
    ///
    /// Falls back to a random id fixed for the life of the process when
    /// the kernel does not expose one.
    #[must_use]
    pub fn boot_id() -> Self {
        static BOOT_ID: OnceLock<Id128> = OnceLock::new();
        *BOOT_ID.get_or_init(|| {
            std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
                .ok()
                .and_then(|s| Self::parse(&s))
                .unwrap_or_else(Self::random)
        })
    }
}

impl fmt::Debug for Id128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id128({})", self.to_hex())
    }
}

impl fmt::Display for Id128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A pair of wall-clock and monotonic timestamps, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DualTimestamp {
    /// Microseconds since the Unix epoch.
    pub realtime: u64,
    /// Microseconds since boot.
    pub monotonic: u64,
}

impl DualTimestamp {
    /// Creates a timestamp pair.
    #[must_use]
    pub const fn new(realtime: u64, monotonic: u64) -> Self {
        Self {
            realtime,
            monotonic,
        }
    }

    /// Samples both clocks.
    #[must_use]
    pub fn now() -> Self {
        Self {
            realtime: now_realtime(),
            monotonic: now_monotonic(),
        }
    }
}

/// Largest timestamp accepted anywhere in a file.
pub const TIMESTAMP_LIMIT: u64 = 1 << 55;

/// Returns `true` for a usable wall-clock timestamp.
#[must_use]
pub const fn valid_realtime(usec: u64) -> bool {
    usec > 0 && usec < TIMESTAMP_LIMIT
}

/// Returns `true` for a usable monotonic timestamp.
#[must_use]
pub const fn valid_monotonic(usec: u64) -> bool {
    usec < TIMESTAMP_LIMIT
}

/// Current wall-clock time in microseconds.
#[must_use]
pub fn now_realtime() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Current monotonic time in microseconds since boot.
///
/// Anchored on the kernel's uptime at first use and advanced with
/// [`Instant`], so it never goes backwards within a process.
#[must_use]
pub fn now_monotonic() -> u64 {
    static ANCHOR: OnceLock<(Instant, u64)> = OnceLock::new();
    let (instant, uptime) = ANCHOR.get_or_init(|| {
        let uptime = std::fs::read_to_string("/proc/uptime")
            .ok()
            .and_then(|s| s.split_whitespace().next().map(str::to_owned))
            .and_then(|s| s.parse::<f64>().ok())
            .map(|secs| (secs * 1_000_000.0) as u64)
            .unwrap_or(0);
        (Instant::now(), uptime)
    });
    uptime + instant.elapsed().as_micros() as u64
}

/// Search and traversal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards newer entries: first match at or after the key.
    Down,
    /// Towards older entries: first match at or before the key.
    Up,
}

impl Direction {
    /// Returns the opposite direction.
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::Down => Self::Up,
            Self::Up => Self::Down,
        }
    }
}

/// A sequence-number counter shared by several files of one domain.
///
/// Files appended with the same counter draw strictly increasing
/// sequence numbers even across rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceCounter {
    /// The sequence-number domain.
    pub id: Id128,
    /// The last sequence number handed out.
    pub value: u64,
}

impl SequenceCounter {
    /// Creates a counter in a fresh random domain.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Id128::random(),
            value: 0,
        }
    }
}

/// Field name under which entries record their boot id.
pub const BOOT_ID_FIELD: &str = "_BOOT_ID";

/// Returns the `_BOOT_ID=<hex>` payload for a boot id.
#[must_use]
pub fn boot_id_payload(boot_id: &Id128) -> Vec<u8> {
    format!("{BOOT_ID_FIELD}={}", boot_id.to_hex()).into_bytes()
}
