//! Content hashes used by the hash tables and entry signatures.
//!
//! Two algorithms exist. Files created with the keyed-hash flag index
//! their content with SipHash-2-4 keyed by the file id, which stops an
//! attacker from crafting payloads that pile into one bucket. Older files
//! use Bob Jenkins' lookup3. The per-entry XOR signature always uses
//! lookup3 so that signatures of the same entry agree across files with
//! different keys.

use crate::types::Id128;
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

/// The content hash a file indexes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// Unkeyed Jenkins lookup3.
    Jenkins,
    /// SipHash-2-4 keyed by the file id.
    Siphash24 {
        /// The 128-bit key.
        key: [u8; 16],
    },
}

impl HashAlgorithm {
    /// Selects the algorithm for a file.
    #[must_use]
    pub fn for_file(keyed: bool, file_id: &Id128) -> Self {
        if keyed {
            Self::Siphash24 {
                key: *file_id.as_bytes(),
            }
        } else {
            Self::Jenkins
        }
    }

    /// Hashes `data`.
    #[must_use]
    pub fn hash(&self, data: &[u8]) -> u64 {
        match self {
            Self::Jenkins => jenkins_hash64(data),
            Self::Siphash24 { key } => siphash24(key, data),
        }
    }

    /// Returns `true` for the keyed variant.
    #[must_use]
    pub const fn is_keyed(&self) -> bool {
        matches!(self, Self::Siphash24 { .. })
    }
}

/// SipHash-2-4 of `data` under `key`.
#[must_use]
pub fn siphash24(key: &[u8; 16], data: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_key(key);
    hasher.write(data);
    hasher.finish()
}

/// 64-bit Jenkins hash: `(c << 32) | b` from lookup3's `hashlittle2`.
#[must_use]
pub fn jenkins_hash64(data: &[u8]) -> u64 {
    let (c, b) = hashlittle2(data, 0, 0);
    (u64::from(c) << 32) | u64::from(b)
}

#[inline]
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

#[inline]
fn final_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

#[inline]
fn le32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word[..bytes.len()].copy_from_slice(bytes);
    u32::from_le_bytes(word)
}

/// lookup3 `hashlittle2`: returns `(c, b)` seeded with `(pc, pb)`.
fn hashlittle2(key: &[u8], pc: u32, pb: u32) -> (u32, u32) {
    let init = 0xdead_beef_u32
        .wrapping_add(key.len() as u32)
        .wrapping_add(pc);
    let (mut a, mut b, mut c) = (init, init, init.wrapping_add(pb));

    let mut k = key;
    while k.len() > 12 {
        a = a.wrapping_add(le32(&k[0..4]));
        b = b.wrapping_add(le32(&k[4..8]));
        c = c.wrapping_add(le32(&k[8..12]));
        mix(&mut a, &mut b, &mut c);
        k = &k[12..];
    }

    if k.is_empty() {
        return (c, b);
    }

    let mut tail = [0u8; 12];
    tail[..k.len()].copy_from_slice(k);
    a = a.wrapping_add(le32(&tail[0..4]));
    b = b.wrapping_add(le32(&tail[4..8]));
    c = c.wrapping_add(le32(&tail[8..12]));
    final_mix(&mut a, &mut b, &mut c);

    (c, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup3_empty_input() {
        assert_eq!(hashlittle2(b"", 0, 0), (0xdead_beef, 0xdead_beef));
        assert_eq!(jenkins_hash64(b""), 0xdead_beef_dead_beef);
    }

    #[test]
    fn lookup3_reference_vector() {
        let (c, _) = hashlittle2(b"Four score and seven years ago", 0, 0);
        assert_eq!(c, 0x1777_0551);
        let (c, _) = hashlittle2(b"Four score and seven years ago", 1, 0);
        assert_eq!(c, 0xcd62_8161);
    }

    #[test]
    fn lookup3_exact_block_boundary() {
        // 12 and 24 byte inputs take the mix path for every block but the
        // last, which must go through the final mix.
        let twelve = jenkins_hash64(b"abcdefghijkl");
        let thirteen = jenkins_hash64(b"abcdefghijklm");
        assert_ne!(twelve, thirteen);
        assert_ne!(jenkins_hash64(&[0u8; 24]), jenkins_hash64(&[0u8; 23]));
    }

    #[test]
    fn siphash_depends_on_key() {
        let a = siphash24(&[1; 16], b"MESSAGE=hello");
        let b = siphash24(&[2; 16], b"MESSAGE=hello");
        assert_ne!(a, b);
        assert_eq!(a, siphash24(&[1; 16], b"MESSAGE=hello"));
    }

    #[test]
    fn algorithm_selection() {
        let id = Id128::from_bytes([7; 16]);
        let keyed = HashAlgorithm::for_file(true, &id);
        let plain = HashAlgorithm::for_file(false, &id);

        assert!(keyed.is_keyed());
        assert!(!plain.is_keyed());
        assert_eq!(plain.hash(b"x"), jenkins_hash64(b"x"));
        assert_eq!(keyed.hash(b"x"), siphash24(&[7; 16], b"x"));
    }
}
