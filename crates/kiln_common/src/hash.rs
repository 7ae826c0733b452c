//! Structural fingerprints for change detection and incremental compilation.

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

/// Additive constant used when mixing two fingerprints (the 64-bit golden ratio).
const MIX_CONSTANT: u64 = 0x9e37_79b9_7f4a_7c15;

/// A 64-bit structural fingerprint.
///
/// Two entities with the same `Fingerprint` are assumed to be observably
/// equivalent for compilation purposes. Fingerprints are combined with the
/// order-sensitive [`combine`](Self::combine); callers that need an
/// order-independent result must sort their inputs by a stable key first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// The fingerprint of nothing; the identity seed for folds.
    pub const ZERO: Fingerprint = Fingerprint(0);

    /// Creates a `Fingerprint` from a raw `u64` value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw `u64` value of this fingerprint.
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Computes the fingerprint of a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = FingerprintHasher::new();
        hasher.update_bytes(data);
        hasher.finish()
    }

    /// Mixes `other` into `self`.
    ///
    /// The operation is not commutative: `a.combine(b) != b.combine(a)` in general.
    pub fn combine(self, other: Fingerprint) -> Fingerprint {
        let a = self.0;
        let mixed = other
            .0
            .wrapping_add(MIX_CONSTANT)
            .wrapping_add(a << 12)
            .wrapping_add(a >> 4);
        Fingerprint(a ^ mixed)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:08x}..)", self.0 >> 32)
    }
}

/// Streaming fingerprint calculator.
///
/// Variable-length inputs are length-prefixed and sequences are
/// count-prefixed, so `["ab", "c"]` and `["a", "bc"]` never collide
/// structurally. The 128-bit XXH3 digest is folded into a [`Fingerprint`]
/// by combining its two halves.
pub struct FingerprintHasher {
    state: Xxh3,
}

impl FingerprintHasher {
    /// Creates a hasher with an empty digest context.
    pub fn new() -> Self {
        Self { state: Xxh3::new() }
    }

    /// Feeds raw bytes without a length prefix.
    pub fn update_raw(&mut self, data: &[u8]) -> &mut Self {
        self.state.update(data);
        self
    }

    /// Feeds a length-prefixed byte slice.
    pub fn update_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.update_len(data.len());
        self.state.update(data);
        self
    }

    /// Feeds a length-prefixed UTF-8 string.
    pub fn update_str(&mut self, s: &str) -> &mut Self {
        self.update_bytes(s.as_bytes())
    }

    /// Feeds a boolean as a single byte.
    pub fn update_bool(&mut self, b: bool) -> &mut Self {
        self.state.update(&[u8::from(b)]);
        self
    }

    /// Feeds a `u64` in little-endian order.
    pub fn update_u64(&mut self, v: u64) -> &mut Self {
        self.state.update(&v.to_le_bytes());
        self
    }

    /// Feeds another fingerprint.
    pub fn update_fingerprint(&mut self, fp: Fingerprint) -> &mut Self {
        self.update_u64(fp.0)
    }

    /// Feeds a count-prefixed sequence, calling `f` for each element.
    pub fn update_each<I, F>(&mut self, items: I, mut f: F) -> &mut Self
    where
        I: IntoIterator,
        I::IntoIter: ExactSizeIterator,
        F: FnMut(&mut Self, I::Item),
    {
        let items = items.into_iter();
        self.update_len(items.len());
        for item in items {
            f(&mut *self, item);
        }
        self
    }

    /// Returns the folded fingerprint of everything fed so far.
    pub fn finish(&self) -> Fingerprint {
        let digest = self.state.digest128();
        let low = Fingerprint(digest as u64);
        let high = Fingerprint((digest >> 64) as u64);
        low.combine(high)
    }

    fn update_len(&mut self, len: usize) {
        self.state.update(&(len as u64).to_le_bytes());
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = Fingerprint::from_bytes(b"fn g(x: Int)");
        let b = Fingerprint::from_bytes(b"fn g(x: Int)");
        assert_eq!(a, b);
    }

    #[test]
    fn different_inputs_differ() {
        let a = Fingerprint::from_bytes(b"fn g(x: Int)");
        let b = Fingerprint::from_bytes(b"fn g(x: Long)");
        assert_ne!(a, b);
    }

    #[test]
    fn combine_is_order_sensitive() {
        let a = Fingerprint::from_bytes(b"a");
        let b = Fingerprint::from_bytes(b"b");
        let c = Fingerprint::from_bytes(b"c");
        assert_ne!(a.combine(b.combine(c)), b.combine(a.combine(c)));
        assert_ne!(a.combine(b), b.combine(a));
    }

    #[test]
    fn combine_matches_mixing_formula() {
        let a = Fingerprint::from_raw(1);
        let b = Fingerprint::from_raw(2);
        let expected = 1u64 ^ (2u64.wrapping_add(MIX_CONSTANT) + (1 << 12) + (1 >> 4));
        assert_eq!(a.combine(b).as_raw(), expected);
    }

    #[test]
    fn length_prefix_separates_fields() {
        let mut h1 = FingerprintHasher::new();
        h1.update_str("ab").update_str("c");
        let mut h2 = FingerprintHasher::new();
        h2.update_str("a").update_str("bc");
        assert_ne!(h1.finish(), h2.finish());
    }

    #[test]
    fn update_each_counts_elements() {
        let mut h1 = FingerprintHasher::new();
        h1.update_each(["x", "y"], |h, s| {
            h.update_str(s);
        });
        let mut h2 = FingerprintHasher::new();
        h2.update_each(["x"], |h, s| {
            h.update_str(s);
        })
        .update_str("y");
        assert_ne!(h1.finish(), h2.finish());
    }

    #[test]
    fn display_format() {
        let h = Fingerprint::from_bytes(b"test");
        let s = format!("{h}");
        assert_eq!(s.len(), 16, "Display should be 16 hex chars");
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn debug_abbreviated() {
        let h = Fingerprint::from_bytes(b"test");
        let s = format!("{h:?}");
        assert!(s.starts_with("Fingerprint("));
        assert!(s.ends_with("..)"));
    }

    #[test]
    fn serde_roundtrip() {
        let h = Fingerprint::from_bytes(b"serde test");
        let json = serde_json::to_string(&h).unwrap();
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(h, back);
    }
}
