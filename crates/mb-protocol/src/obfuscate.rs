//! Session obfuscation: symmetric per-byte XOR with a single-byte key.
//!
//! The key is negotiated at connect time and applied to every byte on the
//! data port, in both directions.  The greeting exchange and the
//! authentication reply stay cleartext.

use rand::Rng;

/// A session key in `1..=254`.  `0` would be a no-op and `255` is excluded
/// by the protocol's key range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XorKey(u8);

impl XorKey {
    pub fn new(key: u8) -> Option<XorKey> {
        match key {
            0 | 255 => None,
            k => Some(XorKey(k)),
        }
    }

    /// Choose a uniformly random session key.
    pub fn random() -> XorKey {
        XorKey(rand::thread_rng().gen_range(1..=254))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// XOR every byte in place.  Applying twice restores the input.
    pub fn apply(self, buf: &mut [u8]) {
        for b in buf {
            *b ^= self.0;
        }
    }
}
