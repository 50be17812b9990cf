//! Strong (SHA-1) and weak (rsync rolling) checksums.

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::node::BLOCK_SIZE;

/// A strong content checksum (SHA-1, 160-bit).
///
/// Equality of strong checksums is treated as equality of content everywhere
/// in this crate. Persisted forms are lowercase hexadecimal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrongHash([u8; 20]);

impl StrongHash {
    /// Hash arbitrary bytes.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }

    /// Hash a file by path, streaming.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path).map_err(|e| Error::io("open", path, e))?;
        let mut hasher = Sha1::new();
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let n = file
                .read(&mut buffer)
                .map_err(|e| Error::io("read", path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(Self(hasher.finalize().into()))
    }

    /// Finish an incrementally-fed digest.
    #[must_use]
    pub fn from_digest(hasher: Sha1) -> Self {
        Self(hasher.finalize().into())
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Convert to a lowercase hex string.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for StrongHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StrongHash({})", self.to_hex())
    }
}

impl fmt::Display for StrongHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Rolling weak checksum over a window of bytes, rsync-style.
///
/// Two 32-bit accumulators: `a` is the byte sum, `b` the position-weighted
/// sum. `roll` slides a full [`BLOCK_SIZE`] window forward by one byte in
/// O(1). All arithmetic wraps; overflow is part of the format.
#[derive(Clone, Copy, Default)]
pub struct WeakChecksum {
    a: u32,
    b: u32,
}

impl WeakChecksum {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to the empty-window state.
    pub fn reset(&mut self) {
        self.a = 0;
        self.b = 0;
    }

    /// Feed window bytes. Calls accumulate, so a window split across slices
    /// produces the same value as one contiguous write.
    pub fn update(&mut self, buf: &[u8]) {
        for &byte in buf {
            self.a = self.a.wrapping_add(u32::from(byte));
            self.b = self.b.wrapping_add(self.a);
        }
    }

    /// Slide a full-block window forward one byte: `removed` leaves at the
    /// front, `incoming` enters at the back. Only valid when the window holds
    /// exactly [`BLOCK_SIZE`] bytes.
    pub fn roll(&mut self, removed: u8, incoming: u8) {
        self.a = self
            .a
            .wrapping_sub(u32::from(removed))
            .wrapping_add(u32::from(incoming));
        self.b = self
            .b
            .wrapping_sub(u32::from(removed).wrapping_mul(BLOCK_SIZE as u32))
            .wrapping_add(self.a);
    }

    /// Current checksum value.
    #[must_use]
    pub fn value(&self) -> u32 {
        (self.b << 16) | (self.a & 0xffff)
    }
}

/// Weak checksum of one complete buffer.
#[must_use]
pub fn weak_checksum(buf: &[u8]) -> u32 {
    let mut weak = WeakChecksum::new();
    weak.update(buf);
    weak.value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_deterministic() {
        let h1 = StrongHash::from_bytes(b"hello world");
        let h2 = StrongHash::from_bytes(b"hello world");
        assert_eq!(h1, h2);
        assert_ne!(h1, StrongHash::from_bytes(b"hello worle"));
    }

    #[test]
    fn strong_hex_is_lowercase_sha1() {
        // sha1("abc")
        assert_eq!(
            StrongHash::from_bytes(b"abc").to_hex(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(StrongHash::from_bytes(b"").to_hex().len(), 40);
    }

    #[test]
    fn weak_matches_reference_formula() {
        let buf = [1u8, 2, 3, 4, 5];
        let len = buf.len() as u32;
        let a: u32 = buf.iter().map(|&b| u32::from(b)).sum();
        let b: u32 = buf
            .iter()
            .enumerate()
            .map(|(i, &v)| (len - i as u32) * u32::from(v))
            .sum();
        assert_eq!(weak_checksum(&buf), (b << 16) | (a & 0xffff));
    }

    #[test]
    fn weak_update_is_cumulative() {
        let buf = b"some window content that spans two writes";
        let mut split = WeakChecksum::new();
        split.update(&buf[..10]);
        split.update(&buf[10..]);
        assert_eq!(split.value(), weak_checksum(buf));
    }

    #[test]
    fn roll_equals_reseed_at_every_offset() {
        // Deterministic pseudo-random buffer a few blocks long.
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let buf: Vec<u8> = (0..BLOCK_SIZE * 3 + 17)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state & 0xff) as u8
            })
            .collect();

        let mut rolling = WeakChecksum::new();
        rolling.update(&buf[..BLOCK_SIZE]);

        for start in 1..=buf.len() - BLOCK_SIZE {
            rolling.roll(buf[start - 1], buf[start + BLOCK_SIZE - 1]);
            assert_eq!(
                rolling.value(),
                weak_checksum(&buf[start..start + BLOCK_SIZE]),
                "divergence at window offset {start}"
            );
        }
    }

    #[test]
    fn weak_collision_with_strong_mismatch() {
        // [0,2,0] and [1,0,1] have equal byte sums and equal weighted sums,
        // so embedding them at the same offset of otherwise identical blocks
        // collides the weak checksum while the bytes differ.
        let mut one = vec![7u8; BLOCK_SIZE];
        let mut two = vec![7u8; BLOCK_SIZE];
        one[100..103].copy_from_slice(&[0, 2, 0]);
        two[100..103].copy_from_slice(&[1, 0, 1]);

        assert_ne!(one, two);
        assert_eq!(weak_checksum(&one), weak_checksum(&two));
        assert_ne!(StrongHash::from_bytes(&one), StrongHash::from_bytes(&two));
    }
}
