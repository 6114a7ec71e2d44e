//! Bounded bloom filter for cross-batch duplicate tracking
//!
//! Sized from a byte budget up front and never grows. The caller watches
//! `saturated()` to know when the advertised false-positive behavior can
//! no longer hold and uniqueness tracking should degrade to per-batch.

use sha2::{Digest, Sha256};

/// Bits of filter per expected element (~1% false positives at 10)
const BITS_PER_ELEMENT: usize = 10;
const NUM_HASHES: u64 = 4;

pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    inserted: usize,
    capacity: usize,
}

impl BloomFilter {
    /// Build a filter bounded to roughly `budget_bytes` of memory
    pub fn with_budget_bytes(budget_bytes: usize) -> Self {
        let num_bits = (budget_bytes.max(64) * 8) as u64;
        Self {
            bits: vec![0u64; num_bits.div_ceil(64) as usize],
            num_bits,
            inserted: 0,
            capacity: (num_bits as usize) / BITS_PER_ELEMENT,
        }
    }

    fn hash_pair(key: &str) -> (u64, u64) {
        let digest = Sha256::digest(key.as_bytes());
        let h1 = u64::from_be_bytes(digest[..8].try_into().expect("8 bytes"));
        let h2 = u64::from_be_bytes(digest[8..16].try_into().expect("8 bytes"));
        (h1, h2 | 1)
    }

    fn set_bit(&mut self, index: u64) -> bool {
        let word = (index / 64) as usize;
        let mask = 1u64 << (index % 64);
        let was_set = self.bits[word] & mask != 0;
        self.bits[word] |= mask;
        was_set
    }

    /// Insert a key; returns whether it was (probably) already present
    pub fn check_and_insert(&mut self, key: &str) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        let mut seen = true;
        for i in 0..NUM_HASHES {
            let index = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            if !self.set_bit(index) {
                seen = false;
            }
        }
        if !seen {
            self.inserted += 1;
        }
        seen
    }

    /// Whether the filter has taken more distinct keys than it was sized for
    pub fn saturated(&self) -> bool {
        self.inserted > self.capacity
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }
}
