//! Per-block Bloom filters for the kind/namespace/group dimensions.
//!
//! Classic double hashing: two independent SipHash-1-3 digests combined
//! as `h1 + i*h2`. Never produces a false negative for inserted values.

use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

const SEED_A: (u64, u64) = (0x5370_6563_7472_6531, 0x626c_6f6f_6d5f_6b31);
const SEED_B: (u64, u64) = (0x5370_6563_7472_6532, 0x626c_6f6f_6d5f_6b32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes the filter for `expected` items at the given false-positive
    /// rate. `m = -n·ln(p)/ln(2)²`, `k = m/n·ln(2)`.
    pub fn with_capacity(expected: usize, fp_rate: f64) -> Self {
        let expected = expected.max(1) as f64;
        let rate = fp_rate.clamp(1e-6, 0.5);
        let num_bits = (-(expected * rate.ln()) / (2f64.ln() * 2f64.ln())).ceil() as u64;
        let num_bits = num_bits.max(64);
        let num_hashes = ((num_bits as f64 / expected) * 2f64.ln()).round().max(1.0) as u32;
        Self {
            bits: vec![0; num_bits.div_ceil(64) as usize],
            num_bits,
            num_hashes,
        }
    }

    pub fn insert(&mut self, value: &str) {
        let (h1, h2) = self.digests(value);
        for i in 0..self.num_hashes {
            let bit = (h1.wrapping_add(u64::from(i).wrapping_mul(h2))) % self.num_bits;
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// `false` means the value is definitely absent.
    pub fn contains(&self, value: &str) -> bool {
        let (h1, h2) = self.digests(value);
        for i in 0..self.num_hashes {
            let bit = (h1.wrapping_add(u64::from(i).wrapping_mul(h2))) % self.num_bits;
            if self.bits[(bit / 64) as usize] & (1 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    fn digests(&self, value: &str) -> (u64, u64) {
        let mut a = SipHasher13::new_with_keys(SEED_A.0, SEED_A.1);
        a.write(value.as_bytes());
        let mut b = SipHasher13::new_with_keys(SEED_B.0, SEED_B.1);
        b.write(value.as_bytes());
        // h2 must be odd so the probe sequence covers the bit array.
        (a.finish(), b.finish() | 1)
    }
}
