//! Bloom filter for fast negative key lookups
//!
//! Built over all record keys of a base file at write time and stored in the
//! file footer in a typed, versioned layout so it can be loaded without
//! reading record data. False positives are possible (target FPP is
//! configurable), false negatives are not.

use crate::{Result, SiltError};
use bytes::{BufMut, Bytes, BytesMut};
use std::hash::{Hash, Hasher};

/// Serialized layout version
const BLOOM_SER_VERSION: u32 = 1;

/// Filter implementation type code in the serialized form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BloomFilterTypeCode {
    /// Fixed-size bit set with double hashing
    Simple = 1,
}

/// Bloom filter implementation
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Create a filter sized for `expected_entries` keys at the given target
    /// false-positive probability.
    pub fn with_fpp(expected_entries: usize, fpp: f64) -> Self {
        let n = expected_entries.max(1) as f64;
        let fpp = fpp.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-n * fpp.ln()) / (ln2 * ln2)).ceil().max(8.0) as u64;
        let num_hashes = (((num_bits as f64 / n) * ln2).round() as u32).clamp(1, 30);
        let num_bytes = ((num_bits + 7) / 8) as usize;
        Self {
            bits: vec![0u8; num_bytes],
            num_bits,
            num_hashes,
        }
    }

    /// Add a key to the filter
    pub fn add<K: Hash>(&mut self, key: &K) {
        let (h1, h2) = Self::hash_key(key);
        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            self.set_bit(bit);
        }
    }

    /// Check if a key may be in the set
    pub fn may_contain<K: Hash>(&self, key: &K) -> bool {
        let (h1, h2) = Self::hash_key(key);
        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            if !self.get_bit(bit) {
                return false;
            }
        }
        true
    }

    /// Number of hash functions
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Serialize: `[u8 type code][u32 version][u32 num_hashes][u64 num_bits]`
    /// followed by the bit set.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(17 + self.bits.len());
        buf.put_u8(BloomFilterTypeCode::Simple as u8);
        buf.put_u32(BLOOM_SER_VERSION);
        buf.put_u32(self.num_hashes);
        buf.put_u64(self.num_bits);
        buf.put_slice(&self.bits);
        buf.freeze()
    }

    /// Load a filter from its serialized form
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 17 {
            return Err(SiltError::InvalidFormat("bloom filter too short".into()));
        }
        if data[0] != BloomFilterTypeCode::Simple as u8 {
            return Err(SiltError::InvalidFormat(format!(
                "unknown bloom filter type code: {}",
                data[0]
            )));
        }
        let version = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        if version != BLOOM_SER_VERSION {
            return Err(SiltError::InvalidFormat(format!(
                "unsupported bloom filter version: {}",
                version
            )));
        }
        let num_hashes = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        let num_bits = u64::from_be_bytes([
            data[9], data[10], data[11], data[12], data[13], data[14], data[15], data[16],
        ]);
        let bits = data[17..].to_vec();
        if (bits.len() as u64) * 8 < num_bits {
            return Err(SiltError::InvalidFormat("bloom bit set too short".into()));
        }
        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    fn hash_key<K: Hash>(key: &K) -> (u64, u64) {
        let mut hasher1 = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher1);
        let h1 = hasher1.finish();

        let mut hasher2 = std::collections::hash_map::DefaultHasher::new();
        h1.hash(&mut hasher2);
        let h2 = hasher2.finish();

        (h1, h2)
    }

    fn bit_position(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }

    fn set_bit(&mut self, bit: u64) {
        let byte = (bit / 8) as usize;
        let offset = bit % 8;
        if byte < self.bits.len() {
            self.bits[byte] |= 1 << offset;
        }
    }

    fn get_bit(&self, bit: u64) -> bool {
        let byte = (bit / 8) as usize;
        let offset = bit % 8;
        if byte < self.bits.len() {
            (self.bits[byte] >> offset) & 1 == 1
        } else {
            false
        }
    }
}
