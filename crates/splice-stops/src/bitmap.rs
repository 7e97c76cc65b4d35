//! Reference-map bit sets
//!
//! `BitMap` is the unpacked form used while templates and stops are being
//! built. Packed reference maps live in one shared byte buffer and are
//! accessed through the byte helpers at the bottom of this module.

use std::fmt;

use serde::{Deserialize, Serialize};

const WORD_BITS: usize = 64;

/// A growable set of bit indices
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitMap {
    words: Vec<u64>,
}

impl BitMap {
    /// Create an empty bit map
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Create a bit map with the given bits set
    pub fn from_bits<I: IntoIterator<Item = usize>>(bits: I) -> Self {
        let mut map = Self::new();
        for bit in bits {
            map.set(bit);
        }
        map
    }

    /// Set bit at index
    pub fn set(&mut self, bit: usize) {
        let word = bit / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (bit % WORD_BITS);
    }

    /// Clear bit at index
    pub fn clear(&mut self, bit: usize) {
        if let Some(w) = self.words.get_mut(bit / WORD_BITS) {
            *w &= !(1 << (bit % WORD_BITS));
        }
    }

    /// Check if bit at index is set
    pub fn get(&self, bit: usize) -> bool {
        self.words
            .get(bit / WORD_BITS)
            .map(|w| w & (1 << (bit % WORD_BITS)) != 0)
            .unwrap_or(false)
    }

    /// Index of the first set bit at or after `from`
    pub fn next_set_bit(&self, from: usize) -> Option<usize> {
        let mut word_idx = from / WORD_BITS;
        if word_idx >= self.words.len() {
            return None;
        }
        let mut word = self.words[word_idx] & (!0u64 << (from % WORD_BITS));
        loop {
            if word != 0 {
                return Some(word_idx * WORD_BITS + word.trailing_zeros() as usize);
            }
            word_idx += 1;
            if word_idx >= self.words.len() {
                return None;
            }
            word = self.words[word_idx];
        }
    }

    /// Iterate over indices of set bits in increasing order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let mut next = self.next_set_bit(0);
        std::iter::from_fn(move || {
            let bit = next?;
            next = self.next_set_bit(bit + 1);
            Some(bit)
        })
    }

    /// Number of set bits
    pub fn cardinality(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Check if no bit is set
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// One past the highest set bit, or 0 when empty
    pub fn width(&self) -> usize {
        for (i, &w) in self.words.iter().enumerate().rev() {
            if w != 0 {
                return i * WORD_BITS + (WORD_BITS - w.leading_zeros() as usize);
            }
        }
        0
    }
}

impl FromIterator<usize> for BitMap {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self::from_bits(iter)
    }
}

impl fmt::Debug for BitMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for BitMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, bit) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", bit)?;
        }
        f.write_str("}")
    }
}

/// Bytes needed to hold `bits` bits
pub fn bytes_for_bits(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// Set `bit` in the byte-addressed map starting at `offset`
pub fn set_byte_bit(buffer: &mut [u8], offset: usize, bit: usize) {
    buffer[offset + bit / 8] |= 1 << (bit % 8);
}

/// Check `bit` in the byte-addressed map starting at `offset`
pub fn get_byte_bit(buffer: &[u8], offset: usize, bit: usize) -> bool {
    buffer[offset + bit / 8] & (1 << (bit % 8)) != 0
}

/// Iterate over the set bits of a byte-addressed map
pub fn byte_bits(map: &[u8]) -> impl Iterator<Item = usize> + '_ {
    map.iter().enumerate().flat_map(|(i, &byte)| {
        (0..8usize)
            .filter(move |&b| byte & (1u8 << b) != 0)
            .map(move |b| i * 8 + b)
    })
}
