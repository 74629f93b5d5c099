//! Specialized collection types
//!
//! Every long-lived pipeline object (device resources, lights) lives in a
//! slot map and is addressed by a generation-checked key, so a released
//! record can never be reached through a stale handle.

pub use slotmap::{new_key_type, SecondaryMap, SlotMap};

/// Growable bit vector used for per-frame scratch masks (shadow bits).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitVector {
    words: Vec<u64>,
}

impl BitVector {
    /// Create an empty bit vector
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bit `index`, growing as needed
    pub fn set(&mut self, index: usize) {
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (index % 64);
    }

    /// Clear bit `index`
    pub fn clear_bit(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / 64) {
            *word &= !(1 << (index % 64));
        }
    }

    /// Test bit `index`
    pub fn is_set(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|word| word & (1 << (index % 64)) != 0)
    }

    /// Clear every bit without releasing storage
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
    }

    /// True when no bit is set
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&word| word == 0)
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Iterate the indices of set bits in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(word_index, &word)| {
            (0..64).filter(move |bit| word & (1 << bit) != 0).map(move |bit| word_index * 64 + bit)
        })
    }
}
