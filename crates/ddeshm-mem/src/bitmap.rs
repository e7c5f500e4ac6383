//! Fixed-capacity bit array for slot tracking.
//!
//! Unlike a heap bitmap this one is `repr(C)` with its words inline, so it
//! can be embedded in a shared-memory block. Each bit is one slot:
//! 0 = free, 1 = allocated. Mutation is serialized by the caller's lock.

/// A bit array of `WORDS * 32` bits.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitArray<const WORDS: usize> {
    words: [u32; WORDS],
}

impl<const WORDS: usize> Default for BitArray<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const WORDS: usize> BitArray<WORDS> {
    /// Total number of bits.
    pub const CAPACITY: usize = WORDS * 32;

    /// Creates an array with every bit clear.
    #[must_use]
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Total number of bits.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        Self::CAPACITY
    }

    /// Index of the lowest clear bit, if any.
    #[must_use]
    pub fn vacant_bit(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u32::MAX)
            .map(|(idx, word)| idx * 32 + (!*word).trailing_zeros() as usize)
    }

    /// Sets bit `bit`. Returns `false` if out of range or already set.
    pub fn assign(&mut self, bit: usize) -> bool {
        let Some(word) = self.words.get_mut(bit / 32) else {
            return false;
        };
        let mask = 1u32 << (bit % 32);
        let was_clear = *word & mask == 0;
        *word |= mask;
        was_clear
    }

    /// Clears bit `bit`. Returns `false` if out of range or already clear.
    pub fn clear(&mut self, bit: usize) -> bool {
        let Some(word) = self.words.get_mut(bit / 32) else {
            return false;
        };
        let mask = 1u32 << (bit % 32);
        let was_set = *word & mask != 0;
        *word &= !mask;
        was_set
    }

    /// Whether bit `bit` is set. Out-of-range bits read as clear.
    #[must_use]
    pub fn sample(&self, bit: usize) -> bool {
        self.words
            .get(bit / 32)
            .is_some_and(|word| word & (1u32 << (bit % 32)) != 0)
    }

    /// Sets the lowest clear bit and returns its index (first fit).
    pub fn assign_vacant(&mut self) -> Option<usize> {
        let bit = self.vacant_bit()?;
        self.assign(bit);
        Some(bit)
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates the indices of set bits in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..Self::CAPACITY).filter(|&bit| self.sample(bit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit() {
        let mut bits = BitArray::<2>::new();
        assert_eq!(bits.capacity(), 64);

        assert_eq!(bits.assign_vacant(), Some(0));
        assert_eq!(bits.assign_vacant(), Some(1));
        assert!(bits.clear(0));
        assert_eq!(bits.assign_vacant(), Some(0));
        assert_eq!(bits.assign_vacant(), Some(2));
        assert_eq!(bits.count(), 3);
    }

    #[test]
    fn test_assign_and_clear_report_change() {
        let mut bits = BitArray::<1>::new();
        assert!(bits.assign(5));
        assert!(!bits.assign(5));
        assert!(bits.sample(5));
        assert!(bits.clear(5));
        assert!(!bits.clear(5));
        assert!(!bits.sample(5));
    }

    #[test]
    fn test_out_of_range() {
        let mut bits = BitArray::<1>::new();
        assert!(!bits.assign(32));
        assert!(!bits.clear(32));
        assert!(!bits.sample(1000));
    }

    #[test]
    fn test_full_array() {
        let mut bits = BitArray::<32>::new();
        for expected in 0..1024 {
            assert_eq!(bits.assign_vacant(), Some(expected));
        }
        assert_eq!(bits.assign_vacant(), None);
        assert_eq!(bits.count(), 1024);

        bits.clear(700);
        assert_eq!(bits.vacant_bit(), Some(700));
        assert_eq!(bits.iter_set().count(), 1023);
    }
}
