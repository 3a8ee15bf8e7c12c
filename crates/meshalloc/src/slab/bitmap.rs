use crate::util::MAX_OBJECTS_PER_SPAN;

const WORDS: usize = MAX_OBJECTS_PER_SPAN / 64;

/// Occupancy bitmap for the slots of one span.
/// Each bit represents one slot: 1 = occupied, 0 = free.
///
/// Storage is inline so a span's metadata never needs a separate allocation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Bitmap {
    words: [u64; WORDS],
    /// Total number of slots.
    num_slots: usize,
    /// Number of currently occupied slots.
    in_use: usize,
}

impl Bitmap {
    /// Create a bitmap with all `num_slots` slots free.
    pub const fn new(num_slots: usize) -> Self {
        assert!(num_slots > 0 && num_slots <= MAX_OBJECTS_PER_SPAN);
        Bitmap {
            words: [0; WORDS],
            num_slots,
            in_use: 0,
        }
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    #[inline]
    pub fn in_use_count(&self) -> usize {
        self.in_use
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.in_use == self.num_slots
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// Check if a slot is currently occupied.
    #[inline]
    pub fn is_set(&self, slot: usize) -> bool {
        debug_assert!(slot < self.num_slots);
        self.words[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    /// Mark `slot` occupied. Returns false if it already was.
    #[inline]
    pub fn try_set(&mut self, slot: usize) -> bool {
        debug_assert!(slot < self.num_slots);
        let mask = 1u64 << (slot % 64);
        let word = &mut self.words[slot / 64];
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        self.in_use += 1;
        true
    }

    /// Mark `slot` free. Returns false if it was not occupied.
    #[inline]
    pub fn unset(&mut self, slot: usize) -> bool {
        debug_assert!(slot < self.num_slots);
        let mask = 1u64 << (slot % 64);
        let word = &mut self.words[slot / 64];
        if *word & mask == 0 {
            return false;
        }
        *word &= !mask;
        self.in_use -= 1;
        true
    }

    /// Claim the first free slot at or after a random starting point, wrapping
    /// around. Uses fast range reduction instead of a modulo.
    pub fn alloc_random(&mut self, random: u64) -> Option<usize> {
        if self.is_full() {
            return None;
        }

        let start = ((random as u128 * self.num_slots as u128) >> 64) as usize;
        let num_words = self.num_slots.div_ceil(64);
        let start_word = start / 64;
        let start_bit = start & 63;

        // Free bits from start_bit onward in the starting word, then whole
        // words, then the bits before start_bit.
        let first = !self.words[start_word] & (u64::MAX << start_bit);
        if let Some(slot) = self.claim_in_word(start_word, first) {
            return Some(slot);
        }
        for step in 1..=num_words {
            let i = (start_word + step) % num_words;
            let mut free = !self.words[i];
            if i == start_word {
                free &= (1u64 << start_bit).wrapping_sub(1);
            }
            if let Some(slot) = self.claim_in_word(i, free) {
                return Some(slot);
            }
        }
        None
    }

    #[inline]
    fn claim_in_word(&mut self, word_idx: usize, free: u64) -> Option<usize> {
        if free == 0 {
            return None;
        }
        let slot = word_idx * 64 + free.trailing_zeros() as usize;
        if slot >= self.num_slots || !self.try_set(slot) {
            return None;
        }
        Some(slot)
    }

    /// True if no slot is occupied in both bitmaps, i.e. the two spans can
    /// share one set of pages.
    #[inline]
    pub fn meshable_with(&self, other: &Bitmap) -> bool {
        self.num_slots == other.num_slots
            && self
                .words
                .iter()
                .zip(other.words.iter())
                .all(|(a, b)| a & b == 0)
    }

    /// Set every bit that is set in `other`. The two must be disjoint.
    pub fn absorb(&mut self, other: &Bitmap) {
        debug_assert!(self.meshable_with(other));
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= b;
        }
        self.in_use += other.in_use;
    }

    /// Iterate the indices of occupied slots in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(i, &word)| SetBits { word, base: i * 64 })
    }
}

impl core::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Bitmap({}/{} ", self.in_use, self.num_slots)?;
        for slot in 0..self.num_slots {
            f.write_str(if self.is_set(slot) { "1" } else { "0" })?;
        }
        f.write_str(")")
    }
}

struct SetBits {
    word: u64,
    base: usize,
}

impl Iterator for SetBits {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.word == 0 {
            return None;
        }
        let bit = self.word.trailing_zeros() as usize;
        self.word &= self.word - 1;
        Some(self.base + bit)
    }
}
