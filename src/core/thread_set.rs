//! Dynamically sized bitset of compilation threads.
//!
//! Used for the per-class "newly extended" marks: one bit per compilation
//! thread that was running a remote compile when the class gained a
//! subclass. Grows on demand, so there is no fixed bound on the number of
//! compilation threads.

use crate::core::ids::CompThreadId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadBitSet {
    words: Vec<u64>,
}

impl ThreadBitSet {
    /// Create empty set.
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    fn locate(thread: CompThreadId) -> (usize, u64) {
        (thread / 64, 1u64 << (thread % 64))
    }

    /// Check if the thread's bit is set.
    pub fn contains(&self, thread: CompThreadId) -> bool {
        let (word, mask) = Self::locate(thread);
        self.words.get(word).is_some_and(|w| w & mask != 0)
    }

    /// Set the thread's bit.
    pub fn set(&mut self, thread: CompThreadId) {
        let (word, mask) = Self::locate(thread);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= mask;
    }

    /// Clear the thread's bit.
    pub fn clear(&mut self, thread: CompThreadId) {
        let (word, mask) = Self::locate(thread);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !mask;
        }
    }

    /// Set union with another set.
    pub fn union(&mut self, other: &ThreadBitSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (dst, src) in self.words.iter_mut().zip(&other.words) {
            *dst |= *src;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Iterate set thread ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = CompThreadId> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(i * 64 + bit)
            })
        })
    }

    pub fn clear_all(&mut self) {
        self.words.clear();
    }
}

impl FromIterator<CompThreadId> for ThreadBitSet {
    fn from_iter<I: IntoIterator<Item = CompThreadId>>(iter: I) -> Self {
        let mut set = ThreadBitSet::new();
        for thread in iter {
            set.set(thread);
        }
        set
    }
}
