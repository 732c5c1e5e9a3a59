//! Per-slot dirty-page bitmaps.
//!
//! One bit per guest page, relative to the owning slot's base frame.
//! Bits are set with atomic `fetch_or` from any execution thread and
//! read without locking; the bitmap itself is kept alive by the slot
//! table's grace period, so readers never race with its release.

use std::collections::TryReserveError;
use std::sync::atomic::{AtomicU64, Ordering};

use memslots_abi::{bit_position, bitmap_words, DirtyLog};

/// Atomic dirty bitmap sized for one slot.
#[derive(Debug)]
pub struct DirtyBitmap {
    words: Box<[AtomicU64]>,
    npages: u64,
}

impl DirtyBitmap {
    /// Allocate a clear bitmap for `npages` pages.
    ///
    /// # Errors
    ///
    /// Returns the allocator's error if the words cannot be reserved.
    pub fn try_new(npages: u64) -> Result<Self, TryReserveError> {
        let nwords = bitmap_words(npages);
        let mut words = Vec::new();
        words.try_reserve_exact(nwords)?;
        words.resize_with(nwords, || AtomicU64::new(0));
        Ok(Self {
            words: words.into_boxed_slice(),
            npages,
        })
    }

    /// Pages covered.
    pub fn npages(&self) -> u64 {
        self.npages
    }

    /// Words in the bitmap.
    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    /// Mark page `rel` (relative to the slot base) dirty.
    pub fn set(&self, rel: u64) {
        debug_assert!(rel < self.npages, "page {rel} beyond bitmap of {}", self.npages);
        let (word, mask) = bit_position(rel);
        self.words[word].fetch_or(mask, Ordering::Relaxed);
    }

    /// True if page `rel` is dirty.
    pub fn test(&self, rel: u64) -> bool {
        let (word, mask) = bit_position(rel);
        self.words
            .get(word)
            .is_some_and(|w| w.load(Ordering::Relaxed) & mask != 0)
    }

    /// Dirty pages currently recorded.
    pub fn count(&self) -> u64 {
        self.words
            .iter()
            .map(|w| u64::from(w.load(Ordering::Relaxed).count_ones()))
            .sum()
    }

    /// Copy the bitmap without clearing it.
    ///
    /// # Errors
    ///
    /// Returns the allocator's error if the copy cannot be reserved.
    pub fn snapshot(&self) -> Result<DirtyLog, TryReserveError> {
        self.collect(|w| w.load(Ordering::Relaxed))
    }

    /// Copy the bitmap and clear every bit it returns.
    ///
    /// Bits set concurrently with the call land either in the returned
    /// log or in the bitmap, never in neither.
    pub fn take(&self) -> Result<DirtyLog, TryReserveError> {
        self.collect(|w| w.swap(0, Ordering::Relaxed))
    }

    /// OR externally collected words (e.g. from KVM) into the bitmap.
    pub fn merge(&self, words: &[u64]) {
        for (dst, &src) in self.words.iter().zip(words) {
            if src != 0 {
                dst.fetch_or(src, Ordering::Relaxed);
            }
        }
    }

    fn collect(&self, mut read: impl FnMut(&AtomicU64) -> u64) -> Result<DirtyLog, TryReserveError> {
        let mut bitmap = Vec::new();
        bitmap.try_reserve_exact(self.words.len())?;
        let mut any = 0u64;
        for w in self.words.iter() {
            let v = read(w);
            any |= v;
            bitmap.push(v);
        }
        Ok(DirtyLog {
            bitmap,
            any_dirty: any != 0,
        })
    }
}
