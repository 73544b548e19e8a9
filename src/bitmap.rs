//! Mark bitmap: one liveness bit per heap word.
//!
//! The heap keeps two of these — the "previous" bitmap, whose marks are
//! complete and paired with each region's previous top-at-mark-start, and
//! the "next" bitmap being populated by the in-progress marking cycle.
//! Completing a cycle swaps the two and wipes the new next bitmap.
//!
//! Marking itself lives outside this crate; regions only read the
//! previous view to classify objects as live or dead.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::layout::{MemRegion, LOG_WORD_SIZE};

const BITS_PER_SLOT: usize = 64;

/// Bit-per-word liveness map over one contiguous heap range.
pub struct MarkBitmap {
    bits: Box<[AtomicU64]>,
    covered: MemRegion,
}

impl MarkBitmap {
    /// Creates an all-clear bitmap covering `covered`.
    pub fn new(covered: MemRegion) -> Self {
        let words = covered.word_len();
        let slots = (words + BITS_PER_SLOT - 1) / BITS_PER_SLOT;
        let bits: Vec<AtomicU64> = (0..slots).map(|_| AtomicU64::new(0)).collect();
        Self {
            bits: bits.into_boxed_slice(),
            covered,
        }
    }

    /// (slot, bit) position of `addr`, which must be in the covered range.
    #[inline]
    fn position(&self, addr: usize) -> (usize, u32) {
        debug_assert!(self.covered.contains(addr), "address outside bitmap");
        let word = (addr - self.covered.start()) >> LOG_WORD_SIZE;
        (word / BITS_PER_SLOT, (word % BITS_PER_SLOT) as u32)
    }

    /// Sets the mark bit for `addr`. Returns `true` if this call set it,
    /// `false` if it was already set — the exactly-once signal marking
    /// work queues rely on.
    #[inline]
    pub fn mark(&self, addr: usize) -> bool {
        let (slot, bit) = self.position(addr);
        let mask = 1u64 << bit;
        self.bits[slot].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Whether the mark bit for `addr` is set.
    #[inline]
    pub fn is_marked(&self, addr: usize) -> bool {
        let (slot, bit) = self.position(addr);
        self.bits[slot].load(Ordering::Acquire) & (1u64 << bit) != 0
    }

    /// Clears the mark bit for `addr`.
    #[inline]
    pub fn clear(&self, addr: usize) {
        let (slot, bit) = self.position(addr);
        self.bits[slot].fetch_and(!(1u64 << bit), Ordering::AcqRel);
    }

    /// Clears every bit. Pause-only; not atomic with respect to
    /// concurrent markers.
    pub fn clear_all(&self) {
        for slot in self.bits.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }

    /// Number of marked words in `mr`, which must lie in the covered
    /// range. Diagnostic use only; word-at-a-time.
    pub fn count_marked(&self, mr: MemRegion) -> usize {
        let mut count = 0;
        let mut addr = mr.start();
        while addr < mr.end() {
            if self.is_marked(addr) {
                count += 1;
            }
            addr += 1 << LOG_WORD_SIZE;
        }
        count
    }

    /// The covered range.
    #[inline]
    pub fn covered(&self) -> MemRegion {
        self.covered
    }
}
