//! Card table: one dirty/clean byte per 512 bytes of heap.
//!
//! The write barrier (an external collaborator) dirties the card of every
//! pointer store unconditionally; the refinement pass later drains dirty
//! cards into the owning regions' remembered sets. The table itself knows
//! nothing about regions — it is a flat byte array over the committed
//! heap, addressed by heap address.
//!
//! Card clearing during a concurrent scan hands out the raw card byte
//! (see [`CardTable::card_ref`]) so the scan can order the clear against
//! its young-region classification with an explicit fence.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::layout::{MemRegion, CARD_SIZE, LOG_CARD_SIZE};

/// Card value: no interesting pointer stores since the last drain.
pub const CARD_CLEAN: u8 = 0;

/// Card value: at least one pointer store landed in this card.
pub const CARD_DIRTY: u8 = 1;

/// Byte-per-card dirty tracking over one contiguous heap range.
pub struct CardTable {
    /// The card bytes.
    cards: Box<[AtomicU8]>,
    /// Start address of the covered range, card-aligned.
    base: usize,
}

impl CardTable {
    /// Creates a clean card table covering `covered`.
    ///
    /// The range must be card-aligned at both ends; the config layer
    /// guarantees that for any heap it accepts.
    pub fn new(covered: MemRegion) -> Self {
        debug_assert_eq!(covered.start() % CARD_SIZE, 0, "unaligned card table base");
        debug_assert_eq!(covered.byte_len() % CARD_SIZE, 0, "ragged card table extent");

        let num_cards = covered.byte_len() >> LOG_CARD_SIZE;
        let cards: Vec<AtomicU8> = (0..num_cards).map(|_| AtomicU8::new(CARD_CLEAN)).collect();

        Self {
            cards: cards.into_boxed_slice(),
            base: covered.start(),
        }
    }

    /// Card index of `addr`, or `None` outside the covered range.
    #[inline]
    fn index_of(&self, addr: usize) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let index = (addr - self.base) >> LOG_CARD_SIZE;
        (index < self.cards.len()).then_some(index)
    }

    /// Marks the card containing `addr` dirty. Out-of-range addresses are
    /// ignored.
    #[inline]
    pub fn dirty(&self, addr: usize) {
        if let Some(index) = self.index_of(addr) {
            self.cards[index].store(CARD_DIRTY, Ordering::Relaxed);
        }
    }

    /// Whether the card containing `addr` is dirty.
    #[inline]
    pub fn is_dirty(&self, addr: usize) -> bool {
        self.index_of(addr)
            .map(|i| self.cards[i].load(Ordering::Relaxed) == CARD_DIRTY)
            .unwrap_or(false)
    }

    /// The raw card byte for `addr`, for callers that must order a clear
    /// against surrounding loads themselves.
    #[inline]
    pub fn card_ref(&self, addr: usize) -> Option<&AtomicU8> {
        self.index_of(addr).map(|i| &self.cards[i])
    }

    /// Heap span covered by the card at `index`.
    #[inline]
    pub fn card_span(&self, index: usize) -> MemRegion {
        let start = self.base + (index << LOG_CARD_SIZE);
        MemRegion::new(start, start + CARD_SIZE)
    }

    /// Clears every card overlapping `mr`. Used by the batched parallel
    /// clear of an empty region.
    pub fn clear_range(&self, mr: MemRegion) {
        if mr.is_empty() {
            return;
        }
        let first = match self.index_of(mr.start()) {
            Some(i) => i,
            None => return,
        };
        let last = self.index_of(mr.end() - 1).unwrap_or(self.cards.len() - 1);
        for card in &self.cards[first..=last] {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Clears all cards.
    pub fn clear_all(&self) {
        for card in self.cards.iter() {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Calls `f` with the heap span of every dirty card.
    ///
    /// The snapshot is racy by design: cards dirtied during the walk may
    /// or may not be visited; they stay dirty for the next pass either
    /// way.
    pub fn for_each_dirty<F>(&self, mut f: F)
    where
        F: FnMut(MemRegion),
    {
        for (i, card) in self.cards.iter().enumerate() {
            if card.load(Ordering::Relaxed) == CARD_DIRTY {
                f(self.card_span(i));
            }
        }
    }

    /// Number of dirty cards right now.
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) == CARD_DIRTY)
            .count()
    }

    /// Total number of cards.
    #[inline]
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether the table covers no cards.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Start address of the covered range.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }
}
