//! Block offset table: per-region map from cards to block starts.
//!
//! Given any address inside a region, the allocator-maintained offset
//! table finds the start of the object block containing it without
//! walking from the region bottom. One byte per card:
//!
//! ```text
//! 0..=64   block start is this many words back from the card boundary
//! 65 + k   no block starts nearby; skip back 2^k cards and re-read
//! ```
//!
//! Entries are filled lazily. The table keeps a threshold — the first
//! card boundary not yet covered by any entry — and the region calls
//! [`BlockOffsetTable::alloc_block`] whenever a completed allocation
//! crosses it. A block spanning many cards writes one direct entry at its
//! first boundary and power-of-two back-skips for the rest, so a lookup
//! over an N-card block chases O(log N) entries.
//!
//! Lookups are only guaranteed for completed allocations: concurrent
//! callers must stay below the parsable prefix their region hands them
//! (the pause that records a saved mark also orders the BOT writes of
//! everything beneath it).

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::layout::{align_down, align_up, CARD_SIZE, LOG_CARD_SIZE, LOG_WORD_SIZE, WORDS_PER_CARD};

/// Largest direct back-offset, in words (one full card).
const MAX_DIRECT: u8 = WORDS_PER_CARD as u8;

/// First back-skip entry value; `BASE_SKIP + k` encodes "back 2^k cards".
const BASE_SKIP: u8 = MAX_DIRECT + 1;

/// Per-region block offset table.
pub struct BlockOffsetTable {
    /// One entry per card of the region's original extent.
    offsets: Box<[AtomicU8]>,
    /// Region bottom; card 0 starts here.
    bottom: usize,
    /// First card boundary with no recorded entry. Monotonic between
    /// resets; advanced with `fetch_max` so out-of-order parallel
    /// recording stays safe.
    threshold: AtomicUsize,
}

impl BlockOffsetTable {
    /// Creates an empty table for a region of `cards` cards starting at
    /// `bottom` (card-aligned).
    pub fn new(bottom: usize, cards: usize) -> Self {
        debug_assert_eq!(bottom % CARD_SIZE, 0, "unaligned region bottom");
        let offsets: Vec<AtomicU8> = (0..cards).map(|_| AtomicU8::new(0)).collect();
        Self {
            offsets: offsets.into_boxed_slice(),
            bottom,
            threshold: AtomicUsize::new(bottom),
        }
    }

    /// Forgets all recorded blocks; the region does this on `hr_clear`.
    pub fn reset(&self) {
        for entry in self.offsets.iter() {
            entry.store(0, Ordering::Relaxed);
        }
        self.threshold.store(self.bottom, Ordering::Release);
    }

    /// First card boundary not yet covered by a recorded entry.
    #[inline]
    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Acquire)
    }

    /// Number of cards the table covers.
    #[inline]
    pub fn cards(&self) -> usize {
        self.offsets.len()
    }

    /// Records the completed block `[block_start, block_end)`.
    ///
    /// Writes an entry for every card boundary the block covers; a block
    /// that crosses no boundary records nothing (its card is covered by
    /// the block that contains the card's first word). Safe to call from
    /// parallel allocators — each block writes only its own cards.
    pub fn alloc_block(&self, block_start: usize, block_end: usize) {
        debug_assert!(block_start < block_end);
        debug_assert!(block_start >= self.bottom);
        debug_assert_eq!(block_start % (1 << LOG_WORD_SIZE), 0);

        let first = align_up(block_start, CARD_SIZE);
        if first >= block_end {
            return;
        }

        let anchor = (first - self.bottom) >> LOG_CARD_SIZE;
        let last = (block_end - 1 - self.bottom) >> LOG_CARD_SIZE;
        debug_assert!(last < self.offsets.len(), "block beyond table extent");

        // Direct entry at the first covered boundary, back-skips after.
        let back_words = ((first - block_start) >> LOG_WORD_SIZE) as u8;
        debug_assert!(back_words < MAX_DIRECT || first == block_start);
        self.offsets[anchor].store(back_words, Ordering::Release);

        for card in anchor + 1..=last {
            let back_cards = card - anchor;
            let k = (usize::BITS - 1 - back_cards.leading_zeros()) as u8;
            self.offsets[card].store(BASE_SKIP + k, Ordering::Release);
        }

        let covered = align_up(block_end, CARD_SIZE);
        self.threshold.fetch_max(covered, Ordering::AcqRel);
    }

    /// Seeds the table for a humongous object filling the region from
    /// `bottom` up to `cover_end` (capped at the region's original end by
    /// the caller).
    pub fn set_for_humongous(&self, cover_end: usize) {
        self.alloc_block(self.bottom, cover_end);
    }

    /// A recorded block start at or below `addr`.
    ///
    /// This is a hint: the true block containing `addr` starts at or
    /// after the returned address, and the caller walks forward by block
    /// sizes to find it. Addresses past the threshold fall back to the
    /// last recorded card; with nothing recorded, the region bottom.
    pub fn block_start_hint(&self, addr: usize) -> usize {
        let threshold = self.threshold.load(Ordering::Acquire);
        if threshold == self.bottom {
            return self.bottom;
        }
        let card_addr = align_down(addr, CARD_SIZE).min(threshold - CARD_SIZE);
        let card = (card_addr - self.bottom) >> LOG_CARD_SIZE;
        self.resolve_card(card)
    }

    /// Chases the entry chain from `card` down to a direct entry and
    /// returns the block start it records.
    ///
    /// A corrupt chain (skip past card 0) resolves to the region bottom
    /// rather than wrapping; the verifier reports the mismatch instead.
    pub fn resolve_card(&self, card: usize) -> usize {
        let mut card = card;
        loop {
            let entry = self.offsets[card].load(Ordering::Acquire);
            if entry <= MAX_DIRECT {
                let card_addr = self.bottom + (card << LOG_CARD_SIZE);
                return card_addr - ((entry as usize) << LOG_WORD_SIZE);
            }
            let skip = 1usize << (entry - BASE_SKIP);
            if skip > card {
                return self.bottom;
            }
            card -= skip;
        }
    }

    /// Raw entry byte for `card`.
    #[inline]
    pub fn entry(&self, card: usize) -> u8 {
        self.offsets[card].load(Ordering::Acquire)
    }

    /// Overwrites a raw entry byte.
    ///
    /// Diagnostic hook for verification stress tests, which plant a
    /// corrupt entry and expect the verifier to report it. Never called
    /// on a healthy heap.
    pub fn overwrite_entry(&self, card: usize, value: u8) {
        self.offsets[card].store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::WORD_SIZE;

    const BOTTOM: usize = 0x1000_0000;
    const CARDS: usize = 2048; // a 1 MiB region

    fn table() -> BlockOffsetTable {
        BlockOffsetTable::new(BOTTOM, CARDS)
    }

    #[test]
    fn test_empty_table_hints_bottom() {
        let bot = table();
        assert_eq!(bot.threshold(), BOTTOM);
        assert_eq!(bot.block_start_hint(BOTTOM), BOTTOM);
        assert_eq!(bot.block_start_hint(BOTTOM + 10 * CARD_SIZE), BOTTOM);
    }

    #[test]
    fn test_small_blocks_within_one_card_record_nothing() {
        let bot = table();
        bot.alloc_block(BOTTOM + 8, BOTTOM + 16);
        bot.alloc_block(BOTTOM + 16, BOTTOM + 64);
        assert_eq!(bot.threshold(), BOTTOM);
    }

    #[test]
    fn test_sequential_blocks_cross_boundaries() {
        let bot = table();
        // First block owns card 0 (starts exactly at bottom).
        bot.alloc_block(BOTTOM, BOTTOM + 24);
        assert_eq!(bot.threshold(), BOTTOM + CARD_SIZE);
        assert_eq!(bot.block_start_hint(BOTTOM + 8), BOTTOM);

        // Fill up to just past the next boundary.
        bot.alloc_block(BOTTOM + 24, BOTTOM + CARD_SIZE + 40);
        assert_eq!(bot.threshold(), BOTTOM + 2 * CARD_SIZE);
        // Card 1's first word belongs to the second block.
        let hint = bot.block_start_hint(BOTTOM + CARD_SIZE + 8);
        assert_eq!(hint, BOTTOM + 24);
    }

    #[test]
    fn test_hint_is_at_or_below_addr() {
        let bot = table();
        let mut cursor = BOTTOM;
        let sizes = [24usize, 512, 64, 2000, 8, 4096, 72];
        for size in sizes {
            bot.alloc_block(cursor, cursor + size);
            cursor += size;
        }
        let mut addr = BOTTOM;
        while addr < cursor {
            let hint = bot.block_start_hint(addr);
            assert!(hint <= addr, "hint {:#x} above addr {:#x}", hint, addr);
            assert!(hint >= BOTTOM);
            addr += WORD_SIZE;
        }
    }

    #[test]
    fn test_long_block_uses_back_skips() {
        let bot = table();
        let span = 300 * CARD_SIZE;
        bot.alloc_block(BOTTOM, BOTTOM + span);
        assert_eq!(bot.threshold(), BOTTOM + span);

        // Every covered card resolves to the block start.
        for card in 0..300 {
            assert_eq!(bot.resolve_card(card), BOTTOM, "card {}", card);
        }
        // Far cards carry skip entries, not direct offsets.
        assert!(bot.entry(256) > MAX_DIRECT);
        assert_eq!(bot.block_start_hint(BOTTOM + 299 * CARD_SIZE + 96), BOTTOM);
    }

    #[test]
    fn test_unaligned_block_start_gets_direct_offset() {
        let bot = table();
        bot.alloc_block(BOTTOM, BOTTOM + CARD_SIZE - 48);
        bot.alloc_block(BOTTOM + CARD_SIZE - 48, BOTTOM + 3 * CARD_SIZE);

        // Card 1's entry points 6 words back to the second block's start.
        assert_eq!(bot.entry(1), 6);
        assert_eq!(bot.resolve_card(1), BOTTOM + CARD_SIZE - 48);
        assert_eq!(bot.resolve_card(2), BOTTOM + CARD_SIZE - 48);
    }

    #[test]
    fn test_humongous_seed_covers_whole_extent() {
        let bot = table();
        bot.set_for_humongous(BOTTOM + CARDS * CARD_SIZE);
        assert_eq!(bot.threshold(), BOTTOM + CARDS * CARD_SIZE);
        assert_eq!(bot.resolve_card(CARDS - 1), BOTTOM);
        assert_eq!(bot.block_start_hint(BOTTOM + (CARDS - 1) * CARD_SIZE + 64), BOTTOM);
    }

    #[test]
    fn test_reset_forgets_everything() {
        let bot = table();
        bot.alloc_block(BOTTOM, BOTTOM + 10 * CARD_SIZE);
        assert_ne!(bot.threshold(), BOTTOM);

        bot.reset();
        assert_eq!(bot.threshold(), BOTTOM);
        assert_eq!(bot.entry(4), 0);
        assert_eq!(bot.block_start_hint(BOTTOM + 5 * CARD_SIZE), BOTTOM);
    }

    #[test]
    fn test_corrupt_skip_resolves_to_bottom() {
        let bot = table();
        bot.alloc_block(BOTTOM, BOTTOM + 4 * CARD_SIZE);
        // Skip of 2^10 cards from card 3 would underflow.
        bot.overwrite_entry(3, BASE_SKIP + 10);
        assert_eq!(bot.resolve_card(3), BOTTOM);
    }
}
