//! Per-region remembered set: which cards elsewhere point in here.
//!
//! Each region records the cross-region references aimed at it, keyed by
//! (source region, card within the source region). A partial collection
//! then scans only those cards instead of the whole heap.
//!
//! Storage starts sparse — a few inline card slots per source region —
//! and is promoted to a per-source card bitmap once a source contributes
//! more cards than the sparse slots hold. Stale entries (the source card
//! no longer holds the pointer) are tolerated and filtered at scan time;
//! a missing entry for a live cross-region pointer is a correctness bug,
//! which is what the verifier hunts for.
//!
//! Mutation is protected by the set's own mutex; regions impose no lock
//! of their own on top. The occupancy counter is read lock-free by the
//! efficiency scoring.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Cards a source region may contribute before its sparse entry is
/// promoted to a bitmap.
const SPARSE_CARDS: usize = 4;

/// Card set contributed by one source region.
enum SourceCards {
    /// Up to [`SPARSE_CARDS`] distinct cards, unordered.
    Sparse(SmallVec<[u16; SPARSE_CARDS]>),
    /// One bit per card of the source region.
    Fine(Box<[u64]>),
}

impl SourceCards {
    fn contains(&self, card: u16) -> bool {
        match self {
            SourceCards::Sparse(cards) => cards.contains(&card),
            SourceCards::Fine(bits) => {
                bits[card as usize / 64] & (1u64 << (card as usize % 64)) != 0
            }
        }
    }
}

/// Remembered set owned by a single heap region.
pub struct RegionRemSet {
    /// Source region index → cards in that region holding inbound
    /// pointers.
    table: Mutex<FxHashMap<u32, SourceCards>>,
    /// Cards of the owning region, used to size promoted bitmaps (all
    /// regions share one grain, so source and owner card counts match).
    cards_per_region: usize,
    /// Distinct (source, card) pairs recorded. Approximate only while a
    /// mutation is in flight.
    occupied: AtomicUsize,
}

impl RegionRemSet {
    /// Creates an empty set for regions of `cards_per_region` cards.
    pub fn new(cards_per_region: usize) -> Self {
        Self {
            table: Mutex::new(FxHashMap::default()),
            cards_per_region,
            occupied: AtomicUsize::new(0),
        }
    }

    /// Records that `from_card` of region `from_region` may hold a
    /// pointer into the owning region. Returns `true` if the pair was not
    /// already present.
    pub fn add_reference(&self, from_region: u32, from_card: u16) -> bool {
        debug_assert!((from_card as usize) < self.cards_per_region);
        let mut table = self.table.lock();
        let entry = table
            .entry(from_region)
            .or_insert_with(|| SourceCards::Sparse(SmallVec::new()));

        let added = match entry {
            SourceCards::Sparse(cards) => {
                if cards.contains(&from_card) {
                    false
                } else if cards.len() < SPARSE_CARDS {
                    cards.push(from_card);
                    true
                } else {
                    // Sparse overflow: promote to a card bitmap.
                    let mut bits = vec![0u64; (self.cards_per_region + 63) / 64].into_boxed_slice();
                    for card in cards.iter() {
                        bits[*card as usize / 64] |= 1u64 << (*card as usize % 64);
                    }
                    bits[from_card as usize / 64] |= 1u64 << (from_card as usize % 64);
                    *entry = SourceCards::Fine(bits);
                    true
                }
            }
            SourceCards::Fine(bits) => {
                let slot = &mut bits[from_card as usize / 64];
                let mask = 1u64 << (from_card as usize % 64);
                let new = *slot & mask == 0;
                *slot |= mask;
                new
            }
        };

        if added {
            self.occupied.fetch_add(1, Ordering::Relaxed);
        }
        added
    }

    /// Whether the pair (`from_region`, `from_card`) is recorded.
    pub fn contains(&self, from_region: u32, from_card: u16) -> bool {
        self.table
            .lock()
            .get(&from_region)
            .map(|cards| cards.contains(from_card))
            .unwrap_or(false)
    }

    /// Distinct (source, card) pairs recorded.
    #[inline]
    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }

    /// Whether no pairs are recorded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    /// Number of distinct source regions recorded.
    pub fn source_region_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Calls `f` for every recorded (source region, card) pair.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(u32, u16),
    {
        let table = self.table.lock();
        for (&region, cards) in table.iter() {
            match cards {
                SourceCards::Sparse(cards) => {
                    for &card in cards.iter() {
                        f(region, card);
                    }
                }
                SourceCards::Fine(bits) => {
                    for (slot, &word) in bits.iter().enumerate() {
                        let mut word = word;
                        while word != 0 {
                            let bit = word.trailing_zeros() as usize;
                            f(region, (slot * 64 + bit) as u16);
                            word &= word - 1;
                        }
                    }
                }
            }
        }
    }

    /// Empties the set. The caller has exclusive use of the owning region
    /// (a freshly claimed or pause-held region); the lock is still taken,
    /// it is just guaranteed uncontended.
    pub fn clear(&self) {
        self.clear_locked();
    }

    /// Empties the set while other threads may still be inserting; their
    /// inserts land either before the clear (and vanish) or after (and
    /// survive).
    pub fn clear_locked(&self) {
        let mut table = self.table.lock();
        table.clear();
        self.occupied.store(0, Ordering::Relaxed);
    }
}
