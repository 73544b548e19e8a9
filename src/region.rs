//! Heap regions: fixed-size partitions of the managed heap.
//!
//! A [`HeapRegion`] is constructed once per grain of the committed heap
//! and then recycled forever through the lifecycle
//! `free → allocating → used → (optionally humongous) → reclaimed → free`.
//! It tracks an allocation frontier (`top`), marking snapshots (the
//! previous and next top-at-mark-start with their live-byte counters),
//! and exclusively owns its block offset table and remembered set.
//!
//! All mutable state is atomic: regions are shared by reference across
//! GC worker threads, and the only coordination primitive a region
//! exposes is the claim token — a single compare-exchange that hands the
//! region to exactly one worker per claim value. Nothing here blocks.
//!
//! The careful iterators tolerate a concurrently advancing `top`: they
//! walk only the parsable prefix (bounded by the saved mark while a GC
//! is active) and stop at the first object whose header has not been
//! published yet, returning its address so the caller can defer.

use std::fmt;
use std::sync::atomic::{
    fence, AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering,
};

use crate::bitmap::MarkBitmap;
use crate::bot::BlockOffsetTable;
use crate::card_table::{CardTable, CARD_CLEAN};
use crate::config::RegionSizing;
use crate::layout::{format_bytes, MemRegion, WORD_SIZE};
use crate::object::ObjectModel;
use crate::policy::ScanTimePolicy;
use crate::remset::RegionRemSet;
use crate::scan::{ObjectVisitor, ReferenceVisitor, ScanFilter};

/// Claim value every region is reset to; never handed to workers.
pub const INITIAL_CLAIM: u32 = 0;

/// Sentinel for "no humongous start region".
const NO_HUMONGOUS_START: u32 = u32::MAX;

/// Sentinel for "not in the young collection-set list".
const NO_YOUNG_INDEX: u32 = u32::MAX;

/// Lifecycle/type tag of a region.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Uncommitted to any use; on the manager's free list.
    Free = 0,
    /// Young region taking new allocations.
    Eden = 1,
    /// Young region holding objects that survived one collection.
    Survivor = 2,
    /// Plain old-generation region.
    Old = 3,
    /// First region of a humongous object; `end` is extended over the
    /// whole object.
    StartsHumongous = 4,
    /// Follow-on region of a humongous object; holds no object start.
    ContinuesHumongous = 5,
}

impl RegionKind {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RegionKind::Free,
            1 => RegionKind::Eden,
            2 => RegionKind::Survivor,
            3 => RegionKind::Old,
            4 => RegionKind::StartsHumongous,
            _ => RegionKind::ContinuesHumongous,
        }
    }

    /// Whether this is a young (implicitly fully-scanned) kind.
    #[inline]
    pub fn is_young(self) -> bool {
        matches!(self, RegionKind::Eden | RegionKind::Survivor)
    }

    /// Whether this is either humongous kind.
    #[inline]
    pub fn is_humongous(self) -> bool {
        matches!(self, RegionKind::StartsHumongous | RegionKind::ContinuesHumongous)
    }

    /// Two-character tag used by the region printout.
    pub fn tag(self) -> &'static str {
        match self {
            RegionKind::Free => "F ",
            RegionKind::Eden => "E ",
            RegionKind::Survivor => "S ",
            RegionKind::Old => "O ",
            RegionKind::StartsHumongous => "HS",
            RegionKind::ContinuesHumongous => "HC",
        }
    }
}

/// Snapshot of the collector state the careful iterators need: the GC
/// clock, whether a collection is active (which bounds the parsable
/// prefix by the saved mark), and the completed marking bitmap for
/// liveness.
pub struct ScanContext<'a> {
    /// Current GC timestamp.
    pub clock: u32,
    /// Whether a collection pause or marking phase is in progress.
    pub gc_active: bool,
    /// The previous (complete) marking bitmap.
    pub prev_bitmap: &'a MarkBitmap,
}

/// One fixed-size partition of the heap.
pub struct HeapRegion {
    /// Position in the manager's region array; fixed at construction.
    index: u32,
    /// Fixed lower bound of the address range.
    bottom: usize,
    /// `bottom + grain`; `end` returns here when a humongous extension
    /// is cleared.
    original_end: usize,
    sizing: RegionSizing,

    /// Allocation frontier, `bottom <= top <= end`.
    top: AtomicUsize,
    /// Upper bound; equals `original_end` except on a starts-humongous
    /// region.
    end: AtomicUsize,
    kind: AtomicU8,
    /// Owner-partition token for multi-tenant allocation.
    alloc_context: AtomicU8,
    /// Claim token for exactly-once work distribution.
    claim: AtomicU32,
    /// Index of the humongous start region, [`NO_HUMONGOUS_START`] when
    /// not humongous. A starts-humongous region names itself.
    humongous_start: AtomicU32,

    /// Top at the start of the previous (completed) marking.
    prev_tams: AtomicUsize,
    /// Top at the start of the in-progress marking.
    next_tams: AtomicUsize,
    prev_marked_bytes: AtomicUsize,
    next_marked_bytes: AtomicUsize,

    /// Saved `top` for scanners racing the current GC; see
    /// [`record_top_and_timestamp`](Self::record_top_and_timestamp).
    saved_mark: AtomicUsize,
    /// GC timestamp the saved mark belongs to.
    timestamp: AtomicU32,

    in_collection_set: AtomicBool,
    young_index: AtomicU32,
    /// Last computed efficiency score, as f64 bits.
    gc_efficiency: AtomicU64,

    bot: BlockOffsetTable,
    rem_set: RegionRemSet,
}

impl HeapRegion {
    /// Binds region `index` to the fixed range starting at `bottom`
    /// (grain-aligned). The region comes up free and empty.
    pub fn new(index: u32, bottom: usize, sizing: RegionSizing) -> Self {
        debug_assert_eq!(bottom % sizing.grain_bytes(), 0, "unaligned region bottom");
        let end = bottom + sizing.grain_bytes();
        Self {
            index,
            bottom,
            original_end: end,
            sizing,
            top: AtomicUsize::new(bottom),
            end: AtomicUsize::new(end),
            kind: AtomicU8::new(RegionKind::Free as u8),
            alloc_context: AtomicU8::new(0),
            claim: AtomicU32::new(INITIAL_CLAIM),
            humongous_start: AtomicU32::new(NO_HUMONGOUS_START),
            prev_tams: AtomicUsize::new(bottom),
            next_tams: AtomicUsize::new(bottom),
            prev_marked_bytes: AtomicUsize::new(0),
            next_marked_bytes: AtomicUsize::new(0),
            saved_mark: AtomicUsize::new(bottom),
            timestamp: AtomicU32::new(0),
            in_collection_set: AtomicBool::new(false),
            young_index: AtomicU32::new(NO_YOUNG_INDEX),
            gc_efficiency: AtomicU64::new(0f64.to_bits()),
            bot: BlockOffsetTable::new(bottom, sizing.cards_per_region()),
            rem_set: RegionRemSet::new(sizing.cards_per_region()),
        }
    }

    // -------------------------------------------------------------------------
    // Geometry
    // -------------------------------------------------------------------------

    /// Position in the owning manager's region array.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Lower bound of the address range.
    #[inline]
    pub fn bottom(&self) -> usize {
        self.bottom
    }

    /// Allocation frontier.
    #[inline]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    /// Upper bound of the address range; extended on a starts-humongous
    /// region.
    #[inline]
    pub fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    /// The current `[bottom, end)` span.
    #[inline]
    pub fn mem_region(&self) -> MemRegion {
        MemRegion::new(self.bottom, self.end())
    }

    /// Current capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.end() - self.bottom
    }

    /// Bytes below the allocation frontier.
    #[inline]
    pub fn used(&self) -> usize {
        self.top() - self.bottom
    }

    /// Bytes still allocatable.
    #[inline]
    pub fn free(&self) -> usize {
        self.end().saturating_sub(self.top())
    }

    /// Whether nothing has been allocated here.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top() == self.bottom
    }

    // -------------------------------------------------------------------------
    // Kind / lifecycle
    // -------------------------------------------------------------------------

    /// Current lifecycle tag.
    #[inline]
    pub fn kind(&self) -> RegionKind {
        RegionKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    /// Sets a non-humongous kind. Humongous transitions go through
    /// [`set_starts_humongous`](Self::set_starts_humongous) and friends.
    pub fn set_kind(&self, kind: RegionKind) {
        debug_assert!(!kind.is_humongous(), "humongous kinds have dedicated setters");
        debug_assert!(!self.is_humongous(), "clear_humongous first");
        self.kind.store(kind as u8, Ordering::Release);
    }

    /// Whether the region is on the free list.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.kind() == RegionKind::Free
    }

    /// Whether the region is young (eden or survivor). Young regions are
    /// rescanned wholesale every young collection, which is why they are
    /// exempt from remembered-set tracking.
    #[inline]
    pub fn is_young(&self) -> bool {
        self.kind().is_young()
    }

    /// Whether the region is either humongous kind.
    #[inline]
    pub fn is_humongous(&self) -> bool {
        self.kind().is_humongous()
    }

    /// Whether the region is the first of a humongous chain.
    #[inline]
    pub fn starts_humongous(&self) -> bool {
        self.kind() == RegionKind::StartsHumongous
    }

    /// Whether the region continues a humongous chain.
    #[inline]
    pub fn continues_humongous(&self) -> bool {
        self.kind() == RegionKind::ContinuesHumongous
    }

    /// Index of this region's humongous start region, if humongous.
    #[inline]
    pub fn humongous_start_index(&self) -> Option<u32> {
        let raw = self.humongous_start.load(Ordering::Acquire);
        (raw != NO_HUMONGOUS_START).then_some(raw)
    }

    /// Bottom address of the chain's start region, computed from the
    /// index delta (regions are laid out contiguously at one grain).
    fn humongous_start_bottom(&self) -> usize {
        let start = self.humongous_start.load(Ordering::Acquire);
        debug_assert_ne!(start, NO_HUMONGOUS_START);
        self.bottom - ((self.index - start) as usize * self.sizing.grain_bytes())
    }

    /// Resets the region's metadata on its way back to reuse.
    ///
    /// Collection-set membership, survivor stats, the claim token, both
    /// top-at-mark-start snapshots and live counters, the saved mark and
    /// timestamp all return to their initial values. With `clear_space`
    /// the allocation frontier and block offset table are reset too.
    ///
    /// The remembered set is cleared inline unless `par`, in which case
    /// a worker clears it later via [`par_clear`](Self::par_clear);
    /// `locked` selects the remembered set's concurrent-safe clear.
    ///
    /// The kind tag is untouched — the caller decides what the region
    /// becomes next. Humongous regions must go through
    /// [`clear_humongous`](Self::clear_humongous) first.
    pub fn clear(&self, par: bool, clear_space: bool, locked: bool) {
        debug_assert!(!self.is_humongous(), "clear_humongous first");
        debug_assert_eq!(self.end(), self.original_end, "still extended");

        self.in_collection_set.store(false, Ordering::Release);
        self.young_index.store(NO_YOUNG_INDEX, Ordering::Release);
        self.claim.store(INITIAL_CLAIM, Ordering::Release);
        self.alloc_context.store(0, Ordering::Release);
        self.prev_tams.store(self.bottom, Ordering::Release);
        self.next_tams.store(self.bottom, Ordering::Release);
        self.prev_marked_bytes.store(0, Ordering::Release);
        self.next_marked_bytes.store(0, Ordering::Release);
        self.saved_mark.store(self.bottom, Ordering::Release);
        self.timestamp.store(0, Ordering::Release);
        self.gc_efficiency.store(0f64.to_bits(), Ordering::Release);

        if clear_space {
            self.top.store(self.bottom, Ordering::Release);
            self.bot.reset();
        }

        if !par {
            if locked {
                self.rem_set.clear_locked();
            } else {
                self.rem_set.clear();
            }
        }
    }

    /// Worker-side batched clear for a region already reset by a
    /// parallel [`clear`](Self::clear): empties the remembered set and
    /// cleans the region's card span.
    pub fn par_clear(&self, card_table: &CardTable) {
        debug_assert_eq!(self.used(), 0, "par_clear on a non-empty region");
        debug_assert_eq!(self.capacity(), self.sizing.grain_bytes());
        self.rem_set.clear_locked();
        card_table.clear_range(self.mem_region());
    }

    // -------------------------------------------------------------------------
    // Claiming
    // -------------------------------------------------------------------------

    /// Atomically hands the region to the caller for `claim_value`.
    ///
    /// Exactly one of N concurrent callers with the same value gets
    /// `true`; losers move on to the next candidate region rather than
    /// retrying here. Never blocks.
    pub fn claim(&self, claim_value: u32) -> bool {
        let current = self.claim.load(Ordering::Relaxed);
        if current == claim_value {
            return false;
        }
        self.claim
            .compare_exchange(current, claim_value, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Current claim token.
    #[inline]
    pub fn claim_value(&self) -> u32 {
        self.claim.load(Ordering::Acquire)
    }

    /// Resets the claim token; pause-only.
    pub fn set_claim_value(&self, claim_value: u32) {
        self.claim.store(claim_value, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Bump-allocates `byte_size` bytes for a single owning thread.
    /// Returns the block address, or `None` when the region is full.
    pub fn allocate(&self, byte_size: usize) -> Option<usize> {
        debug_assert_eq!(byte_size % WORD_SIZE, 0, "unaligned allocation");
        let old = self.top.load(Ordering::Relaxed);
        let new = old + byte_size;
        if new > self.end.load(Ordering::Relaxed) {
            return None;
        }
        self.top.store(new, Ordering::Release);
        self.bot.alloc_block(old, new);
        Some(old)
    }

    /// Lock-free bump allocation racing other allocators on the same
    /// region.
    pub fn par_allocate(&self, byte_size: usize) -> Option<usize> {
        debug_assert_eq!(byte_size % WORD_SIZE, 0, "unaligned allocation");
        let end = self.end.load(Ordering::Relaxed);
        let mut old = self.top.load(Ordering::Relaxed);
        loop {
            let new = old + byte_size;
            if new > end {
                return None;
            }
            match self
                .top
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.bot.alloc_block(old, new);
                    return Some(old);
                }
                Err(current) => old = current,
            }
        }
    }

    /// Owner-partition token.
    #[inline]
    pub fn allocation_context(&self) -> u8 {
        self.alloc_context.load(Ordering::Acquire)
    }

    /// Sets the owner-partition token.
    pub fn set_allocation_context(&self, context: u8) {
        self.alloc_context.store(context, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Humongous chain
    // -------------------------------------------------------------------------

    /// Turns an empty, unextended region into the start of a humongous
    /// chain: `end` is extended to `new_end` (the last chain region's
    /// end) and `top` jumps to `new_top` (the object's end). The block
    /// offset table is seeded so every interior address resolves to
    /// `bottom`.
    pub fn set_starts_humongous(&self, new_top: usize, new_end: usize) {
        debug_assert!(!self.is_humongous(), "already humongous");
        debug_assert!(self.is_empty(), "humongous setup on a non-empty region");
        debug_assert_eq!(self.end(), self.original_end, "already extended");
        debug_assert!(new_top > self.bottom && new_top <= new_end);
        debug_assert!(new_end >= self.original_end);

        self.kind.store(RegionKind::StartsHumongous as u8, Ordering::Release);
        self.humongous_start.store(self.index, Ordering::Release);
        self.end.store(new_end, Ordering::Release);
        self.top.store(new_top, Ordering::Release);
        self.bot.set_for_humongous(new_top.min(self.original_end));
    }

    /// Links an empty, unextended region into `first`'s humongous chain.
    /// The region reads as fully occupied (`top == end`) and keeps its
    /// original extent.
    pub fn set_continues_humongous(&self, first: &HeapRegion) {
        debug_assert!(!self.is_humongous(), "already humongous");
        debug_assert!(self.is_empty(), "humongous setup on a non-empty region");
        debug_assert_eq!(self.end(), self.original_end, "already extended");
        debug_assert!(first.starts_humongous(), "chain start not set up");
        debug_assert!(first.index < self.index);

        self.kind.store(RegionKind::ContinuesHumongous as u8, Ordering::Release);
        self.humongous_start.store(first.index, Ordering::Release);
        self.top.store(self.original_end, Ordering::Release);
    }

    /// Takes the region out of its humongous chain: restores `end` to
    /// the original extent (capping `top` there on the start region) and
    /// drops back to the plain non-humongous kind. The caller finishes
    /// the teardown with [`clear`](Self::clear).
    pub fn clear_humongous(&self) {
        debug_assert!(self.is_humongous());
        if self.starts_humongous() {
            self.end.store(self.original_end, Ordering::Release);
            if self.top() > self.original_end {
                self.top.store(self.original_end, Ordering::Release);
            }
        } else {
            debug_assert_eq!(self.end(), self.original_end);
        }
        self.kind.store(RegionKind::Old as u8, Ordering::Release);
        self.humongous_start.store(NO_HUMONGOUS_START, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Collection-set membership
    // -------------------------------------------------------------------------

    /// Whether the region is currently selected for evacuation.
    #[inline]
    pub fn in_collection_set(&self) -> bool {
        self.in_collection_set.load(Ordering::Acquire)
    }

    /// Marks or unmarks the region as selected for evacuation.
    pub fn set_in_collection_set(&self, value: bool) {
        self.in_collection_set.store(value, Ordering::Release);
    }

    /// Position in the young collection-set list, if any.
    #[inline]
    pub fn young_index_in_cset(&self) -> Option<u32> {
        let raw = self.young_index.load(Ordering::Acquire);
        (raw != NO_YOUNG_INDEX).then_some(raw)
    }

    /// Sets or clears the young collection-set position.
    pub fn set_young_index_in_cset(&self, index: Option<u32>) {
        self.young_index
            .store(index.unwrap_or(NO_YOUNG_INDEX), Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Marking bookkeeping
    // -------------------------------------------------------------------------

    /// Top at the start of the previous completed marking.
    #[inline]
    pub fn prev_top_at_mark_start(&self) -> usize {
        self.prev_tams.load(Ordering::Acquire)
    }

    /// Top at the start of the in-progress marking.
    #[inline]
    pub fn next_top_at_mark_start(&self) -> usize {
        self.next_tams.load(Ordering::Acquire)
    }

    /// Snapshot for a new marking cycle: NTAMS = top, next live counter
    /// reset. Objects allocated above NTAMS are implicitly live for this
    /// cycle.
    pub fn note_start_of_marking(&self) {
        self.next_marked_bytes.store(0, Ordering::Release);
        self.next_tams.store(self.top(), Ordering::Release);
    }

    /// Promotes the just-completed marking to "previous": PTAMS and the
    /// previous live counter take the next values, and NTAMS drops back
    /// to bottom.
    pub fn note_end_of_marking(&self) {
        self.prev_tams
            .store(self.next_tams.load(Ordering::Acquire), Ordering::Release);
        self.prev_marked_bytes.store(
            self.next_marked_bytes.load(Ordering::Acquire),
            Ordering::Release,
        );
        self.next_tams.store(self.bottom, Ordering::Release);
        self.next_marked_bytes.store(0, Ordering::Release);
    }

    /// Credits `bytes` of newly marked objects to the in-progress cycle.
    pub fn add_to_marked_bytes(&self, bytes: usize) {
        self.next_marked_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Live bytes per the previous marking.
    #[inline]
    pub fn prev_marked_bytes(&self) -> usize {
        self.prev_marked_bytes.load(Ordering::Acquire)
    }

    /// Live bytes credited to the in-progress marking so far.
    #[inline]
    pub fn next_marked_bytes(&self) -> usize {
        self.next_marked_bytes.load(Ordering::Acquire)
    }

    /// Bytes known live: marked below PTAMS plus everything allocated
    /// since.
    pub fn live_bytes(&self) -> usize {
        self.prev_marked_bytes() + (self.top() - self.prev_top_at_mark_start())
    }

    /// Bytes a collection of this region would reclaim.
    pub fn reclaimable_bytes(&self) -> usize {
        self.used() - self.live_bytes()
    }

    /// Whether the object at `addr` is dead per the previous marking:
    /// below PTAMS and unmarked. Anything at or above PTAMS is
    /// implicitly live.
    ///
    /// An address below `bottom` is a humongous chain start seen from a
    /// continuation region; its own region tracks its liveness and it
    /// reads as live here.
    #[inline]
    pub fn is_obj_dead(&self, addr: usize, prev_bitmap: &MarkBitmap) -> bool {
        addr >= self.bottom
            && addr < self.prev_top_at_mark_start()
            && !prev_bitmap.is_marked(addr)
    }

    // -------------------------------------------------------------------------
    // Saved mark / timestamp
    // -------------------------------------------------------------------------

    /// Publishes the current `top` as this GC's high-water mark, once per
    /// clock value.
    ///
    /// Races with concurrent readers by design: a reader either sees the
    /// new timestamp (and then, by the store ordering below, the saved
    /// mark written before it) or the old timestamp (and falls back to a
    /// live `top` read). Both are correct for the clock the reader holds,
    /// so no lock is taken. The saved-mark store must not be reordered
    /// after the timestamp store.
    pub fn record_top_and_timestamp(&self, clock: u32) {
        if self.timestamp.load(Ordering::Acquire) < clock {
            self.saved_mark.store(self.top(), Ordering::Release);
            self.timestamp.store(clock, Ordering::Release);
        }
    }

    /// High-water mark for scanners working under `clock`: the saved
    /// mark if this region already recorded one for the clock, else the
    /// live `top`.
    pub fn saved_mark_word(&self, clock: u32) -> usize {
        if self.timestamp.load(Ordering::Acquire) < clock {
            self.top()
        } else {
            self.saved_mark.load(Ordering::Acquire)
        }
    }

    /// GC timestamp of the saved mark.
    #[inline]
    pub fn timestamp(&self) -> u32 {
        self.timestamp.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Efficiency scoring
    // -------------------------------------------------------------------------

    /// Computes, stores, and returns reclaimable bytes per predicted
    /// scan millisecond. Higher scores make better eviction candidates.
    pub fn calc_gc_efficiency(&self, policy: &dyn ScanTimePolicy) -> f64 {
        let predicted_ms = policy
            .predict_region_scan_ms(self, false)
            .max(f64::EPSILON);
        let efficiency = self.reclaimable_bytes() as f64 / predicted_ms;
        self.gc_efficiency.store(efficiency.to_bits(), Ordering::Release);
        efficiency
    }

    /// Last computed efficiency score.
    #[inline]
    pub fn gc_efficiency(&self) -> f64 {
        f64::from_bits(self.gc_efficiency.load(Ordering::Acquire))
    }

    // -------------------------------------------------------------------------
    // Block lookup and careful iteration
    // -------------------------------------------------------------------------

    /// The region's block offset table.
    #[inline]
    pub fn bot(&self) -> &BlockOffsetTable {
        &self.bot
    }

    /// The region's remembered set.
    #[inline]
    pub fn rem_set(&self) -> &RegionRemSet {
        &self.rem_set
    }

    /// Start of the object block containing `addr`.
    ///
    /// Addresses at or above `top` belong to the unallocated tail, one
    /// pseudo-block starting at `top`. A continues-humongous region
    /// short-circuits to its chain start. `Err(addr)` reports the first
    /// unparsable object hit while walking forward from the offset-table
    /// hint.
    pub fn block_start(&self, addr: usize, model: &dyn ObjectModel) -> Result<usize, usize> {
        debug_assert!(addr >= self.bottom && addr < self.end());
        if self.continues_humongous() {
            return Ok(self.humongous_start_bottom());
        }
        let top = self.top();
        if addr >= top {
            return Ok(top);
        }
        let mut cur = self.bot.block_start_hint(addr);
        loop {
            let size = model.size_of(cur).ok_or(cur)?;
            let next = cur + size;
            if next > addr {
                return Ok(cur);
            }
            cur = next;
        }
    }

    /// Byte size of the block starting at `addr`: the object's size
    /// below `top`, the distance to `end` for the tail pseudo-block.
    pub fn block_size(&self, addr: usize, model: &dyn ObjectModel) -> Option<usize> {
        let top = self.top();
        if addr >= top {
            return Some(self.end() - addr);
        }
        model.size_of(addr)
    }

    /// Parsable prefix bound: the saved mark while a GC is active, the
    /// live `top` otherwise.
    fn scan_limit(&self, ctx: &ScanContext<'_>) -> usize {
        if ctx.gc_active {
            self.saved_mark_word(ctx.clock)
        } else {
            self.top()
        }
    }

    /// Walks live objects overlapping `mr` while allocation may be
    /// extending `top` concurrently.
    ///
    /// Returns `None` when the walk completed, or `Some(addr)` — the
    /// first unparsable address (an in-flight allocation's unpublished
    /// header) or the object on which the visitor aborted. Callers
    /// receiving `Some` are expected to retry later, not to treat it as
    /// an error.
    pub fn object_iterate_careful(
        &self,
        mr: MemRegion,
        ctx: &ScanContext<'_>,
        model: &dyn ObjectModel,
        visitor: &mut dyn ObjectVisitor,
    ) -> Option<usize> {
        let limit = self.scan_limit(ctx);
        let mr = mr.intersection(MemRegion::new(self.bottom, limit));
        if mr.is_empty() {
            return None;
        }
        let mut cur = match self.block_start(mr.start(), model) {
            Ok(start) => start,
            Err(addr) => return Some(addr),
        };
        debug_assert!(cur <= mr.start());
        while cur < mr.end() {
            let size = match model.size_of(cur) {
                Some(size) => size,
                None => return Some(cur),
            };
            let obj_end = cur + size;
            if obj_end > mr.start()
                && !self.is_obj_dead(cur, ctx.prev_bitmap)
                && !visitor.visit(cur, size)
            {
                return Some(cur);
            }
            cur = obj_end;
        }
        None
    }

    /// Walks the references of live objects overlapping `mr`, surfacing
    /// only targets admitted by `filter`. Same careful contract as
    /// [`object_iterate_careful`](Self::object_iterate_careful).
    ///
    /// A reference array spanning the walk boundary is clipped to `mr`;
    /// any other boundary-spanning object is scanned in full.
    pub fn oops_iterate_careful(
        &self,
        mr: MemRegion,
        ctx: &ScanContext<'_>,
        model: &dyn ObjectModel,
        filter: &ScanFilter<'_>,
        visitor: &mut dyn ReferenceVisitor,
    ) -> Option<usize> {
        match filter {
            ScanFilter::NoFilter => self.walk_refs(mr, ctx, model, |_| true, visitor),
            ScanFilter::OutOfRegion(span) => {
                let span = *span;
                self.walk_refs(mr, ctx, model, move |target| !span.contains(target), visitor)
            }
            ScanFilter::IntoCollectionSet(manager) => self.walk_refs(
                mr,
                ctx,
                model,
                |target| {
                    manager
                        .region_containing(target)
                        .map(|r| r.in_collection_set())
                        .unwrap_or(false)
                },
                visitor,
            ),
        }
    }

    fn walk_refs<F>(
        &self,
        mr: MemRegion,
        ctx: &ScanContext<'_>,
        model: &dyn ObjectModel,
        admit: F,
        visitor: &mut dyn ReferenceVisitor,
    ) -> Option<usize>
    where
        F: Fn(usize) -> bool,
    {
        let limit = self.scan_limit(ctx);
        let mr = mr.intersection(MemRegion::new(self.bottom, limit));
        if mr.is_empty() {
            return None;
        }
        let mut cur = match self.block_start(mr.start(), model) {
            Ok(start) => start,
            Err(addr) => return Some(addr),
        };
        debug_assert!(cur <= mr.start());
        while cur < mr.end() {
            let size = match model.size_of(cur) {
                Some(size) => size,
                None => return Some(cur),
            };
            let obj_end = cur + size;
            if obj_end > mr.start() && !self.is_obj_dead(cur, ctx.prev_bitmap) {
                let mut aborted = false;
                let mut emit = |slot: usize, target: usize| {
                    if !aborted && admit(target) && !visitor.visit(slot, target) {
                        aborted = true;
                    }
                };
                let spans_boundary = cur < mr.start() || obj_end > mr.end();
                if spans_boundary && model.is_reference_array(cur) {
                    model.for_each_reference_in(cur, mr, &mut emit);
                } else {
                    model.for_each_reference(cur, &mut emit);
                }
                if aborted {
                    return Some(cur);
                }
            }
            cur = obj_end;
        }
        None
    }

    /// Card-driven careful reference walk used by the refinement pass.
    ///
    /// With `filter_young` set, a young region returns `None` without
    /// touching `card` — young regions are rescanned wholesale anyway.
    /// Otherwise the supplied card is cleared *before* any read that
    /// depends on the not-young classification, with a store-load fence
    /// between: a racing allocator must not be able to turn the region
    /// young after the check while another thread still sees the card
    /// clean. References surfaced are those with out-of-region targets.
    pub fn card_refs_iterate_careful(
        &self,
        mr: MemRegion,
        ctx: &ScanContext<'_>,
        model: &dyn ObjectModel,
        visitor: &mut dyn ReferenceVisitor,
        filter_young: bool,
        card: &AtomicU8,
    ) -> Option<usize> {
        if filter_young && self.is_young() {
            return None;
        }

        // The card write must be ordered before every load the walk does
        // on the strength of the classification above.
        card.store(CARD_CLEAN, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let filter = ScanFilter::OutOfRegion(self.mem_region());
        self.oops_iterate_careful(mr, ctx, model, &filter, visitor)
    }
}

impl fmt::Display for HeapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HR {:4} {} [{:#x}, {:#x}, {:#x}) used {:>9} ts {:3} ptams {:#x} ntams {:#x}",
            self.index,
            self.kind().tag(),
            self.bottom,
            self.top(),
            self.end(),
            format_bytes(self.used()),
            self.timestamp(),
            self.prev_top_at_mark_start(),
            self.next_top_at_mark_start(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeapSizing, RegionSizing};
    use crate::layout::CARD_SIZE;
    use crate::object::fake::FakeHeap;

    const MB: usize = 1024 * 1024;
    const BASE: usize = 0x4000_0000;

    fn sizing() -> RegionSizing {
        RegionSizing::derive(&HeapSizing {
            initial_heap_size: 256 * MB,
            max_heap_size: 1024 * MB,
            region_size: MB,
        })
        .expect("valid sizing")
    }

    fn region() -> HeapRegion {
        HeapRegion::new(0, BASE, sizing())
    }

    fn bitmap() -> MarkBitmap {
        MarkBitmap::new(MemRegion::new(BASE, BASE + 4 * MB))
    }

    fn idle_ctx(bitmap: &MarkBitmap) -> ScanContext<'_> {
        ScanContext {
            clock: 0,
            gc_active: false,
            prev_bitmap: bitmap,
        }
    }

    // -------------------------------------------------------------------------
    // Geometry and lifecycle
    // -------------------------------------------------------------------------

    #[test]
    fn test_new_region_is_free_and_empty() {
        let hr = region();
        assert_eq!(hr.bottom(), BASE);
        assert_eq!(hr.top(), BASE);
        assert_eq!(hr.end(), BASE + MB);
        assert_eq!(hr.capacity(), MB);
        assert_eq!(hr.used(), 0);
        assert_eq!(hr.free(), MB);
        assert!(hr.is_empty());
        assert_eq!(hr.kind(), RegionKind::Free);
        assert!(!hr.is_humongous());
        assert_eq!(hr.humongous_start_index(), None);
    }

    #[test]
    fn test_clear_resets_metadata() {
        let hr = region();
        hr.set_kind(RegionKind::Old);
        hr.allocate(256).expect("alloc");
        hr.set_in_collection_set(true);
        hr.set_young_index_in_cset(Some(3));
        hr.set_claim_value(9);
        hr.note_start_of_marking();
        hr.add_to_marked_bytes(128);
        hr.rem_set().add_reference(2, 7);
        hr.record_top_and_timestamp(5);

        hr.clear(false, true, false);
        assert_eq!(hr.top(), hr.bottom());
        assert!(!hr.in_collection_set());
        assert_eq!(hr.young_index_in_cset(), None);
        assert_eq!(hr.claim_value(), INITIAL_CLAIM);
        assert_eq!(hr.prev_top_at_mark_start(), hr.bottom());
        assert_eq!(hr.next_top_at_mark_start(), hr.bottom());
        assert_eq!(hr.next_marked_bytes(), 0);
        assert_eq!(hr.timestamp(), 0);
        assert!(hr.rem_set().is_empty());
        // The kind tag is the caller's business.
        assert_eq!(hr.kind(), RegionKind::Old);
    }

    #[test]
    fn test_parallel_clear_defers_remset() {
        let hr = region();
        hr.set_kind(RegionKind::Old);
        hr.rem_set().add_reference(1, 1);

        hr.clear(true, true, false);
        assert!(!hr.rem_set().is_empty(), "parallel clear defers the remset");

        let cards = CardTable::new(MemRegion::new(BASE, BASE + MB));
        cards.dirty(BASE + 17);
        hr.par_clear(&cards);
        assert!(hr.rem_set().is_empty());
        assert_eq!(cards.dirty_count(), 0);
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    #[test]
    fn test_bump_allocation() {
        let hr = region();
        hr.set_kind(RegionKind::Eden);

        let a = hr.allocate(64).expect("first alloc");
        let b = hr.allocate(128).expect("second alloc");
        assert_eq!(a, BASE);
        assert_eq!(b, BASE + 64);
        assert_eq!(hr.used(), 192);

        // Exhaust the region.
        assert!(hr.allocate(MB).is_none());
        let c = hr.allocate(MB - 192).expect("fills exactly");
        assert_eq!(c, BASE + 192);
        assert_eq!(hr.free(), 0);
        assert!(hr.allocate(8).is_none());
    }

    #[test]
    fn test_par_allocate_matches_bump_semantics() {
        let hr = region();
        hr.set_kind(RegionKind::Eden);
        let a = hr.par_allocate(64).expect("alloc");
        let b = hr.par_allocate(64).expect("alloc");
        assert_eq!(a, BASE);
        assert_eq!(b, BASE + 64);
        assert!(hr.par_allocate(2 * MB).is_none());
    }

    // -------------------------------------------------------------------------
    // Claiming
    // -------------------------------------------------------------------------

    #[test]
    fn test_claim_is_exactly_once_per_value() {
        let hr = region();
        assert!(hr.claim(1));
        assert!(!hr.claim(1), "second claimant loses");
        assert!(hr.claim(2), "new claim value reopens the region");
        assert!(!hr.claim(2));
        assert_eq!(hr.claim_value(), 2);

        hr.set_claim_value(INITIAL_CLAIM);
        assert!(hr.claim(2));
    }

    // -------------------------------------------------------------------------
    // Humongous transitions
    // -------------------------------------------------------------------------

    #[test]
    fn test_humongous_chain_setup_and_teardown() {
        let sizing = sizing();
        let first = HeapRegion::new(4, BASE + 4 * MB, sizing);
        let second = HeapRegion::new(5, BASE + 5 * MB, sizing);

        // A 1.5 MiB object spanning two regions.
        let obj_end = BASE + 4 * MB + MB + MB / 2;
        first.set_starts_humongous(obj_end, second.end());
        second.set_continues_humongous(&first);

        assert!(first.starts_humongous());
        assert_eq!(first.end(), BASE + 6 * MB);
        assert_eq!(first.top(), obj_end);
        assert_eq!(first.humongous_start_index(), Some(4));

        assert!(second.continues_humongous());
        assert_eq!(second.end(), BASE + 6 * MB);
        assert_eq!(second.top(), second.end());
        assert_eq!(second.humongous_start_index(), Some(4));

        first.clear_humongous();
        second.clear_humongous();
        assert_eq!(first.end(), BASE + 5 * MB, "extension undone");
        assert_eq!(first.top(), BASE + 5 * MB, "top capped at restored end");
        assert!(!first.is_humongous());
        assert!(!second.is_humongous());
        assert_eq!(second.humongous_start_index(), None);
    }

    #[test]
    fn test_continuation_block_start_points_at_chain_start() {
        let sizing = sizing();
        let first = HeapRegion::new(0, BASE, sizing);
        let second = HeapRegion::new(1, BASE + MB, sizing);
        first.set_starts_humongous(BASE + MB + MB / 2, BASE + 2 * MB);
        second.set_continues_humongous(&first);

        let model = FakeHeap::new();
        let start = second
            .block_start(BASE + MB + 4096, &model)
            .expect("no walk needed");
        assert_eq!(start, BASE);
    }

    // -------------------------------------------------------------------------
    // Marking bookkeeping
    // -------------------------------------------------------------------------

    #[test]
    fn test_marking_cycle_accounting() {
        let hr = region();
        hr.set_kind(RegionKind::Old);
        hr.allocate(4096).expect("alloc");

        hr.note_start_of_marking();
        assert_eq!(hr.next_top_at_mark_start(), BASE + 4096);

        // Concurrent allocation past NTAMS is implicitly live.
        hr.allocate(1024).expect("alloc");
        hr.add_to_marked_bytes(2048);

        hr.note_end_of_marking();
        assert_eq!(hr.prev_top_at_mark_start(), BASE + 4096);
        assert_eq!(hr.prev_marked_bytes(), 2048);
        assert_eq!(hr.next_top_at_mark_start(), BASE);
        assert_eq!(hr.live_bytes(), 2048 + 1024);
        assert_eq!(hr.reclaimable_bytes(), 4096 - 2048);
    }

    #[test]
    fn test_is_obj_dead_honors_ptams_and_bitmap() {
        let hr = region();
        let bm = bitmap();
        hr.set_kind(RegionKind::Old);
        hr.allocate(4096).expect("alloc");
        hr.note_start_of_marking();
        bm.mark(BASE + 64);
        hr.note_end_of_marking();

        assert!(!hr.is_obj_dead(BASE + 64, &bm), "marked below PTAMS");
        assert!(hr.is_obj_dead(BASE + 128, &bm), "unmarked below PTAMS");
        assert!(!hr.is_obj_dead(BASE + 8192, &bm), "above PTAMS is implicitly live");
    }

    #[test]
    fn test_gc_efficiency_score() {
        let hr = region();
        hr.set_kind(RegionKind::Old);
        hr.allocate(512 * 1024).expect("alloc");
        // Nothing marked: everything below PTAMS... PTAMS is bottom, so
        // everything is implicitly live and nothing is reclaimable yet.
        assert_eq!(hr.reclaimable_bytes(), 512 * 1024 - hr.live_bytes());

        hr.note_start_of_marking();
        hr.note_end_of_marking();
        // Now all 512 KiB are below PTAMS and unmarked: fully reclaimable.
        assert_eq!(hr.reclaimable_bytes(), 512 * 1024);

        let policy = crate::policy::FlatRatePolicy::default();
        let eff = hr.calc_gc_efficiency(&policy);
        assert!(eff > 0.0 && eff.is_finite());
        assert_eq!(hr.gc_efficiency(), eff);
    }

    // -------------------------------------------------------------------------
    // Saved mark / timestamp
    // -------------------------------------------------------------------------

    #[test]
    fn test_saved_mark_tracks_clock() {
        let hr = region();
        hr.set_kind(RegionKind::Old);
        hr.allocate(256).expect("alloc");

        // No record for clock 1 yet: readers see the live top.
        assert_eq!(hr.saved_mark_word(1), BASE + 256);

        hr.record_top_and_timestamp(1);
        assert_eq!(hr.timestamp(), 1);
        hr.allocate(256).expect("alloc");
        // Readers under clock 1 see the recorded mark, not the new top.
        assert_eq!(hr.saved_mark_word(1), BASE + 256);
        // A second record under the same clock is a no-op.
        hr.record_top_and_timestamp(1);
        assert_eq!(hr.saved_mark_word(1), BASE + 256);
        // A newer clock falls back to the live top until recorded.
        assert_eq!(hr.saved_mark_word(2), BASE + 512);
    }

    // -------------------------------------------------------------------------
    // Block lookup and careful iteration
    // -------------------------------------------------------------------------

    /// Lays out `sizes` as consecutive published objects from bottom.
    fn fill(hr: &HeapRegion, model: &FakeHeap, sizes: &[usize]) -> Vec<usize> {
        let mut starts = Vec::new();
        for &size in sizes {
            let addr = hr.allocate(size).expect("alloc");
            model.add_object(addr, size);
            starts.push(addr);
        }
        starts
    }

    #[test]
    fn test_block_start_idempotent_and_below_addr() {
        let hr = region();
        hr.set_kind(RegionKind::Old);
        let model = FakeHeap::new();
        let starts = fill(&hr, &model, &[64, 8, 2048, 16, CARD_SIZE * 3, 40]);

        let mut addr = hr.bottom();
        while addr < hr.top() {
            let start = hr.block_start(addr, &model).expect("parsable");
            assert!(start <= addr);
            assert!(starts.contains(&start), "{:#x} not an object start", start);
            let again = hr.block_start(start, &model).expect("parsable");
            assert_eq!(again, start, "block_start is idempotent");
            addr += WORD_SIZE;
        }
    }

    #[test]
    fn test_block_start_of_unallocated_tail_is_top() {
        let hr = region();
        hr.set_kind(RegionKind::Old);
        let model = FakeHeap::new();
        fill(&hr, &model, &[64]);

        let top = hr.top();
        let end = hr.end();
        let probes = [top, top + WORD_SIZE, top + (end - top) / 2, end - WORD_SIZE];
        for probe in probes {
            assert_eq!(hr.block_start(probe, &model), Ok(top), "probe {:#x}", probe);
        }
        assert_eq!(hr.block_size(top, &model), Some(end - top));
    }

    #[test]
    fn test_object_iterate_stops_at_unpublished_header() {
        let hr = region();
        hr.set_kind(RegionKind::Old);
        let model = FakeHeap::new();
        let starts = fill(&hr, &model, &[64, 128, 256]);
        model.set_published(starts[1], false);

        let bm = bitmap();
        let ctx = idle_ctx(&bm);
        let mut seen = Vec::new();
        let stop = hr.object_iterate_careful(
            MemRegion::new(hr.bottom(), hr.end()),
            &ctx,
            &model,
            &mut |addr: usize, _size: usize| {
                seen.push(addr);
                true
            },
        );
        assert_eq!(stop, Some(starts[1]), "stops at the unpublished header");
        assert_eq!(seen, vec![starts[0]]);

        model.set_published(starts[1], true);
        let stop = hr.object_iterate_careful(
            MemRegion::new(hr.bottom(), hr.end()),
            &ctx,
            &model,
            &mut |_: usize, _: usize| true,
        );
        assert_eq!(stop, None, "completes after the header is published");
    }

    #[test]
    fn test_object_iterate_skips_dead_and_respects_window() {
        let hr = region();
        hr.set_kind(RegionKind::Old);
        let model = FakeHeap::new();
        let starts = fill(&hr, &model, &[64, 64, 64, 64]);

        let bm = bitmap();
        // Mark only objects 0 and 2, then complete a cycle so the rest
        // read as dead.
        hr.note_start_of_marking();
        bm.mark(starts[0]);
        bm.mark(starts[2]);
        hr.note_end_of_marking();

        let ctx = idle_ctx(&bm);
        let mut seen = Vec::new();
        // Window starts mid-object 1: object 1 overlaps but is dead.
        let window = MemRegion::new(starts[1] + 8, hr.end());
        let stop = hr.object_iterate_careful(window, &ctx, &model, &mut |addr: usize, _: usize| {
            seen.push(addr);
            true
        });
        assert_eq!(stop, None);
        assert_eq!(seen, vec![starts[2]]);
    }

    #[test]
    fn test_card_walk_filters_young_without_touching_card() {
        let hr = region();
        hr.set_kind(RegionKind::Eden);
        let model = FakeHeap::new();
        fill(&hr, &model, &[64]);

        let bm = bitmap();
        let ctx = idle_ctx(&bm);
        let card = AtomicU8::new(crate::card_table::CARD_DIRTY);
        let stop = hr.card_refs_iterate_careful(
            MemRegion::new(hr.bottom(), hr.bottom() + CARD_SIZE),
            &ctx,
            &model,
            &mut |_: usize, _: usize| true,
            true,
            &card,
        );
        assert_eq!(stop, None);
        assert_eq!(
            card.load(Ordering::Relaxed),
            crate::card_table::CARD_DIRTY,
            "young filter leaves the card alone"
        );
    }

    #[test]
    fn test_card_walk_clears_card_and_filters_in_region_targets() {
        let hr = region();
        hr.set_kind(RegionKind::Old);
        let model = FakeHeap::new();
        let starts = fill(&hr, &model, &[64, 64]);
        // One in-region reference (filtered) and one cross-region.
        model.add_ref(starts[0], starts[0] + 8, starts[1]);
        model.add_ref(starts[0], starts[0] + 16, BASE + 8 * MB);

        let bm = bitmap();
        let ctx = idle_ctx(&bm);
        let card = AtomicU8::new(crate::card_table::CARD_DIRTY);
        let mut seen = Vec::new();
        let stop = hr.card_refs_iterate_careful(
            MemRegion::new(hr.bottom(), hr.bottom() + CARD_SIZE),
            &ctx,
            &model,
            &mut |slot: usize, target: usize| {
                seen.push((slot, target));
                true
            },
            true,
            &card,
        );
        assert_eq!(stop, None);
        assert_eq!(card.load(Ordering::Relaxed), CARD_CLEAN);
        assert_eq!(seen, vec![(starts[0] + 16, BASE + 8 * MB)]);
    }

    #[test]
    fn test_gc_active_bounds_walk_at_saved_mark() {
        let hr = region();
        hr.set_kind(RegionKind::Old);
        let model = FakeHeap::new();
        let starts = fill(&hr, &model, &[64, 64]);

        hr.record_top_and_timestamp(1);
        // Allocated after the mark: parsable prefix excludes it. The
        // header is deliberately unpublished — a careful walk must not
        // reach it.
        let late = hr.allocate(64).expect("alloc");
        model.add_full(late, 64, crate::object::TypeToken(1), false, false, Vec::new());

        let bm = bitmap();
        let ctx = ScanContext {
            clock: 1,
            gc_active: true,
            prev_bitmap: &bm,
        };
        let mut seen = Vec::new();
        let stop = hr.object_iterate_careful(
            MemRegion::new(hr.bottom(), hr.end()),
            &ctx,
            &model,
            &mut |addr: usize, _: usize| {
                seen.push(addr);
                true
            },
        );
        assert_eq!(stop, None);
        assert_eq!(seen, starts);
    }

    #[test]
    fn test_display_renders_one_line() {
        let hr = region();
        hr.set_kind(RegionKind::Eden);
        hr.allocate(2048).expect("alloc");
        let line = hr.to_string();
        assert!(line.contains("E "));
        assert!(line.contains("2.00 KB"));
        assert!(!line.contains('\n'));
    }
}
