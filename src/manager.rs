//! The region manager: owner of the region array and heap-wide state.
//!
//! One manager owns every [`HeapRegion`] of a committed heap range, the
//! card table, both marking bitmaps, the free list, and the GC clock.
//! Regions are constructed once here and recycled forever; the manager
//! is also where multi-region (humongous) objects are assembled, since
//! a chain needs a contiguous run of free regions that no single region
//! can see.
//!
//! Everything that reshapes the heap — humongous chain setup and
//! teardown, freeing regions, swapping marking bitmaps — is pause-only:
//! callers run it stop-the-world or under an equivalent external
//! guarantee. Concurrent work distribution goes through
//! [`claimed_iterate`](RegionManager::claimed_iterate) instead.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::card_table::CardTable;
use crate::config::{ConfigError, RegionSizing};
use crate::layout::{format_bytes, HeapLayout, MemRegion};
use crate::bitmap::MarkBitmap;
use crate::object::ObjectModel;
use crate::region::{HeapRegion, RegionKind, ScanContext};
use crate::verify::{Verifier, VerifyOptions, VerifyOutcome};

/// Owner of all regions covering one committed heap range.
pub struct RegionManager {
    layout: HeapLayout,
    sizing: RegionSizing,
    regions: Box<[HeapRegion]>,
    card_table: CardTable,
    /// Complete marks from the last finished cycle; paired with PTAMS.
    prev_bitmap: MarkBitmap,
    /// Marks of the in-progress cycle; paired with NTAMS.
    next_bitmap: MarkBitmap,
    /// Indices of free regions, popped lowest-first.
    free_list: Mutex<Vec<u32>>,
    gc_time_stamp: AtomicU32,
    gc_active: AtomicBool,
}

impl RegionManager {
    /// Commits `heap` as regions of the configured grain.
    ///
    /// The range must start grain-aligned and span a whole number of
    /// grains, otherwise [`ConfigError::BadHeapRange`] is returned.
    pub fn new(heap: MemRegion, sizing: RegionSizing) -> Result<Self, ConfigError> {
        let grain = sizing.grain_bytes();
        if heap.is_empty() || heap.start() % grain != 0 || heap.byte_len() % grain != 0 {
            return Err(ConfigError::BadHeapRange {
                start: heap.start(),
                end: heap.end(),
                grain,
            });
        }

        let count = (heap.byte_len() / grain) as u32;
        let layout = HeapLayout::new(heap.start(), grain, count);
        let regions: Vec<HeapRegion> = (0..count)
            .map(|i| HeapRegion::new(i, layout.region_bottom(i), sizing))
            .collect();

        log::debug!(
            "committed {} regions of {} at {:#x}",
            count,
            format_bytes(grain),
            heap.start()
        );

        Ok(Self {
            layout,
            sizing,
            regions: regions.into_boxed_slice(),
            card_table: CardTable::new(heap),
            prev_bitmap: MarkBitmap::new(heap),
            next_bitmap: MarkBitmap::new(heap),
            free_list: Mutex::new((0..count).rev().collect()),
            gc_time_stamp: AtomicU32::new(0),
            gc_active: AtomicBool::new(false),
        })
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// The fixed heap geometry.
    #[inline]
    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    /// The region geometry all regions share.
    #[inline]
    pub fn sizing(&self) -> RegionSizing {
        self.sizing
    }

    /// The heap-wide card table.
    #[inline]
    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    /// The completed marking bitmap.
    #[inline]
    pub fn prev_bitmap(&self) -> &MarkBitmap {
        &self.prev_bitmap
    }

    /// The in-progress marking bitmap.
    #[inline]
    pub fn next_bitmap(&self) -> &MarkBitmap {
        &self.next_bitmap
    }

    /// Number of committed regions.
    #[inline]
    pub fn region_count(&self) -> u32 {
        self.regions.len() as u32
    }

    /// Number of regions on the free list.
    pub fn free_region_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// The region at `index`. Panics on an out-of-range index; indices
    /// come from this manager and are trusted.
    #[inline]
    pub fn region(&self, index: u32) -> &HeapRegion {
        &self.regions[index as usize]
    }

    /// The region containing `addr`, or `None` outside the heap.
    #[inline]
    pub fn region_containing(&self, addr: usize) -> Option<&HeapRegion> {
        let index = self.layout.region_index_of(addr)?;
        Some(&self.regions[index as usize])
    }

    /// All regions, in index order.
    pub fn regions(&self) -> impl Iterator<Item = &HeapRegion> {
        self.regions.iter()
    }

    // -------------------------------------------------------------------------
    // Region allocation
    // -------------------------------------------------------------------------

    /// Takes a region off the free list and retags it. Returns `None`
    /// when the heap is fully committed.
    pub fn allocate_free_region(&self, kind: RegionKind, context: u8) -> Option<&HeapRegion> {
        let index = self.free_list.lock().pop()?;
        let hr = &self.regions[index as usize];
        debug_assert!(hr.is_free() && hr.is_empty());
        hr.set_kind(kind);
        hr.set_allocation_context(context);
        Some(hr)
    }

    /// Returns a non-humongous region to the free list, clearing it.
    /// Pause-only.
    pub fn free_region(&self, index: u32) {
        let hr = &self.regions[index as usize];
        debug_assert!(!hr.is_free(), "double free of region {}", index);
        debug_assert!(!hr.is_humongous(), "humongous regions go through free_humongous");
        hr.clear(false, true, true);
        hr.set_kind(RegionKind::Free);
        self.free_list.lock().push(index);
    }

    /// Allocates a humongous object of `byte_size` bytes (word-aligned,
    /// larger than half a grain) across a contiguous run of free
    /// regions. Returns the object address. Pause-only.
    pub fn allocate_humongous(&self, byte_size: usize, context: u8) -> Option<usize> {
        debug_assert!(self.sizing.is_humongous(byte_size), "not a humongous size");
        debug_assert_eq!(byte_size % crate::layout::WORD_SIZE, 0);

        let needed = self.sizing.regions_for_humongous(byte_size);
        let first = self.claim_free_run(needed)?;
        let first_hr = &self.regions[first];

        let obj_start = first_hr.bottom();
        let obj_end = obj_start + byte_size;
        let last = first + needed - 1;
        let chain_end = self.layout.region_bottom(last as u32) + self.sizing.grain_bytes();

        first_hr.set_starts_humongous(obj_end, chain_end);
        first_hr.set_allocation_context(context);
        for index in first + 1..=last {
            let hr = &self.regions[index];
            hr.set_continues_humongous(first_hr);
            hr.set_allocation_context(context);
        }

        log::debug!(
            "humongous object of {} in regions {}..={} at {:#x}",
            format_bytes(byte_size),
            first,
            last,
            obj_start
        );
        Some(obj_start)
    }

    /// Tears down the humongous chain starting at `start_index` and
    /// returns every chain region to the free list. Returns the bytes
    /// reclaimed. Pause-only.
    pub fn free_humongous(&self, start_index: u32) -> usize {
        let first = &self.regions[start_index as usize];
        debug_assert!(first.starts_humongous(), "not a chain start");

        let mut chain = vec![start_index];
        let mut index = start_index + 1;
        while (index as usize) < self.regions.len()
            && self.regions[index as usize].continues_humongous()
            && self.regions[index as usize].humongous_start_index() == Some(start_index)
        {
            chain.push(index);
            index += 1;
        }

        let mut reclaimed = 0;
        for &i in &chain {
            let hr = &self.regions[i as usize];
            hr.clear_humongous();
            reclaimed += hr.used();
            hr.clear(false, true, true);
            hr.set_kind(RegionKind::Free);
            self.free_list.lock().push(i);
        }

        log::debug!(
            "freed humongous chain {}..={}, reclaimed {}",
            start_index,
            chain.last().copied().unwrap_or(start_index),
            format_bytes(reclaimed)
        );
        reclaimed
    }

    /// Finds a contiguous run of `needed` free regions and removes them
    /// from the free list. Lowest run wins.
    fn claim_free_run(&self, needed: usize) -> Option<usize> {
        let mut free = self.free_list.lock();
        let mut run = 0usize;
        for index in 0..self.regions.len() {
            if self.regions[index].is_free() {
                run += 1;
                if run == needed {
                    let first = index + 1 - needed;
                    free.retain(|&r| (r as usize) < first || (r as usize) > index);
                    return Some(first);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    // -------------------------------------------------------------------------
    // Work distribution
    // -------------------------------------------------------------------------

    /// Visits every region the calling worker wins the claim for.
    /// Workers calling concurrently with the same claim value partition
    /// the heap between them: each region is visited exactly once.
    pub fn claimed_iterate<F>(&self, claim_value: u32, mut f: F)
    where
        F: FnMut(&HeapRegion),
    {
        for hr in self.regions.iter() {
            if hr.claim(claim_value) {
                f(hr);
            }
        }
    }

    // -------------------------------------------------------------------------
    // GC clock and marking cycle
    // -------------------------------------------------------------------------

    /// Advances the GC timestamp and returns the new value.
    pub fn increment_gc_time_stamp(&self) -> u32 {
        self.gc_time_stamp.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current GC timestamp.
    #[inline]
    pub fn gc_time_stamp(&self) -> u32 {
        self.gc_time_stamp.load(Ordering::Acquire)
    }

    /// Flags a collection as in progress; while set, careful iterators
    /// bound themselves by each region's saved mark.
    pub fn set_gc_active(&self, active: bool) {
        self.gc_active.store(active, Ordering::Release);
    }

    /// Whether a collection is flagged in progress.
    #[inline]
    pub fn gc_active(&self) -> bool {
        self.gc_active.load(Ordering::Acquire)
    }

    /// Bundles the collector state the careful iterators take.
    pub fn scan_context(&self) -> ScanContext<'_> {
        ScanContext {
            clock: self.gc_time_stamp(),
            gc_active: self.gc_active(),
            prev_bitmap: &self.prev_bitmap,
        }
    }

    /// Starts a marking cycle: every region snapshots its NTAMS.
    /// Pause-only.
    pub fn note_start_of_marking(&self) {
        for hr in self.regions.iter() {
            hr.note_start_of_marking();
        }
    }

    /// Finishes a marking cycle: regions promote next→previous, the
    /// bitmaps swap roles, and the new next bitmap is wiped. Pause-only.
    pub fn complete_marking_cycle(&mut self) {
        for hr in self.regions.iter() {
            hr.note_end_of_marking();
        }
        std::mem::swap(&mut self.prev_bitmap, &mut self.next_bitmap);
        self.next_bitmap.clear_all();
    }

    /// Runs the structural verifier over all committed regions.
    pub fn verify(&self, model: &dyn ObjectModel, options: VerifyOptions) -> VerifyOutcome {
        Verifier::new(self, model, options).run()
    }
}

impl fmt::Display for RegionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "heap: {} regions x {}, {} free, clock {}",
            self.region_count(),
            format_bytes(self.sizing.grain_bytes()),
            self.free_region_count(),
            self.gc_time_stamp()
        )?;
        for hr in self.regions.iter() {
            writeln!(f, "  {}", hr)?;
        }
        Ok(())
    }
}
