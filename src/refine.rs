//! Refinement: draining dirty cards into remembered sets.
//!
//! The write barrier dirties a card for every pointer store; this pass
//! turns that coarse signal into precise remembered-set entries. For
//! each dirty card it scans the card's objects and records, in the
//! *target* region's remembered set, the source card of every surviving
//! cross-region reference.
//!
//! Young source regions are exempt: they are rescanned wholesale at
//! every young collection, so their cards are dropped unscanned — an
//! optimization, not an omission. A card whose scan trips over an
//! in-flight allocation is re-dirtied and reported as deferred; the
//! next pass picks it up.

use std::sync::atomic::Ordering;

use crate::card_table::{CARD_CLEAN, CARD_DIRTY};
use crate::manager::RegionManager;
use crate::object::ObjectModel;

/// Counters from one [`RefinementPass::drain`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefineStats {
    /// Cards scanned to completion.
    pub cards_scanned: usize,
    /// Cards re-dirtied because the scan hit an unparsable object.
    pub cards_deferred: usize,
    /// New remembered-set entries recorded.
    pub refs_recorded: usize,
    /// Cards dropped because their region was young.
    pub cards_skipped_young: usize,
}

/// One refinement worker over a heap.
pub struct RefinementPass<'a> {
    manager: &'a RegionManager,
    model: &'a dyn ObjectModel,
}

impl<'a> RefinementPass<'a> {
    /// Creates a pass over `manager`'s card table and regions.
    pub fn new(manager: &'a RegionManager, model: &'a dyn ObjectModel) -> Self {
        Self { manager, model }
    }

    /// Drains every currently-dirty card into the remembered sets.
    ///
    /// The dirty snapshot is racy: cards dirtied mid-drain are caught by
    /// the next call. Deferred cards stay dirty.
    pub fn drain(&self) -> RefineStats {
        let mut stats = RefineStats::default();
        let table = self.manager.card_table();
        let layout = self.manager.layout();
        let ctx = self.manager.scan_context();

        let mut dirty = Vec::new();
        table.for_each_dirty(|span| dirty.push(span));

        for span in dirty {
            let src = match self.manager.region_containing(span.start()) {
                Some(region) => region,
                None => continue,
            };
            let card = match table.card_ref(span.start()) {
                Some(card) => card,
                None => continue,
            };

            if src.is_young() {
                // Exempt: the card is dropped without a scan.
                card.store(CARD_CLEAN, Ordering::Relaxed);
                stats.cards_skipped_young += 1;
                continue;
            }

            let mut recorded = 0usize;
            let result = src.card_refs_iterate_careful(
                span,
                &ctx,
                self.model,
                &mut |slot: usize, target: usize| {
                    let dst = match self.manager.region_containing(target) {
                        Some(region) => region,
                        None => return true,
                    };
                    // The slot's own region keys the entry; for a
                    // humongous chain it can differ from `src`.
                    if let Some(slot_region) = self.manager.region_containing(slot) {
                        if slot_region.index() != dst.index() {
                            let source_card = layout.card_within_region(slot);
                            if dst.rem_set().add_reference(slot_region.index(), source_card) {
                                recorded += 1;
                            }
                        }
                    }
                    true
                },
                true,
                card,
            );
            stats.refs_recorded += recorded;

            match result {
                None => stats.cards_scanned += 1,
                Some(addr) => {
                    // Unpublished header in the scan window: put the
                    // card back and let a later pass retry.
                    card.store(CARD_DIRTY, Ordering::Relaxed);
                    stats.cards_deferred += 1;
                    log::trace!(
                        "deferred card {} in region {}: unparsable at {:#x}",
                        span,
                        src.index(),
                        addr
                    );
                }
            }
        }

        log::debug!(
            "refinement: {} scanned, {} deferred, {} young-skipped, {} refs recorded",
            stats.cards_scanned,
            stats.cards_deferred,
            stats.cards_skipped_young,
            stats.refs_recorded
        );
        stats
    }
}
