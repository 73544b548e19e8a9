//! Structural heap verification.
//!
//! The verifier re-derives, the slow way, everything the fast paths
//! trust: it walks every committed region object by object and checks
//! the block offset table against the objects actually laid out, the
//! marking snapshots against region geometry, humongous chain wiring,
//! type liveness, and remembered-set containment for every cross-region
//! reference it can see.
//!
//! It runs at a pause (or under an equivalent external guarantee) and
//! never mutates heap state. Failures are collected up to a cap rather
//! than reported one at a time, so a single corruption that cascades
//! does not drown the log.

use std::fmt;

use crate::layout::{align_down, align_up, CARD_SIZE, LOG_CARD_SIZE, WORD_SIZE};
use crate::manager::RegionManager;
use crate::object::{ObjectModel, TypeToken};
use crate::region::HeapRegion;

/// Which marking snapshot liveness is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkingView {
    /// The completed marking: PTAMS and the previous bitmap.
    Previous,
    /// The in-progress marking: NTAMS and the next bitmap.
    Next,
}

/// Knobs for one verification run.
#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions {
    /// Marking snapshot to judge liveness against.
    pub view: MarkingView,
    /// Whether every dirty-card buffer has been flushed into the
    /// remembered sets. When false, a missing remembered-set entry whose
    /// source card is still dirty is in-flight, not an omission.
    pub flushed_buffers: bool,
    /// Stop after this many failures.
    pub max_failures: usize,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            view: MarkingView::Previous,
            flushed_buffers: false,
            max_failures: 10,
        }
    }
}

/// One verification finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyFailure {
    /// An offset-table entry resolved to the wrong block start.
    BotMismatch {
        /// Region the entry belongs to.
        region: u32,
        /// Card index within the region.
        card: usize,
        /// The object start the card actually lies in.
        expected: usize,
        /// What the entry chain resolved to.
        actual: usize,
    },
    /// A tail probe did not resolve to the top pseudo-block.
    TailProbeMismatch {
        /// Region probed.
        region: u32,
        /// Probe address in the unallocated tail.
        probe: usize,
        /// The region's `top`.
        expected: usize,
        /// What `block_start` returned.
        actual: usize,
    },
    /// An object header could not be parsed during a pause.
    Unparsable {
        /// Region walked.
        region: u32,
        /// Address of the unparsable header.
        addr: usize,
    },
    /// The marking snapshots are out of order with region geometry.
    TamsOrder {
        /// Offending region.
        region: u32,
        /// Previous top-at-mark-start.
        ptams: usize,
        /// Next top-at-mark-start.
        ntams: usize,
        /// The region's `top`.
        top: usize,
    },
    /// An object's size disagrees with its region's humongous tagging.
    HumongousClassification {
        /// Region holding the object.
        region: u32,
        /// Object start.
        addr: usize,
        /// Object byte size.
        size: usize,
    },
    /// A starts-humongous region holds more than one live object.
    ExtraHumongousObject {
        /// Offending region.
        region: u32,
        /// Start of the extra object.
        addr: usize,
    },
    /// A continues-humongous region kept its extension or lost its
    /// back-reference.
    BrokenHumongousChain {
        /// Offending region.
        region: u32,
        /// The chain-start index it carries, if any.
        start: Option<u32>,
    },
    /// A live object's type token names an unloaded type.
    UnloadedType {
        /// Region holding the object.
        region: u32,
        /// Object start.
        addr: usize,
        /// The unloaded token.
        token: TypeToken,
    },
    /// A live object references outside the heap, into a free region, or
    /// at a dead object.
    DanglingReference {
        /// Region holding the referencing slot.
        region: u32,
        /// Slot address.
        slot: usize,
        /// Target address.
        target: usize,
    },
    /// A cross-region reference has no remembered-set entry and no
    /// in-flight excuse.
    RemSetOmission {
        /// Region holding the referencing slot.
        source_region: u32,
        /// Card of the slot within its region.
        source_card: u16,
        /// Region holding the target.
        target_region: u32,
        /// Slot address.
        slot: usize,
        /// Target address.
        target: usize,
    },
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyFailure::BotMismatch { region, card, expected, actual } => write!(
                f,
                "region {}: offset-table card {} resolves to {:#x}, object starts at {:#x}",
                region, card, actual, expected
            ),
            VerifyFailure::TailProbeMismatch { region, probe, expected, actual } => write!(
                f,
                "region {}: tail probe {:#x} resolves to {:#x}, expected top {:#x}",
                region, probe, actual, expected
            ),
            VerifyFailure::Unparsable { region, addr } => {
                write!(f, "region {}: unparsable object header at {:#x}", region, addr)
            }
            VerifyFailure::TamsOrder { region, ptams, ntams, top } => write!(
                f,
                "region {}: mark snapshots out of order (ptams {:#x}, ntams {:#x}, top {:#x})",
                region, ptams, ntams, top
            ),
            VerifyFailure::HumongousClassification { region, addr, size } => write!(
                f,
                "region {}: object at {:#x} of {} bytes disagrees with region tagging",
                region, addr, size
            ),
            VerifyFailure::ExtraHumongousObject { region, addr } => write!(
                f,
                "region {}: extra object at {:#x} in a starts-humongous region",
                region, addr
            ),
            VerifyFailure::BrokenHumongousChain { region, start } => write!(
                f,
                "region {}: broken humongous chain (start {:?})",
                region, start
            ),
            VerifyFailure::UnloadedType { region, addr, token } => write!(
                f,
                "region {}: object at {:#x} has unloaded type {:?}",
                region, addr, token
            ),
            VerifyFailure::DanglingReference { region, slot, target } => write!(
                f,
                "region {}: slot {:#x} references dead or unmanaged {:#x}",
                region, slot, target
            ),
            VerifyFailure::RemSetOmission {
                source_region,
                source_card,
                target_region,
                slot,
                target,
            } => write!(
                f,
                "region {} card {}: reference {:#x} -> {:#x} missing from region {}'s remembered set",
                source_region, source_card, slot, target, target_region
            ),
        }
    }
}

/// Result of one verification run.
#[derive(Debug)]
pub struct VerifyOutcome {
    /// Everything found, in walk order, capped at
    /// [`VerifyOptions::max_failures`].
    pub failures: Vec<VerifyFailure>,
    /// Non-free regions visited.
    pub regions_verified: usize,
    /// Live objects fully checked.
    pub objects_verified: usize,
    /// False when the failure cap stopped the run early.
    pub complete: bool,
}

impl VerifyOutcome {
    /// Whether the run finished with nothing to report.
    pub fn is_clean(&self) -> bool {
        self.complete && self.failures.is_empty()
    }
}

/// The verification walker.
pub struct Verifier<'a> {
    manager: &'a RegionManager,
    model: &'a dyn ObjectModel,
    options: VerifyOptions,
}

impl<'a> Verifier<'a> {
    /// Prepares a run over `manager` with the given options.
    pub fn new(
        manager: &'a RegionManager,
        model: &'a dyn ObjectModel,
        options: VerifyOptions,
    ) -> Self {
        Self {
            manager,
            model,
            options,
        }
    }

    /// Walks every committed region and returns the findings.
    pub fn run(&self) -> VerifyOutcome {
        let mut outcome = VerifyOutcome {
            failures: Vec::new(),
            regions_verified: 0,
            objects_verified: 0,
            complete: true,
        };

        for hr in self.manager.regions() {
            if hr.is_free() {
                continue;
            }
            outcome.regions_verified += 1;
            if !self.verify_structure(hr, &mut outcome) {
                break;
            }
            // Continuation regions hold no object starts; their content
            // is covered by the chain-start walk.
            if !hr.continues_humongous() && !self.verify_objects(hr, &mut outcome) {
                break;
            }
        }

        if outcome.failures.is_empty() {
            log::debug!(
                "verification clean: {} regions, {} objects",
                outcome.regions_verified,
                outcome.objects_verified
            );
        } else {
            log::warn!(
                "verification found {} failure(s) over {} regions{}",
                outcome.failures.len(),
                outcome.regions_verified,
                if outcome.complete { "" } else { " (stopped at cap)" }
            );
            for failure in &outcome.failures {
                log::warn!("  {}", failure);
            }
        }
        outcome
    }

    /// Records `failure`; returns `false` once the cap is reached.
    fn report(&self, outcome: &mut VerifyOutcome, failure: VerifyFailure) -> bool {
        outcome.failures.push(failure);
        if outcome.failures.len() >= self.options.max_failures {
            outcome.complete = false;
            return false;
        }
        true
    }

    /// Deadness per the selected marking view.
    fn is_dead(&self, hr: &HeapRegion, addr: usize) -> bool {
        match self.options.view {
            MarkingView::Previous => hr.is_obj_dead(addr, self.manager.prev_bitmap()),
            MarkingView::Next => {
                addr < hr.next_top_at_mark_start() && !self.manager.next_bitmap().is_marked(addr)
            }
        }
    }

    /// Geometry-level checks that apply without parsing any object.
    fn verify_structure(&self, hr: &HeapRegion, outcome: &mut VerifyOutcome) -> bool {
        let bottom = hr.bottom();
        let top = hr.top();
        let ptams = hr.prev_top_at_mark_start();
        let ntams = hr.next_top_at_mark_start();
        let tams_ok = bottom <= ptams
            && ptams <= top
            && (ntams == bottom || (ptams <= ntams && ntams <= top));
        if !tams_ok {
            let failure = VerifyFailure::TamsOrder {
                region: hr.index(),
                ptams,
                ntams,
                top,
            };
            if !self.report(outcome, failure) {
                return false;
            }
        }

        let grain = self.manager.sizing().grain_bytes();
        if hr.continues_humongous() {
            if hr.end() != bottom + grain {
                let failure = VerifyFailure::BrokenHumongousChain {
                    region: hr.index(),
                    start: hr.humongous_start_index(),
                };
                if !self.report(outcome, failure) {
                    return false;
                }
            }
            let chain_ok = match hr.humongous_start_index() {
                Some(start) if start < hr.index() => {
                    let prev = self.manager.region(hr.index() - 1);
                    self.manager.region(start).starts_humongous()
                        && (prev.index() == start
                            || (prev.continues_humongous()
                                && prev.humongous_start_index() == Some(start)))
                }
                _ => false,
            };
            if !chain_ok {
                let failure = VerifyFailure::BrokenHumongousChain {
                    region: hr.index(),
                    start: hr.humongous_start_index(),
                };
                if !self.report(outcome, failure) {
                    return false;
                }
            }
        } else if hr.starts_humongous() && hr.humongous_start_index() != Some(hr.index()) {
            let failure = VerifyFailure::BrokenHumongousChain {
                region: hr.index(),
                start: hr.humongous_start_index(),
            };
            if !self.report(outcome, failure) {
                return false;
            }
        }
        true
    }

    /// Parses every object from bottom to top and cross-checks the
    /// offset table, humongous tagging, types, and references; then
    /// probes the unallocated tail.
    fn verify_objects(&self, hr: &HeapRegion, outcome: &mut VerifyOutcome) -> bool {
        let bottom = hr.bottom();
        let top = hr.top();
        let bot = hr.bot();
        let threshold = bot.threshold();
        let extent_end = bottom + self.manager.sizing().grain_bytes();

        let mut live_seen = 0usize;
        let mut cur = bottom;
        while cur < top {
            let size = match self.model.size_of(cur) {
                Some(size) => size,
                None => {
                    // Nothing past an unpublished header is walkable.
                    let failure = VerifyFailure::Unparsable {
                        region: hr.index(),
                        addr: cur,
                    };
                    return self.report(outcome, failure);
                }
            };
            let obj_end = cur + size;

            // Every offset-table entry the object covers must resolve
            // back to the object's start.
            let mut card_addr = align_up(cur, CARD_SIZE);
            while card_addr < obj_end && card_addr < threshold && card_addr < extent_end {
                let card = (card_addr - bottom) >> LOG_CARD_SIZE;
                let actual = bot.resolve_card(card);
                if actual != cur {
                    let failure = VerifyFailure::BotMismatch {
                        region: hr.index(),
                        card,
                        expected: cur,
                        actual,
                    };
                    if !self.report(outcome, failure) {
                        return false;
                    }
                }
                card_addr += CARD_SIZE;
            }

            if self.manager.sizing().is_humongous(size) != hr.starts_humongous() {
                let failure = VerifyFailure::HumongousClassification {
                    region: hr.index(),
                    addr: cur,
                    size,
                };
                if !self.report(outcome, failure) {
                    return false;
                }
            }

            if !self.is_dead(hr, cur) {
                live_seen += 1;
                if hr.starts_humongous() && live_seen > 1 {
                    let failure = VerifyFailure::ExtraHumongousObject {
                        region: hr.index(),
                        addr: cur,
                    };
                    if !self.report(outcome, failure) {
                        return false;
                    }
                }

                let token = self.model.type_of(cur);
                if !self.model.is_type_loaded(token) {
                    let failure = VerifyFailure::UnloadedType {
                        region: hr.index(),
                        addr: cur,
                        token,
                    };
                    if !self.report(outcome, failure) {
                        return false;
                    }
                }

                if !self.verify_references(hr, cur, outcome) {
                    return false;
                }
                outcome.objects_verified += 1;
            }
            cur = obj_end;
        }

        self.verify_tail(hr, outcome)
    }

    /// Checks every reference the object at `addr` holds.
    fn verify_references(
        &self,
        hr: &HeapRegion,
        addr: usize,
        outcome: &mut VerifyOutcome,
    ) -> bool {
        let mut refs = Vec::new();
        self.model
            .for_each_reference(addr, &mut |slot, target| refs.push((slot, target)));

        for (slot, target) in refs {
            let dst = match self.manager.region_containing(target) {
                Some(region) => region,
                None => {
                    let failure = VerifyFailure::DanglingReference {
                        region: hr.index(),
                        slot,
                        target,
                    };
                    if !self.report(outcome, failure) {
                        return false;
                    }
                    continue;
                }
            };
            if dst.is_free() || self.is_dead(dst, target) {
                let failure = VerifyFailure::DanglingReference {
                    region: hr.index(),
                    slot,
                    target,
                };
                if !self.report(outcome, failure) {
                    return false;
                }
                continue;
            }

            // Cross-region references from non-young regions must be
            // remembered. The slot's own region keys the entry; for a
            // humongous chain it can differ from `hr`.
            let src = match self.manager.region_containing(slot) {
                Some(region) => region,
                None => continue,
            };
            if src.index() == dst.index() || src.is_young() {
                continue;
            }
            let source_card = self.manager.layout().card_within_region(slot);
            if dst.rem_set().contains(src.index(), source_card) {
                continue;
            }
            // A still-dirty source card means the entry is in flight.
            if !self.options.flushed_buffers && self.manager.card_table().is_dirty(slot) {
                continue;
            }
            let failure = VerifyFailure::RemSetOmission {
                source_region: src.index(),
                source_card,
                target_region: dst.index(),
                slot,
                target,
            };
            if !self.report(outcome, failure) {
                return false;
            }
        }
        true
    }

    /// Probes the unallocated tail: every address in `[top, end)` must
    /// resolve to the pseudo-block starting at `top`.
    fn verify_tail(&self, hr: &HeapRegion, outcome: &mut VerifyOutcome) -> bool {
        let top = hr.top();
        let end = hr.end();
        if top >= end {
            return true;
        }
        let probes = [
            top,
            top + WORD_SIZE,
            top + align_down((end - top) / 2, WORD_SIZE),
            end - WORD_SIZE,
        ];
        for probe in probes {
            if probe >= end {
                continue;
            }
            let failure = match hr.block_start(probe, self.model) {
                Ok(start) if start == top => continue,
                Ok(start) => VerifyFailure::TailProbeMismatch {
                    region: hr.index(),
                    probe,
                    expected: top,
                    actual: start,
                },
                Err(addr) => VerifyFailure::Unparsable {
                    region: hr.index(),
                    addr,
                },
            };
            if !self.report(outcome, failure) {
                return false;
            }
        }
        true
    }
}
