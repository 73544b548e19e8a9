//! Visitor seams and target filters for object scans.
//!
//! Scans hand each discovered reference to a [`ReferenceVisitor`] (or
//! each object to an [`ObjectVisitor`]); closures implement both, so
//! call sites stay light. A [`ScanFilter`] narrows which reference
//! *targets* are interesting — the filter variant is chosen once per
//! scan and the walk is monomorphized over it, not re-dispatched per
//! object.

use crate::layout::MemRegion;
use crate::manager::RegionManager;

/// Receives references discovered during a scan.
pub trait ReferenceVisitor {
    /// Visits one reference: the holding slot's address and the target
    /// it points at. Returning `false` aborts the walk.
    fn visit(&mut self, slot: usize, target: usize) -> bool;
}

impl<F> ReferenceVisitor for F
where
    F: FnMut(usize, usize) -> bool,
{
    #[inline]
    fn visit(&mut self, slot: usize, target: usize) -> bool {
        self(slot, target)
    }
}

/// Receives whole objects discovered during a region walk.
pub trait ObjectVisitor {
    /// Visits one live object by start address and byte size. Returning
    /// `false` aborts the walk.
    fn visit(&mut self, addr: usize, size: usize) -> bool;
}

impl<F> ObjectVisitor for F
where
    F: FnMut(usize, usize) -> bool,
{
    #[inline]
    fn visit(&mut self, addr: usize, size: usize) -> bool {
        self(addr, size)
    }
}

/// Which reference targets a scan should surface.
///
/// Chosen once per scan. `NoFilter` admits everything; `OutOfRegion`
/// admits targets outside the scanned region (the refinement pass's
/// view); `IntoCollectionSet` admits targets in regions currently
/// selected for evacuation.
pub enum ScanFilter<'a> {
    /// Admit every target.
    NoFilter,
    /// Admit targets outside the given span.
    OutOfRegion(MemRegion),
    /// Admit targets inside collection-set regions.
    IntoCollectionSet(&'a RegionManager),
}

impl ScanFilter<'_> {
    /// Whether `target` passes the filter.
    #[inline]
    pub fn admits(&self, target: usize) -> bool {
        match self {
            ScanFilter::NoFilter => true,
            ScanFilter::OutOfRegion(span) => !span.contains(target),
            ScanFilter::IntoCollectionSet(manager) => manager
                .region_containing(target)
                .map(|r| r.in_collection_set())
                .unwrap_or(false),
        }
    }
}
