//! Scan-time prediction consumed by GC-efficiency scoring.
//!
//! The collector's pause-time model lives outside this crate; regions
//! only divide their reclaimable bytes by a predicted scan cost to rank
//! themselves as eviction candidates. [`FlatRatePolicy`] is a
//! deliberately simple stand-in good enough for tests and embedders
//! without a tuned model.

use crate::region::HeapRegion;

/// Predicts how long a region would take to scan during a collection.
pub trait ScanTimePolicy {
    /// Predicted milliseconds to evacuate/scan `region`. `for_young_gc`
    /// distinguishes the young-collection cost model from the mixed one.
    fn predict_region_scan_ms(&self, region: &HeapRegion, for_young_gc: bool) -> f64;
}

/// Linear cost model: a fixed rate per byte of live data plus a fixed
/// rate per remembered-set entry.
#[derive(Debug, Clone, Copy)]
pub struct FlatRatePolicy {
    /// Milliseconds per KiB of used space.
    pub ms_per_kib: f64,
    /// Milliseconds per remembered-set entry that must be scanned.
    pub ms_per_remset_entry: f64,
}

impl Default for FlatRatePolicy {
    fn default() -> Self {
        Self {
            ms_per_kib: 0.01,
            ms_per_remset_entry: 0.001,
        }
    }
}

impl ScanTimePolicy for FlatRatePolicy {
    fn predict_region_scan_ms(&self, region: &HeapRegion, _for_young_gc: bool) -> f64 {
        let kib = region.used() as f64 / 1024.0;
        let entries = region.rem_set().occupied() as f64;
        kib * self.ms_per_kib + entries * self.ms_per_remset_entry
    }
}
