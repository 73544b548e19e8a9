//! Address arithmetic shared by every layer of the heap.
//!
//! The crate never dereferences heap memory itself; everything in here is
//! plain arithmetic over byte addresses (`usize`). Three units matter:
//!
//! ```text
//! word   8 bytes    allocation granule, one mark bit each
//! card   512 bytes  dirty-tracking granule, one card-table byte each
//! grain  1..32 MiB  region size, power of two, fixed per process
//! ```
//!
//! A committed heap is `region_count` grains starting at a card-aligned
//! base; [`HeapLayout`] turns addresses into region and card indices
//! without touching the regions themselves.

use std::fmt;

/// Bytes per heap word. All object sizes are multiples of this.
pub const WORD_SIZE: usize = 8;

/// `log2(WORD_SIZE)`.
pub const LOG_WORD_SIZE: u32 = 3;

/// Bytes covered by one card-table byte.
pub const CARD_SIZE: usize = 512;

/// `log2(CARD_SIZE)`.
pub const LOG_CARD_SIZE: u32 = 9;

/// Words covered by one card.
pub const WORDS_PER_CARD: usize = CARD_SIZE / WORD_SIZE;

/// Aligns `value` up to `align`, which must be a power of two.
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Aligns `value` down to `align`, which must be a power of two.
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Formats a byte count in human-readable form.
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// A half-open span of heap addresses `[start, end)`.
///
/// Used for region extents, card spans, and scan windows. Empty spans
/// (`start == end`) are legal and show up routinely as intersection
/// results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    start: usize,
    end: usize,
}

impl MemRegion {
    /// Creates a span. `start` must not exceed `end`.
    #[inline]
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "inverted span {:#x}..{:#x}", start, end);
        Self { start, end }
    }

    /// The canonical empty span.
    #[inline]
    pub const fn empty() -> Self {
        Self { start: 0, end: 0 }
    }

    /// Start address (inclusive).
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// End address (exclusive).
    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Length in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.end - self.start
    }

    /// Length in words.
    #[inline]
    pub fn word_len(&self) -> usize {
        self.byte_len() >> LOG_WORD_SIZE
    }

    /// Whether the span covers no addresses.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `addr` lies within `[start, end)`.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Whether `other` lies entirely within this span.
    #[inline]
    pub fn contains_region(&self, other: MemRegion) -> bool {
        other.is_empty() || (other.start >= self.start && other.end <= self.end)
    }

    /// The overlap of two spans, possibly empty.
    #[inline]
    pub fn intersection(&self, other: MemRegion) -> MemRegion {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            MemRegion::new(start, end)
        } else {
            MemRegion::empty()
        }
    }
}

impl fmt::Display for MemRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

/// Fixed geometry of a committed heap: base address, grain size, and
/// region count.
///
/// Because regions partition one contiguous range at a power-of-two
/// grain, region and card indices are shift-and-mask operations. The
/// layout is immutable after construction and freely copyable.
#[derive(Debug, Clone, Copy)]
pub struct HeapLayout {
    base: usize,
    log_grain: u32,
    region_count: u32,
}

impl HeapLayout {
    /// Builds a layout for `region_count` regions of `grain_bytes` each,
    /// starting at `base`.
    ///
    /// `grain_bytes` must be a power of two and `base` must be aligned to
    /// it; both are debug-checked, the config layer validates them for
    /// release builds.
    pub fn new(base: usize, grain_bytes: usize, region_count: u32) -> Self {
        debug_assert!(grain_bytes.is_power_of_two());
        debug_assert_eq!(base & (grain_bytes - 1), 0, "unaligned heap base");
        Self {
            base,
            log_grain: grain_bytes.trailing_zeros(),
            region_count,
        }
    }

    /// Base address of region 0.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Region size in bytes.
    #[inline]
    pub fn grain_bytes(&self) -> usize {
        1usize << self.log_grain
    }

    /// Number of regions in the committed range.
    #[inline]
    pub fn region_count(&self) -> u32 {
        self.region_count
    }

    /// The whole committed range.
    #[inline]
    pub fn heap_region(&self) -> MemRegion {
        MemRegion::new(self.base, self.base + ((self.region_count as usize) << self.log_grain))
    }

    /// Whether `addr` falls inside the committed range.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.heap_region().contains(addr)
    }

    /// Index of the region holding `addr`, or `None` outside the heap.
    #[inline]
    pub fn region_index_of(&self, addr: usize) -> Option<u32> {
        if !self.contains(addr) {
            return None;
        }
        Some(((addr - self.base) >> self.log_grain) as u32)
    }

    /// Bottom address of region `index`.
    #[inline]
    pub fn region_bottom(&self, index: u32) -> usize {
        debug_assert!(index < self.region_count);
        self.base + ((index as usize) << self.log_grain)
    }

    /// Card index of `addr` within its own region.
    ///
    /// This is the key the remembered set stores: a card number relative
    /// to the source region's bottom, so it stays valid no matter where
    /// the owning region sits in the heap.
    #[inline]
    pub fn card_within_region(&self, addr: usize) -> u16 {
        let offset = addr & (self.grain_bytes() - 1);
        (offset >> LOG_CARD_SIZE) as u16
    }
}
