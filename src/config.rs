//! Heap sizing input and the derived region geometry.
//!
//! Region size ("grain") is computed once from the heap bounds and is
//! immutable afterwards: every region, the card table, and the block
//! offset tables are all sized from it. The derivation targets
//! [`TARGET_REGION_NUMBER`] regions for the average heap size, floors to
//! a power of two, and clamps to `[MIN_REGION_SIZE, MAX_REGION_SIZE]`.
//!
//! The result is an explicit [`RegionSizing`] value handed to every
//! constructor that needs it. For embedders whose barrier code cannot
//! carry a handle there is an optional process-wide slot
//! ([`install_global`]); installing twice is reported as an error, not a
//! crash.

use std::error::Error;
use std::fmt;
use std::sync::OnceLock;

use crate::layout::{LOG_CARD_SIZE, LOG_WORD_SIZE};

/// Smallest permitted region size: 1 MiB.
pub const MIN_REGION_SIZE: usize = 1024 * 1024;

/// Largest permitted region size: 32 MiB.
pub const MAX_REGION_SIZE: usize = 32 * 1024 * 1024;

/// Preferred region count the grain derivation aims for.
pub const TARGET_REGION_NUMBER: usize = 2048;

/// Heap bounds fed into the grain derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSizing {
    /// Committed heap size at startup, in bytes.
    pub initial_heap_size: usize,

    /// Upper bound the heap may grow to, in bytes.
    pub max_heap_size: usize,

    /// Explicit region size override in bytes; `0` selects the automatic
    /// derivation from the heap bounds. A non-zero value is floored to a
    /// power of two and clamped to the permitted range, it is not taken
    /// verbatim.
    pub region_size: usize,
}

impl Default for HeapSizing {
    fn default() -> Self {
        Self {
            initial_heap_size: 256 * 1024 * 1024,
            max_heap_size: 1024 * 1024 * 1024,
            region_size: 0,
        }
    }
}

/// Derived region geometry: grain size and the per-region card count.
///
/// Cheap to copy; constructors take it by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSizing {
    grain_bytes: usize,
    log_grain_bytes: u32,
}

impl RegionSizing {
    /// Derives the grain size from heap bounds.
    ///
    /// The automatic path computes `average(initial, max) /
    /// TARGET_REGION_NUMBER`, raises it to at least [`MIN_REGION_SIZE`],
    /// floors to a power of two, and clamps into the permitted range.
    ///
    /// # Examples
    ///
    /// ```
    /// use regionheap::config::{HeapSizing, RegionSizing};
    ///
    /// let sizing = RegionSizing::derive(&HeapSizing {
    ///     initial_heap_size: 256 * 1024 * 1024,
    ///     max_heap_size: 2 * 1024 * 1024 * 1024,
    ///     region_size: 0,
    /// })
    /// .unwrap();
    /// // 1152 MiB / 2048 = 576 KiB, raised to the 1 MiB floor.
    /// assert_eq!(sizing.grain_bytes(), 1024 * 1024);
    /// ```
    pub fn derive(sizing: &HeapSizing) -> Result<Self, ConfigError> {
        if sizing.initial_heap_size == 0 || sizing.max_heap_size == 0 {
            return Err(ConfigError::ZeroHeapSize);
        }
        if sizing.initial_heap_size > sizing.max_heap_size {
            return Err(ConfigError::InitialExceedsMax {
                initial: sizing.initial_heap_size,
                max: sizing.max_heap_size,
            });
        }

        let mut region_size = sizing.region_size;
        if region_size == 0 {
            let average = (sizing.initial_heap_size + sizing.max_heap_size) / 2;
            region_size = (average / TARGET_REGION_NUMBER).max(MIN_REGION_SIZE);
        }

        // Floor to a power of two, then clamp. The clamp bounds are powers
        // of two themselves, so the result always stays one.
        let log = (usize::BITS - 1) - region_size.leading_zeros();
        let mut grain = 1usize << log;
        grain = grain.clamp(MIN_REGION_SIZE, MAX_REGION_SIZE);

        Ok(Self {
            grain_bytes: grain,
            log_grain_bytes: grain.trailing_zeros(),
        })
    }

    /// Region size in bytes.
    #[inline]
    pub fn grain_bytes(&self) -> usize {
        self.grain_bytes
    }

    /// `log2` of the region size.
    #[inline]
    pub fn log_grain_bytes(&self) -> u32 {
        self.log_grain_bytes
    }

    /// Region size in words.
    #[inline]
    pub fn grain_words(&self) -> usize {
        self.grain_bytes >> LOG_WORD_SIZE
    }

    /// Number of card-table bytes covering one region.
    #[inline]
    pub fn cards_per_region(&self) -> usize {
        self.grain_bytes >> LOG_CARD_SIZE
    }

    /// Byte size above which an object no longer fits the regular
    /// allocation path and must take a dedicated region chain.
    #[inline]
    pub fn humongous_threshold_bytes(&self) -> usize {
        self.grain_bytes / 2
    }

    /// Whether an object of `byte_size` is humongous (larger than half a
    /// region).
    #[inline]
    pub fn is_humongous(&self, byte_size: usize) -> bool {
        byte_size > self.humongous_threshold_bytes()
    }

    /// Number of regions needed to hold a humongous object of `byte_size`.
    #[inline]
    pub fn regions_for_humongous(&self, byte_size: usize) -> usize {
        (byte_size + self.grain_bytes - 1) >> self.log_grain_bytes
    }
}

static GLOBAL_SIZING: OnceLock<RegionSizing> = OnceLock::new();

/// Publishes a process-wide copy of the region geometry.
///
/// Intended for embedders that size their write barrier from a global
/// rather than a handle. May be called at most once; later calls fail
/// with [`ConfigError::AlreadyConfigured`] and leave the installed value
/// untouched.
pub fn install_global(sizing: RegionSizing) -> Result<(), ConfigError> {
    GLOBAL_SIZING
        .set(sizing)
        .map_err(|_| ConfigError::AlreadyConfigured)
}

/// The process-wide region geometry, if one was installed.
pub fn global_sizing() -> Option<RegionSizing> {
    GLOBAL_SIZING.get().copied()
}

/// Errors from sizing derivation and installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A heap bound was zero.
    ZeroHeapSize,
    /// The initial heap size exceeds the maximum.
    InitialExceedsMax {
        /// Offending initial size in bytes.
        initial: usize,
        /// Configured maximum in bytes.
        max: usize,
    },
    /// [`install_global`] was called a second time.
    AlreadyConfigured,
    /// A committed heap range does not fit the geometry (unaligned base
    /// or a length that is not a whole number of regions).
    BadHeapRange {
        /// Start of the rejected range.
        start: usize,
        /// End of the rejected range.
        end: usize,
        /// Required grain size in bytes.
        grain: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroHeapSize => write!(f, "heap sizes must be non-zero"),
            ConfigError::InitialExceedsMax { initial, max } => write!(
                f,
                "initial heap size ({} bytes) exceeds maximum ({} bytes)",
                initial, max
            ),
            ConfigError::AlreadyConfigured => {
                write!(f, "region sizing is already configured for this process")
            }
            ConfigError::BadHeapRange { start, end, grain } => write!(
                f,
                "heap range [{:#x}, {:#x}) is not aligned to whole {}-byte regions",
                start, end, grain
            ),
        }
    }
}

impl Error for ConfigError {}
