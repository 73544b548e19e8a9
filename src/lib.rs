//! Region-Based Heap Management
//!
//! The metadata layer of a regional garbage-collected heap: fixed-size
//! regions with bump allocation, card-table dirty tracking, per-region
//! block offset tables and remembered sets, and the careful iteration
//! protocols that let concurrent scanners race live allocation safely.
//!
//! # Architecture
//!
//! The heap is partitioned into power-of-two **regions** (1..32 MiB,
//! fixed per process). A [`manager::RegionManager`] owns the region
//! array plus the heap-wide structures:
//!
//! - **Card table**: one byte per 512-byte card, dirtied by the
//!   embedder's write barrier and drained by [`refine::RefinementPass`]
//!   into precise remembered-set entries.
//!
//! - **Block offset table** (per region): maps any interior address to
//!   the start of the object block containing it, with power-of-two
//!   back-skips so lookups over large objects stay logarithmic.
//!
//! - **Remembered set** (per region): which cards of which other
//!   regions hold references into this one, sparse per source region
//!   until promoted to a card bitmap.
//!
//! - **Marking bitmaps**: previous (complete) and next (in-progress)
//!   mark bits, paired with each region's top-at-mark-start snapshots
//!   for liveness without touching object headers.
//!
//! Objects larger than half a region span a **humongous chain**: a
//! starts-humongous region whose `end` is extended over the whole
//! object, followed by continues-humongous regions holding no object
//! starts.
//!
//! # Careful iteration
//!
//! Scanners run while mutators allocate. Every walk is bounded by the
//! region's parsable prefix (the saved mark while a collection is
//! active, the live `top` otherwise) and stops at the first object
//! whose header has not been published yet, returning its address so
//! the caller can defer rather than fail.
//!
//! # Object parsing
//!
//! The crate never dereferences heap memory. Everything it needs to
//! know about objects — sizes, types, reference slots — is asked
//! through the embedder-implemented [`object::ObjectModel`] trait.
//!
//! # Usage
//!
//! ```ignore
//! use regionheap::config::{HeapSizing, RegionSizing};
//! use regionheap::layout::MemRegion;
//! use regionheap::manager::RegionManager;
//! use regionheap::region::RegionKind;
//!
//! let sizing = RegionSizing::derive(&HeapSizing {
//!     initial_heap_size: 256 << 20,
//!     max_heap_size: 1024 << 20,
//!     region_size: 1 << 20,
//! })?;
//! let heap = RegionManager::new(MemRegion::new(base, base + committed), sizing)?;
//!
//! let eden = heap.allocate_free_region(RegionKind::Eden, 0).unwrap();
//! let addr = eden.allocate(64).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bitmap;
pub mod bot;
pub mod card_table;
pub mod config;
pub mod layout;
pub mod manager;
pub mod object;
pub mod policy;
pub mod refine;
pub mod region;
pub mod remset;
pub mod scan;
pub mod verify;

// Re-exports for convenient access
pub use config::{ConfigError, HeapSizing, RegionSizing};
pub use layout::MemRegion;
pub use manager::RegionManager;
pub use object::{ObjectModel, TypeToken};
pub use region::{HeapRegion, RegionKind};
pub use verify::{VerifyOptions, VerifyOutcome};
