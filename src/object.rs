//! The object-parsing seam between the region layer and the embedder.
//!
//! Regions never dereference heap memory themselves; everything they need
//! to know about an object — its size, its type, the references it holds —
//! is asked through [`ObjectModel`]. The embedder implements the trait over
//! its real object layout; the crate stays pure address arithmetic.
//!
//! Size queries return `None` while an object's header has not been
//! published yet (an in-flight concurrent allocation). The careful
//! iteration paths treat that as "stop here and let the caller retry",
//! never as an error.

use crate::layout::MemRegion;

/// Opaque identity of an object's class.
///
/// The region layer only ever compares tokens and asks whether a token
/// names a currently-loaded type; layout and subtype machinery stay on
/// the embedder's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeToken(pub u64);

/// Embedder-supplied view of heap objects.
///
/// Implementations must be callable from multiple GC worker threads at
/// once, hence the `Sync` bound.
pub trait ObjectModel: Sync {
    /// Byte size of the object starting at `addr`, or `None` if the
    /// object's header has not been published yet.
    ///
    /// Sizes are always multiples of the word size.
    fn size_of(&self, addr: usize) -> Option<usize>;

    /// Type token of the object starting at `addr`.
    fn type_of(&self, addr: usize) -> TypeToken;

    /// Whether `token` names a currently-loaded type.
    fn is_type_loaded(&self, token: TypeToken) -> bool;

    /// Whether the object at `addr` is a reference array.
    ///
    /// Reference arrays are the one object shape whose scan may be
    /// clipped to a sub-range; any other object spanning a scan boundary
    /// is scanned in full.
    fn is_reference_array(&self, addr: usize) -> bool;

    /// Visits every reference-holding slot of the object at `addr` as
    /// `(slot_address, target_address)`. Null/absent slots are skipped by
    /// the implementation.
    fn for_each_reference(&self, addr: usize, f: &mut dyn FnMut(usize, usize));

    /// Like [`for_each_reference`](Self::for_each_reference), restricted
    /// to slots whose address lies inside `clip`.
    ///
    /// The default filters the full iteration; implementations with slot
    /// tables can do better.
    fn for_each_reference_in(&self, addr: usize, clip: MemRegion, f: &mut dyn FnMut(usize, usize)) {
        self.for_each_reference(addr, &mut |slot, target| {
            if clip.contains(slot) {
                f(slot, target);
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! A hash-map heap for unit tests: objects are (address → descriptor)
    //! entries, with an explicit "published" bit to exercise the careful
    //! iteration paths.

    use super::*;
    use parking_lot::Mutex;
    use rustc_hash::{FxHashMap, FxHashSet};

    pub(crate) struct FakeObject {
        pub size: usize,
        pub type_token: TypeToken,
        pub is_ref_array: bool,
        pub published: bool,
        /// (slot address, target address) pairs.
        pub refs: Vec<(usize, usize)>,
    }

    #[derive(Default)]
    pub(crate) struct FakeHeap {
        objects: Mutex<FxHashMap<usize, FakeObject>>,
        loaded: Mutex<FxHashSet<u64>>,
    }

    impl FakeHeap {
        pub fn new() -> Self {
            let heap = Self::default();
            heap.load_type(TypeToken(1));
            heap
        }

        /// Adds a published object of `size` bytes with no references.
        pub fn add_object(&self, addr: usize, size: usize) {
            self.add_full(addr, size, TypeToken(1), false, true, Vec::new());
        }

        pub fn add_full(
            &self,
            addr: usize,
            size: usize,
            type_token: TypeToken,
            is_ref_array: bool,
            published: bool,
            refs: Vec<(usize, usize)>,
        ) {
            self.objects.lock().insert(
                addr,
                FakeObject {
                    size,
                    type_token,
                    is_ref_array,
                    published,
                    refs,
                },
            );
        }

        pub fn add_ref(&self, addr: usize, slot: usize, target: usize) {
            let mut objects = self.objects.lock();
            let obj = objects.get_mut(&addr).expect("no object at addr");
            obj.refs.push((slot, target));
        }

        pub fn set_published(&self, addr: usize, published: bool) {
            let mut objects = self.objects.lock();
            objects.get_mut(&addr).expect("no object at addr").published = published;
        }

        pub fn load_type(&self, token: TypeToken) {
            self.loaded.lock().insert(token.0);
        }
    }

    impl ObjectModel for FakeHeap {
        fn size_of(&self, addr: usize) -> Option<usize> {
            let objects = self.objects.lock();
            let obj = objects.get(&addr)?;
            obj.published.then_some(obj.size)
        }

        fn type_of(&self, addr: usize) -> TypeToken {
            self.objects.lock().get(&addr).map(|o| o.type_token).unwrap_or(TypeToken(0))
        }

        fn is_type_loaded(&self, token: TypeToken) -> bool {
            self.loaded.lock().contains(&token.0)
        }

        fn is_reference_array(&self, addr: usize) -> bool {
            self.objects.lock().get(&addr).map(|o| o.is_ref_array).unwrap_or(false)
        }

        fn for_each_reference(&self, addr: usize, f: &mut dyn FnMut(usize, usize)) {
            let refs: Vec<(usize, usize)> = {
                let objects = self.objects.lock();
                match objects.get(&addr) {
                    Some(obj) => obj.refs.clone(),
                    None => return,
                }
            };
            for (slot, target) in refs {
                f(slot, target);
            }
        }
    }
}
