//! Shared fixtures for the integration suites: a hash-map-backed object
//! model and the standard heap geometry every suite uses.

#![allow(dead_code)]

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use regionheap::config::{HeapSizing, RegionSizing};
use regionheap::layout::MemRegion;
use regionheap::manager::RegionManager;
use regionheap::object::{ObjectModel, TypeToken};

pub const MB: usize = 1024 * 1024;
pub const BASE: usize = 0x4000_0000;

/// 1 MiB regions, the smallest legal grain.
pub fn sizing() -> RegionSizing {
    RegionSizing::derive(&HeapSizing {
        initial_heap_size: 256 * MB,
        max_heap_size: 1024 * MB,
        region_size: MB,
    })
    .expect("valid sizing")
}

pub fn manager(region_count: usize) -> RegionManager {
    RegionManager::new(MemRegion::new(BASE, BASE + region_count * MB), sizing())
        .expect("valid heap range")
}

struct TestObject {
    size: usize,
    type_token: TypeToken,
    is_ref_array: bool,
    published: bool,
    /// (slot address, target address) pairs.
    refs: Vec<(usize, usize)>,
}

/// A heap of descriptors keyed by address; no real memory behind it.
#[derive(Default)]
pub struct TestHeap {
    objects: Mutex<FxHashMap<usize, TestObject>>,
    loaded: Mutex<FxHashSet<u64>>,
}

impl TestHeap {
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
            TestObject {
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

impl ObjectModel for TestHeap {
    fn size_of(&self, addr: usize) -> Option<usize> {
        let objects = self.objects.lock();
        let obj = objects.get(&addr)?;
        obj.published.then_some(obj.size)
    }

    fn type_of(&self, addr: usize) -> TypeToken {
        self.objects
            .lock()
            .get(&addr)
            .map(|o| o.type_token)
            .unwrap_or(TypeToken(0))
    }

    fn is_type_loaded(&self, token: TypeToken) -> bool {
        self.loaded.lock().contains(&token.0)
    }

    fn is_reference_array(&self, addr: usize) -> bool {
        self.objects
            .lock()
            .get(&addr)
            .map(|o| o.is_ref_array)
            .unwrap_or(false)
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
