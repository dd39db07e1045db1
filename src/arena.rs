//! Accounted raw allocator backing trie nodes and scoped buffers.
//!
//! Allocations bypass Rust ownership entirely: callers get a raw pointer and
//! must hand it back with the same layout. The arena only keeps the byte
//! count so that a capacity limit can be enforced and so that tests can
//! observe that everything handed out was eventually returned.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, TrieError};

static GLOBAL: Arena = Arena::with_capacity(usize::MAX);

#[derive(Debug)]
pub struct Arena {
    capacity: AtomicUsize,
    in_use: AtomicUsize,
    live_allocations: AtomicUsize,
}

impl Arena {
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: AtomicUsize::new(capacity),
            in_use: AtomicUsize::new(0),
            live_allocations: AtomicUsize::new(0),
        }
    }

    /// The process-wide arena shared by every version and buffer pool.
    pub fn global() -> &'static Arena {
        &GLOBAL
    }

    /// Changes the byte limit. Lowering it below the current usage only
    /// makes further allocations fail, nothing is evicted.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Bytes currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Number of allocations not yet returned.
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::Acquire)
    }

    pub(crate) fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        debug_assert!(layout.size() > 0, "zero sized arena allocation");
        let requested = layout.size();
        let capacity = self.capacity();
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(requested).filter(|&total| total <= capacity)
            })
            .map_err(|in_use| TrieError::OutOfMemory {
                requested,
                in_use,
                capacity,
            })?;

        let Some(ptr) = NonNull::new(unsafe { alloc(layout) }) else {
            let in_use = self.in_use.fetch_sub(requested, Ordering::AcqRel) - requested;
            return Err(TrieError::OutOfMemory {
                requested,
                in_use,
                capacity,
            });
        };
        self.live_allocations.fetch_add(1, Ordering::AcqRel);
        Ok(ptr)
    }

    /// # Safety
    /// `ptr` must come from [`Arena::allocate`] on this arena with the same
    /// `layout` and must not be used afterwards.
    pub(crate) unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { dealloc(ptr.as_ptr(), layout) };
        self.in_use.fetch_sub(layout.size(), Ordering::AcqRel);
        self.live_allocations.fetch_sub(1, Ordering::AcqRel);
    }
}
