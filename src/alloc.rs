//! Native allocator hook with byte accounting
//!
//! Lua routes every allocation through a single `lua_Alloc` callback. The
//! accounting here backs that callback: it tracks the bytes currently in use
//! and denies growth past an optional cap by returning null, which the
//! interpreter reports as a memory error. It must never unwind.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::os::raw::c_void;
use std::ptr;

/// Alignment for every block handed to the interpreter (`max_align_t`)
const NATIVE_ALIGN: usize = 16;

/// Snapshot of allocator counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorStats {
    /// Bytes currently allocated
    pub current_bytes: usize,

    /// Bytes allocated over the lifetime of the state
    pub total_bytes: u64,

    /// Number of successful allocation requests (new blocks and growth)
    pub allocation_count: u64,

    /// Configured cap, if any
    pub max_bytes: Option<usize>,
}

/// Allocation accounting for one interpreter state.
///
/// Owned exclusively by one state: sharing it between states would mix their
/// byte counts.
#[derive(Debug, Default)]
pub struct AllocatorState {
    current: Cell<usize>,
    total: Cell<u64>,
    count: Cell<u64>,
    max_bytes: Cell<Option<usize>>,
    denied: Cell<u64>,
}

impl AllocatorState {
    /// Create allocator state with an optional byte cap
    pub fn new(max_bytes: Option<usize>) -> Self {
        let state = AllocatorState::default();
        state.max_bytes.set(max_bytes);
        state
    }

    /// Current counters
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            current_bytes: self.current.get(),
            total_bytes: self.total.get(),
            allocation_count: self.count.get(),
            max_bytes: self.max_bytes.get(),
        }
    }

    /// Change the cap. Existing allocations are not affected.
    pub fn set_max_bytes(&self, max_bytes: Option<usize>) {
        self.max_bytes.set(max_bytes);
    }

    /// Number of requests denied because of the cap
    pub fn denied_count(&self) -> u64 {
        self.denied.get()
    }

    /// Whether growing a block from `old_size` to `new_size` stays within the cap
    fn admits(&self, old_size: usize, new_size: usize) -> bool {
        match self.max_bytes.get() {
            Some(max) if new_size > old_size => {
                let growth = new_size - old_size;
                self.current.get().saturating_add(growth) <= max
            }
            _ => true,
        }
    }

    /// Serve one `lua_Alloc` request.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a block previously returned by this allocator
    /// with size `old_size`.
    pub unsafe fn reallocate(&self, ptr: *mut c_void, old_size: usize, new_size: usize) -> *mut c_void {
        // For fresh blocks Lua passes the object type in `old_size`
        let old_size = if ptr.is_null() { 0 } else { old_size };

        if new_size == 0 {
            if !ptr.is_null() {
                if let Ok(layout) = Layout::from_size_align(old_size, NATIVE_ALIGN) {
                    alloc::dealloc(ptr as *mut u8, layout);
                }
                self.current.set(self.current.get().saturating_sub(old_size));
            }
            return ptr::null_mut();
        }

        if !self.admits(old_size, new_size) {
            self.denied.set(self.denied.get() + 1);
            tracing::warn!(
                requested = new_size,
                current = self.current.get(),
                max = ?self.max_bytes.get(),
                "native allocation denied by memory cap"
            );
            return ptr::null_mut();
        }

        let new_ptr = if ptr.is_null() {
            match Layout::from_size_align(new_size, NATIVE_ALIGN) {
                Ok(layout) => alloc::alloc(layout),
                Err(_) => ptr::null_mut(),
            }
        } else {
            match Layout::from_size_align(old_size, NATIVE_ALIGN) {
                Ok(layout) => alloc::realloc(ptr as *mut u8, layout, new_size),
                Err(_) => ptr::null_mut(),
            }
        };

        if new_ptr.is_null() {
            return ptr::null_mut();
        }

        self.current.set(self.current.get() - old_size + new_size);
        if new_size > old_size {
            self.total.set(self.total.get() + (new_size - old_size) as u64);
            self.count.set(self.count.get() + 1);
        }
        new_ptr as *mut c_void
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free_tracks_bytes() {
        let state = AllocatorState::new(None);
        unsafe {
            let block = state.reallocate(ptr::null_mut(), 5, 64);
            assert!(!block.is_null());
            assert_eq!(state.stats().current_bytes, 64);

            let block = state.reallocate(block, 64, 128);
            assert!(!block.is_null());
            assert_eq!(state.stats().current_bytes, 128);

            let block = state.reallocate(block, 128, 32);
            assert!(!block.is_null());
            assert_eq!(state.stats().current_bytes, 32);

            let freed = state.reallocate(block, 32, 0);
            assert!(freed.is_null());
        }

        let stats = state.stats();
        assert_eq!(stats.current_bytes, 0);
        assert_eq!(stats.total_bytes, 128);
        assert_eq!(stats.allocation_count, 2);
    }

    #[test]
    fn test_cap_denies_without_panicking() {
        let state = AllocatorState::new(Some(100));
        unsafe {
            let denied = state.reallocate(ptr::null_mut(), 0, 101);
            assert!(denied.is_null());
            assert_eq!(state.denied_count(), 1);

            let block = state.reallocate(ptr::null_mut(), 0, 80);
            assert!(!block.is_null());

            let grown = state.reallocate(block, 80, 120);
            assert!(grown.is_null());
            assert_eq!(state.stats().current_bytes, 80);

            // Shrinking is always allowed
            let shrunk = state.reallocate(block, 80, 40);
            assert!(!shrunk.is_null());
            state.reallocate(shrunk, 40, 0);
        }
        assert_eq!(state.stats().current_bytes, 0);
    }
}
