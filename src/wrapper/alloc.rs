//! Tracking of native-heap memory handed to the runtime.
//!
//! Every string or token array passed across the boundary is copied into
//! `malloc`ed memory and recorded in an [`AllocationTracker`]. Each foreign
//! call allocates through its own [`AllocationScope`], which releases exactly
//! what it allocated once the call returns; `Drop` on the tracker only catches
//! what a caller forgot.

use std::collections::HashSet;
use std::ffi::{c_char, c_void};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

use super::error::{RkllmError, Result};

/// A set of owned `malloc` allocations, safe to share between threads.
#[derive(Default)]
pub struct AllocationTracker {
    // Addresses are stored as usize so the set stays Send + Sync.
    addrs: Mutex<HashSet<usize>>,
}

impl AllocationTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<usize>> {
        // A panic while holding the lock cannot leave the set half-updated.
        self.addrs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `ptr` as owned by this tracker.
    ///
    /// Returns `false` if the address was already tracked.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `libc::malloc` (or `calloc`/`realloc`), must not be
    /// freed by anyone else, and must not be tracked by another tracker.
    pub unsafe fn add(&self, ptr: NonNull<c_void>) -> bool {
        self.lock().insert(ptr.as_ptr() as usize)
    }

    /// Copy `bytes` into a fresh native allocation owned by this tracker.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> Result<NonNull<u8>> {
        // malloc(0) may return null; always ask for at least one byte.
        let size = bytes.len().max(1);
        let raw = unsafe { libc::malloc(size) };
        let ptr = NonNull::new(raw).ok_or(RkllmError::OutOfMemory(size))?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr() as *mut u8, bytes.len());
            self.add(ptr);
        }
        Ok(ptr.cast())
    }

    /// Copy an already NUL-terminated buffer into native memory.
    ///
    /// Callers build `bytes` with [`nul_terminated`](super::marshal::nul_terminated).
    pub fn alloc_c_string(&self, bytes: &[u8]) -> Result<NonNull<c_char>> {
        debug_assert_eq!(bytes.last(), Some(&0));
        self.alloc_bytes(bytes).map(NonNull::cast)
    }

    /// Copy a token sequence into a contiguous native `int32_t` array.
    pub fn alloc_tokens(&self, tokens: &[i32]) -> Result<NonNull<i32>> {
        let bytes = unsafe {
            std::slice::from_raw_parts(tokens.as_ptr() as *const u8, std::mem::size_of_val(tokens))
        };
        self.alloc_bytes(bytes).map(NonNull::cast)
    }

    /// Whether `ptr` is currently owned by this tracker.
    pub fn contains(&self, ptr: *const c_void) -> bool {
        self.lock().contains(&(ptr as usize))
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Free a single tracked allocation.
    ///
    /// Returns `false` (and frees nothing) if `ptr` is not tracked here.
    pub fn release(&self, ptr: *mut c_void) -> bool {
        let removed = self.lock().remove(&(ptr as usize));
        if removed {
            unsafe { libc::free(ptr) };
        }
        removed
    }

    /// Move every allocation of `other` into `self`.
    ///
    /// The source is emptied before the destination is extended, so an
    /// address is never owned by two trackers at once.
    pub fn borrow_from(&self, other: &AllocationTracker) {
        if std::ptr::eq(self, other) {
            return;
        }
        let moved = std::mem::take(&mut *other.lock());
        if moved.is_empty() {
            return;
        }
        self.lock().extend(moved);
    }

    /// Free every tracked allocation and clear the set.
    pub fn free(&self) {
        let mut addrs = self.lock();
        let count = addrs.len();
        for addr in addrs.drain() {
            unsafe { libc::free(addr as *mut c_void) };
        }
        if count > 0 {
            tracing::trace!("Freed {} native allocations", count);
        }
    }

    /// Open a per-call scope over this tracker.
    ///
    /// Memory allocated through the scope is visible in the tracker and is
    /// released when the scope drops. Other scopes on the same tracker are
    /// unaffected, so concurrent calls may share one tracker.
    pub fn scope(&self) -> AllocationScope<'_> {
        AllocationScope {
            tracker: self,
            owned: Mutex::new(Vec::new()),
        }
    }
}

impl Drop for AllocationTracker {
    fn drop(&mut self) {
        let leftover = self.lock().len();
        if leftover > 0 {
            tracing::debug!("Releasing {} native allocations on drop", leftover);
            self.free();
        }
    }
}

/// Allocations belonging to one foreign call. See [`AllocationTracker::scope`].
pub struct AllocationScope<'a> {
    tracker: &'a AllocationTracker,
    owned: Mutex<Vec<usize>>,
}

impl AllocationScope<'_> {
    fn adopt<T>(&self, ptr: NonNull<T>) -> NonNull<T> {
        self.owned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ptr.as_ptr() as usize);
        ptr
    }

    /// [`AllocationTracker::alloc_bytes`], released with this scope.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> Result<NonNull<u8>> {
        Ok(self.adopt(self.tracker.alloc_bytes(bytes)?))
    }

    /// [`AllocationTracker::alloc_c_string`], released with this scope.
    pub fn alloc_c_string(&self, bytes: &[u8]) -> Result<NonNull<c_char>> {
        Ok(self.adopt(self.tracker.alloc_c_string(bytes)?))
    }

    /// [`AllocationTracker::alloc_tokens`], released with this scope.
    pub fn alloc_tokens(&self, tokens: &[i32]) -> Result<NonNull<i32>> {
        Ok(self.adopt(self.tracker.alloc_tokens(tokens)?))
    }

    /// Allocations made through this scope and not yet released.
    pub fn len(&self) -> usize {
        self.owned.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for AllocationScope<'_> {
    fn drop(&mut self) {
        let owned = std::mem::take(&mut *self.owned.lock().unwrap_or_else(|e| e.into_inner()));
        for addr in owned {
            // Already gone if the tracker was freed or handed off meanwhile.
            self.tracker.release(addr as *mut c_void);
        }
    }
}
