//! A `ChunkRef` is a `NonNull<c_void>` that can't be copied or
//! cloned.  Free chunks travel through the pools' free-lists as
//! `ChunkRef`s, so a chunk can only be in one place at a time: either
//! enqueued, or in a client's hands.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::ptr::NonNull;

#[derive(Debug)]
#[repr(transparent)]
pub struct ChunkRef {
    inner: NonNull<c_void>,
}

impl ChunkRef {
    /// Wraps `inner` in a `ChunkRef`.  The `inner` pointer must be the
    /// unique reference to that chunk.
    ///
    /// This function should only be called where chunks enter the pool
    /// layer: freshly sliced super-blocks, and deallocation calls.
    #[allow(clippy::assertions_on_constants)]
    #[requires(true, "`inner` must be unique (check manually)")]
    #[inline(always)]
    pub fn new(inner: NonNull<c_void>) -> Self {
        Self { inner }
    }

    /// Unwraps the `ChunkRef` into a bare `NonNull`, giving up
    /// tracking.  This should only happen where chunks leave the pool
    /// layer: allocations handed to a caller, and shutdown draining.
    #[inline(always)]
    pub fn into_non_null(self) -> NonNull<c_void> {
        #[allow(clippy::let_and_return)]
        let ret = self.inner;

        #[cfg(any(
            all(test, feature = "check_contracts_in_tests"),
            feature = "check_contracts"
        ))]
        std::mem::forget(self);
        ret
    }

    /// Only used for tests and contracts: returns a reference to the
    /// underlying `NonNull`.
    #[cfg(any(test, feature = "check_contracts"))]
    pub(crate) fn get(&self) -> &NonNull<c_void> {
        &self.inner
    }
}

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
impl Drop for ChunkRef {
    #[allow(clippy::assertions_on_constants)]
    #[requires(false, "ChunkRef should never be dropped.")]
    fn drop(&mut self) {}
}

impl PartialEq for ChunkRef {
    fn eq(&self, other: &Self) -> bool {
        self.inner.as_ptr() == other.inner.as_ptr()
    }
}

impl Eq for ChunkRef {}

// It's safe to send a ChunkRef to another thread: linearity means
// there's only one reference to the underlying chunk, so only one
// thread at a time has access to the data.
unsafe impl Send for ChunkRef {}
