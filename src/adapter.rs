//! A typed front for container-style allocation: element counts are
//! translated into byte requests against the process-wide router, and
//! request lengths are validated before they can overflow.
use std::ffi::c_void;
use std::mem;
use std::ptr::NonNull;

use thiserror::Error;

use crate::header::HEADER_SIZE;

/// The recoverable failures a client can meaningfully react to.
/// Everything else in the allocator is fatal by design.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("allocation length overflows the addressable range")]
    LengthOverflow,
    #[error("the system allocator is out of memory")]
    OutOfMemory,
}

/// A stateless allocation handle for arrays of `T`.  All instances,
/// for all element types, are interchangeable: a pointer obtained from
/// one may be released through any other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArrayAlloc;

impl ArrayAlloc {
    /// Allocates room for `count` elements of `T`.
    ///
    /// Fails with `LengthOverflow` before the byte count can wrap, and
    /// with `OutOfMemory` when an oversized request exhausts the
    /// system fallback.
    pub fn allocate_array<T>(&self, count: usize) -> Result<NonNull<T>, AllocError> {
        // Classes only guarantee the header alignment.
        debug_assert!(mem::align_of::<T>() <= HEADER_SIZE);

        let elem_size = mem::size_of::<T>();

        if elem_size != 0 && count > usize::MAX / elem_size {
            return Err(AllocError::LengthOverflow);
        }

        let payload = crate::allocate(count * elem_size);

        NonNull::new(payload as *mut T).ok_or(AllocError::OutOfMemory)
    }

    /// Releases an array previously obtained from `allocate_array`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate_array` on any `ArrayAlloc`
    /// instance and must not have been released since.
    pub unsafe fn deallocate_array<T>(&self, ptr: NonNull<T>, _count: usize) {
        crate::deallocate(ptr.as_ptr() as *mut c_void);
    }
}
