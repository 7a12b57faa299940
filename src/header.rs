//! Every payload handed to a client is preceded by a fixed-size
//! header that remembers where the block came from.  On free, the
//! header routes the block back to its pool, or to the system
//! allocator for fallback blocks, without any address lookup.
use std::ffi::c_void;
use std::ptr::NonNull;

use static_assertions::{const_assert, const_assert_eq};

use crate::pool::Pool;

/// Bytes of metadata in front of every payload.  A power of two, and
/// at least the natural alignment of any supported scalar, so the
/// payload inherits a usable alignment from its chunk.
pub const HEADER_SIZE: usize = 16;

/// Wire layout on 64-bit targets: bytes 0..8 hold the owner pointer
/// (the all-zero bit pattern marks a system fallback block), bytes
/// 8..16 the total block size in native endianness.  No padding, no
/// trailer; the payload starts at byte 16.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockHeader {
    pub owner: Option<NonNull<Pool>>,
    pub total_size: usize,
}

const_assert_eq!(std::mem::size_of::<BlockHeader>(), HEADER_SIZE);
const_assert!(HEADER_SIZE.is_power_of_two());
const_assert!(std::mem::align_of::<BlockHeader>() <= HEADER_SIZE);

/// Writes a header at the start of `chunk` and returns the payload
/// address, `HEADER_SIZE` bytes in.
///
/// # Safety
///
/// `chunk` must point to at least `HEADER_SIZE` writable bytes,
/// aligned to `align_of::<BlockHeader>()`.
#[inline(always)]
pub(crate) unsafe fn stamp(
    chunk: NonNull<c_void>,
    owner: Option<NonNull<Pool>>,
    total_size: usize,
) -> *mut c_void {
    let header = chunk.as_ptr() as *mut BlockHeader;

    header.write(BlockHeader { owner, total_size });
    (chunk.as_ptr() as *mut u8).add(HEADER_SIZE) as *mut c_void
}

/// Recovers the chunk base address and the header for `payload`.
///
/// # Safety
///
/// `payload` must have been returned by `stamp`, with the header
/// bytes still intact.
#[inline(always)]
pub(crate) unsafe fn from_payload(payload: *mut c_void) -> (NonNull<c_void>, BlockHeader) {
    let chunk = (payload as *mut u8).sub(HEADER_SIZE) as *mut c_void;
    let header = (chunk as *const BlockHeader).read();

    (NonNull::new_unchecked(chunk), header)
}
