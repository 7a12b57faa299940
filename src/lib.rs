//! Quarry is a thread-safe, size-classed memory allocator for
//! latency-sensitive workloads: many small, short-lived objects,
//! node-like graphs, and mid-size buffers.
//!
//! Two layers do the work.  An [`Arena`] reserves one large range of
//! address space up front and commits pages lazily, in address order,
//! under a single mutex.  A [`Router`] owns one pool per power-of-two
//! size class; pools serve chunks from lock-free free-lists, so the
//! steady-state allocation path never takes a lock, and a 16-byte
//! header in front of every payload routes deallocations back without
//! any address lookup.  Requests too large for the biggest class fall
//! through to the system allocator.
mod adapter;
mod arena;
mod chunk_ref;
mod header;
mod map;
mod mapper;
mod pool;
mod router;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_allocation_map;

use std::ffi::c_void;

pub use adapter::AllocError;
pub use adapter::ArrayAlloc;
pub use arena::get_default_arena;
pub use arena::Arena;
pub use arena::ArenaConfig;
pub use arena::DEFAULT_RESERVE_SIZE;
pub use header::HEADER_SIZE;
pub use mapper::get_default_mapper;
pub use mapper::Mapper;
pub use pool::Pool;
pub use pool::PoolConfig;
pub use router::get_default_router;
pub use router::Router;
pub use router::RouterConfig;
pub use router::MAX_BLOCK_SIZE;
pub use router::MIN_BLOCK_SIZE;
pub use router::POOL_COUNT;

/// Allocates `size` bytes from the process-wide router.
///
/// Returns null only when an oversized request exhausts the system
/// fallback; pooled requests either succeed or terminate the process.
#[inline]
pub fn allocate(size: usize) -> *mut c_void {
    router::get_default_router().allocate(size)
}

/// Releases a payload obtained from [`allocate`].  Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null, or a pointer previously returned by
/// [`allocate`] that has not been released since.
#[inline]
pub unsafe fn deallocate(ptr: *mut c_void) {
    router::get_default_router().deallocate(ptr)
}

/// C-callable variant of [`allocate`].
#[no_mangle]
pub extern "C" fn quarry_allocate(size: usize) -> *mut c_void {
    allocate(size)
}

/// C-callable variant of [`deallocate`].
///
/// # Safety
///
/// This function assumes `ptr` is NULL or a live quarry allocation.
#[no_mangle]
pub unsafe extern "C" fn quarry_deallocate(ptr: *mut c_void) {
    deallocate(ptr)
}
