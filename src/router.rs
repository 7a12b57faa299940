//! The `Router` sits on top of the size-class pools and services the
//! public byte-oriented entry points: it routes each request to a pool
//! by total size in constant time, stamps a header on every block so
//! deallocation can find its way back, and falls through to the system
//! allocator for requests larger than the biggest pooled class.
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

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_allocation_map;

use std::alloc::{GlobalAlloc, Layout, System};
use std::ffi::c_void;
use std::ptr::NonNull;

use static_assertions::{const_assert, const_assert_eq};

use crate::arena::Arena;
use crate::chunk_ref::ChunkRef;
use crate::header::{self, HEADER_SIZE};
use crate::pool::{Pool, PoolConfig};

/// Log2 of the smallest class size.
pub const MIN_BIT_SHIFT: usize = 6;

/// Smallest total block size served by a pool: 64 bytes.
pub const MIN_BLOCK_SIZE: usize = 1 << MIN_BIT_SHIFT;

/// Largest total block size served by a pool; anything bigger goes to
/// the system allocator.
pub const MAX_BLOCK_SIZE: usize = 4096;

/// One pool per power of two in `[MIN_BLOCK_SIZE, MAX_BLOCK_SIZE]`.
pub const POOL_COUNT: usize = 7;

const_assert_eq!(MIN_BLOCK_SIZE << (POOL_COUNT - 1), MAX_BLOCK_SIZE);
const_assert!(HEADER_SIZE < MIN_BLOCK_SIZE);

/// Optional per-class sizing overrides for a `Router`.
#[derive(Clone, Debug, Default)]
pub struct RouterConfig {
    /// Classes without a matching `chunk_size` entry use the tiered
    /// defaults.
    pub pool_configs: Vec<PoolConfig>,
}

pub struct Router {
    pools: Vec<&'static Pool>,
}

/// Returns a reference to the shared default `Router`.  Touching the
/// default arena's accessor first pins the initialization order.
pub fn get_default_router() -> &'static Router {
    lazy_static::lazy_static! {
        static ref DEFAULT_ROUTER: Router = Router::new(
            crate::arena::get_default_arena(),
            &RouterConfig::default(),
        );
    }

    &DEFAULT_ROUTER
}

/// Number of chunks in a class's first super-block.  Small chunks
/// churn the most, so they are provisioned deepest.
fn initial_item_count(chunk_size: usize) -> usize {
    if chunk_size <= 256 {
        4096
    } else if chunk_size <= 1024 {
        1024
    } else {
        256
    }
}

/// `bit_width(x)` is the number of bits needed to represent `x`.
#[inline]
fn bit_width(x: usize) -> usize {
    (usize::BITS - x.leading_zeros()) as usize
}

impl Router {
    /// Builds the fixed pool array on top of `arena`, growing each
    /// pool once.
    pub fn new(arena: &'static Arena, config: &RouterConfig) -> Router {
        assert!(
            arena.is_initialized(),
            "the arena must be initialized before the router"
        );

        let mut pools = Vec::with_capacity(POOL_COUNT);
        let mut chunk_size = MIN_BLOCK_SIZE;

        for _ in 0..POOL_COUNT {
            let initial_block_size = config
                .pool_configs
                .iter()
                .find(|pool_config| pool_config.chunk_size == chunk_size)
                .map(|pool_config| pool_config.initial_block_size)
                .unwrap_or(chunk_size * initial_item_count(chunk_size));

            let pool: &'static Pool =
                Box::leak(Box::new(Pool::new(arena, chunk_size, initial_block_size)));

            pools.push(pool);
            chunk_size *= 2;
        }

        Router { pools }
    }

    /// Maps a total (header + payload) size to a pool index: sizes in
    /// `(2^(k-1), 2^k]` land in index `k - MIN_BIT_SHIFT`, and
    /// anything up to `MIN_BLOCK_SIZE` in index 0.  Compiles down to a
    /// single bit-scan after the clamp.
    #[inline]
    pub(crate) fn pool_index(total_size: usize) -> usize {
        let clamped = total_size.max(MIN_BLOCK_SIZE);

        bit_width(clamped - 1) - MIN_BIT_SHIFT
    }

    /// Returns a payload of at least `user_size` bytes, aligned to the
    /// serving class's natural alignment (at least `HEADER_SIZE`).
    ///
    /// Returns null only when the system fallback runs out of memory
    /// (or the request size itself overflows); pool-path failures are
    /// fatal inside the pools.
    #[ensures(!ret.is_null() -> ret as usize % HEADER_SIZE == 0,
              "payloads are at least header-aligned")]
    #[ensures(!ret.is_null() -> debug_allocation_map::mark_allocated(ret as usize).is_ok(),
              "payloads are unique until released")]
    #[inline]
    pub fn allocate(&self, user_size: usize) -> *mut c_void {
        let total_size = match user_size.checked_add(HEADER_SIZE) {
            Some(total_size) => total_size,
            None => return std::ptr::null_mut(),
        };

        if total_size <= MAX_BLOCK_SIZE {
            let pool = self.pools[Self::pool_index(total_size)];
            let chunk = pool.pop().into_non_null();

            unsafe { header::stamp(chunk, Some(NonNull::from(pool)), total_size) }
        } else {
            self.allocate_fallback(total_size)
        }
    }

    #[inline(never)]
    fn allocate_fallback(&self, total_size: usize) -> *mut c_void {
        let layout = match Layout::from_size_align(total_size, HEADER_SIZE) {
            Ok(layout) => layout,
            Err(_) => return std::ptr::null_mut(),
        };

        let raw = unsafe { System.alloc(layout) };

        match NonNull::new(raw as *mut c_void) {
            Some(chunk) => unsafe { header::stamp(chunk, None, total_size) },
            None => {
                log::warn!("fallback allocation of {} bytes failed", total_size);
                std::ptr::null_mut()
            }
        }
    }

    /// Returns `payload` to its owning pool, or to the system
    /// allocator for fallback blocks.  Null is a no-op.
    ///
    /// # Safety
    ///
    /// `payload` must be null, or a pointer previously returned by
    /// `allocate` on this router and not deallocated since.
    pub unsafe fn deallocate(&self, payload: *mut c_void) {
        if payload.is_null() {
            return;
        }

        #[cfg(any(
            all(test, feature = "check_contracts_in_tests"),
            feature = "check_contracts"
        ))]
        debug_allocation_map::mark_released(payload as usize)
            .expect("released payloads come from this router and are live");

        let (chunk, block) = header::from_payload(payload);

        match block.owner {
            Some(pool) => pool.as_ref().push(ChunkRef::new(chunk)),
            None => {
                // Fallback blocks go back whole: the system allocation
                // starts at the chunk base, not the payload.
                let layout = Layout::from_size_align_unchecked(block.total_size, HEADER_SIZE);

                System.dealloc(chunk.as_ptr() as *mut u8, layout);
            }
        }
    }

    /// Drains every pool's free-list.  Backing pages stay with the
    /// arena until its own shutdown.
    pub fn shutdown(&self) {
        for pool in &self.pools {
            pool.shutdown();
        }
    }

    #[cfg(test)]
    pub(crate) fn pool_at(&self, index: usize) -> &'static Pool {
        self.pools[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaConfig;
    use crossbeam_queue::SegQueue;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn test_env(total_reserve_size: usize) -> (&'static Arena, &'static Router) {
        let arena = Box::leak(Box::new(Arena::new(crate::mapper::get_default_mapper())));

        arena.initialize(&ArenaConfig { total_reserve_size });

        let router = Box::leak(Box::new(Router::new(arena, &RouterConfig::default())));

        (arena, router)
    }

    fn owner_of(payload: *mut c_void) -> Option<NonNull<Pool>> {
        unsafe { header::from_payload(payload) }.1.owner
    }

    fn total_size_of(payload: *mut c_void) -> usize {
        unsafe { header::from_payload(payload) }.1.total_size
    }

    #[test]
    fn index_covers_every_class_boundary() {
        // Any total in (2^(k-1), 2^k] lands in index k - 6; totals at
        // or below the smallest class land in index 0.
        for k in MIN_BIT_SHIFT..=12 {
            let class_size = 1usize << k;

            assert_eq!(Router::pool_index(class_size), k - MIN_BIT_SHIFT);
            assert_eq!(Router::pool_index(class_size / 2 + 1), k - MIN_BIT_SHIFT);
        }

        assert_eq!(Router::pool_index(1), 0);
        assert_eq!(Router::pool_index(17), 0);
        assert_eq!(Router::pool_index(63), 0);
        assert_eq!(Router::pool_index(65), 1);
    }

    #[test]
    fn user_sizes_route_to_the_expected_pools() {
        let (_, router) = test_env(1 << 24);

        // User sizes 1 and 48 both total at most 64 bytes with the
        // header; 49 tips over into the 128-byte class, and 4080 fills
        // the largest class exactly.
        let by_class = [(1usize, 0usize), (48, 0), (49, 1), (4080, 6)];

        for &(user_size, index) in by_class.iter() {
            let payload = router.allocate(user_size);

            assert_eq!(
                owner_of(payload),
                Some(NonNull::from(router.pool_at(index))),
                "user size {} should come from pool {}",
                user_size,
                index
            );
            assert_eq!(total_size_of(payload), user_size + HEADER_SIZE);
            unsafe { router.deallocate(payload) };
        }

        // One byte more than the largest class falls through.
        let payload = router.allocate(4081);
        assert_eq!(owner_of(payload), None);
        unsafe { router.deallocate(payload) };
    }

    #[test]
    fn payloads_are_usable_and_aligned() {
        let (_, router) = test_env(1 << 24);

        for &user_size in [1usize, 16, 48, 100, 1000, 4000, 10000].iter() {
            let payload = router.allocate(user_size);

            assert!(!payload.is_null());
            assert_eq!(payload as usize % HEADER_SIZE, 0);

            // The backing region must hold at least `user_size` bytes.
            unsafe { std::ptr::write_bytes(payload as *mut u8, 42, user_size) };
            unsafe { router.deallocate(payload) };
        }
    }

    #[test]
    fn zero_size_requests_are_serviced_from_the_smallest_class() {
        let (_, router) = test_env(1 << 24);
        let payload = router.allocate(0);

        assert!(!payload.is_null());
        assert_eq!(owner_of(payload), Some(NonNull::from(router.pool_at(0))));
        assert_eq!(total_size_of(payload), HEADER_SIZE);
        unsafe { router.deallocate(payload) };
    }

    #[test]
    fn deallocating_null_is_a_noop() {
        let (_, router) = test_env(1 << 24);

        unsafe { router.deallocate(std::ptr::null_mut()) };
    }

    #[test]
    fn large_requests_fall_through_to_the_system() {
        let (arena, router) = test_env(1 << 24);
        let offset = arena.commit_offset();
        let payload = router.allocate(1 << 20);

        assert!(!payload.is_null());
        assert_eq!(owner_of(payload), None);
        assert_eq!(total_size_of(payload), (1 << 20) + HEADER_SIZE);

        // Fallback blocks never touch the arena.
        assert_eq!(arena.commit_offset(), offset);

        unsafe { std::ptr::write_bytes(payload as *mut u8, 42, 1 << 20) };
        unsafe { router.deallocate(payload) };
    }

    #[test]
    fn live_payloads_never_alias() {
        let (_, router) = test_env(1 << 24);
        let mut live = Vec::new();

        for _ in 0..1000 {
            live.push(router.allocate(40) as usize);
        }

        let unique: HashSet<usize> = live.iter().cloned().collect();
        assert_eq!(unique.len(), live.len());

        for payload in live {
            unsafe { router.deallocate(payload as *mut c_void) };
        }
    }

    // A steady allocate/release cycle of one small size must be
    // serviced entirely out of the eagerly grown free-list.
    #[test]
    fn small_fixed_size_cycle_never_grows() {
        let (arena, router) = test_env(1 << 24);
        let offset = arena.commit_offset();

        for _ in 0..20_000 {
            let payload = router.allocate(16);

            assert!(!payload.is_null());
            unsafe { std::ptr::write_bytes(payload as *mut u8, 42, 16) };
            unsafe { router.deallocate(payload) };
        }

        assert_eq!(arena.commit_offset(), offset);
    }

    // Draining one class without freeing doubles the super-block on
    // every growth: 256 KiB at construction, then 512 KiB, then 1 MiB.
    #[test]
    fn super_blocks_double_on_every_growth() {
        let (arena, router) = test_env(1 << 25);
        let pool = router.pool_at(0);
        let offset = arena.commit_offset();

        assert_eq!(pool.next_block_size(), 512 * 1024);

        // 4096 chunks were provisioned up front.
        for _ in 0..4096 {
            let _ = router.allocate(16);
        }
        assert_eq!(arena.commit_offset(), offset);

        let _ = router.allocate(16);
        assert_eq!(arena.commit_offset(), offset + 512 * 1024);

        for _ in 0..8192 {
            let _ = router.allocate(16);
        }
        assert_eq!(arena.commit_offset(), offset + 512 * 1024 + 1024 * 1024);
        assert_eq!(pool.next_block_size(), 2 * 1024 * 1024);
    }

    #[test]
    fn per_class_overrides_replace_the_tiered_defaults() {
        let arena = Box::leak(Box::new(Arena::new(crate::mapper::get_default_mapper())));

        arena.initialize(&ArenaConfig {
            total_reserve_size: 1 << 24,
        });

        let config = RouterConfig {
            pool_configs: vec![PoolConfig {
                chunk_size: 64,
                initial_block_size: 64 * 8,
            }],
        };
        let router = Box::leak(Box::new(Router::new(arena, &config)));

        // The override leaves only 8 chunks in class 0: the ninth
        // allocation must grow.
        let offset = arena.commit_offset();
        let mut live = Vec::new();

        for _ in 0..8 {
            live.push(router.allocate(16));
        }
        assert_eq!(arena.commit_offset(), offset);

        live.push(router.allocate(16));
        assert!(arena.commit_offset() > offset);

        for payload in live {
            unsafe { router.deallocate(payload) };
        }
    }

    // Chunks freed by one thread service later allocations on others.
    #[test]
    fn chunks_recycle_across_threads() {
        let (arena, router) = test_env(1 << 25);
        let handoff: &'static SegQueue<usize> = Box::leak(Box::new(SegQueue::new()));
        const COUNT: usize = 10_000;

        let producer = std::thread::spawn(move || {
            for _ in 0..COUNT {
                // 100 bytes plus the header routes to the 128-byte class.
                let payload = router.allocate(100);

                assert!(!payload.is_null());
                handoff.push(payload as usize);
            }
        });

        let consumer = std::thread::spawn(move || {
            let mut freed = 0;

            while freed < COUNT {
                match handoff.pop() {
                    Some(payload) => {
                        unsafe { router.deallocate(payload as *mut c_void) };
                        freed += 1;
                    }
                    None => std::thread::yield_now(),
                }
            }
        });

        producer.join().expect("producer should not panic");
        consumer.join().expect("consumer should not panic");

        // Everything was freed, so a third thread's allocation comes
        // straight from the free-list.
        let offset = arena.commit_offset();
        let payload = std::thread::spawn(move || router.allocate(100) as usize)
            .join()
            .expect("allocator thread should not panic");

        assert_eq!(arena.commit_offset(), offset);
        unsafe { router.deallocate(payload as *mut c_void) };
    }

    #[test]
    fn concurrent_random_pairs_stay_disjoint() {
        let (_, router) = test_env(1 << 25);

        let handles: Vec<_> = (0..4)
            .map(|thread| {
                std::thread::spawn(move || {
                    let mut state: u64 = 0x9E37_79B9_7F4A_7C15u64.wrapping_mul(thread as u64 + 1) | 1;

                    for _ in 0..2000 {
                        state ^= state << 13;
                        state ^= state >> 7;
                        state ^= state << 17;

                        let user_size = (state as usize % 4096) + 1;
                        let payload = router.allocate(user_size);

                        assert!(!payload.is_null());

                        // Tag both ends of the payload and check them
                        // before releasing; aliased payloads would race.
                        unsafe {
                            let bytes = payload as *mut u8;

                            bytes.write(thread as u8);
                            bytes.add(user_size - 1).write(thread as u8);
                            assert_eq!(bytes.read(), thread as u8);
                            assert_eq!(bytes.add(user_size - 1).read(), thread as u8);
                            router.deallocate(payload);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker should not panic");
        }
    }

    // Teardown order: pools drop their bookkeeping first, then the
    // arena hands the whole reservation back.
    #[test]
    fn teardown_runs_router_first_then_arena() {
        let (arena, router) = test_env(1 << 24);
        let payload = router.allocate(64);

        unsafe { router.deallocate(payload) };

        router.shutdown();
        arena.shutdown();
        assert!(!arena.is_initialized());
    }

    #[test]
    fn shutdown_drains_the_pools() {
        let (arena, router) = test_env(1 << 24);

        router.shutdown();

        // The next allocation regrows its class from the arena.
        let offset = arena.commit_offset();
        let payload = router.allocate(16);

        assert!(arena.commit_offset() > offset);
        unsafe { router.deallocate(payload) };
    }

    proptest! {
        // Bulk allocate, then deallocate and re-allocate in random-ish
        // order, checking that no live payload is ever handed out twice.
        #[test]
        fn random_order(ops in vec((0..20usize, 1..512usize), 1..50)) {
            let router = get_default_router();

            // If a slot is None, we allocate in there the next time we
            // hit it; otherwise we free its contents.  Let the vec leak
            // because we do not want to drop payloads on panic.
            let slots: &mut Vec<Option<*mut c_void>> = Box::leak(Box::new(vec![None; 20]));

            for (index, user_size) in ops.iter().cloned() {
                if let Some(payload) = slots[index].take() {
                    unsafe { router.deallocate(payload) };
                } else {
                    let payload = router.allocate(user_size);

                    prop_assert!(!payload.is_null());

                    let fresh = slots
                        .iter()
                        .all(|slot| slot.map_or(true, |live| live != payload));
                    prop_assert!(fresh);

                    unsafe { std::ptr::write_bytes(payload as *mut u8, 42, user_size) };
                    slots[index] = Some(payload);
                }
            }

            for slot in slots.iter_mut() {
                if let Some(payload) = slot.take() {
                    unsafe { router.deallocate(payload) };
                }
            }

            // Reacquire the vector to avoid leaking on success.
            unsafe { Box::from_raw(slots as *mut _); }
        }
    }
}
