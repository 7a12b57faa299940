//! A `Pool` hands out fixed-size chunks for a single size class.  The
//! free-list is a lock-free MPMC queue, so steady-state `pop`/`push`
//! never take a lock; only growth serialises on a per-pool mutex and
//! calls down into the `Arena` for a fresh super-block.
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
use std::sync::Mutex;

use crossbeam_queue::SegQueue;

use crate::arena::Arena;
use crate::chunk_ref::ChunkRef;

/// A `(chunk_size, initial_block_size)` override for one size class.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Total chunk size (header + payload) served by the pool.
    pub chunk_size: usize,
    /// Size of the first super-block the pool requests from the arena.
    pub initial_block_size: usize,
}

/// State that only changes under the grow lock.
#[derive(Debug)]
struct GrowState {
    /// Size of the next super-block, doubled after every growth.
    next_block_size: usize,
}

pub struct Pool {
    chunk_size: usize,
    arena: &'static Arena,
    free_list: SegQueue<ChunkRef>,
    grow_lock: Mutex<GrowState>,
}

impl Pool {
    /// Creates a pool for chunks of `chunk_size` bytes and grows it
    /// once, so the first `pop` is already a hot-path call.
    #[requires(chunk_size.is_power_of_two())]
    #[requires(initial_block_size >= chunk_size)]
    #[requires(initial_block_size % chunk_size == 0)]
    pub fn new(arena: &'static Arena, chunk_size: usize, initial_block_size: usize) -> Pool {
        let pool = Pool {
            chunk_size,
            arena,
            free_list: SegQueue::new(),
            grow_lock: Mutex::new(GrowState {
                next_block_size: initial_block_size,
            }),
        };

        let grown = pool.grow();
        assert!(grown, "a fresh pool must grow");
        pool
    }

    /// Acquires a free chunk, growing the pool if the free-list is
    /// empty.  An empty free-list right after a growth is a bug and
    /// terminates the process.
    #[ensures(ret.get().as_ptr() as usize % self.chunk_size == 0,
              "chunks are naturally aligned to the class size")]
    #[inline]
    pub fn pop(&self) -> ChunkRef {
        if let Some(chunk) = self.free_list.pop() {
            return chunk;
        }

        self.pop_slow()
    }

    #[inline(never)]
    fn pop_slow(&self) -> ChunkRef {
        if self.grow() {
            if let Some(chunk) = self.free_list.pop() {
                return chunk;
            }
        }

        log::error!(
            "pool {}: free-list still empty after growing",
            self.chunk_size
        );
        panic!("failed to pop a chunk after growing");
    }

    /// Returns a chunk to the free-list.  Never blocks on growth.
    #[requires(chunk.get().as_ptr() as usize % self.chunk_size == 0,
               "chunks are naturally aligned to the class size")]
    #[inline]
    pub fn push(&self, chunk: ChunkRef) {
        self.free_list.push(chunk);
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Drops the free-list bookkeeping.  The chunks' backing memory
    /// belongs to the arena and is only reclaimed when the arena's
    /// whole reservation is released.
    pub fn shutdown(&self) {
        while let Some(chunk) = self.free_list.pop() {
            let _ = chunk.into_non_null();
        }
    }

    /// Requests a super-block from the arena, slices it into chunks,
    /// and enqueues them.  Serialised under the grow lock; re-checks
    /// the free-list after acquisition so that threads racing on a
    /// cold pool trigger a single growth.
    fn grow(&self) -> bool {
        let mut state = self.grow_lock.lock().unwrap();

        if !self.free_list.is_empty() {
            return true;
        }

        let block = self.arena.allocate_block(state.next_block_size);
        let base = block.as_ptr() as usize;
        let count = state.next_block_size / self.chunk_size;

        log::debug!(
            "pool {}: grew by {} chunks ({} bytes)",
            self.chunk_size,
            count,
            state.next_block_size
        );

        for i in 0..count {
            let addr = (base + i * self.chunk_size) as *mut c_void;

            self.free_list
                .push(ChunkRef::new(NonNull::new(addr).expect("chunks are never NULL")));
        }

        state.next_block_size *= 2;
        true
    }

    #[cfg(test)]
    pub(crate) fn next_block_size(&self) -> usize {
        self.grow_lock.lock().unwrap().next_block_size
    }
}
