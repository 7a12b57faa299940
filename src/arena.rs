//! The `Arena` owns one large reservation of address space, obtained
//! up front, and hands out page-aligned, freshly committed sub-ranges
//! at monotonically increasing offsets.  It never recycles a
//! sub-range: pools sitting on top never return their super-blocks,
//! and the whole reservation goes back to the operating system in one
//! `release` at shutdown.
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

use crate::mapper::Mapper;

/// The default address space reservation: 1 GiB.
pub const DEFAULT_RESERVE_SIZE: usize = 1 << 30;

/// Sizing knobs for an `Arena`.
#[derive(Clone, Copy, Debug)]
pub struct ArenaConfig {
    /// Size of the one-shot virtual address space reservation, in
    /// bytes.  Rounded up to the page size.
    pub total_reserve_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            total_reserve_size: DEFAULT_RESERVE_SIZE,
        }
    }
}

#[derive(Default)]
struct ArenaState {
    base: usize, // 0 until initialized.
    total_reserved: usize,
    commit_offset: usize,
    page_size: usize,
    initialized: bool,
}

/// A bump allocator over one reserved range of address space.
///
/// All mutation is serialised under a single mutex; callers only reach
/// the arena on cold paths (pool growth), so the lock is never
/// contended in steady state.
pub struct Arena {
    mapper: &'static dyn Mapper,
    state: Mutex<ArenaState>,
}

/// Returns a reference to the shared default `Arena`, initialised with
/// the default configuration on first access.
pub fn get_default_arena() -> &'static Arena {
    lazy_static::lazy_static! {
        static ref DEFAULT_ARENA: &'static Arena = {
            let arena = Box::leak(Box::new(Arena::new(crate::mapper::get_default_mapper())));

            arena.initialize(&ArenaConfig::default());
            arena
        };
    }

    &DEFAULT_ARENA
}

impl Arena {
    /// Creates an uninitialised arena on top of `mapper`.
    pub fn new(mapper: &'static dyn Mapper) -> Self {
        Self {
            mapper,
            state: Mutex::new(ArenaState::default()),
        }
    }

    /// Reserves the configured address range.  Calling this on an
    /// already-initialised arena is a no-op.
    #[ensures(self.is_initialized())]
    pub fn initialize(&self, config: &ArenaConfig) {
        let mut state = self.state.lock().unwrap();

        if state.initialized {
            return;
        }

        let page_size = self.mapper.page_size();
        assert!(
            page_size.is_power_of_two(),
            "page size {} is not a power of two",
            page_size
        );

        let total = round_up_to(config.total_reserve_size, page_size)
            .expect("reservation size overflows when rounded to the page size");

        let base = match self.mapper.reserve(total) {
            Ok(base) => base,
            Err(err) => {
                log::error!(
                    "arena: failed to reserve {} bytes: {}",
                    total,
                    errno::Errno(err)
                );
                panic!("failed to reserve {} bytes of address space: errno={}", total, err);
            }
        };

        state.base = base.as_ptr() as usize;
        state.total_reserved = total;
        state.commit_offset = 0;
        state.page_size = page_size;
        state.initialized = true;

        log::info!(
            "arena: reserved {} bytes at {:#x} (page size {})",
            total,
            state.base,
            page_size
        );
    }

    /// Commits and returns a fresh sub-range of `size` bytes, rounded
    /// up to the page size, at the current commit offset.
    ///
    /// Exhausting the reservation is a configuration bug, not a
    /// runtime condition, and terminates the process.
    #[requires(size > 0)]
    #[ensures(ret.as_ptr() as usize % self.page_size() == 0,
              "blocks start on a page boundary")]
    #[ensures(self.commit_offset() % self.page_size() == 0,
              "the commit offset stays page-aligned")]
    #[ensures(self.commit_offset() <= self.total_reserved(),
              "the commit offset never passes the reservation")]
    pub fn allocate_block(&self, size: usize) -> NonNull<c_void> {
        let mut state = self.state.lock().unwrap();

        assert!(state.initialized, "arena is not initialized");

        let rounded = round_up_to(size, state.page_size).unwrap_or(usize::MAX);
        let new_offset = state.commit_offset.checked_add(rounded).unwrap_or(usize::MAX);

        if new_offset > state.total_reserved {
            log::error!(
                "arena: out of reserved memory: committed={} requested={} reserved={}",
                state.commit_offset,
                rounded,
                state.total_reserved
            );
            panic!("out of reserved memory; increase the arena reservation");
        }

        let addr = state.base + state.commit_offset;
        let block =
            NonNull::new(addr as *mut c_void).expect("a reserved range never includes NULL");

        if let Err(err) = self.mapper.commit(block, rounded) {
            log::error!(
                "arena: failed to commit {} bytes at {:#x}: {}",
                rounded,
                addr,
                errno::Errno(err)
            );
            panic!("failed to commit {} bytes: errno={}", rounded, err);
        }

        state.commit_offset = new_offset;
        block
    }

    /// Returns the whole reservation to the operating system.  Calling
    /// this on an arena that is not initialised is a no-op.
    #[ensures(!self.is_initialized())]
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();

        if !state.initialized {
            return;
        }

        let base =
            NonNull::new(state.base as *mut c_void).expect("initialized arenas have a base");

        if let Err(err) = self.mapper.release(base, state.total_reserved) {
            log::error!(
                "arena: failed to release {} bytes at {:#x}: {}",
                state.total_reserved,
                state.base,
                errno::Errno(err)
            );
            panic!(
                "failed to release {} bytes: errno={}",
                state.total_reserved, err
            );
        }

        log::info!(
            "arena: released {} bytes at {:#x}",
            state.total_reserved,
            state.base
        );

        *state = ArenaState::default();
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().initialized
    }

    /// Total bytes committed so far, page-rounded.
    pub fn commit_offset(&self) -> usize {
        self.state.lock().unwrap().commit_offset
    }

    pub fn total_reserved(&self) -> usize {
        self.state.lock().unwrap().total_reserved
    }

    pub fn page_size(&self) -> usize {
        self.state.lock().unwrap().page_size
    }
}

/// Rounds `size` up to the next multiple of `unit`; `unit` must be a
/// power of two.
fn round_up_to(size: usize, unit: usize) -> Option<usize> {
    Some(size.checked_add(unit - 1)? & !(unit - 1))
}
