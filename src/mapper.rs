//! A `Mapper` is responsible for acquiring address space and backing
//! memory from the operating system.  The `Arena` is parameterised on
//! such a `Mapper`, which keeps platform details out of the allocation
//! logic and lets tests inject their own instances.
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

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait Mapper: std::fmt::Debug + Sync {
    /// Returns the mapping granularity for this mapper.  All calls
    /// into the mapper align addresses and sizes to that page size.
    ///
    /// The page size must be constant for the lifetime of a process.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Attempts to reserve `size` bytes of contiguous, currently
    /// inaccessible address space.  On success, returns the address of
    /// the first byte in the reserved range.
    #[requires(size > 0)]
    #[requires(size % self.page_size() == 0)]
    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, i32>;

    /// Makes a sub-range of a previously reserved region readable and
    /// writable.  The sub-range must be page-aligned on both ends.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;

    /// Returns an entire reservation, including all committed pages
    /// within it, to the operating system.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;
}

#[derive(Debug)]
struct DefaultMapper {}

/// Returns the process-wide default mapper, backed by the platform's
/// virtual memory calls.
pub fn get_default_mapper() -> &'static dyn Mapper {
    lazy_static::lazy_static! {
        static ref DEFAULT_MAPPER: DefaultMapper = DefaultMapper {};
    }

    &*DEFAULT_MAPPER
}

#[contract_trait]
impl Mapper for DefaultMapper {
    fn page_size(&self) -> usize {
        crate::map::page_size()
    }

    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, i32> {
        crate::map::reserve_region(size)
    }

    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::commit_region(base, size)
    }

    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::release_region(base, size)
    }
}

#[test]
fn default_mapper_round_trips() {
    let mapper = get_default_mapper();
    let page = mapper.page_size();

    assert!(page.is_power_of_two());

    let base = mapper.reserve(16 * page).expect("reserve should succeed");

    mapper.commit(base, page).expect("commit should succeed");
    unsafe { std::ptr::write_bytes(base.as_ptr() as *mut u8, 1, page) };

    mapper
        .release(base, 16 * page)
        .expect("release should succeed");
}
