//! Thin wrappers around the operating system's virtual memory calls:
//! reserve inaccessible address space, commit sub-ranges for read-write
//! access, and release whole reservations.
use std::ffi::c_void;
use std::ptr::NonNull;

#[cfg(unix)]
mod sys {
    use std::ffi::c_void;
    use std::ptr::NonNull;

    pub fn page_size() -> i64 {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as i64 }
    }

    /// Maps `size` bytes of anonymous, inaccessible address space.
    pub fn reserve(size: usize) -> Result<NonNull<c_void>, i32> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno().0);
        }

        NonNull::new(ptr as *mut c_void).ok_or_else(|| errno::errno().0)
    }

    /// Upgrades the protection of a reserved sub-range to read-write.
    pub fn commit(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        let ret = unsafe {
            libc::mprotect(
                base.as_ptr() as *mut _,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };

        if ret == 0 {
            Ok(())
        } else {
            Err(errno::errno().0)
        }
    }

    pub fn release(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        let ret = unsafe { libc::munmap(base.as_ptr() as *mut _, size) };

        if ret == 0 {
            Ok(())
        } else {
            Err(errno::errno().0)
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::ffi::c_void;
    use std::ptr::NonNull;

    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

    pub fn page_size() -> i64 {
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };

        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as i64
    }

    pub fn reserve(size: usize) -> Result<NonNull<c_void>, i32> {
        let ptr = unsafe { VirtualAlloc(std::ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };

        NonNull::new(ptr as *mut c_void).ok_or_else(|| unsafe { GetLastError() } as i32)
    }

    pub fn commit(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        let ptr = unsafe { VirtualAlloc(base.as_ptr() as *mut _, size, MEM_COMMIT, PAGE_READWRITE) };

        if ptr.is_null() {
            Err(unsafe { GetLastError() } as i32)
        } else {
            Ok(())
        }
    }

    pub fn release(base: NonNull<c_void>, _size: usize) -> Result<(), i32> {
        // VirtualFree with MEM_RELEASE frees the whole reservation and
        // requires a zero size.
        let ret = unsafe { VirtualFree(base.as_ptr() as *mut _, 0, MEM_RELEASE) };

        if ret == 0 {
            Err(unsafe { GetLastError() } as i32)
        } else {
            Ok(())
        }
    }
}

fn page_size_or_die() -> usize {
    let ret = sys::page_size();

    if ret <= 0 {
        panic!("Unable to find page_size: errno={}", errno::errno());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Attempts to reserve an *address space* region of `size` bytes.
/// The reserved range is inaccessible until committed.
///
/// The `size` argument must be a multiple of the page size.
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    sys::reserve(size)
}

/// Backs `size` bytes starting at `base` with (demand-faulted)
/// read-write memory.  The range must lie inside a reserved region.
///
/// Both arguments must be aligned to the page size.
pub fn commit_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (base.as_ptr() as usize % page_size()) == 0 && (size % page_size()) == 0,
        "Bad region base={:?} size={} page_size={}",
        base,
        size,
        page_size()
    );

    sys::commit(base, size)
}

/// Returns a whole reservation of `size` bytes starting at `base`,
/// including any committed pages inside it, to the operating system.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    sys::release(base, size)
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert!(page_size().is_power_of_two());
}

// Reserve a range, commit a couple of sub-ranges, scribble in them,
// and release the whole reservation.
#[test]
fn smoke_test() {
    let region_size = 1usize << 20;
    let base = reserve_region(region_size).expect("reserve should succeed");

    commit_region(base, page_size()).expect("should commit the first page");

    let tail = NonNull::new((base.as_ptr() as usize + 4 * page_size()) as *mut c_void)
        .expect("should be non-null");
    commit_region(tail, 2 * page_size()).expect("should commit an interior range");

    unsafe {
        std::ptr::write_bytes(base.as_ptr() as *mut u8, 42, page_size());
        std::ptr::write_bytes(tail.as_ptr() as *mut u8, 42, 2 * page_size());
    }

    release_region(base, region_size).expect("should release everything");
}
