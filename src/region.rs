//! Region reservation acquires a single large range of virtual address
//! space without committing any physical memory to it.  The range is
//! reserved with a `PROT_NONE` placeholder mapping so that later calls
//! can replace arbitrary page-aligned sub-ranges with real, file-backed
//! mappings via `MAP_FIXED`, without disturbing neighboring blocks.
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

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("unable to determine page size");
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.  Constant for the lifetime of the process.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Rounds `size` up to the next multiple of the page size.
#[inline]
pub fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

fn errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL)
}

/// Attempts to reserve `size` bytes of address space.  `size` must be a
/// multiple of the page size.
///
/// # Errors
///
/// Returns the `errno` set by `mmap` on failure (typically `ENOMEM`:
/// `OUT_OF_ADDRESS_SPACE`).
#[requires(size > 0 && size % page_size() == 0, "size must be a positive multiple of the page size")]
#[ensures(ret.is_ok() -> ret.unwrap().as_ptr() as usize % page_size() == 0, "returned base is page-aligned")]
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, i32> {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        return Err(errno());
    }

    NonNull::new(addr).ok_or(libc::ENOMEM)
}

/// Releases a region of `size` bytes starting at `base`, previously
/// obtained from a single call to [`reserve_region`].
#[requires(base.as_ptr() as usize % page_size() == 0)]
#[requires(size % page_size() == 0)]
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    let ret = unsafe { libc::munmap(base.as_ptr(), size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Re-installs a `PROT_NONE` placeholder mapping over `[base, base+size)`,
/// which must already be part of a range returned by [`reserve_region`].
/// Used to keep a freshly-unmapped block's address range reserved for
/// future allocations.
#[requires(base.as_ptr() as usize % page_size() == 0)]
#[requires(size % page_size() == 0)]
pub fn reserve_placeholder(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    let addr = unsafe {
        libc::mmap(
            base.as_ptr(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED,
            -1,
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(())
    }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert_eq!(page_size() % 4096, 0);
}

#[test]
fn smoke_test_reserve_release() {
    let size = 16 * page_size();
    let base = reserve_region(size).expect("reserve should succeed");

    reserve_placeholder(base, size).expect("re-placeholdering should succeed");
    release_region(base, size).expect("release should succeed");
}
