//! `mmap-alloc` is a drop-in replacement for `malloc`/`calloc`/
//! `realloc`/`reallocarray`/`free` that backs large allocations with
//! file-mapped virtual memory instead of anonymous process heap, so
//! the kernel can page cold data out to disk rather than only to swap.
//! Requests below a configurable threshold fall straight through to
//! the host allocator.
//!
//! The crate is usable three ways: as a set of `#[no_mangle] extern
//! "C"` symbols (`mmap_malloc` and friends) for linking against C/C++
//! code, as a `std::alloc::GlobalAlloc` via [`MmapAlloc`], or directly
//! through the safe [`dispatch`] functions from other Rust code.
mod block;
mod config;
mod dispatch;
mod free_index;
mod heap;
mod host_alloc;
mod mapper;
mod profiler;
mod region;
mod registry;

use std::alloc::{GlobalAlloc, Layout};
use std::ffi::c_void;
use std::os::raw::c_char;

pub use config::ConfigError;
pub use heap::FreeError;

/// Allocates `size` bytes.
///
/// # Safety
///
/// The returned pointer, if non-null, must eventually be passed to
/// exactly one of [`mmap_free`] or [`mmap_realloc`]/[`mmap_reallocarray`]
/// and to no other deallocator.
#[no_mangle]
pub unsafe extern "C" fn mmap_malloc(size: usize) -> *mut c_void {
    dispatch::alloc(size) as *mut c_void
}

/// Allocates zeroed storage for `count` elements of `elem_size` bytes.
///
/// # Safety
///
/// See [`mmap_malloc`].
#[no_mangle]
pub unsafe extern "C" fn mmap_calloc(count: usize, elem_size: usize) -> *mut c_void {
    dispatch::alloc_zeroed(count, elem_size) as *mut c_void
}

/// Resizes the allocation at `ptr` to `size` bytes.
///
/// # Safety
///
/// `ptr` must be `NULL` or a pointer previously returned by one of
/// this crate's allocation functions and not yet freed.
#[no_mangle]
pub unsafe extern "C" fn mmap_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    dispatch::realloc(ptr as *mut u8, size) as *mut c_void
}

/// Resizes the allocation at `ptr` to `count * size` bytes, failing
/// with `errno == EOVERFLOW` if the product overflows.
///
/// # Safety
///
/// See [`mmap_realloc`].
#[no_mangle]
pub unsafe extern "C" fn mmap_reallocarray(
    ptr: *mut c_void,
    count: usize,
    size: usize,
) -> *mut c_void {
    dispatch::realloc_array(ptr as *mut u8, size, count) as *mut c_void
}

/// Releases the allocation at `ptr`. `NULL` is a no-op.
///
/// # Safety
///
/// See [`mmap_realloc`]; `ptr` must not be used again after this call.
#[no_mangle]
pub unsafe extern "C" fn mmap_free(ptr: *mut c_void) {
    dispatch::free(ptr as *mut u8)
}

/// Overrides the directory used for the file-backed heap's temporary
/// files. `NULL` reverts to the platform default temporary directory.
///
/// Only takes effect before the allocator's first-use initialization;
/// calling it afterward has no effect on an already-reserved heap.
///
/// # Safety
///
/// This function assumes `path` is NULL or a valid, NUL-terminated
/// C string.
#[no_mangle]
pub unsafe extern "C" fn mmap_alloc_set_temp_dir(path: *const c_char) {
    use std::ffi::CStr;

    if path.is_null() {
        mapper::set_temp_dir(None);
        return;
    }

    // A caller-supplied path is valid POSIX input even when it isn't
    // valid UTF-8; degrade to a logged no-op instead of aborting across
    // the C boundary, mirroring `ClassConfig::from_c`'s
    // `to_nullable_str` in the teacher crate.
    match CStr::from_ptr(path).to_str() {
        Ok(path_str) => mapper::set_temp_dir(Some(path_str.to_owned().into())),
        Err(e) => {
            log::error!(
                "mmap-alloc: mmap_alloc_set_temp_dir: path is not valid UTF-8: {}",
                e
            );
        }
    }
}

/// A `std::alloc::GlobalAlloc` front door onto the same dispatcher the
/// C shims use, for Rust code that wants this allocator as its global
/// allocator rather than linking against the C symbols.
#[derive(Debug, Default)]
pub struct MmapAlloc;

unsafe impl GlobalAlloc for MmapAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        dispatch::alloc(layout.size())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        dispatch::alloc_zeroed(1, layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        dispatch::free(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        dispatch::realloc(ptr, new_size)
    }
}
