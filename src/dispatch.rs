//! The dispatcher (C6) is the public API: `alloc`, `alloc_zeroed`,
//! `realloc`, `realloc_array`, `free`. Each entry point first ensures
//! the allocator is initialized (lazily, exactly once, thread-safely),
//! then routes the call either to the file-backed heap (C4 + C5) or to
//! the host allocator, per the table in the external interfaces
//! section.
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{self, Config, ConfigError};
use crate::heap::HeapManager;
use crate::mapper;
use crate::profiler;
use crate::region;

const STATUS_UNLOADED: u8 = 0;
const STATUS_LOADED: u8 = 1;
const STATUS_FAILED: u8 = 2;

static STATUS: AtomicU8 = AtomicU8::new(STATUS_UNLOADED);

struct Inner {
    heap: Arc<HeapManager>,
    config: Config,
}

lazy_static::lazy_static! {
    static ref INNER: Mutex<Option<Arc<Inner>>> = Mutex::new(None);
}

#[derive(Debug, thiserror::Error)]
enum InitError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to reserve a {0}-byte heap region: errno {1}")]
    RegionReserve(usize, i32),
}

fn initialize() -> Result<Inner, InitError> {
    let cfg = config::load()?;

    let base = region::reserve_region(cfg.heap_size)
        .map_err(|errno| InitError::RegionReserve(cfg.heap_size, errno))?;
    let heap = Arc::new(HeapManager::init(base.as_ptr() as usize, cfg.heap_size));

    if let Some(path) = cfg.profile_path.clone() {
        profiler::start(heap.clone(), path, cfg.profile_frequency);
    }

    log::info!(
        "mmap-alloc: initialized heap at {:#x}, capacity {} bytes, threshold {} bytes",
        heap.base(),
        cfg.heap_size,
        cfg.min_bsize
    );

    Ok(Inner { heap, config: cfg })
}

/// Ensures the allocator has attempted first-use initialization, and
/// returns the live state if it succeeded. Idempotent: only the first
/// caller across the process actually runs `initialize`.
fn ensure_initialized() -> Option<Arc<Inner>> {
    match STATUS.load(Ordering::Acquire) {
        STATUS_LOADED => return INNER.lock().unwrap().clone(),
        STATUS_FAILED => return None,
        _ => {}
    }

    let mut guard = INNER.lock().unwrap();

    // Another thread may have raced us to the lock and already decided
    // the outcome.
    match STATUS.load(Ordering::Acquire) {
        STATUS_LOADED => return guard.clone(),
        STATUS_FAILED => return None,
        _ => {}
    }

    match initialize() {
        Ok(inner) => {
            let arc = Arc::new(inner);
            *guard = Some(arc.clone());
            STATUS.store(STATUS_LOADED, Ordering::Release);
            Some(arc)
        }
        Err(e) => {
            log::error!("mmap-alloc: initialization failed, falling back to host allocator: {}", e);
            STATUS.store(STATUS_FAILED, Ordering::Release);
            None
        }
    }
}

fn set_errno(e: i32) {
    errno::set_errno(errno::Errno(e));
}

fn nonnull(addr: usize) -> NonNull<c_void> {
    NonNull::new(addr as *mut c_void).expect("block addresses are never null")
}

fn host_alloc(size: usize) -> *mut u8 {
    unsafe { libc::malloc(size) as *mut u8 }
}

fn host_calloc(count: usize, elem_size: usize) -> *mut u8 {
    unsafe { libc::calloc(count, elem_size) as *mut u8 }
}

fn host_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    unsafe { libc::realloc(ptr as *mut c_void, size) as *mut u8 }
}

fn host_free(ptr: *mut u8) {
    unsafe { libc::free(ptr as *mut c_void) }
}

fn allocate_in_heap(inner: &Inner, size: usize) -> *mut u8 {
    let rounded = region::round_up_to_page(size);
    let template = inner.config.naming_template.clone();

    match inner
        .heap
        .allocate_and_map(rounded, |addr, sz| mapper::map_backed(nonnull(addr), sz, &template))
    {
        Ok(Some(addr)) => addr as *mut u8,
        Ok(None) => {
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
        Err(errno) => {
            set_errno(errno);
            std::ptr::null_mut()
        }
    }
}

/// Allocates `size` bytes. Requests at or above the configured
/// threshold, once the allocator has initialized successfully, are
/// backed by the file-mapped heap; everything else forwards to the
/// host allocator.
pub fn alloc(size: usize) -> *mut u8 {
    if size == 0 {
        return std::ptr::null_mut();
    }

    match ensure_initialized() {
        Some(inner) if size >= inner.config.min_bsize => allocate_in_heap(&inner, size),
        _ => host_alloc(size),
    }
}

/// Allocates zeroed storage for `count` elements of `elem_size` bytes
/// each. Rejects a product that would overflow `usize` the same way
/// `realloc_array` does.
pub fn alloc_zeroed(count: usize, elem_size: usize) -> *mut u8 {
    let size = match count.checked_mul(elem_size) {
        Some(size) => size,
        None => {
            set_errno(libc::ENOMEM);
            return std::ptr::null_mut();
        }
    };

    if size == 0 {
        return std::ptr::null_mut();
    }

    let ptr = match ensure_initialized() {
        Some(inner) if size >= inner.config.min_bsize => allocate_in_heap(&inner, size),
        _ => host_calloc(count, elem_size),
    };

    if !ptr.is_null() {
        // `map_backed` already hands back zero-filled pages (a fresh
        // sparse file's extended range reads as zero), but the
        // host-allocator path does not, so zero explicitly for both to
        // honor the contract uniformly.
        unsafe { std::ptr::write_bytes(ptr, 0, size) };
    }

    ptr
}

fn realloc_in_heap(inner: &Inner, ptr: *mut u8, size: usize) -> *mut u8 {
    let addr = ptr as usize;

    let block = match inner.heap.block_at(addr) {
        Some(block) => block,
        None => {
            log::error!("mmap-alloc: realloc: {:#x} is not a live block", addr);
            set_errno(libc::EINVAL);
            return std::ptr::null_mut();
        }
    };

    // No shrinking in place: a request that already fits is returned
    // unchanged.
    if block.size >= size {
        return ptr;
    }

    let rounded = region::round_up_to_page(size);
    let template = inner.config.naming_template.clone();

    let new_addr = match inner
        .heap
        .allocate_and_map(rounded, |addr, sz| mapper::map_backed(nonnull(addr), sz, &template))
    {
        Ok(Some(addr)) => addr,
        Ok(None) => {
            set_errno(libc::ENOMEM);
            return std::ptr::null_mut();
        }
        Err(errno) => {
            set_errno(errno);
            return std::ptr::null_mut();
        }
    };

    unsafe {
        std::ptr::copy_nonoverlapping(ptr, new_addr as *mut u8, block.size.min(rounded));
    }

    if let Err(e) = inner
        .heap
        .free_and_unmap(addr, |addr, sz| mapper::unmap(nonnull(addr), sz))
    {
        log::error!("mmap-alloc: realloc: failed to release old block: {}", e);
    }

    new_addr as *mut u8
}

/// Grows a host-allocator buffer across the threshold by calling the
/// host `realloc` first and then migrating the (possibly moved)
/// result into the file-backed heap.
///
/// This pays for two copies instead of one; the alternative of
/// allocating the heap block directly and skipping the host `realloc`
/// call was considered (see the design notes) but requires knowing
/// the old buffer's usable size, which the host allocator does not
/// expose portably.
fn migrate_host_result_into_heap(inner: &Inner, host_ptr: *mut u8, size: usize) -> *mut u8 {
    let rounded = region::round_up_to_page(size);
    let template = inner.config.naming_template.clone();

    match inner
        .heap
        .allocate_and_map(rounded, |addr, sz| mapper::map_backed(nonnull(addr), sz, &template))
    {
        Ok(Some(heap_addr)) => {
            unsafe {
                std::ptr::copy_nonoverlapping(host_ptr, heap_addr as *mut u8, size);
            }
            host_free(host_ptr);
            heap_addr as *mut u8
        }
        _ => host_ptr,
    }
}

/// Resizes the allocation at `ptr` to `size` bytes, as `realloc`.
/// `ptr == NULL` behaves as `alloc(size)`.
pub fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return alloc(size);
    }

    if size == 0 {
        free(ptr);
        return std::ptr::null_mut();
    }

    let inner = ensure_initialized();

    match &inner {
        Some(inner) if inner.heap.contains(ptr as usize) => realloc_in_heap(inner, ptr, size),
        Some(inner) => {
            let new_ptr = host_realloc(ptr, size);
            if new_ptr.is_null() || size < inner.config.min_bsize {
                new_ptr
            } else {
                migrate_host_result_into_heap(inner, new_ptr, size)
            }
        }
        None => host_realloc(ptr, size),
    }
}

/// `realloc(ptr, size * count)`, with overflow detection on the
/// product.
pub fn realloc_array(ptr: *mut u8, size: usize, count: usize) -> *mut u8 {
    match size.checked_mul(count) {
        Some(total) => realloc(ptr, total),
        None => {
            set_errno(libc::EOVERFLOW);
            std::ptr::null_mut()
        }
    }
}

/// Releases the allocation at `ptr`. A `NULL` pointer is a no-op.
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }

    match ensure_initialized() {
        Some(inner) if inner.heap.contains(ptr as usize) => {
            if let Err(e) = inner
                .heap
                .free_and_unmap(ptr as usize, |addr, sz| mapper::unmap(nonnull(addr), sz))
            {
                log::error!("mmap-alloc: free: {}", e);
            }
        }
        _ => host_free(ptr),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // These tests share the single process-wide heap singleton, so
    // they must not run concurrently with each other under
    // `cargo test` without `PROPTEST_FORK`/`--test-threads=1`; the
    // package's `x test` alias sets `PROPTEST_FORK=true` precisely so
    // each proptest case gets a fresh process. Plain `#[test]`s below
    // only assert on the delta they themselves cause, so interleaving
    // from other tests cannot falsify them.

    #[test]
    fn small_allocation_routes_to_host_allocator() {
        let ptr = alloc(8);
        assert!(!ptr.is_null());

        if let Some(inner) = ensure_initialized() {
            assert!(!inner.heap.contains(ptr as usize));
        }

        free(ptr);
    }

    #[test]
    fn large_allocation_round_trips_content() {
        let inner = match ensure_initialized() {
            Some(inner) => inner,
            None => return, // environment forbids the heap reservation; nothing to test.
        };

        let size = inner.config.min_bsize;
        let ptr = alloc(size);
        if ptr.is_null() {
            return;
        }
        assert!(inner.heap.contains(ptr as usize));

        unsafe {
            std::ptr::write_bytes(ptr, 0xAB, size);
            assert_eq!(*ptr, 0xAB);
            assert_eq!(*ptr.add(size - 1), 0xAB);
        }

        free(ptr);
    }

    #[test]
    fn realloc_array_overflow_is_rejected() {
        let ptr = realloc_array(std::ptr::null_mut(), usize::MAX, 2);
        assert!(ptr.is_null());
    }

    #[test]
    fn free_of_null_is_a_no_op() {
        free(std::ptr::null_mut());
    }

    #[test]
    fn realloc_of_null_behaves_as_alloc() {
        let ptr = realloc(std::ptr::null_mut(), 16);
        assert!(!ptr.is_null());
        free(ptr);
    }

    // Scenario 5 / §8 "Realloc preservation": growing a live in-heap
    // block must return a block whose first `old_size` bytes still
    // hold what was written before the call.
    #[test]
    fn realloc_grow_preserves_original_bytes() {
        let inner = match ensure_initialized() {
            Some(inner) => inner,
            None => return, // environment forbids the heap reservation; nothing to test.
        };

        let old_size = inner.config.min_bsize;
        let p = alloc(old_size);
        if p.is_null() {
            return;
        }
        assert!(inner.heap.contains(p as usize));

        unsafe {
            std::ptr::write_bytes(p, 0xAB, old_size);
        }

        let new_size = old_size * 3;
        let p2 = realloc(p, new_size);
        assert!(!p2.is_null());
        assert!(inner.heap.contains(p2 as usize));

        unsafe {
            let preserved = std::slice::from_raw_parts(p2, old_size);
            assert!(preserved.iter().all(|&b| b == 0xAB));
        }

        free(p2);
    }
}
