//! A minimal growable array whose backing storage comes directly from
//! `libc::malloc`/`realloc`/`free`, never from Rust's global allocator.
//!
//! `Arena` (see `block.rs`) uses this instead of `Vec` because this
//! crate's own [`crate::MmapAlloc`] may be installed as the process's
//! `#[global_allocator]`. If the arena's bookkeeping storage grew
//! through `Vec` (i.e. through `std::alloc::Global`), a large enough
//! arena reallocation would re-enter `dispatch::alloc`, which takes the
//! same non-reentrant heap lock the caller may already be holding while
//! growing the arena -- a deadlock reachable simply by lowering
//! `ENV_MMAP_ALLOCATOR_MIN_BSIZE`. Routing this storage through
//! `libc::malloc` directly keeps "bookkeeping nodes are allocated via
//! the host allocator only" true structurally, not just by default.
use std::mem;
use std::os::raw::c_void;
use std::ptr::NonNull;

pub struct HostVec<T> {
    ptr: *mut T,
    len: usize,
    cap: usize,
}

// SAFETY: `HostVec<T>` owns its buffer exclusively; it is Send/Sync
// whenever `T` is, exactly like `Vec<T>`.
unsafe impl<T: Send> Send for HostVec<T> {}
unsafe impl<T: Sync> Sync for HostVec<T> {}

impl<T: Copy> HostVec<T> {
    pub fn new() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            len: 0,
            cap: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn push(&mut self, value: T) {
        if self.len == self.cap {
            self.grow();
        }

        unsafe { self.ptr.add(self.len).write(value) };
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }

        self.len -= 1;
        Some(unsafe { self.ptr.add(self.len).read() })
    }

    pub fn as_slice(&self) -> &[T] {
        if self.ptr.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
        }
    }

    fn grow(&mut self) {
        let new_cap = if self.cap == 0 { 16 } else { self.cap * 2 };
        let new_size = new_cap
            .checked_mul(mem::size_of::<T>())
            .expect("host arena capacity overflow");

        let raw = if self.ptr.is_null() {
            unsafe { libc::malloc(new_size) }
        } else {
            unsafe { libc::realloc(self.ptr as *mut c_void, new_size) }
        };

        let raw = NonNull::new(raw as *mut T)
            .expect("host allocator exhausted while growing bookkeeping storage");

        self.ptr = raw.as_ptr();
        self.cap = new_cap;
    }
}

impl<T: Copy> Default for HostVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for HostVec<T> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { libc::free(self.ptr as *mut c_void) };
        }
    }
}

impl<T: Copy> std::ops::Index<usize> for HostVec<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        assert!(index < self.len, "index out of bounds");
        unsafe { &*self.ptr.add(index) }
    }
}

impl<T: Copy> std::ops::IndexMut<usize> for HostVec<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        assert!(index < self.len, "index out of bounds");
        unsafe { &mut *self.ptr.add(index) }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn push_pop_round_trip() {
        let mut v: HostVec<usize> = HostVec::new();
        for i in 0..64 {
            v.push(i);
        }
        assert_eq!(v.len(), 64);

        for i in (0..64).rev() {
            assert_eq!(v.pop(), Some(i));
        }
        assert_eq!(v.pop(), None);
    }

    #[test]
    fn index_assignment_overwrites_in_place() {
        let mut v: HostVec<Option<u32>> = HostVec::new();
        v.push(Some(1));
        v.push(Some(2));

        v[0] = Some(99);
        assert_eq!(v[0], Some(99));
        assert_eq!(v[1], Some(2));
    }

    #[test]
    fn grows_past_initial_capacity_without_losing_data() {
        let mut v: HostVec<u64> = HostVec::new();
        for i in 0..1000u64 {
            v.push(i);
        }

        assert_eq!(v.len(), 1000);
        assert_eq!(v.as_slice(), (0..1000u64).collect::<Vec<_>>().as_slice());
    }
}
