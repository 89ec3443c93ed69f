//! The file-backed mapper (C5) turns a `(addr, size)` block carved out
//! by the heap manager into a mapping of a uniquely-named temporary
//! file, so the kernel can swap the block's contents out to disk under
//! memory pressure instead of only to anonymous swap. `unmap` reverses
//! this and leaves a `PROT_NONE` placeholder behind so the address
//! range stays reserved.
use std::ffi::c_void;
use std::fs::File;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::region;

lazy_static::lazy_static! {
    static ref TEMP_DIR: Mutex<Option<PathBuf>> = Default::default();
}

/// Overrides the parent directory used for backing files. `None`
/// reverts to the platform's default temporary directory.
pub fn set_temp_dir(path: Option<PathBuf>) {
    *TEMP_DIR.lock().unwrap() = path;
}

fn errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL)
}

/// Splits a naming template of the form `"prefix.XXXXXX"` into its
/// fixed prefix, the count of trailing sentinel characters to replace
/// with random alphanumerics, and any fixed suffix after them.
///
/// The trailing run must be at least six `X` characters, matching the
/// `mkstemp`-style convention documented in §4.5.3.
fn split_template(template: &str) -> Result<(&str, usize, &str), &'static str> {
    let last_x = template.rfind('X').ok_or("template has no placeholder run")?;
    let run_start = template[..=last_x]
        .rfind(|c: char| c != 'X')
        .map(|i| i + 1)
        .unwrap_or(0);
    let run_len = last_x + 1 - run_start;

    if run_len < 6 {
        return Err("template's placeholder run must be at least six characters");
    }

    Ok((&template[..run_start], run_len, &template[last_x + 1..]))
}

fn create_named_temp_file(template: &str) -> Result<File, i32> {
    let (prefix, rand_len, suffix) = split_template(template).map_err(|_| libc::EINVAL)?;

    let dir = TEMP_DIR.lock().unwrap().clone();
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix).suffix(suffix).rand_bytes(rand_len);

    let named = match &dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;

    // Unlink immediately: the file is kept alive only by the mapping
    // (and, briefly, by this open descriptor) so it never outlives the
    // process, and never accumulates on disk even if the process is
    // killed before `free` runs.
    let (file, path) = named
        .keep()
        .map_err(|e| e.error.raw_os_error().unwrap_or(libc::EIO))?;
    let _ = std::fs::remove_file(&path);

    Ok(file)
}

/// Installs a read-write, shared file mapping of exactly `size` bytes
/// at `addr`, replacing whatever placeholder mapping was there.
/// `template` names the backing file per §4.5.3.
///
/// Rolls back (closes/unlinks the file and never installs a mapping)
/// on any failure.
pub fn map_backed(addr: NonNull<c_void>, size: usize, template: &str) -> Result<(), i32> {
    let file = create_named_temp_file(template)?;

    file.set_len(size as u64)
        .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;

    let mapped = unsafe {
        libc::mmap(
            addr.as_ptr(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            std::os::unix::io::AsRawFd::as_raw_fd(&file),
            0,
        )
    };

    // `file` can be dropped as soon as mmap returns: the mapping itself
    // keeps the underlying (already-unlinked) inode alive.
    drop(file);

    if mapped == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(())
    }
}

/// Removes the file mapping at `(addr, size)` and replaces it with a
/// `PROT_NONE` placeholder so the range remains reserved.
pub fn unmap(addr: NonNull<c_void>, size: usize) -> Result<(), i32> {
    let unmapped = unsafe { libc::munmap(addr.as_ptr(), size) };
    if unmapped != 0 {
        return Err(errno());
    }

    region::reserve_placeholder(addr, size)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn template_splitting() {
        assert_eq!(
            split_template(".mmap_alloc.XXXXXXXXXX").unwrap(),
            (".mmap_alloc.", 10, "")
        );
        assert_eq!(
            split_template("prefixXXXXXX.tmp").unwrap(),
            ("prefix", 6, ".tmp")
        );
        assert!(split_template("no-placeholder").is_err());
        assert!(split_template("tooshortXXXXX").is_err());
    }

    #[test]
    fn map_then_unmap_round_trips_content() {
        let size = region::page_size();
        let base = region::reserve_region(size).expect("reserve");

        map_backed(base, size, ".mmap_alloc_test.XXXXXXXXXX").expect("map should succeed");

        let slice = unsafe { std::slice::from_raw_parts_mut(base.as_ptr() as *mut u8, size) };
        slice[0] = 0xAB;
        slice[size - 1] = 0xCD;
        assert_eq!(slice[0], 0xAB);
        assert_eq!(slice[size - 1], 0xCD);

        unmap(base, size).expect("unmap should succeed");
        region::release_region(base, size).expect("release");
    }
}
