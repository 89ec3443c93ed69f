//! Tiny smoke test: installs `MmapAlloc` as the process's global
//! allocator and populates a container with it, exercising the
//! file-backed path end to end.
use mmap_alloc::MmapAlloc;

#[global_allocator]
static ALLOCATOR: MmapAlloc = MmapAlloc;

fn main() {
    env_logger::init();

    // `ENV_MMAP_ALLOCATOR_MIN_BSIZE` defaults to 2 GiB; a quick smoke
    // run sets it lower so this single large `Vec` actually crosses
    // the threshold and gets mapped into the file-backed heap.
    let threshold: usize = std::env::var("ENV_MMAP_ALLOCATOR_MIN_BSIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4096);

    let len = threshold * 2 / std::mem::size_of::<u64>() + 1;
    let mut values: Vec<u64> = Vec::with_capacity(len);
    for i in 0..len {
        values.push(i as u64);
    }

    let sum: u64 = values.iter().sum();
    println!(
        "smoke: populated a {}-element Vec ({} bytes), checksum {}",
        values.len(),
        values.len() * std::mem::size_of::<u64>(),
        sum
    );

    drop(values);
    println!("smoke: freed the Vec; exiting cleanly");
}
