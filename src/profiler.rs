//! The profiler collaborator (A3) is a minimal background thread that,
//! when `ENV_PROFILE_FILE_PATH` names a file, periodically appends a
//! line of heap statistics to it. It is started once by the dispatcher
//! during first-use initialization and runs for the remainder of the
//! process's life; there is no shutdown path, matching the heap's own
//! process-lifetime lifecycle.
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::heap::HeapManager;

/// Starts the sampling thread. `path` is the file samples are appended
/// to; `frequency` is the sleep interval between samples.
pub fn start(heap: Arc<HeapManager>, path: PathBuf, frequency: Duration) {
    std::thread::spawn(move || run(&heap, &path, frequency));
}

fn run(heap: &HeapManager, path: &PathBuf, frequency: Duration) {
    loop {
        std::thread::sleep(frequency);

        if let Err(e) = sample_once(heap, path) {
            log::warn!("profiler: failed to write sample to {:?}: {}", path, e);
        }
    }
}

fn sample_once(heap: &HeapManager, path: &PathBuf) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    let (free_bytes, free_blocks, in_use_bytes, in_use_blocks) = heap.usage_snapshot();

    writeln!(
        file,
        "capacity={} free_bytes={} free_blocks={} in_use_bytes={} in_use_blocks={}",
        heap.capacity(),
        free_bytes,
        free_blocks,
        in_use_bytes,
        in_use_blocks
    )
}
