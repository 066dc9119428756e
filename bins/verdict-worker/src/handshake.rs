// File-signal synchronization between the host and sandboxed processes.
// Sandboxes cannot be signaled directly once started, so every readiness
// and completion checkpoint is a marker file inside a shared mount.
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Wait until the marker file exists, polling every ~10 ms, bounded by an
/// explicit deadline. Returns false on timeout. This is the only
/// cross-boundary synchronization primitive.
pub async fn wait_for(marker: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        if marker.exists() {
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}

/// Raise a marker for the sandboxed side to observe.
pub fn touch(marker: &Path) -> io::Result<()> {
    fs::File::create(marker)?;
    Ok(())
}
