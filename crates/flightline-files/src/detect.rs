//! Durable storage capability detection.

use std::fs;
use std::path::Path;

const PROBE_NAME: &str = ".flightline-probe";

/// Probe whether `dir` can hold durable buffers
///
/// Creates the directory if needed and round-trips a small probe file. Meant
/// to run once at startup; the result feeds [`TierPolicy`](crate::TierPolicy).
pub fn durable_storage_available(dir: &Path) -> bool {
    if let Err(e) = fs::create_dir_all(dir) {
        tracing::info!(
            "Durable buffering unavailable ({}): {}",
            dir.display(),
            e
        );
        return false;
    }

    let probe = dir.join(PROBE_NAME);
    let result = fs::write(&probe, b"probe").and_then(|()| fs::read(&probe));
    let _ = fs::remove_file(&probe);

    match result {
        Ok(bytes) if bytes == b"probe" => {
            tracing::debug!("Durable buffering available in {}", dir.display());
            true
        }
        Ok(_) => {
            tracing::info!("Durable buffering unavailable ({}): probe mismatch", dir.display());
            false
        }
        Err(e) => {
            tracing::info!(
                "Durable buffering unavailable ({}): {}",
                dir.display(),
                e
            );
            false
        }
    }
}
