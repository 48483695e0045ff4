//! Filesystem adapters for Trellis.
//!
//! Data directory resolution and a run store that keeps one JSON file per
//! run.

pub mod run_store;

use std::path::PathBuf;

pub use run_store::FileRunStore;

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `TRELLIS_DATA_DIR` environment variable
/// 2. `~/.trellis`
/// 3. `.trellis` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TRELLIS_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".trellis");
    }

    PathBuf::from(".trellis")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var("TRELLIS_DATA_DIR", "/tmp/test-trellis");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-trellis"));
        unsafe {
            std::env::remove_var("TRELLIS_DATA_DIR");
        }
    }
}
