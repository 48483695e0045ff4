//! Infrastructure layer for Trellis.
//!
//! Contains implementations of the `RunStore` trait defined in `trellis-core`
//! (SQLite and one-file-per-run JSON), backend selection, data directory
//! resolution, and configuration loading.

pub mod config;
pub mod filesystem;
pub mod sqlite;
pub mod store;
