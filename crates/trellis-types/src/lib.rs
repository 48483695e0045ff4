//! Shared domain types for Trellis.
//!
//! Step and run statuses, variable references, run events, the persisted run
//! record, and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod variable;
pub mod workflow;
