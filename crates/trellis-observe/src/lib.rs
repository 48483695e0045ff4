//! Observability for Trellis: subscriber setup and structured run event logs.

pub mod run_attrs;
pub mod tracing_setup;
