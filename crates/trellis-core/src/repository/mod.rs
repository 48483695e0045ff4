//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (trellis-infra) implements. The core crate never depends on any specific
//! storage technology; `memory` provides an in-process implementation.

pub mod memory;
pub mod run;

pub use memory::InMemoryRunStore;
pub use run::RunStore;
