//! Workflow graph model, scheduler, and run store traits for Trellis.
//!
//! This crate defines the engine and the "ports" (repository traits) that the
//! infrastructure layer implements. It depends only on `trellis-types` --
//! never on `trellis-infra` or any database/IO crate.

pub mod capability;
pub mod event;
pub mod repository;
pub mod workflow;
