//! Shared types and pure logic for the stagehand job engine.
//!
//! This crate has zero internal dependencies so it can be used by the
//! engine, the sentinel loops, and any future CLI tooling alike.

pub mod error;
pub mod estimation;
pub mod heartbeat;
pub mod scheduling;
pub mod types;

pub use error::CoreError;
