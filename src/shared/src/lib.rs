//! Shared types and utilities for the FIELDOPS Platform
//!
//! Common vocabulary used by the resilience engine and the external
//! collaborators that consume its results (persistence, notification,
//! reporting). Keeping these in one crate ensures the event records the
//! engine emits deserialize identically on both sides.

pub mod types;

// Export all types from types module
pub use types::*;
