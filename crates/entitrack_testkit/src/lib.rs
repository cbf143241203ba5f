//! # EntiTrack Testkit
//!
//! Test utilities for EntiTrack.
//!
//! This crate provides:
//! - A sample model covering object-backed, mixed and shadow entity types
//! - A recording listener and an in-memory store double
//! - Deterministic value generators
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use entitrack_testkit::prelude::*;
//!
//! let mut manager = sample_manager();
//! let id = materialize_category(&mut manager, 1, "Beverages");
//! assert!(manager.entry(id).is_ok());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
