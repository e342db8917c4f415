//! # burrow-common
//!
//! Shared utilities and types for the Burrow container engine.
//!
//! This crate provides common functionality used across all Burrow crates:
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{BurrowError, BurrowResult};
pub use paths::BurrowPaths;
