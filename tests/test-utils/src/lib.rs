//! Test utilities shared by the allocator test suites
//!
//! Provides:
//! - Test logging initialization
//! - Deterministic random traffic generators
//! - Byte-pattern verification helpers
//! - Polling helpers for cross-thread conditions

pub mod helpers;

pub use helpers::*;
