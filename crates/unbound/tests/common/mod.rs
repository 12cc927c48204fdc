//! Shared test utilities for unbound integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs against a temporary database file
//! - Builders and processor doubles for driving consumers

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
