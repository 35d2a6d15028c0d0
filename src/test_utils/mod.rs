//! Test utilities and helpers for lumen-dht
//!
//! This module provides common testing utilities, fixtures, and helper functions
//! to improve test quality and reduce code duplication across the codebase.

pub mod fixtures;
pub mod assertions;
pub mod async_helpers;
pub mod deterministic_rng;

pub use fixtures::*;
pub use assertions::*;
pub use async_helpers::*;
pub use deterministic_rng::*;
