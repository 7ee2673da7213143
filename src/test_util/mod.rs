//! Utilities for testing code built on the broadcast stack. They are used by this
//!  crate's own tests (unit and integration), and exported for application testing.

pub mod log;
pub mod membership;
