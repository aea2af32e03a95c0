//! Utilities for testing code based on protocols: an in-memory socket that records what is
//!  written to it, and a load estimator that can be switched by the test.
//!
//! They are part of the crate's regular (non-#[cfg(test)]) code so that applications can use
//!  them for their own tests.

pub mod load;
pub mod socket;
