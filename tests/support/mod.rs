//! Helpers shared by integration tests.

// Same helper the unit tests use, compiled into each test crate.
#[path = "../../src/test_support/socket_guard.rs"]
pub mod socket_guard;
