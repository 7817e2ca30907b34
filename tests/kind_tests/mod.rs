//! Integration tests for peernet against a real API server
//!
//! # Test Organization
//!
//! - `session_operations`: Stories about how the controller's metadata
//!   writes (finalizer, processed label) behave against the API server,
//!   including optimistic-concurrency conflicts
//!
//! Host networking is not touched here; kernel behavior is covered by the
//! unit tests with in-memory backends.

mod helpers;
mod session_operations;
