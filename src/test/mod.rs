//! Crate-level integration tests.
