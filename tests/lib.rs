//! Shared helpers for the nrflow integration tests.
