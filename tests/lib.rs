//! Shared fixtures and helpers for Flightline integration tests

pub mod fixtures;
