//! Shared Gantry model types: run tracking and coverage.
//!
//! This crate has no I/O; both the state store and the engine depend on it.

pub mod coverage;
pub mod state;
