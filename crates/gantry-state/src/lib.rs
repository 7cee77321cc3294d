//! Run history persistence for Gantry.
//!
//! Provides the [`StateBackend`] trait and a [`SqliteStateBackend`]
//! implementation tracking pipeline runs and their matrix instances.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod sqlite;

pub use backend::{RunFilter, StateBackend};
pub use error::StateError;
pub use sqlite::SqliteStateBackend;
