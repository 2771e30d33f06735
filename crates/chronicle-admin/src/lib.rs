//! Chronicle admin — maintenance commands for the `PostgreSQL` event store.
//!
//! The library half exposes the command implementations so integration
//! tests can drive them against a database.

pub mod cli;
pub mod commands;
pub mod error;
