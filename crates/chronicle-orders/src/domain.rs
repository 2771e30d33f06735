//! Order domain model: events, aggregate, commands and upgraders.

pub mod aggregates;
pub mod commands;
pub mod events;
pub mod upgraders;
