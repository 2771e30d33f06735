//! Chronicle Core — event-sourcing persistence abstractions.
//!
//! This crate defines the committed-event envelope, the persistence and
//! snapshot contracts every backend satisfies, the upgrader chain, and the
//! [`AggregateStore`](aggregate_store::AggregateStore) that implements the
//! load → mutate → commit protocol with optimistic concurrency. It contains
//! no database code.

pub mod aggregate;
pub mod aggregate_store;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod metadata;
pub mod persistence;
pub mod retry;
pub mod rng;
pub mod serializer;
pub mod snapshot;
pub mod upgrade;

pub use tokio_util::sync::CancellationToken;
