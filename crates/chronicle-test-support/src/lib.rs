//! Shared test doubles for Chronicle.

mod clock;
mod persistence;
mod rng;
mod snapshot;

pub use clock::{FixedClock, ManualClock};
pub use persistence::{
    ConflictingEventPersistence, CountingEventPersistence, FailingEventPersistence,
    PausingEventPersistence,
};
pub use rng::{MockRng, SequenceRng};
pub use snapshot::FailingSnapshotStore;
