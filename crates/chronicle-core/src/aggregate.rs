//! Aggregate abstraction and event handler tables.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::event::{DomainEvent, EventType};
use crate::identity::AggregateId;

/// State of a consistency boundary, derived solely from its own events.
///
/// `Default` is the zero state a new aggregate starts from. The serde bounds
/// let the state be captured in snapshots.
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Aggregate type name; namespaces aggregate ids in storage.
    const NAME: &'static str;

    /// The event family this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Registers one handler per event type the aggregate accepts.
    fn register_handlers(handlers: &mut EventHandlers<Self>);
}

/// Applies one event to aggregate state.
pub type EventHandler<A> = fn(&mut A, &<A as Aggregate>::Event);

/// Table mapping event types to handlers, built once per aggregate type.
pub struct EventHandlers<A: Aggregate> {
    table: HashMap<EventType, EventHandler<A>>,
}

impl<A: Aggregate> fmt::Debug for EventHandlers<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.table.keys().collect();
        types.sort();
        f.debug_struct("EventHandlers")
            .field("aggregate", &A::NAME)
            .field("event_types", &types)
            .finish()
    }
}

impl<A: Aggregate> EventHandlers<A> {
    /// Builds the table by asking the aggregate to register its handlers.
    #[must_use]
    pub fn build() -> Self {
        let mut handlers = Self {
            table: HashMap::new(),
        };
        A::register_handlers(&mut handlers);
        handlers
    }

    /// Registers the handler for `event_type`, replacing any earlier one.
    pub fn on(&mut self, event_type: EventType, handler: EventHandler<A>) -> &mut Self {
        self.table.insert(event_type, handler);
        self
    }

    /// Returns `true` if `event_type` has a handler.
    #[must_use]
    pub fn handles(&self, event_type: EventType) -> bool {
        self.table.contains_key(&event_type)
    }

    /// Applies `event` to `state`.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingEventHandler` if the event type is not
    /// registered. Skipping it would silently corrupt state.
    pub fn apply(&self, state: &mut A, event: &A::Event) -> Result<(), Error> {
        let event_type = event.event_type();
        let handler = self
            .table
            .get(&event_type)
            .ok_or(Error::MissingEventHandler {
                aggregate_name: A::NAME,
                event_type,
            })?;
        handler(state, event);
        Ok(())
    }
}

/// One aggregate instance during a unit of work.
///
/// Constructed fresh on every load and discarded afterwards.
pub struct AggregateRoot<A: Aggregate> {
    id: AggregateId,
    state: A,
    version: u64,
    uncommitted: Vec<A::Event>,
    handlers: Arc<EventHandlers<A>>,
}

impl<A: Aggregate + fmt::Debug> fmt::Debug for AggregateRoot<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("name", &A::NAME)
            .field("id", &self.id)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("uncommitted", &self.uncommitted)
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Creates an aggregate from a starting state and version.
    #[must_use]
    pub fn new(
        id: AggregateId,
        state: A,
        version: u64,
        handlers: Arc<EventHandlers<A>>,
    ) -> Self {
        Self {
            id,
            state,
            version,
            uncommitted: Vec::new(),
            handlers,
        }
    }

    /// Returns the aggregate identifier.
    #[must_use]
    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    /// Returns the current state, including applied uncommitted events.
    #[must_use]
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Sequence number of the last committed event (0 if none).
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns `true` if no events have been committed for this aggregate.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.version == 0
    }

    /// Events emitted during the current unit of work.
    #[must_use]
    pub fn uncommitted_events(&self) -> &[A::Event] {
        &self.uncommitted
    }

    /// Applies `event` to the state and records it for commit.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingEventHandler` if the aggregate cannot apply the
    /// event type.
    pub fn emit(&mut self, event: A::Event) -> Result<(), Error> {
        self.handlers.apply(&mut self.state, &event)?;
        self.uncommitted.push(event);
        Ok(())
    }

    /// Applies an already-committed (and upgraded) event during replay.
    pub(crate) fn apply_committed(&mut self, event: &A::Event) -> Result<(), Error> {
        self.handlers.apply(&mut self.state, event)
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub(crate) fn take_uncommitted(&mut self) -> Vec<A::Event> {
        std::mem::take(&mut self.uncommitted)
    }

    /// Consumes the root and returns its state.
    #[must_use]
    pub fn into_state(self) -> A {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum CounterEvent {
        Incremented,
        Decremented,
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> EventType {
            match self {
                Self::Incremented => EventType::new("Incremented", 1),
                Self::Decremented => EventType::new("Decremented", 1),
            }
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Counter {
        value: i64,
    }

    impl Aggregate for Counter {
        const NAME: &'static str = "counter";
        type Event = CounterEvent;

        // Decremented is deliberately left unregistered.
        fn register_handlers(handlers: &mut EventHandlers<Self>) {
            handlers.on(EventType::new("Incremented", 1), |c, _| c.value += 1);
        }
    }

    fn root() -> AggregateRoot<Counter> {
        AggregateRoot::new(
            AggregateId::new("counter-1").unwrap(),
            Counter::default(),
            0,
            Arc::new(EventHandlers::build()),
        )
    }

    #[test]
    fn test_emit_applies_and_records() {
        let mut root = root();

        root.emit(CounterEvent::Incremented).unwrap();
        root.emit(CounterEvent::Incremented).unwrap();

        assert_eq!(root.state().value, 2);
        assert_eq!(root.uncommitted_events().len(), 2);
        assert_eq!(root.version(), 0);
    }

    #[test]
    fn test_emit_fails_fast_on_unregistered_event() {
        let mut root = root();

        let err = root.emit(CounterEvent::Decremented).unwrap_err();

        match err {
            Error::MissingEventHandler {
                aggregate_name,
                event_type,
            } => {
                assert_eq!(aggregate_name, "counter");
                assert_eq!(event_type, EventType::new("Decremented", 1));
            }
            other => panic!("expected MissingEventHandler, got {other:?}"),
        }
        assert!(root.uncommitted_events().is_empty());
    }

    #[test]
    fn test_handler_table_reports_registered_types() {
        let handlers = EventHandlers::<Counter>::build();

        assert!(handlers.handles(EventType::new("Incremented", 1)));
        assert!(!handlers.handles(EventType::new("Decremented", 1)));
    }
}
