//! Event upgrader chain.
//!
//! Historical events are never rewritten in storage. Instead each aggregate
//! type registers upgraders keyed by the event type they consume; during
//! replay the chain is applied until a full pass changes nothing.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::Error;
use crate::event::{DomainEvent, EventType};

/// Default bound on upgrade passes per stored event.
pub const DEFAULT_MAX_ITERATIONS: usize = 16;

type Transform<E> = Box<dyn Fn(E) -> Vec<E> + Send + Sync>;

struct Upgrader<E> {
    input: EventType,
    outputs: Vec<EventType>,
    transform: Transform<E>,
}

/// Ordered, statically registered upgraders for one event type family.
pub struct UpgraderChain<E> {
    upgraders: Vec<Upgrader<E>>,
    max_iterations: usize,
}

impl<E> fmt::Debug for UpgraderChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgraderChain")
            .field(
                "upgraders",
                &self
                    .upgraders
                    .iter()
                    .map(|u| (u.input, u.outputs.clone()))
                    .collect::<Vec<_>>(),
            )
            .field("max_iterations", &self.max_iterations)
            .finish()
    }
}

impl<E> Default for UpgraderChain<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> UpgraderChain<E> {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self {
            upgraders: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Overrides the bound on passes per stored event.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Returns `true` if no upgraders are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upgraders.is_empty()
    }

    /// Registers an upgrader consuming `input` and producing zero or more
    /// events of the declared `outputs` types. An empty `outputs` list drops
    /// the event.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateUpgrader` if `input` already has an upgrader,
    /// or `Error::UpgraderCycle` if the declared outputs lead back to
    /// `input`.
    pub fn register<F>(
        mut self,
        input: EventType,
        outputs: &[EventType],
        transform: F,
    ) -> Result<Self, Error>
    where
        F: Fn(E) -> Vec<E> + Send + Sync + 'static,
    {
        if self.upgraders.iter().any(|u| u.input == input) {
            return Err(Error::DuplicateUpgrader(input));
        }
        if let Some(path) = self.find_path(outputs, input) {
            let rendered: Vec<String> = std::iter::once(input)
                .chain(path)
                .map(|ty| ty.to_string())
                .collect();
            return Err(Error::UpgraderCycle(rendered.join(" -> ")));
        }
        self.upgraders.push(Upgrader {
            input,
            outputs: outputs.to_vec(),
            transform: Box::new(transform),
        });
        Ok(self)
    }

    /// Depth-first search over declared edges from `starts` to `target`.
    fn find_path(&self, starts: &[EventType], target: EventType) -> Option<Vec<EventType>> {
        let edges: HashMap<EventType, &[EventType]> = self
            .upgraders
            .iter()
            .map(|u| (u.input, u.outputs.as_slice()))
            .collect();
        let mut visited = HashSet::new();
        let mut stack: Vec<(EventType, Vec<EventType>)> =
            starts.iter().map(|ty| (*ty, vec![*ty])).collect();
        while let Some((node, path)) = stack.pop() {
            if node == target {
                return Some(path);
            }
            if !visited.insert(node) {
                continue;
            }
            for next in edges.get(&node).copied().unwrap_or_default() {
                let mut extended = path.clone();
                extended.push(*next);
                stack.push((*next, extended));
            }
        }
        None
    }
}

impl<E: DomainEvent> UpgraderChain<E> {
    /// Upgrades one stored event to the current schema.
    ///
    /// # Errors
    ///
    /// Returns `Error::UpgradeLimitExceeded` if no fixpoint is reached within
    /// the iteration bound.
    pub fn upgrade(&self, event: E) -> Result<Vec<E>, Error> {
        if self.upgraders.is_empty() {
            return Ok(vec![event]);
        }
        let original = event.event_type();
        let mut current = vec![event];
        for _ in 0..self.max_iterations {
            let mut changed = false;
            for upgrader in &self.upgraders {
                if !current.iter().any(|e| e.event_type() == upgrader.input) {
                    continue;
                }
                changed = true;
                current = current
                    .into_iter()
                    .flat_map(|e| {
                        if e.event_type() == upgrader.input {
                            (upgrader.transform)(e)
                        } else {
                            vec![e]
                        }
                    })
                    .collect();
            }
            if !changed {
                return Ok(current);
            }
        }
        Err(Error::UpgradeLimitExceeded {
            event_type: original,
            iterations: self.max_iterations,
        })
    }
}
