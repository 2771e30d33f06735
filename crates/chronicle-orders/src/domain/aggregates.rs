//! Aggregate root for the orders context.

use chronicle_core::aggregate::{Aggregate, AggregateRoot, EventHandlers};
use chronicle_core::error::Error;
use serde::{Deserialize, Serialize};

use super::events::{ITEM_ADDED_V2, ITEM_REMOVED, ORDER_SUBMITTED, OrderEvent};

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    /// Stock keeping unit.
    pub sku: String,
    /// Units ordered.
    pub quantity: u32,
}

/// State of an order: its lines in the order they were first added, and
/// whether it has been submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    lines: Vec<OrderLine>,
    submitted: bool,
}

impl Order {
    /// Order lines in insertion order.
    #[must_use]
    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    /// SKUs in insertion order.
    #[must_use]
    pub fn skus(&self) -> Vec<&str> {
        self.lines.iter().map(|l| l.sku.as_str()).collect()
    }

    /// Returns `true` once the order has been submitted.
    #[must_use]
    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    fn line_mut(&mut self, sku: &str) -> Option<&mut OrderLine> {
        self.lines.iter_mut().find(|l| l.sku == sku)
    }

    fn on_item_added(&mut self, event: &OrderEvent) {
        if let OrderEvent::ItemAdded { sku, quantity } = event {
            match self.line_mut(sku) {
                Some(line) => line.quantity = line.quantity.saturating_add(*quantity),
                None => self.lines.push(OrderLine {
                    sku: sku.clone(),
                    quantity: *quantity,
                }),
            }
        }
    }

    fn on_item_removed(&mut self, event: &OrderEvent) {
        if let OrderEvent::ItemRemoved { sku } = event {
            self.lines.retain(|l| &l.sku != sku);
        }
    }

    fn on_submitted(&mut self, _event: &OrderEvent) {
        self.submitted = true;
    }
}

impl Aggregate for Order {
    const NAME: &'static str = "order";
    type Event = OrderEvent;

    // Legacy shapes are upgraded before replay and have no handlers.
    fn register_handlers(handlers: &mut EventHandlers<Self>) {
        handlers
            .on(ITEM_ADDED_V2, Self::on_item_added)
            .on(ITEM_REMOVED, Self::on_item_removed)
            .on(ORDER_SUBMITTED, Self::on_submitted);
    }
}

fn ensure_open(root: &AggregateRoot<Order>) -> Result<(), Error> {
    if root.state().submitted {
        return Err(Error::Validation(format!(
            "order {} has already been submitted",
            root.id()
        )));
    }
    Ok(())
}

/// Adds `quantity` units of `sku`, producing an `ItemAdded` event.
///
/// # Errors
///
/// Returns `Error::Validation` if the order is submitted or `quantity` is
/// zero.
pub fn add_item(root: &mut AggregateRoot<Order>, sku: &str, quantity: u32) -> Result<(), Error> {
    ensure_open(root)?;
    if quantity == 0 {
        return Err(Error::Validation("quantity must be positive".into()));
    }
    root.emit(OrderEvent::ItemAdded {
        sku: sku.to_owned(),
        quantity,
    })
}

/// Removes the line for `sku`, producing an `ItemRemoved` event.
///
/// # Errors
///
/// Returns `Error::Validation` if the order is submitted or has no such line.
pub fn remove_item(root: &mut AggregateRoot<Order>, sku: &str) -> Result<(), Error> {
    ensure_open(root)?;
    if !root.state().lines.iter().any(|l| l.sku == sku) {
        return Err(Error::Validation(format!(
            "sku {sku} not found in order {}",
            root.id()
        )));
    }
    root.emit(OrderEvent::ItemRemoved {
        sku: sku.to_owned(),
    })
}

/// Submits the order, producing an `OrderSubmitted` event.
///
/// # Errors
///
/// Returns `Error::Validation` if the order is already submitted or empty.
pub fn submit(root: &mut AggregateRoot<Order>) -> Result<(), Error> {
    ensure_open(root)?;
    if root.state().lines.is_empty() {
        return Err(Error::Validation(format!(
            "order {} has no lines",
            root.id()
        )));
    }
    root.emit(OrderEvent::OrderSubmitted)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chronicle_core::identity::AggregateId;

    use super::*;

    fn new_order() -> AggregateRoot<Order> {
        AggregateRoot::new(
            AggregateId::new("order-1").unwrap(),
            Order::default(),
            0,
            Arc::new(EventHandlers::build()),
        )
    }

    #[test]
    fn test_add_item_keeps_insertion_order_and_merges_quantities() {
        let mut order = new_order();

        add_item(&mut order, "X", 1).unwrap();
        add_item(&mut order, "Y", 2).unwrap();
        add_item(&mut order, "X", 3).unwrap();

        assert_eq!(order.state().skus(), vec!["X", "Y"]);
        assert_eq!(order.state().lines()[0].quantity, 4);
        assert_eq!(order.uncommitted_events().len(), 3);
    }

    #[test]
    fn test_add_item_rejects_zero_quantity() {
        let mut order = new_order();

        let result = add_item(&mut order, "X", 0);

        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(order.uncommitted_events().is_empty());
    }

    #[test]
    fn test_remove_item_requires_existing_line() {
        let mut order = new_order();
        add_item(&mut order, "X", 1).unwrap();

        let missing = remove_item(&mut order, "Y");
        remove_item(&mut order, "X").unwrap();

        assert!(matches!(missing, Err(Error::Validation(_))));
        assert!(order.state().lines().is_empty());
    }

    #[test]
    fn test_submitted_order_rejects_changes() {
        let mut order = new_order();
        add_item(&mut order, "X", 1).unwrap();
        submit(&mut order).unwrap();

        assert!(order.state().is_submitted());
        assert!(matches!(add_item(&mut order, "Y", 1), Err(Error::Validation(_))));
        assert!(matches!(submit(&mut order), Err(Error::Validation(_))));
    }

    #[test]
    fn test_empty_order_cannot_be_submitted() {
        let mut order = new_order();

        assert!(matches!(submit(&mut order), Err(Error::Validation(_))));
    }

    #[test]
    fn test_legacy_events_have_no_handler() {
        let mut order = new_order();

        let result = order.emit(OrderEvent::ItemAddedV1 { item: "X".into() });

        assert!(matches!(result, Err(Error::MissingEventHandler { .. })));
    }
}
