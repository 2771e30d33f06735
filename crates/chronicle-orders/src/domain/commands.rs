//! Commands for the orders context.
//!
//! Each command carries a caller-chosen `command_id`, used as the source id
//! of the update so that a redelivered command is committed at most once.

use chronicle_core::identity::{AggregateId, SourceId};

/// Command to add units of a SKU to an order.
#[derive(Debug, Clone)]
pub struct AddItem {
    /// Idempotency token of this command.
    pub command_id: SourceId,
    /// The order identifier.
    pub order_id: AggregateId,
    /// Stock keeping unit.
    pub sku: String,
    /// Units to add.
    pub quantity: u32,
}

/// Command to remove a SKU from an order.
#[derive(Debug, Clone)]
pub struct RemoveItem {
    /// Idempotency token of this command.
    pub command_id: SourceId,
    /// The order identifier.
    pub order_id: AggregateId,
    /// Stock keeping unit.
    pub sku: String,
}

/// Command to submit an order.
#[derive(Debug, Clone)]
pub struct SubmitOrder {
    /// Idempotency token of this command.
    pub command_id: SourceId,
    /// The order identifier.
    pub order_id: AggregateId,
}
