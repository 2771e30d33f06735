//! Command handlers for the orders context.
//!
//! Each handler hands a mutation to the aggregate store, which loads the
//! order, runs the mutation, commits the emitted events and retries on
//! concurrency conflicts.

use std::sync::Arc;

use chronicle_core::CancellationToken;
use chronicle_core::aggregate_store::AggregateStore;
use chronicle_core::error::Error;
use chronicle_core::identity::AggregateId;
use chronicle_core::persistence::{CommittedEvent, EventPersistence};

use crate::domain::aggregates::{self, Order};
use crate::domain::commands::{AddItem, RemoveItem, SubmitOrder};
use crate::domain::upgraders::order_upgraders;

/// Aggregate store specialised to orders.
pub type OrderStore = AggregateStore<Order>;

/// Result of a successfully handled command.
#[derive(Debug)]
pub struct OrderCommandResult {
    /// The aggregate ID affected by the command.
    pub aggregate_id: AggregateId,
    /// The events committed for the command. Empty if the command changed
    /// nothing.
    pub committed_events: Vec<CommittedEvent>,
}

/// Builds an order store over `persistence` with the order upgraders
/// installed. Further options are layered on with the store's builder
/// methods.
///
/// # Errors
///
/// Returns an error if the upgrader chain is inconsistent.
pub fn order_store(persistence: Arc<dyn EventPersistence>) -> Result<OrderStore, Error> {
    Ok(AggregateStore::new(persistence).with_upgraders(order_upgraders()?))
}

/// Handles the `AddItem` command.
///
/// # Errors
///
/// Returns `Error::Validation` if the order rejects the change, and any
/// store error.
pub async fn handle_add_item(
    command: &AddItem,
    store: &OrderStore,
    cancel: &CancellationToken,
) -> Result<OrderCommandResult, Error> {
    let committed_events = store
        .update(
            &command.order_id,
            Some(&command.command_id),
            |order| aggregates::add_item(order, &command.sku, command.quantity),
            cancel,
        )
        .await?;
    tracing::info!(
        order_id = %command.order_id,
        sku = %command.sku,
        events = committed_events.len(),
        "item added"
    );
    Ok(OrderCommandResult {
        aggregate_id: command.order_id.clone(),
        committed_events,
    })
}

/// Handles the `RemoveItem` command.
///
/// # Errors
///
/// Returns `Error::Validation` if the order has no such line or is
/// submitted, and any store error.
pub async fn handle_remove_item(
    command: &RemoveItem,
    store: &OrderStore,
    cancel: &CancellationToken,
) -> Result<OrderCommandResult, Error> {
    let committed_events = store
        .update(
            &command.order_id,
            Some(&command.command_id),
            |order| aggregates::remove_item(order, &command.sku),
            cancel,
        )
        .await?;
    Ok(OrderCommandResult {
        aggregate_id: command.order_id.clone(),
        committed_events,
    })
}

/// Handles the `SubmitOrder` command.
///
/// # Errors
///
/// Returns `Error::Validation` if the order is empty or already submitted,
/// and any store error.
pub async fn handle_submit_order(
    command: &SubmitOrder,
    store: &OrderStore,
    cancel: &CancellationToken,
) -> Result<OrderCommandResult, Error> {
    let committed_events = store
        .update(
            &command.order_id,
            Some(&command.command_id),
            aggregates::submit,
            cancel,
        )
        .await?;
    tracing::info!(order_id = %command.order_id, "order submitted");
    Ok(OrderCommandResult {
        aggregate_id: command.order_id.clone(),
        committed_events,
    })
}
