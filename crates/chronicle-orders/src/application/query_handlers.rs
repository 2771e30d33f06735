//! Query handlers for the orders context.
//!
//! Queries load the aggregate through the store and return read-only view
//! DTOs.

use chronicle_core::CancellationToken;
use chronicle_core::error::Error;
use chronicle_core::identity::AggregateId;
use serde::Serialize;

use crate::application::command_handlers::OrderStore;
use crate::domain::aggregates::OrderLine;

/// Read-only view of an order aggregate.
#[derive(Debug, Serialize)]
pub struct OrderView {
    /// The order identifier.
    pub order_id: AggregateId,
    /// Order lines in insertion order.
    pub lines: Vec<OrderLine>,
    /// Whether the order has been submitted.
    pub submitted: bool,
    /// Sequence number of the last committed event.
    pub version: u64,
}

/// Retrieves an order by its aggregate ID.
///
/// Returns `None` if no events exist for the ID.
///
/// # Errors
///
/// Returns any error from loading the aggregate.
pub async fn get_order_by_id(
    order_id: &AggregateId,
    store: &OrderStore,
    cancel: &CancellationToken,
) -> Result<Option<OrderView>, Error> {
    let order = store.load(order_id, cancel).await?;
    if order.is_new() {
        return Ok(None);
    }
    let version = order.version();
    let state = order.into_state();
    Ok(Some(OrderView {
        order_id: order_id.clone(),
        submitted: state.is_submitted(),
        lines: state.lines().to_vec(),
        version,
    }))
}
