//! Domain events for the orders context.

use chronicle_core::event::{DomainEvent, EventType};
use serde::{Deserialize, Serialize};

/// Legacy shape of `ItemAdded`: a bare item name, quantity implied to be one.
pub const ITEM_ADDED_V1: EventType = EventType::new("ItemAdded", 1);
/// Current shape of `ItemAdded`.
pub const ITEM_ADDED_V2: EventType = EventType::new("ItemAdded", 2);
/// Legacy event that added several items at once.
pub const BULK_ITEMS_ADDED_V1: EventType = EventType::new("BulkItemsAdded", 1);
/// An item line was removed.
pub const ITEM_REMOVED: EventType = EventType::new("ItemRemoved", 1);
/// The order was submitted and is now closed for changes.
pub const ORDER_SUBMITTED: EventType = EventType::new("OrderSubmitted", 1);

/// Every event an order has ever produced, legacy shapes included.
///
/// Legacy variants are only ever read from storage; the upgrader chain turns
/// them into current variants before they reach the aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    /// `ItemAdded@v1`.
    ItemAddedV1 {
        /// Item name, used as the SKU.
        item: String,
    },
    /// `BulkItemsAdded@v1`.
    BulkItemsAdded {
        /// Item names, one unit each.
        items: Vec<String>,
    },
    /// `ItemAdded@v2`.
    ItemAdded {
        /// Stock keeping unit.
        sku: String,
        /// Units added.
        quantity: u32,
    },
    /// `ItemRemoved@v1`.
    ItemRemoved {
        /// Stock keeping unit of the removed line.
        sku: String,
    },
    /// `OrderSubmitted@v1`.
    OrderSubmitted,
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> EventType {
        match self {
            Self::ItemAddedV1 { .. } => ITEM_ADDED_V1,
            Self::BulkItemsAdded { .. } => BULK_ITEMS_ADDED_V1,
            Self::ItemAdded { .. } => ITEM_ADDED_V2,
            Self::ItemRemoved { .. } => ITEM_REMOVED,
            Self::OrderSubmitted => ORDER_SUBMITTED,
        }
    }
}
