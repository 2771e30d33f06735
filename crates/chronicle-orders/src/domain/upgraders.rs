//! Upgraders from legacy order event shapes to the current ones.

use chronicle_core::error::Error;
use chronicle_core::upgrade::UpgraderChain;

use super::events::{BULK_ITEMS_ADDED_V1, ITEM_ADDED_V1, ITEM_ADDED_V2, OrderEvent};

/// `ItemAdded@v1` carried no quantity; every legacy line was a single unit.
fn item_added_v1_to_v2(event: OrderEvent) -> Vec<OrderEvent> {
    match event {
        OrderEvent::ItemAddedV1 { item } => vec![OrderEvent::ItemAdded {
            sku: item,
            quantity: 1,
        }],
        other => vec![other],
    }
}

/// Splits a bulk add into one legacy `ItemAdded` per item, which the next
/// pass upgrades further.
fn split_bulk_items(event: OrderEvent) -> Vec<OrderEvent> {
    match event {
        OrderEvent::BulkItemsAdded { items } => items
            .into_iter()
            .map(|item| OrderEvent::ItemAddedV1 { item })
            .collect(),
        other => vec![other],
    }
}

/// Builds the upgrader chain for order events.
///
/// # Errors
///
/// Returns an error only if the registrations below are inconsistent.
pub fn order_upgraders() -> Result<UpgraderChain<OrderEvent>, Error> {
    UpgraderChain::new()
        .register(ITEM_ADDED_V1, &[ITEM_ADDED_V2], item_added_v1_to_v2)?
        .register(BULK_ITEMS_ADDED_V1, &[ITEM_ADDED_V1], split_bulk_items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_item_becomes_single_unit_v2() {
        let chain = order_upgraders().unwrap();

        let upgraded = chain
            .upgrade(OrderEvent::ItemAddedV1 { item: "X".into() })
            .unwrap();

        assert_eq!(
            upgraded,
            vec![OrderEvent::ItemAdded {
                sku: "X".into(),
                quantity: 1
            }]
        );
    }

    #[test]
    fn test_bulk_add_splits_then_upgrades() {
        let chain = order_upgraders().unwrap();

        let upgraded = chain
            .upgrade(OrderEvent::BulkItemsAdded {
                items: vec!["X".into(), "Y".into()],
            })
            .unwrap();

        assert_eq!(
            upgraded,
            vec![
                OrderEvent::ItemAdded {
                    sku: "X".into(),
                    quantity: 1
                },
                OrderEvent::ItemAdded {
                    sku: "Y".into(),
                    quantity: 1
                },
            ]
        );
    }

    #[test]
    fn test_empty_bulk_add_is_dropped() {
        let chain = order_upgraders().unwrap();

        let upgraded = chain
            .upgrade(OrderEvent::BulkItemsAdded { items: vec![] })
            .unwrap();

        assert!(upgraded.is_empty());
    }

    #[test]
    fn test_current_events_pass_through() {
        let chain = order_upgraders().unwrap();

        let upgraded = chain.upgrade(OrderEvent::OrderSubmitted).unwrap();

        assert_eq!(upgraded, vec![OrderEvent::OrderSubmitted]);
    }
}
