use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::domain::events::{ItemEvent, OrderCreatedPayload};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Success,
    Failed,
    Canceled,
}

impl OrderStatus {
    pub fn from_validation(success: bool) -> Self {
        if success {
            OrderStatus::Success
        } else {
            OrderStatus::Failed
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOrderItem {
    pub product_id: i64,
    pub quantity: i64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: i64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: i64,
    pub buyer_id: i64,
    pub status: OrderStatus,
    pub total_price: f64,
    pub items: Vec<OrderItem>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn created_event(&self) -> OrderCreatedPayload {
        OrderCreatedPayload {
            order_id: self.id,
            items: self
                .items
                .iter()
                .map(|item| ItemEvent {
                    product_id: item.product_id,
                    quantity: item.quantity,
                })
                .collect(),
        }
    }
}

pub fn total_price(items: &[NewOrderItem]) -> f64 {
    items.iter().map(|i| i.price * i.quantity as f64).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_flag_maps_to_status() {
        assert_eq!(OrderStatus::from_validation(true), OrderStatus::Success);
        assert_eq!(OrderStatus::from_validation(false), OrderStatus::Failed);
        assert_eq!(OrderStatus::Failed.as_ref(), "FAILED");
    }

    #[test]
    fn total_price_sums_line_items() {
        let items = vec![
            NewOrderItem { product_id: 1, quantity: 2, price: 2.5 },
            NewOrderItem { product_id: 2, quantity: 1, price: 10.0 },
        ];
        assert_eq!(total_price(&items), 15.0);
    }
}
