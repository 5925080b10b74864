use serde::{Deserialize, Serialize};

use crate::domain::outbox::OutboxKey;

// Wire payloads, one JSON document per broker message.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PwdVersionPayload {
    pub user_id: OutboxKey,
    pub pwd_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerCreatedPayload {
    pub seller_id: OutboxKey,
    pub user_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemEvent {
    pub product_id: i64,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreatedPayload {
    pub order_id: OutboxKey,
    pub items: Vec<ItemEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderValidatedPayload {
    pub order_id: OutboxKey,
    pub success: bool,
}

/// Broker message key for a business key. Keeps all messages about one key on
/// the same partition.
pub fn message_key(key: OutboxKey) -> Vec<u8> {
    key.to_string().into_bytes()
}
