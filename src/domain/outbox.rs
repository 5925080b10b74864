use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::domain::events::{
    OrderCreatedPayload, OrderValidatedPayload, PwdVersionPayload, SellerCreatedPayload,
};

/// Business identifier an outbox row is about (user id, seller id, order id).
pub type OutboxKey = i64;

/// Delivery state of an outbox row.
///
/// `Pending` and `Failed` are picked up by the publisher worker. `Success` is
/// terminal. `DeadLetter` is terminal as well and only reached when the worker
/// runs with a maximum attempt count.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Failed,
    Success,
    DeadLetter,
}

impl OutboxStatus {
    pub const ELIGIBLE: [OutboxStatus; 2] = [OutboxStatus::Pending, OutboxStatus::Failed];

    pub fn is_eligible(&self) -> bool {
        Self::ELIGIBLE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Success | OutboxStatus::DeadLetter)
    }
}

/// A row as read back from one of the outbox tables.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRow {
    pub key: OutboxKey,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    /// Upstream processing gate. Always `true` for event types that are not gated.
    pub processed: bool,
    /// Number of recorded failed publish attempts since the last write.
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

impl OutboxRow {
    pub fn is_publishable(&self, gated: bool) -> bool {
        self.status.is_eligible() && (!gated || self.processed)
    }
}

/// Static description of one outbox event type: where its rows live and what
/// their payload looks like on the wire.
pub trait OutboxEvent: Send + Sync + 'static {
    /// Outbox table holding rows of this type. Trusted constant, interpolated into SQL.
    const TABLE: &'static str;
    /// Whether rows are only publishable once `processed = true`.
    const GATED: bool = false;
    /// Short name used in logs.
    const NAME: &'static str;

    type Payload: Serialize + DeserializeOwned + Clone + Send + Sync + std::fmt::Debug;

    fn key(payload: &Self::Payload) -> OutboxKey;
}

/// Password version bump in the auth service, consumed by the gateway cache.
pub struct PwdVersionChanged;

impl OutboxEvent for PwdVersionChanged {
    const TABLE: &'static str = "pwd_version_outbox";
    const NAME: &'static str = "pwd_version_changed";
    type Payload = PwdVersionPayload;

    fn key(payload: &Self::Payload) -> OutboxKey {
        payload.user_id
    }
}

/// Seller registration in the user service, consumed by the auth service.
pub struct SellerCreated;

impl OutboxEvent for SellerCreated {
    const TABLE: &'static str = "seller_created_outbox";
    const NAME: &'static str = "seller_created";
    type Payload = SellerCreatedPayload;

    fn key(payload: &Self::Payload) -> OutboxKey {
        payload.seller_id
    }
}

/// New order in the order service, consumed by the product service.
pub struct OrderCreated;

impl OutboxEvent for OrderCreated {
    const TABLE: &'static str = "order_created_outbox";
    const NAME: &'static str = "order_created";
    type Payload = OrderCreatedPayload;

    fn key(payload: &Self::Payload) -> OutboxKey {
        payload.order_id
    }
}

/// Inventory validation verdict in the product service, consumed by the order
/// service. Gated: the row only becomes publishable once the verdict is final.
pub struct OrderValidated;

impl OutboxEvent for OrderValidated {
    const TABLE: &'static str = "order_validated_outbox";
    const GATED: bool = true;
    const NAME: &'static str = "order_validated";
    type Payload = OrderValidatedPayload;

    fn key(payload: &Self::Payload) -> OutboxKey {
        payload.order_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_round_trips_through_its_column_literal() {
        assert_eq!(OutboxStatus::Pending.to_string(), "PENDING");
        assert_eq!(OutboxStatus::DeadLetter.as_ref(), "DEAD_LETTER");
        assert_eq!(OutboxStatus::from_str("FAILED").unwrap(), OutboxStatus::Failed);
        assert!(OutboxStatus::from_str("SENT").is_err());
    }

    #[test]
    fn only_pending_and_failed_are_eligible() {
        assert!(OutboxStatus::Pending.is_eligible());
        assert!(OutboxStatus::Failed.is_eligible());
        assert!(!OutboxStatus::Success.is_eligible());
        assert!(!OutboxStatus::DeadLetter.is_eligible());
    }

    #[test]
    fn gated_rows_need_processed_flag() {
        let row = OutboxRow {
            key: 7,
            payload: serde_json::json!({"order_id": 7, "success": true}),
            status: OutboxStatus::Failed,
            processed: false,
            attempts: 2,
            created_at: Utc::now(),
        };
        assert!(row.is_publishable(false));
        assert!(!row.is_publishable(true));
    }
}
