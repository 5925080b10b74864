use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::{
    pwd_version_cache_key, OrderCreatedPayload, OrderStatus, OrderValidatedPayload,
    PwdVersionPayload, SellerCreatedPayload,
};
use crate::infrastructure::account_repository::AccountRepositoryTrait;
use crate::infrastructure::cache::KeyValueCache;
use crate::infrastructure::event_consumer::{HandlerError, MessageHandler};
use crate::infrastructure::kafka_abstraction::BrokerMessage;
use crate::infrastructure::order_repository::OrderRepositoryTrait;
use crate::infrastructure::product_repository::{ProductRepositoryTrait, Reservation};

pub const DEFAULT_PWD_VERSION_TTL: Duration = Duration::from_secs(5 * 60);

fn decode<T: DeserializeOwned>(message: &BrokerMessage) -> Result<T, HandlerError> {
    Ok(serde_json::from_slice(&message.payload)?)
}

/// Gateway: caches the latest password version so stale tokens can be rejected.
pub struct PwdVersionCacheHandler {
    cache: Arc<dyn KeyValueCache>,
    ttl: Duration,
}

impl PwdVersionCacheHandler {
    pub fn new(cache: Arc<dyn KeyValueCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }
}

#[async_trait]
impl MessageHandler for PwdVersionCacheHandler {
    async fn handle(&self, message: &BrokerMessage) -> Result<(), HandlerError> {
        let event: PwdVersionPayload = decode(message)?;
        let key = pwd_version_cache_key(event.user_id);
        self.cache
            .set_with_ttl(&key, &event.pwd_version.to_string(), self.ttl)
            .await?;
        debug!("Cached {} = {}", key, event.pwd_version);
        Ok(())
    }
}

/// Auth: links the account to its new store.
pub struct SellerCreatedHandler {
    accounts: Arc<dyn AccountRepositoryTrait>,
}

impl SellerCreatedHandler {
    pub fn new(accounts: Arc<dyn AccountRepositoryTrait>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl MessageHandler for SellerCreatedHandler {
    async fn handle(&self, message: &BrokerMessage) -> Result<(), HandlerError> {
        let event: SellerCreatedPayload = decode(message)?;
        self.accounts
            .update_store_id(event.user_id, event.seller_id)
            .await?;
        info!("Account {} now owns store {}", event.user_id, event.seller_id);
        Ok(())
    }
}

/// Order: applies the inventory verdict to the order status.
pub struct OrderValidatedHandler {
    orders: Arc<dyn OrderRepositoryTrait>,
}

impl OrderValidatedHandler {
    pub fn new(orders: Arc<dyn OrderRepositoryTrait>) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl MessageHandler for OrderValidatedHandler {
    async fn handle(&self, message: &BrokerMessage) -> Result<(), HandlerError> {
        let event: OrderValidatedPayload = decode(message)?;
        let status = OrderStatus::from_validation(event.success);
        self.orders.update_status(event.order_id, status).await?;
        info!("Order {} marked {}", event.order_id, status);
        Ok(())
    }
}

/// Product: reserves inventory for a new order and records the verdict.
pub struct InventoryReservationHandler {
    products: Arc<dyn ProductRepositoryTrait>,
}

impl InventoryReservationHandler {
    pub fn new(products: Arc<dyn ProductRepositoryTrait>) -> Self {
        Self { products }
    }
}

#[async_trait]
impl MessageHandler for InventoryReservationHandler {
    async fn handle(&self, message: &BrokerMessage) -> Result<(), HandlerError> {
        let order: OrderCreatedPayload = decode(message)?;

        if self.products.is_decided(order.order_id).await? {
            debug!("Order {} already validated, skipping redelivery", order.order_id);
            return Ok(());
        }

        match self.products.reserve_inventory(&order).await {
            Ok(Reservation::AlreadyDecided) => {
                debug!("Order {} was validated by an overlapping delivery", order.order_id);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                if let Err(placeholder) = self.products.record_undecided(order.order_id).await {
                    warn!(
                        "Could not record undecided verdict for order {}: {}",
                        order.order_id, placeholder
                    );
                }
                Err(e.into())
            }
        }
    }
}
