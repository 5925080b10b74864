use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{pwd_version_cache_key, NewOrderItem, Order, OutboxKey, Seller, TokenClaims};
use crate::infrastructure::account_repository::AccountRepositoryTrait;
use crate::infrastructure::cache::KeyValueCache;
use crate::infrastructure::order_repository::OrderRepositoryTrait;
use crate::infrastructure::repository::RepositoryError;
use crate::infrastructure::seller_repository::SellerRepositoryTrait;
use crate::infrastructure::service_clients::{ClientError, ServiceClientRegistry};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Order has no items")]
    EmptyOrder,
    #[error("Invalid quantity {quantity} for product {product_id}")]
    InvalidQuantity { product_id: i64, quantity: i64 },
    #[error("Unknown product: {0}")]
    UnknownProduct(i64),
    #[error("Store name must not be empty")]
    EmptyStoreName,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

pub struct AuthService {
    accounts: Arc<dyn AccountRepositoryTrait>,
}

impl AuthService {
    pub fn new(accounts: Arc<dyn AccountRepositoryTrait>) -> Self {
        Self { accounts }
    }

    /// Hashing happens upstream; this persists the hash and schedules the
    /// password-version notification. Returns the new version.
    pub async fn change_password(
        &self,
        user_id: OutboxKey,
        password_hash: &str,
    ) -> Result<i64, ServiceError> {
        Ok(self.accounts.change_password(user_id, password_hash).await?)
    }
}

pub struct UserService {
    sellers: Arc<dyn SellerRepositoryTrait>,
}

impl UserService {
    pub fn new(sellers: Arc<dyn SellerRepositoryTrait>) -> Self {
        Self { sellers }
    }

    pub async fn create_seller(&self, user_id: i64, store_name: &str) -> Result<Seller, ServiceError> {
        let store_name = store_name.trim();
        if store_name.is_empty() {
            return Err(ServiceError::EmptyStoreName);
        }
        Ok(self.sellers.create_seller(user_id, store_name).await?)
    }
}

pub struct OrderService {
    orders: Arc<dyn OrderRepositoryTrait>,
    clients: Arc<ServiceClientRegistry>,
}

impl OrderService {
    pub fn new(orders: Arc<dyn OrderRepositoryTrait>, clients: Arc<ServiceClientRegistry>) -> Self {
        Self { orders, clients }
    }

    /// Prices each `(product_id, quantity)` line through the product catalog
    /// and stores the order. Inventory is checked later, asynchronously.
    pub async fn create_order(
        &self,
        buyer_id: i64,
        lines: &[(i64, i64)],
    ) -> Result<Order, ServiceError> {
        if lines.is_empty() {
            return Err(ServiceError::EmptyOrder);
        }
        if let Some(&(product_id, quantity)) = lines.iter().find(|(_, q)| *q <= 0) {
            return Err(ServiceError::InvalidQuantity {
                product_id,
                quantity,
            });
        }

        let product_ids: Vec<i64> = lines.iter().map(|(id, _)| *id).collect();
        let prices = self.clients.product()?.unit_prices(&product_ids).await?;

        let items = lines
            .iter()
            .map(|&(product_id, quantity)| {
                prices
                    .get(&product_id)
                    .map(|&price| NewOrderItem {
                        product_id,
                        quantity,
                        price,
                    })
                    .ok_or(ServiceError::UnknownProduct(product_id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let order = self.orders.create_order(buyer_id, &items).await?;
        info!("Order {} accepted, awaiting inventory validation", order.id);
        Ok(order)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum TokenRejected {
    #[error("Token minted at password version {presented}, current is {current}")]
    StalePwdVersion { presented: i64, current: i64 },
    #[error("Password version could not be verified: {0}")]
    Unverifiable(String),
}

/// Rejects tokens issued before the latest password change.
pub struct PwdVersionGuard {
    cache: Arc<dyn KeyValueCache>,
}

impl PwdVersionGuard {
    pub fn new(cache: Arc<dyn KeyValueCache>) -> Self {
        Self { cache }
    }

    /// A missing cache entry accepts the token: no change was seen within the TTL.
    pub async fn check(&self, claims: &TokenClaims) -> Result<(), TokenRejected> {
        let key = pwd_version_cache_key(claims.user_id);
        let cached = self.cache.get(&key).await.map_err(|e| {
            warn!("Password version lookup for {} failed: {}", key, e);
            TokenRejected::Unverifiable(e.to_string())
        })?;

        let Some(raw) = cached else {
            return Ok(());
        };
        let current: i64 = raw
            .trim()
            .parse()
            .map_err(|_| TokenRejected::Unverifiable(format!("bad cached value '{}'", raw)))?;

        if current != claims.pwd_version {
            return Err(TokenRejected::StalePwdVersion {
                presented: claims.pwd_version,
                current,
            });
        }
        Ok(())
    }
}
