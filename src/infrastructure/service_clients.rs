use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use thiserror::Error;

use crate::domain::OrderStatus;

/// The closed set of peer services a process may talk to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceId {
    Auth,
    User,
    Product,
    Order,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("No client registered for the {0} service")]
    NotRegistered(ServiceId),
    #[error("{0} service call failed: {1}")]
    Call(ServiceId, String),
}

#[async_trait]
pub trait AuthClient: Send + Sync {
    async fn current_pwd_version(&self, user_id: i64) -> Result<i64, ClientError>;
}

#[async_trait]
pub trait UserClient: Send + Sync {
    async fn store_id(&self, user_id: i64) -> Result<Option<i64>, ClientError>;
}

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Unit prices of the known products among `product_ids`. Unknown ids are absent.
    async fn unit_prices(&self, product_ids: &[i64]) -> Result<HashMap<i64, f64>, ClientError>;
}

#[async_trait]
pub trait OrderClient: Send + Sync {
    async fn order_status(&self, order_id: i64) -> Result<Option<OrderStatus>, ClientError>;
}

/// One typed slot per peer service. Filled at startup, read-only afterwards.
#[derive(Clone, Default)]
pub struct ServiceClientRegistry {
    auth: Option<Arc<dyn AuthClient>>,
    user: Option<Arc<dyn UserClient>>,
    product: Option<Arc<dyn ProductCatalog>>,
    order: Option<Arc<dyn OrderClient>>,
}

fn slot<T: ?Sized>(client: &Option<Arc<T>>, id: ServiceId) -> Result<Arc<T>, ClientError> {
    client.clone().ok_or(ClientError::NotRegistered(id))
}

impl ServiceClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auth(mut self, client: Arc<dyn AuthClient>) -> Self {
        self.auth = Some(client);
        self
    }

    pub fn with_user(mut self, client: Arc<dyn UserClient>) -> Self {
        self.user = Some(client);
        self
    }

    pub fn with_product(mut self, client: Arc<dyn ProductCatalog>) -> Self {
        self.product = Some(client);
        self
    }

    pub fn with_order(mut self, client: Arc<dyn OrderClient>) -> Self {
        self.order = Some(client);
        self
    }

    pub fn auth(&self) -> Result<Arc<dyn AuthClient>, ClientError> {
        slot(&self.auth, ServiceId::Auth)
    }

    pub fn user(&self) -> Result<Arc<dyn UserClient>, ClientError> {
        slot(&self.user, ServiceId::User)
    }

    pub fn product(&self) -> Result<Arc<dyn ProductCatalog>, ClientError> {
        slot(&self.product, ServiceId::Product)
    }

    pub fn order(&self) -> Result<Arc<dyn OrderClient>, ClientError> {
        slot(&self.order, ServiceId::Order)
    }

    pub fn is_registered(&self, id: ServiceId) -> bool {
        match id {
            ServiceId::Auth => self.auth.is_some(),
            ServiceId::User => self.user.is_some(),
            ServiceId::Product => self.product.is_some(),
            ServiceId::Order => self.order.is_some(),
        }
    }
}

/// Fixed price list.
#[derive(Default)]
pub struct StaticProductCatalog {
    prices: HashMap<i64, f64>,
}

impl StaticProductCatalog {
    pub fn new(prices: impl IntoIterator<Item = (i64, f64)>) -> Self {
        Self {
            prices: prices.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ProductCatalog for StaticProductCatalog {
    async fn unit_prices(&self, product_ids: &[i64]) -> Result<HashMap<i64, f64>, ClientError> {
        Ok(product_ids
            .iter()
            .filter_map(|id| self.prices.get(id).map(|price| (*id, *price)))
            .collect())
    }
}
