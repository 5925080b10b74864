use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use crate::domain::{Seller, SellerCreated, SellerCreatedPayload};
use crate::infrastructure::outbox::PgOutboxStore;
use crate::infrastructure::repository::RepositoryError;

#[async_trait]
pub trait SellerRepositoryTrait: Send + Sync {
    /// Inserts the seller and its `SellerCreated` outbox row atomically.
    async fn create_seller(&self, user_id: i64, store_name: &str) -> Result<Seller, RepositoryError>;
}

#[derive(Clone)]
pub struct PostgresSellerRepository {
    pool: PgPool,
    outbox: PgOutboxStore<SellerCreated>,
}

impl PostgresSellerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            outbox: PgOutboxStore::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl SellerRepositoryTrait for PostgresSellerRepository {
    async fn create_seller(&self, user_id: i64, store_name: &str) -> Result<Seller, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let seller_id: i64 = sqlx::query_scalar(
            "INSERT INTO sellers (user_id, store_name) VALUES ($1, $2) RETURNING id",
        )
        .bind(user_id)
        .bind(store_name)
        .fetch_one(&mut *tx)
        .await?;

        self.outbox
            .create_or_update(&mut tx, &SellerCreatedPayload { seller_id, user_id })
            .await?;

        tx.commit().await?;
        info!("Seller {} created for user {}", seller_id, user_id);
        Ok(Seller {
            id: seller_id,
            user_id,
            store_name: store_name.to_string(),
        })
    }
}
