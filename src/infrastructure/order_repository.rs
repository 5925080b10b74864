use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::str::FromStr;
use tracing::{info, warn};

use crate::domain::{
    total_price, NewOrderItem, Order, OrderCreated, OrderItem, OrderStatus, OutboxKey,
};
use crate::infrastructure::outbox::PgOutboxStore;
use crate::infrastructure::repository::{expect_affected, RepositoryError};

#[async_trait]
pub trait OrderRepositoryTrait: Send + Sync {
    /// Inserts the order, its line items and the `OrderCreated` outbox row in
    /// one transaction. The order starts out `PENDING`.
    async fn create_order(
        &self,
        buyer_id: i64,
        items: &[NewOrderItem],
    ) -> Result<Order, RepositoryError>;

    async fn update_status(
        &self,
        order_id: OutboxKey,
        status: OrderStatus,
    ) -> Result<(), RepositoryError>;
}

#[derive(Clone)]
pub struct PostgresOrderRepository {
    pool: PgPool,
    outbox: PgOutboxStore<OrderCreated>,
}

impl PostgresOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            outbox: PgOutboxStore::new(pool.clone()),
            pool,
        }
    }

    pub async fn find_status(&self, order_id: OutboxKey) -> Result<OrderStatus, RepositoryError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        let status = status.ok_or(RepositoryError::NotFound(order_id))?;
        OrderStatus::from_str(&status).map_err(|_| {
            RepositoryError::Database(sqlx::Error::Decode(
                format!("unknown order status '{}'", status).into(),
            ))
        })
    }
}

#[async_trait]
impl OrderRepositoryTrait for PostgresOrderRepository {
    async fn create_order(
        &self,
        buyer_id: i64,
        items: &[NewOrderItem],
    ) -> Result<Order, RepositoryError> {
        let total = total_price(items);
        let mut tx = self.pool.begin().await?;

        let (order_id, created_at): (i64, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO orders (buyer_id, status, total_price, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING id, created_at
            "#,
        )
        .bind(buyer_id)
        .bind(OrderStatus::Pending.as_ref())
        .bind(total)
        .fetch_one(&mut *tx)
        .await?;

        let mut order_items = Vec::with_capacity(items.len());
        for item in items {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO order_items (order_id, product_id, quantity, price)
                VALUES ($1, $2, $3, $4)
                RETURNING id
                "#,
            )
            .bind(order_id)
            .bind(item.product_id)
            .bind(item.quantity)
            .bind(item.price)
            .fetch_one(&mut *tx)
            .await?;
            order_items.push(OrderItem {
                id,
                order_id,
                product_id: item.product_id,
                quantity: item.quantity,
                price: item.price,
            });
        }

        let order = Order {
            id: order_id,
            buyer_id,
            status: OrderStatus::Pending,
            total_price: total,
            items: order_items,
            created_at,
        };
        self.outbox
            .create_or_update(&mut tx, &order.created_event())
            .await?;

        tx.commit().await?;
        info!(
            "Order {} created for buyer {} with {} items",
            order.id,
            buyer_id,
            order.items.len()
        );
        Ok(order)
    }

    async fn update_status(
        &self,
        order_id: OutboxKey,
        status: OrderStatus,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE orders SET status = $2 WHERE id = $1")
            .bind(order_id)
            .bind(status.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!("Status update for unknown order {}", order_id);
        }
        expect_affected(result, order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OutboxStatus;

    fn items() -> Vec<NewOrderItem> {
        vec![
            NewOrderItem {
                product_id: 1,
                quantity: 2,
                price: 5.0,
            },
            NewOrderItem {
                product_id: 2,
                quantity: 1,
                price: 3.5,
            },
        ]
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore] // Requires DATABASE_URL pointing at a Postgres instance
    async fn order_items_and_outbox_row_commit_together(pool: PgPool) {
        let repo = PostgresOrderRepository::new(pool.clone());
        let order = repo.create_order(8, &items()).await.unwrap();

        assert_eq!(order.total_price, 13.5);
        assert_eq!(repo.find_status(order.id).await.unwrap(), OrderStatus::Pending);

        let row = PgOutboxStore::<OrderCreated>::new(pool)
            .find(order.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.payload["items"].as_array().unwrap().len(), 2);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore] // Requires DATABASE_URL pointing at a Postgres instance
    async fn status_update_is_idempotent(pool: PgPool) {
        let repo = PostgresOrderRepository::new(pool);
        let order = repo.create_order(8, &items()).await.unwrap();

        repo.update_status(order.id, OrderStatus::Failed).await.unwrap();
        repo.update_status(order.id, OrderStatus::Failed).await.unwrap();
        assert_eq!(repo.find_status(order.id).await.unwrap(), OrderStatus::Failed);
        assert!(matches!(
            repo.update_status(9999, OrderStatus::Success).await,
            Err(RepositoryError::NotFound(9999))
        ));
    }
}
