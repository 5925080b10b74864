use async_trait::async_trait;
use sqlx::{Connection, PgPool};
use tracing::{debug, info};

use crate::domain::{OrderCreatedPayload, OrderValidated, OrderValidatedPayload, OutboxKey};
use crate::infrastructure::outbox::PgOutboxStore;
use crate::infrastructure::repository::RepositoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    Rejected,
    /// A verdict was recorded by an earlier delivery. Nothing was changed.
    AlreadyDecided,
}

#[async_trait]
pub trait ProductRepositoryTrait: Send + Sync {
    /// True once a final verdict for the order has been recorded.
    async fn is_decided(&self, order_id: OutboxKey) -> Result<bool, RepositoryError>;

    /// Reserves every line item or none of them, and records the verdict as a
    /// publishable `OrderValidated` row in the same transaction. The verdict
    /// row is locked first, so overlapping deliveries of one order reserve once.
    async fn reserve_inventory(
        &self,
        order: &OrderCreatedPayload,
    ) -> Result<Reservation, RepositoryError>;

    /// Placeholder verdict that is not publishable, written when the
    /// reservation itself could not run.
    async fn record_undecided(&self, order_id: OutboxKey) -> Result<(), RepositoryError>;
}

#[derive(Clone)]
pub struct PostgresProductRepository {
    pool: PgPool,
    outbox: PgOutboxStore<OrderValidated>,
}

impl PostgresProductRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            outbox: PgOutboxStore::new(pool.clone()),
            pool,
        }
    }

    pub async fn inventory(&self, product_id: i64) -> Result<i64, RepositoryError> {
        let inventory: Option<i64> =
            sqlx::query_scalar("SELECT inventory FROM products WHERE id = $1")
                .bind(product_id)
                .fetch_optional(&self.pool)
                .await?;
        inventory.ok_or(RepositoryError::NotFound(product_id))
    }
}

#[async_trait]
impl ProductRepositoryTrait for PostgresProductRepository {
    async fn is_decided(&self, order_id: OutboxKey) -> Result<bool, RepositoryError> {
        Ok(self.outbox.is_processed(order_id).await?)
    }

    async fn reserve_inventory(
        &self,
        order: &OrderCreatedPayload,
    ) -> Result<Reservation, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let undecided = OrderValidatedPayload {
            order_id: order.order_id,
            success: false,
        };
        if self.outbox.lock_gate(&mut tx, &undecided).await? {
            tx.rollback().await?;
            debug!("Order {} already validated", order.order_id);
            return Ok(Reservation::AlreadyDecided);
        }

        // Decrements run in a savepoint so a short item undoes the earlier ones
        // while the verdict below still commits.
        let mut reservation = Connection::begin(&mut *tx).await?;
        let mut success = !order.items.is_empty();
        for item in &order.items {
            if item.quantity <= 0 {
                success = false;
                break;
            }
            let result = sqlx::query(
                "UPDATE products SET inventory = inventory - $2 WHERE id = $1 AND inventory >= $2",
            )
            .bind(item.product_id)
            .bind(item.quantity)
            .execute(&mut *reservation)
            .await?;
            if result.rows_affected() == 0 {
                debug!(
                    "Order {}: product {} short of {} units",
                    order.order_id, item.product_id, item.quantity
                );
                success = false;
                break;
            }
        }
        if success {
            reservation.commit().await?;
        } else {
            reservation.rollback().await?;
        }

        self.outbox
            .create_or_update_gated(
                &mut tx,
                &OrderValidatedPayload {
                    order_id: order.order_id,
                    success,
                },
                false,
            )
            .await?;
        self.outbox.mark_processed(&mut tx, order.order_id).await?;
        tx.commit().await?;

        info!(
            "Order {} inventory {}",
            order.order_id,
            if success { "reserved" } else { "rejected" }
        );
        Ok(if success {
            Reservation::Reserved
        } else {
            Reservation::Rejected
        })
    }

    async fn record_undecided(&self, order_id: OutboxKey) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        self.outbox
            .create_or_update_gated(
                &mut tx,
                &OrderValidatedPayload {
                    order_id,
                    success: false,
                },
                false,
            )
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ItemEvent, OutboxStatus};
    use crate::infrastructure::outbox::OutboxStore;

    async fn insert_product(pool: &PgPool, id: i64, inventory: i64) {
        sqlx::query("INSERT INTO products (id, name, price, inventory) VALUES ($1, 'item', 1.0, $2)")
            .bind(id)
            .bind(inventory)
            .execute(pool)
            .await
            .unwrap();
    }

    fn order(order_id: i64, items: &[(i64, i64)]) -> OrderCreatedPayload {
        OrderCreatedPayload {
            order_id,
            items: items
                .iter()
                .map(|&(product_id, quantity)| ItemEvent {
                    product_id,
                    quantity,
                })
                .collect(),
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore] // Requires DATABASE_URL pointing at a Postgres instance
    async fn successful_reservation_decrements_every_item(pool: PgPool) {
        insert_product(&pool, 1, 5).await;
        insert_product(&pool, 2, 1).await;
        let repo = PostgresProductRepository::new(pool.clone());

        assert_eq!(
            repo.reserve_inventory(&order(42, &[(1, 2), (2, 1)])).await.unwrap(),
            Reservation::Reserved
        );
        assert_eq!(repo.inventory(1).await.unwrap(), 3);
        assert_eq!(repo.inventory(2).await.unwrap(), 0);
        assert!(repo.is_decided(42).await.unwrap());

        let rows = PgOutboxStore::<OrderValidated>::new(pool)
            .fetch_eligible(10)
            .await
            .unwrap();
        assert_eq!(rows[0].payload["success"], true);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore] // Requires DATABASE_URL pointing at a Postgres instance
    async fn short_item_rolls_back_all_decrements(pool: PgPool) {
        insert_product(&pool, 1, 5).await;
        insert_product(&pool, 2, 0).await;
        let repo = PostgresProductRepository::new(pool.clone());

        assert_eq!(
            repo.reserve_inventory(&order(43, &[(1, 2), (2, 1)])).await.unwrap(),
            Reservation::Rejected
        );
        assert_eq!(repo.inventory(1).await.unwrap(), 5);

        let row = PgOutboxStore::<OrderValidated>::new(pool)
            .find(43)
            .await
            .unwrap()
            .unwrap();
        assert!(row.processed);
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.payload["success"], false);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore] // Requires DATABASE_URL pointing at a Postgres instance
    async fn undecided_placeholder_is_not_publishable(pool: PgPool) {
        let repo = PostgresProductRepository::new(pool.clone());
        repo.record_undecided(44).await.unwrap();

        assert!(!repo.is_decided(44).await.unwrap());
        assert!(PgOutboxStore::<OrderValidated>::new(pool)
            .fetch_eligible(10)
            .await
            .is_err());
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore] // Requires DATABASE_URL pointing at a Postgres instance
    async fn overlapping_deliveries_reserve_once(pool: PgPool) {
        insert_product(&pool, 1, 10).await;
        let repo = PostgresProductRepository::new(pool.clone());
        let payload = order(45, &[(1, 3)]);

        // Both deliveries passed the unlocked pre-check before either committed.
        assert!(!repo.is_decided(45).await.unwrap());
        let (first, second) = tokio::join!(
            repo.reserve_inventory(&payload),
            repo.reserve_inventory(&payload)
        );
        let mut outcomes = vec![first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|o| *o == Reservation::AlreadyDecided);

        assert_eq!(outcomes, vec![Reservation::Reserved, Reservation::AlreadyDecided]);
        assert_eq!(repo.inventory(1).await.unwrap(), 7);
        assert!(repo.is_decided(45).await.unwrap());
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore] // Requires DATABASE_URL pointing at a Postgres instance
    async fn placeholder_is_replaced_by_the_real_verdict(pool: PgPool) {
        insert_product(&pool, 1, 10).await;
        let repo = PostgresProductRepository::new(pool.clone());
        repo.record_undecided(46).await.unwrap();

        assert_eq!(
            repo.reserve_inventory(&order(46, &[(1, 1)])).await.unwrap(),
            Reservation::Reserved
        );
        let row = PgOutboxStore::<OrderValidated>::new(pool)
            .find(46)
            .await
            .unwrap()
            .unwrap();
        assert!(row.processed);
        assert_eq!(row.payload["success"], true);
        assert_eq!(
            repo.reserve_inventory(&order(46, &[(1, 1)])).await.unwrap(),
            Reservation::AlreadyDecided
        );
        assert_eq!(repo.inventory(1).await.unwrap(), 9);
    }
}
