use anyhow::Context;
use futures::future::join_all;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use market_outbox::application::{
    InventoryReservationHandler, OrderValidatedHandler, PwdVersionCacheHandler,
    SellerCreatedHandler,
};
use market_outbox::domain::{
    OrderCreated, OrderValidated, OutboxEvent, PwdVersionChanged, SellerCreated,
};
use market_outbox::infrastructure::account_repository::PostgresAccountRepository;
use market_outbox::infrastructure::config::{BrokerKind, ServiceRole};
use market_outbox::infrastructure::logging::{init_logging, prune_old_logs};
use market_outbox::infrastructure::order_repository::PostgresOrderRepository;
use market_outbox::infrastructure::product_repository::PostgresProductRepository;
use market_outbox::infrastructure::repository::connect_pool;
use market_outbox::infrastructure::{
    AppConfig, BrokerConnectionRegistry, BrokerPublisher, BrokerTransport, EventConsumer,
    EventConsumerConfig, EventPublisher, EventPublisherWorker, InMemoryTransport, KafkaTransport,
    MessageHandler, OutboxPollerConfig, PgOutboxStore, RedisCache,
};

struct Runtime {
    config: AppConfig,
    registry: Arc<BrokerConnectionRegistry>,
    publisher: Arc<dyn EventPublisher>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    fn spawn_worker<E: OutboxEvent>(&mut self, pool: &PgPool, topic: &str) {
        let outbox = &self.config.outbox;
        let worker = EventPublisherWorker::<E>::new(
            Arc::new(PgOutboxStore::<E>::new(pool.clone())),
            self.publisher.clone(),
            OutboxPollerConfig {
                topic: topic.to_string(),
                poll_interval: outbox.poll_interval,
                batch_size: outbox.batch_size,
                publish_timeout: outbox.publish_timeout,
                max_publish_attempts: outbox.max_publish_attempts,
            },
        );
        let cancel = self.cancel.clone();
        self.tasks
            .push(tokio::spawn(async move { worker.run(cancel).await }));
    }

    fn spawn_consumer(&mut self, topic: &str, handler: Arc<dyn MessageHandler>) {
        let settings = &self.config.consumer;
        let mut consumer_config = EventConsumerConfig::new(topic, self.config.consumer_group());
        consumer_config.commit_policy = settings.commit_policy;
        consumer_config.handler_retry = settings.handler_retry.clone();
        consumer_config.read_backoff = settings.read_backoff;

        let consumer = EventConsumer::new(self.registry.clone(), handler, consumer_config);
        let cancel = self.cancel.clone();
        let topic = topic.to_string();
        self.tasks.push(tokio::spawn(async move {
            let reason = consumer.run(cancel).await;
            info!("Consumer for {} stopped: {}", topic, reason);
        }));
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;

    let _log_guard = init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))?;
    if config.logging.enable_file {
        if let Err(e) = prune_old_logs(
            &config.logging.log_dir,
            &config.logging.file_prefix,
            config.logging.max_files,
        ) {
            warn!("Failed to prune old log files: {}", e);
        }
    }

    info!(
        "Starting {} service with {} broker transport",
        config.role, config.broker
    );

    let pool = if config.needs_database() {
        let url = config
            .database_url
            .as_deref()
            .context("DATABASE_URL is required for this service role")?;
        let pool = connect_pool(url, config.database_pool_size)
            .await
            .context("failed to connect to Postgres")?;
        if config.run_migrations {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("failed to run migrations")?;
            info!("Database migrations applied");
        }
        Some(pool)
    } else {
        None
    };

    let transport: Arc<dyn BrokerTransport> = match config.broker {
        BrokerKind::Kafka => Arc::new(
            KafkaTransport::new(config.kafka.clone()).context("failed to create Kafka client")?,
        ),
        BrokerKind::Memory => {
            warn!("Using the in-memory broker; events never leave this process");
            Arc::new(InMemoryTransport::new())
        }
    };
    let registry = Arc::new(BrokerConnectionRegistry::new(transport));
    let publisher: Arc<dyn EventPublisher> = Arc::new(BrokerPublisher::new(
        registry.clone(),
        config.outbox.publish_retry.clone(),
    ));

    let mut runtime = Runtime {
        config: config.clone(),
        registry: registry.clone(),
        publisher,
        cancel: CancellationToken::new(),
        tasks: Vec::new(),
    };
    let topics = config.topics.clone();

    match (config.role, pool.as_ref()) {
        (ServiceRole::Auth, Some(pool)) => {
            runtime.spawn_worker::<PwdVersionChanged>(pool, &topics.pwd_version);
            let accounts = Arc::new(PostgresAccountRepository::new(pool.clone()));
            runtime.spawn_consumer(
                &topics.seller_created,
                Arc::new(SellerCreatedHandler::new(accounts)),
            );
        }
        (ServiceRole::User, Some(pool)) => {
            runtime.spawn_worker::<SellerCreated>(pool, &topics.seller_created);
        }
        (ServiceRole::Order, Some(pool)) => {
            runtime.spawn_worker::<OrderCreated>(pool, &topics.order_created);
            let orders = Arc::new(PostgresOrderRepository::new(pool.clone()));
            runtime.spawn_consumer(
                &topics.order_validated,
                Arc::new(OrderValidatedHandler::new(orders)),
            );
        }
        (ServiceRole::Product, Some(pool)) => {
            runtime.spawn_worker::<OrderValidated>(pool, &topics.order_validated);
            let products = Arc::new(PostgresProductRepository::new(pool.clone()));
            runtime.spawn_consumer(
                &topics.order_created,
                Arc::new(InventoryReservationHandler::new(products)),
            );
        }
        (ServiceRole::Gateway, _) => {
            let cache = RedisCache::connect(&config.redis_url)
                .await
                .context("failed to connect to Redis")?;
            runtime.spawn_consumer(
                &topics.pwd_version,
                Arc::new(PwdVersionCacheHandler::new(
                    Arc::new(cache),
                    config.pwd_version_ttl,
                )),
            );
        }
        (role, None) => anyhow::bail!("{} service started without a database pool", role),
    }

    info!("{} service running {} background tasks", config.role, runtime.tasks.len());

    shutdown_signal().await;
    info!("Shutdown signal received, stopping background tasks");
    runtime.cancel.cancel();

    for result in join_all(runtime.tasks).await {
        if let Err(e) = result {
            error!("Background task panicked: {}", e);
        }
    }

    if let Err(e) = registry.close_all().await {
        error!("Failed to close broker connections cleanly: {}", e);
    }
    if let Some(pool) = pool {
        pool.close().await;
    }

    info!("{} service stopped", config.role);
    Ok(())
}
