mod api;
mod backoff;
mod cache;
mod config;
mod dispatcher;
mod embeddings;
mod error;
mod fanout;
mod images;
mod kafka;
mod models;
mod outbox;
mod products;
mod registration;
mod schema;
mod scope;
mod vectorizer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::AppState;
use crate::cache::CacheRepo;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::embeddings::EmbeddingRepo;
use crate::images::{BlobStaging, S3ImageStore};
use crate::kafka::KafkaPublisher;
use crate::outbox::OutboxStore;
use crate::products::{CategoryRepo, ProductRepo};
use crate::registration::RegistrationService;
use crate::vectorizer::{GrpcVectorizer, VectorizerService};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let config = Config::parse();

    info!("running database migrations...");
    let mut conn = PgConnection::establish(&config.database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("migration error: {e}"))?;
    info!("migrations completed");

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.database_url);
    let pool = Pool::builder().build(manager).await?;

    let s3_config = aws_sdk_s3::Config::builder()
        .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
        .endpoint_url(&config.s3_endpoint)
        .region(aws_sdk_s3::config::Region::new("us-east-1"))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            config.s3_access_key.clone(),
            config.s3_secret_key.clone(),
            None,
            None,
            "static",
        ))
        .force_path_style(true)
        .build();
    let image_store = Arc::new(S3ImageStore::new(
        aws_sdk_s3::Client::from_conf(s3_config),
        config.s3_bucket.clone(),
    ));
    image_store.ensure_bucket().await?;

    let mut qdrant = qdrant_client::Qdrant::from_url(&config.qdrant_url);
    if let Some(key) = &config.qdrant_api_key {
        qdrant = qdrant.api_key(key.clone());
    }
    let embeddings = Arc::new(EmbeddingRepo::new(
        qdrant.build()?,
        config.qdrant_collection.clone(),
    ));
    embeddings.ensure_collection(config.vector_size).await?;

    let redis_client = redis::Client::open(config.redis_url.clone())?;
    let cache = Arc::new(CacheRepo::new(
        redis::aio::ConnectionManager::new(redis_client).await?,
        Duration::from_secs(config.product_cache_ttl_secs),
    ));

    let publisher = Arc::new(KafkaPublisher::new(&config.kafka_brokers, &config.kafka_topic)?);
    publisher
        .ensure_topic(config.kafka_partitions, config.kafka_replication_factor)
        .await?;

    let vectorizer_api = Arc::new(GrpcVectorizer::connect(&config.vectorizer_addr)?);
    let vectorizer = VectorizerService::new(
        vectorizer_api,
        config.vectorizer_concurrency,
        config.vectorizer_retries,
    );

    let staging = Arc::new(BlobStaging::new(image_store, config.upload_concurrency));
    let outbox = Arc::new(OutboxStore::new(
        pool.clone(),
        Duration::from_secs(config.outbox_processing_timeout_secs),
    ));

    let shutdown = CancellationToken::new();

    let dispatcher = Dispatcher::new(
        outbox.clone(),
        publisher.clone(),
        config.database_url.clone(),
        shutdown.child_token(),
    );
    let dispatcher_handle = tokio::spawn(async move { dispatcher.run().await });
    info!("outbox dispatcher started");

    let registration = Arc::new(RegistrationService::new(
        pool.clone(),
        ProductRepo::new(pool.clone()),
        CategoryRepo,
        outbox,
        staging.clone(),
        vectorizer,
        embeddings,
        cache,
        config.max_images,
    ));

    let state = AppState {
        registration,
        shutdown: shutdown.clone(),
    };
    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    info!("product service listening on port {}", config.http_port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down...");
    shutdown.cancel();
    if let Err(err) = dispatcher_handle.await {
        warn!("dispatcher task failed: {err}");
    }
    if let Err(err) = staging
        .wait_cleanup(Duration::from_secs(config.shutdown_cleanup_budget_secs))
        .await
    {
        warn!("{err}");
    }
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
    }
}
