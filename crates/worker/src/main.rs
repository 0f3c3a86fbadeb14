use std::sync::Arc;

use logoflow::api;
use logoflow::config;
use logoflow::db;
use logoflow::detector::HttpDetector;
use logoflow::jobs::{IngestCoordinator, JobRunner, JobsRepo};
use logoflow::logging::{init_logging, LogFormat};
use logoflow::queue::{AmqpChannel, DeliveryChannel};
use logoflow::storage::S3BlobStore;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_env_file();
    init_logging(LogFormat::from_env())?;

    let cfg = config::Config::from_env()
        .inspect_err(|e| error!(error = %e, "invalid configuration"))?;

    let api_addr = cfg.api_addr.clone();

    info!(
        api = %api_addr.as_deref().unwrap_or("disabled"),
        consumer = cfg.consumer_enabled,
        bucket = %cfg.storage.bucket,
        exchange = %cfg.broker.exchange,
        queue = %cfg.broker.queue,
        max_file_size = cfg.server.max_file_size,
        migrate_on_startup = cfg.migrate_on_startup,
        "logoflowd starting"
    );

    let pool = db::make_pool(&cfg.database_url, &cfg.pool).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let jobs_repo = Arc::new(JobsRepo::new(pool.clone()));
    let blobs = Arc::new(S3BlobStore::new(&cfg.storage));
    let channel = Arc::new(AmqpChannel::connect(cfg.broker.clone(), cfg.requeue.clone()).await?);
    let detector = Arc::new(HttpDetector::new(&cfg.detector)?);

    let coordinator = IngestCoordinator::new(
        blobs,
        jobs_repo.clone(),
        channel.clone(),
        cfg.ingest_policy(),
    );

    // ---- API task ----
    let app = api::router(api::AppState {
        coordinator,
        allowed_origins: cfg.server.allowed_origins.clone(),
    });

    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!("api listening on http://{addr}");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Consumer task ----
    let consumer_handle = {
        let channel = channel.clone();
        let runner = JobRunner::new(
            jobs_repo,
            detector,
            cfg.timeouts.ledger,
            cfg.detector.timeout,
        );
        let enabled = cfg.consumer_enabled;

        tokio::spawn(async move {
            if enabled {
                channel.consume(Arc::new(runner)).await?;
                anyhow::bail!("consumer stopped: broker stream ended");
            } else {
                std::future::pending::<()>().await;
            }
            Ok::<(), anyhow::Error>(())
        })
    };

    tokio::select! {
        res = api_handle => res??,
        res = consumer_handle => res??,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    if let Err(e) = channel.close().await {
        error!(error = %e, "broker close failed");
    }
    pool.close().await;

    Ok(())
}
