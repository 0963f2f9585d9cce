//! Worker process: polls the `ingestion` and `vendor-events` queues, relays
//! the outbox, and runs the maintenance sweep on a schedule. Mirrors
//! `packages/server/src/bin/server.rs`'s wiring order — init logging, load
//! config, connect, migrate, then start the loops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay::pg_queue::{BackoffPolicy, PgJobStore};
use wholesale::collaborators::fakes::{FakeBlobStore, FakeCreditGate, FakeNotifier, ScriptedExtractor, ScriptedOcr};
use wholesale::collaborators::OcrOutput;
use wholesale::postgres::{
    PostgresArtifactRepository, PostgresBroadcastLog, PostgresProductCatalog,
    PostgresSafeModeGate, PostgresVendorCatalog, PostgresVendorMetricsStore,
    PostgresWebhookDedupeRepository,
};
use wholesale::repository::SafeModeGate;
use wholesale::worker::{Deps, IngestionWorker, OutboxRelay, SafeModeCache};
use wholesale::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wholesale=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true))
        .init();

    tracing::info!("starting wholesale ingestion worker");

    let config = Config::from_env().context("failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    tracing::info!("running database migrations");
    sqlx::migrate!("../queue/migrations")
        .run(&pool)
        .await
        .context("failed to run relay migrations")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run wholesale migrations")?;

    let jobs = Arc::new(PgJobStore::new(pool.clone()).with_backoff(BackoffPolicy {
        base: config.ingestion_queue.base_backoff,
        cap: config.ingestion_queue.cap_backoff,
    }));

    // Seed the gate row from the operator's configured starting value the
    // first time this process boots against a fresh database; subsequent
    // flips happen through the admin operation against the row itself, not
    // through redeploying with a different `SAFE_MODE` env var.
    let safe_mode_gate = Arc::new(PostgresSafeModeGate::new(pool.clone()));
    sqlx::query("INSERT INTO safe_mode_gate (id, engaged) VALUES (true, $1) ON CONFLICT (id) DO NOTHING")
        .bind(config.safe_mode)
        .execute(&pool)
        .await
        .context("failed to seed safe-mode gate")?;

    // Collaborators are the system's external integration seam (§6); real
    // OCR/extraction/notification transports are out of scope for this
    // core (spec Non-goals: "webhook transport glue", blob storage beyond
    // `get(ref) -> bytes`), so the worker runs against the fakes the crate
    // ships for tests until a real adapter is wired in by the deployment.
    let deps = Arc::new(Deps {
        pool: pool.clone(),
        jobs: jobs.clone(),
        artifacts: Arc::new(PostgresArtifactRepository::new(pool.clone())),
        catalog: Arc::new(PostgresProductCatalog::new(pool.clone())),
        vendors: Arc::new(PostgresVendorCatalog::new(pool.clone())),
        vendor_metrics: Arc::new(PostgresVendorMetricsStore::new(
            pool.clone(),
            config.metrics_weights,
            config.seed_samples,
        )),
        broadcasts: Arc::new(PostgresBroadcastLog::new(pool.clone())),
        blob_store: Arc::new(FakeBlobStore::default()),
        ocr: Arc::new(ScriptedOcr::always(OcrOutput {
            text: String::new(),
            per_line_confidences: Vec::new(),
        })),
        extractor: Arc::new(ScriptedExtractor::always(Vec::new())),
        notifier: Arc::new(FakeNotifier::default()),
        credit: Some(Arc::new(FakeCreditGate)),
        webhook_dedupe: Arc::new(PostgresWebhookDedupeRepository::new(pool.clone())),
        safe_mode: Arc::new(SafeModeCache::new(safe_mode_gate.clone())),
        config: config.clone(),
    });

    let ingestion = IngestionWorker::new(deps.clone());
    let outbox_relay = OutboxRelay::new(
        pool.clone(),
        deps.notifier.clone(),
        config.outbox_relay_queue.concurrency,
    );
    let outbox_retry_backoff = config.outbox_relay_queue.base_backoff;
    let maintenance_interval = config.maintenance_queue.job_timeout;
    let maintenance_retry_backoff = config.maintenance_queue.base_backoff;

    let worker_id = format!("wholesale-worker-{}", uuid::Uuid::new_v4());

    let poll_handle = {
        let ingestion = ingestion_ref(&ingestion);
        let worker_id = worker_id.clone();
        tokio::spawn(async move {
            loop {
                match ingestion.poll_once(&worker_id).await {
                    Ok(0) => tokio::time::sleep(Duration::from_millis(500)).await,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "ingestion poll failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    };

    let vendor_events_handle = {
        let ingestion = ingestion_ref(&ingestion);
        let worker_id = worker_id.clone();
        tokio::spawn(async move {
            loop {
                match ingestion.poll_vendor_events_once(&worker_id).await {
                    Ok(0) => tokio::time::sleep(Duration::from_millis(500)).await,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "vendor event poll failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    };

    let resume_deferred_handle = {
        let ingestion = ingestion_ref(&ingestion);
        let worker_id = worker_id.clone();
        tokio::spawn(async move {
            loop {
                match ingestion.resume_deferred_once(&worker_id).await {
                    Ok(0) => tokio::time::sleep(Duration::from_secs(2)).await,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "deferred-queue resume failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    };

    let reap_handle = {
        let ingestion = ingestion_ref(&ingestion);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                if let Err(err) = ingestion.reap().await {
                    tracing::error!(error = %err, "reap sweep failed");
                }
            }
        })
    };

    let outbox_handle = tokio::spawn(async move {
        loop {
            match outbox_relay.relay_once().await {
                Ok(0) => tokio::time::sleep(Duration::from_millis(500)).await,
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "outbox relay sweep failed");
                    tokio::time::sleep(outbox_retry_backoff).await;
                }
            }
        }
    });

    let maintenance_handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(maintenance_interval).await;
            match wholesale::worker::run_maintenance_sweep(&deps).await {
                Ok(results) => tracing::info!(?results, "maintenance sweep complete"),
                Err(err) => {
                    tracing::error!(error = %err, "maintenance sweep failed");
                    tokio::time::sleep(maintenance_retry_backoff).await;
                }
            }
        }
    });

    tracing::info!("wholesale worker running");
    tokio::try_join!(
        poll_handle,
        vendor_events_handle,
        resume_deferred_handle,
        reap_handle,
        outbox_handle,
        maintenance_handle
    )
    .context("a worker loop panicked")?;
    Ok(())
}

/// `IngestionWorker` holds no interior mutability beyond its `Arc<Deps>`, so
/// each polling loop gets its own cheap clone rather than sharing one task.
fn ingestion_ref(worker: &IngestionWorker) -> IngestionWorker {
    worker.clone()
}
