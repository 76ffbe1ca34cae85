//! write-coalescer - drive a toggle storm through the batch layer and
//! check that every counter still matches its relation rows

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use write_coalescer::{
    config::{Args, StoreBackend},
    db::{MongoClient, MongoStore},
    logging::{FlushLogger, FlushSink},
    services::BatchServices,
    store::{MemoryStore, Store},
    storm,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("write_coalescer={},info", args.log_level).into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let settings = args.buffer_settings();

    info!("======================================");
    info!("  Write Coalescer");
    info!("======================================");
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Store: {:?}", args.store);
    if args.store == StoreBackend::Mongo {
        info!("MongoDB: {} / {}", args.mongodb_uri, args.mongodb_db);
    }
    for config in [
        &settings.votes,
        &settings.follows,
        &settings.saves,
        &settings.views,
        &settings.notifications,
        &settings.access_logs,
    ] {
        info!(
            "  {}: delay={}ms max={} mode={:?}",
            config.name,
            config.flush_delay.as_millis(),
            config.max_size,
            config.failure_mode
        );
    }
    info!(
        "Storm: {} requests, {} actors, {} targets, concurrency {}",
        args.storm.storm_requests, args.storm.storm_actors, args.storm.storm_targets, args.storm.storm_concurrency
    );
    info!("======================================");

    let store: Arc<dyn Store> = match args.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Mongo => match connect_mongo(&args).await {
            Ok(store) => {
                info!("MongoDB connected successfully");
                Arc::new(store)
            }
            Err(e) => {
                if args.dev_mode {
                    warn!("MongoDB connection failed (dev mode, using memory store): {}", e);
                    Arc::new(MemoryStore::new())
                } else {
                    error!("MongoDB connection failed: {}", e);
                    std::process::exit(1);
                }
            }
        },
    };

    let flush_logger = FlushLogger::new(args.dev_mode);
    if let Some(path) = &args.flush_log {
        if let Err(e) = flush_logger.init_file(path) {
            warn!("Failed to open flush log {}: {}", path.display(), e);
        }
    }
    let sink: Arc<dyn FlushSink> = Arc::new(flush_logger);

    let services = BatchServices::new(Arc::clone(&store), settings, sink);

    let requests = storm::generate(&args.storm);
    let storm_run = storm::run(&services, requests, args.storm.storm_concurrency);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, draining buffers");
        }
        summary = storm_run => {
            info!(
                "Storm complete: {} toggles, {} views, {} errors in {}ms",
                summary.toggles, summary.views, summary.errors, summary.elapsed_ms
            );
        }
    }

    let report = services.shutdown().await;
    for drain in &report.buffers {
        match &drain.error {
            Some(e) => warn!("  {}: {} drained, {} failed ({})", drain.buffer, drain.records, drain.failed_records, e),
            None => info!("  {}: {} drained, {} failed", drain.buffer, drain.records, drain.failed_records),
        }
    }

    for (name, stats) in services.stats() {
        info!(
            "  {}: enqueued={} deduplicated={} flushes={} flushed={} failed={}",
            name, stats.enqueued, stats.deduplicated, stats.flushes, stats.flushed_records, stats.failed_records
        );
    }

    let drift = storm::verify_counters(store.as_ref(), args.storm.storm_actors, args.storm.storm_targets).await?;
    if !drift.is_empty() {
        if args.storm.storm_strict {
            anyhow::bail!("{} counters drifted from their relation rows", drift.len());
        }
        warn!("{} counters drifted from their relation rows", drift.len());
    }

    if !report.is_clean() && args.storm.storm_strict {
        anyhow::bail!("{} records failed during shutdown", report.failed_records());
    }

    info!("Write coalescer stopped");
    Ok(())
}

async fn connect_mongo(args: &Args) -> write_coalescer::Result<MongoStore> {
    let client = MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await?;
    MongoStore::connect(client).await
}
