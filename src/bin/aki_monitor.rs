//! AKI Monitor - production runtime
//!
//! Wires the pipeline together and streams until Ctrl-C:
//! - Opens (or creates) the patient store, seeding it from history when new
//! - Loads both risk models
//! - Spawns the pager worker
//! - Runs the MLLP connection loop
//! - Logs operator metrics every minute and once more on shutdown
//!
//! Usage:
//!   aki_monitor [--history <csv>] [--persistent_path <db>]
//!
//! Environment variables:
//!   MLLP_ADDRESS - inbound HL7 stream (default: localhost:8440)
//!   PAGER_ADDRESS - pager HTTP endpoint (default: localhost:8441)
//!   AKI_MODEL_PATH / AKI_MODEL_NO_DEMOGRAPHICS_PATH - model artifacts
//!   MALFORMED_FRAME_POLICY - ack | drop (default: ack)
//!   RUST_LOG - log filter (default: info; metrics flushes log at debug)

use akiflow::pipeline::{
    db::PatientStore,
    engine::MessageEngine,
    evaluator::RiskEvaluator,
    metrics::{describe, LATENCY_BUCKETS, REQUEST_LATENCY, TEST_RESULTS, TEST_RESULT_BUCKETS},
    pager::{spawn_pager_worker, AlertDispatcher, HttpPager, PageRequest, RetryPolicy},
    seed::load_history,
};
use akiflow::stream_core::{run_with_reconnect, RuntimeConfig};
use dotenv::dotenv;
use log::{debug, error, info};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Pages waiting for the worker before new ones are recorded as failed
const PAGER_QUEUE_CAPACITY: usize = 1024;

const METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Prometheus recorder without an HTTP listener; renderings go to the log
fn install_metrics() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_LATENCY.to_string()), LATENCY_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full(TEST_RESULTS.to_string()), TEST_RESULT_BUCKETS)?
        .install_recorder()?;
    describe();
    Ok(handle)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = RuntimeConfig::from_env()?;
    let metrics_handle = install_metrics()?;

    info!("Starting AKI monitor");
    info!("   MLLP stream: {}", config.mllp_address);
    info!("   Pager: {}", config.pager_address);
    info!("   Store: {}", config.db_path.display());
    info!("   Malformed frames: {:?}", config.malformed_frame_policy);

    let store = PatientStore::open(&config.db_path)?;
    if store.history_seeded()? {
        info!("Store already seeded, skipping history load");
    } else {
        load_history(&store, &config.history_path)?;
    }

    let evaluator = Arc::new(RiskEvaluator::load(
        &config.model_path,
        &config.model_no_demographics_path,
    )?);
    info!("Risk models loaded");

    let pager = HttpPager::new(&config.pager_address, config.pager_request_timeout)?;
    info!("Pages go to {}", pager.url());
    let policy = RetryPolicy {
        max_attempts: config.pager_max_attempts,
        initial_delay: config.pager_retry_delay,
        ..RetryPolicy::default()
    };
    let dispatcher = Arc::new(AlertDispatcher::new(Arc::new(pager), policy));

    let (tx, rx) = mpsc::channel::<PageRequest>(PAGER_QUEUE_CAPACITY);
    let worker = spawn_pager_worker(rx, dispatcher, store.clone());

    let engine = MessageEngine::new(store, evaluator, tx);

    let flush_handle = metrics_handle.clone();
    let metrics_flush = tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_FLUSH_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            debug!("Metrics\n{}", flush_handle.render());
        }
    });

    let result = tokio::select! {
        result = run_with_reconnect(&config, &engine) => result,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Received Ctrl-C, shutting down"),
                Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
            }
            Ok(())
        }
    };

    // Dropping the engine closes the pager channel; wait for queued pages
    drop(engine);
    if let Err(e) = worker.await {
        error!("Pager worker panicked: {}", e);
    }

    metrics_flush.abort();
    info!("Final metrics\n{}", metrics_handle.render());
    info!("AKI monitor stopped");
    result.map_err(Into::into)
}
