//! Vulnerability Inference Server - Main Entry Point
//!
//! Loads the configured models, answers analysis requests arriving over NATS, and
//! applies admin reload commands. Requests are processed in parallel up to
//! `pipeline.workers`.

use anyhow::Result;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vuln_inference_server::{
    admin::handle_admin_payload,
    config::{AppConfig, LoggingConfig},
    consumer::{decode_request, RequestConsumer},
    error::ErrorKind,
    metrics::{MetricsReporter, PipelineMetrics},
    models::{loader::ModelLoader, registry::ModelRegistry},
    orchestrator::Analyzer,
    producer::{AnalyzeReply, ReplyPublisher},
};

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("vuln_inference_server={}", logging.level))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format.as_str() {
        "pretty" => builder.pretty().init(),
        _ => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;
    init_tracing(&config.logging)?;

    info!("Starting Vulnerability Inference Server");
    info!(
        "Detection threshold: {:.2}, max code size: {} chars, request timeout: {}ms",
        config.detection.confidence_threshold,
        config.detection.max_code_chars,
        config.detection.request_timeout_ms
    );

    // Initialize metrics
    let metrics = Arc::new(PipelineMetrics::new());

    // Load every model; a mandatory failure ends the process here
    let loader = Arc::new(ModelLoader::with_threads(config.registry.onnx_threads)?);
    let registry = Arc::new(ModelRegistry::load(&config, loader, metrics.clone()).await?);
    info!(
        "Model registry initialized with {} models: {:?}",
        registry.len(),
        registry
            .handles()
            .iter()
            .map(|h| format!("{}@{}", h.id(), h.version()))
            .collect::<Vec<_>>()
    );

    let analyzer = Arc::new(Analyzer::new(
        registry.clone(),
        &config.detection,
        metrics.clone(),
    ));

    // Connect to NATS
    let client = async_nats::connect(&config.nats.url).await?;
    info!("Connected to NATS at {}", config.nats.url);

    let consumer = RequestConsumer::new(client.clone(), &config.nats);
    let publisher = ReplyPublisher::new(client.clone());

    let num_workers = config.pipeline.workers;
    info!(
        "Starting request processing loop with {} parallel workers",
        num_workers
    );

    // Semaphore to limit concurrent processing
    let semaphore = Arc::new(Semaphore::new(num_workers));
    let processed_count = Arc::new(AtomicU64::new(0));

    if config.metrics.report_interval_secs > 0 {
        let reporter = MetricsReporter::new(metrics.clone(), config.metrics.report_interval_secs);
        tokio::spawn(reporter.start());
    }

    let mut requests = consumer.subscribe().await?;
    let mut admin = consumer.subscribe_admin().await?;
    info!(
        "Listening for requests on {} and reload commands on {}",
        consumer.subject(),
        config.nats.admin_subject
    );

    // Reloads are tracked so none can publish a model after the registry shuts down
    let mut reloads = JoinSet::new();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received, draining in-flight requests");
                break;
            }
            Some(message) = requests.next() => {
                // Acquire permit (limits concurrent tasks)
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };

                let analyzer = analyzer.clone();
                let publisher = publisher.clone();
                let metrics = metrics.clone();
                let processed_count = processed_count.clone();

                tokio::spawn(async move {
                    let reply = match decode_request(&message.payload) {
                        Ok(request) => AnalyzeReply::from(analyzer.analyze(request).await),
                        Err(error) => {
                            warn!(error = %error, "Failed to deserialize request");
                            metrics.record_error(Duration::ZERO, ErrorKind::BadRequest);
                            AnalyzeReply::Errored { error }
                        }
                    };

                    match message.reply {
                        Some(subject) => {
                            if let Err(e) = publisher.publish(subject, &reply).await {
                                error!(
                                    request_id = reply.request_id().unwrap_or("-"),
                                    error = %e,
                                    "Failed to publish reply"
                                );
                            }
                        }
                        None => warn!(
                            request_id = reply.request_id().unwrap_or("-"),
                            "Request has no reply subject, dropping result"
                        ),
                    }

                    let count = processed_count.fetch_add(1, Ordering::Relaxed) + 1;

                    // Log progress every 100 requests
                    if count % 100 == 0 {
                        let processing_stats = metrics.get_processing_stats();
                        info!(
                            processed = count,
                            throughput = format!("{:.1} req/s", metrics.get_throughput()),
                            avg_latency_us = processing_stats.mean_us,
                            p99_latency_us = processing_stats.p99_us,
                            "Processing milestone"
                        );
                    }

                    drop(permit);
                });
            }
            Some(message) = admin.next() => {
                let registry = registry.clone();
                let publisher = publisher.clone();

                reloads.spawn(async move {
                    let reply = handle_admin_payload(&registry, &message.payload).await;
                    info!(model = %reply.model_id, ok = reply.ok, version = ?reply.version, "Reload finished");
                    if let Some(subject) = message.reply {
                        if let Err(e) = publisher.publish(subject, &reply).await {
                            error!(error = %e, "Failed to publish reload reply");
                        }
                    }
                });
            }
            Some(finished) = reloads.join_next(), if !reloads.is_empty() => {
                if let Err(e) = finished {
                    error!(error = %e, "Reload task failed");
                }
            }
            else => break,
        }
    }

    // Stop accepting new work, then wait for every in-flight request
    if let Err(e) = requests.unsubscribe().await {
        warn!(error = %e, "Failed to unsubscribe from request subject");
    }
    if let Err(e) = admin.unsubscribe().await {
        warn!(error = %e, "Failed to unsubscribe from admin subject");
    }
    if semaphore.acquire_many(num_workers as u32).await.is_err() {
        warn!("Worker semaphore closed before drain completed");
    }
    while let Some(finished) = reloads.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "Reload task failed");
        }
    }
    if let Err(e) = client.flush().await {
        warn!(error = %e, "Failed to flush pending replies");
    }

    info!("Pipeline shutting down...");
    registry.shutdown();
    metrics.print_summary();

    Ok(())
}
