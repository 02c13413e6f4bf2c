//! Performance metrics and statistics tracking for the inference pipeline.

use crate::error::ErrorKind;
use crate::types::finding::InferenceResponse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics collector for pipeline performance
pub struct PipelineMetrics {
    /// Requests that reached `Completed`
    pub requests_completed: AtomicU64,
    /// Requests that reached `Errored`
    pub requests_failed: AtomicU64,
    /// Completed requests where at least one targeted model failed
    pub degraded_responses: AtomicU64,
    /// Findings returned across all requests
    pub findings_returned: AtomicU64,
    /// Errors by kind
    errors_by_kind: RwLock<HashMap<ErrorKind, u64>>,
    /// End-to-end request times (in microseconds)
    processing_times: RwLock<Vec<u64>>,
    /// Forward pass times per model (in microseconds)
    model_times: RwLock<HashMap<String, Vec<u64>>>,
    /// Batch sizes per model
    batch_sizes: RwLock<HashMap<String, Vec<usize>>>,
    /// Finding confidence distribution buckets
    confidence_buckets: RwLock<[u64; 10]>,
    /// Start time for rate calculation
    start_time: Instant,
}

impl PipelineMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            requests_completed: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            degraded_responses: AtomicU64::new(0),
            findings_returned: AtomicU64::new(0),
            errors_by_kind: RwLock::new(HashMap::new()),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            model_times: RwLock::new(HashMap::new()),
            batch_sizes: RwLock::new(HashMap::new()),
            confidence_buckets: RwLock::new([0; 10]),
            start_time: Instant::now(),
        }
    }

    /// Record a completed request
    pub fn record_completed(&self, processing_time: Duration, response: &InferenceResponse) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        self.findings_returned
            .fetch_add(response.findings.len() as u64, Ordering::Relaxed);
        if response.is_degraded() {
            self.degraded_responses.fetch_add(1, Ordering::Relaxed);
        }
        self.record_processing_time(processing_time);

        if let Ok(mut buckets) = self.confidence_buckets.write() {
            for finding in &response.findings {
                let bucket = (finding.confidence * 10.0).min(9.0).max(0.0) as usize;
                buckets[bucket] += 1;
            }
        }
    }

    /// Record a request that ended in an error
    pub fn record_error(&self, processing_time: Duration, kind: ErrorKind) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.record_processing_time(processing_time);

        if let Ok(mut by_kind) = self.errors_by_kind.write() {
            *by_kind.entry(kind).or_insert(0) += 1;
        }
    }

    fn record_processing_time(&self, processing_time: Duration) {
        if let Ok(mut times) = self.processing_times.write() {
            times.push(processing_time.as_micros() as u64);
            // Keep only last 10000 for memory efficiency
            if times.len() > 10000 {
                times.drain(0..5000);
            }
        }
    }

    /// Record one batched forward pass
    pub fn record_batch(&self, model_id: &str, batch_size: usize, duration: Duration) {
        if let Ok(mut times) = self.model_times.write() {
            let model_times = times.entry(model_id.to_string()).or_default();
            model_times.push(duration.as_micros() as u64);
            // Keep only last 1000 per model
            if model_times.len() > 1000 {
                model_times.drain(0..500);
            }
        }

        if let Ok(mut sizes) = self.batch_sizes.write() {
            let model_sizes = sizes.entry(model_id.to_string()).or_default();
            model_sizes.push(batch_size);
            if model_sizes.len() > 1000 {
                model_sizes.drain(0..500);
            }
        }
    }

    /// Get processing time statistics
    pub fn get_processing_stats(&self) -> ProcessingStats {
        let times = self
            .processing_times
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if times.is_empty() {
            return ProcessingStats::default();
        }

        let mut sorted: Vec<u64> = times.clone();
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len();

        ProcessingStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: sorted[count / 2],
            p95_us: sorted[(count as f64 * 0.95) as usize],
            p99_us: sorted[(count as f64 * 0.99) as usize],
            max_us: sorted[count - 1],
        }
    }

    /// Get per-model forward pass stats
    pub fn get_model_stats(&self) -> HashMap<String, ModelStats> {
        let times = self.model_times.read().unwrap_or_else(PoisonError::into_inner);
        let sizes = self.batch_sizes.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = HashMap::new();

        for (model, model_times) in times.iter() {
            if model_times.is_empty() {
                continue;
            }

            let mut sorted: Vec<u64> = model_times.clone();
            sorted.sort_unstable();

            let sum: u64 = sorted.iter().sum();
            let count = sorted.len();

            let avg_batch_size = sizes
                .get(model)
                .filter(|s| !s.is_empty())
                .map(|s| s.iter().sum::<usize>() as f64 / s.len() as f64)
                .unwrap_or(0.0);

            stats.insert(
                model.clone(),
                ModelStats {
                    batches: count as u64,
                    mean_us: sum / count as u64,
                    p50_us: sorted[count / 2],
                    p99_us: sorted[(count as f64 * 0.99) as usize],
                    avg_batch_size,
                },
            );
        }

        stats
    }

    /// Get current throughput (requests per second)
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let total = self.requests_completed.load(Ordering::Relaxed)
            + self.requests_failed.load(Ordering::Relaxed);
        if elapsed > 0.0 {
            total as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get finding confidence distribution
    pub fn get_confidence_distribution(&self) -> [u64; 10] {
        *self
            .confidence_buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Get errors by kind
    pub fn get_errors_by_kind(&self) -> HashMap<ErrorKind, u64> {
        self.errors_by_kind
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Print summary statistics
    pub fn print_summary(&self) {
        let completed = self.requests_completed.load(Ordering::Relaxed);
        let failed = self.requests_failed.load(Ordering::Relaxed);
        let degraded = self.degraded_responses.load(Ordering::Relaxed);
        let findings = self.findings_returned.load(Ordering::Relaxed);
        let total = completed + failed;
        let error_rate = if total > 0 {
            (failed as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        let processing = self.get_processing_stats();
        let throughput = self.get_throughput();
        let errors_by_kind = self.get_errors_by_kind();
        let confidence_dist = self.get_confidence_distribution();

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║          VULNERABILITY INFERENCE SERVER - METRICS SUMMARY    ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Requests Completed: {:>8}  │  Throughput: {:>6.1} req/s    ║",
            completed, throughput
        );
        info!(
            "║ Requests Failed:    {:>8}  │  Error Rate: {:>6.1}%        ║",
            failed, error_rate
        );
        info!(
            "║ Degraded Responses: {:>8}  │  Findings:   {:>8}         ║",
            degraded, findings
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Request Time (μs): mean={:>6} p50={:>6} p95={:>6} p99={:>6} ║",
            processing.mean_us, processing.p50_us, processing.p95_us, processing.p99_us
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Errors by Kind:                                              ║");
        for (kind, count) in &errors_by_kind {
            let pct = if failed > 0 {
                (*count as f64 / failed as f64) * 100.0
            } else {
                0.0
            };
            info!("║   {:16}: {:>6} ({:>5.1}%)                          ║", kind.as_str(), count, pct);
        }
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Finding Confidence Distribution:                             ║");
        let bucket_total: u64 = confidence_dist.iter().sum();
        for (i, &count) in confidence_dist.iter().enumerate() {
            let pct = if bucket_total > 0 {
                (count as f64 / bucket_total as f64) * 100.0
            } else {
                0.0
            };
            let bar_len = (pct / 2.0) as usize;
            let bar: String = "█".repeat(bar_len.min(20));
            info!(
                "║   {:.1}-{:.1}: {:>6} ({:>5.1}%) {}",
                i as f64 / 10.0,
                (i + 1) as f64 / 10.0,
                count,
                pct,
                bar
            );
        }
        info!("╚══════════════════════════════════════════════════════════════╝");

        let model_stats = self.get_model_stats();
        if !model_stats.is_empty() {
            info!("Model Forward Times (μs):");
            for (model, stats) in &model_stats {
                info!(
                    "  {}: mean={} p50={} p99={} (batches={}, avg batch={:.1})",
                    model, stats.mean_us, stats.p50_us, stats.p99_us, stats.batches, stats.avg_batch_size
                );
            }
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Request time statistics
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Model-specific statistics
#[derive(Debug)]
pub struct ModelStats {
    pub batches: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub avg_batch_size: f64,
}

/// Periodic metrics reporter
pub struct MetricsReporter {
    metrics: Arc<PipelineMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<PipelineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}
