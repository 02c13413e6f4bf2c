//! Single-writer batching executor.
//!
//! Every loaded model is owned by one worker thread. Requests are queued on a bounded
//! channel; the worker waits for the first job, keeps collecting until the batch is
//! full or the batch window closes, runs one forward pass and fans the outputs back
//! out by position. Requesters that stopped waiting (timeout) are skipped before the
//! pass, and late results for them are dropped with their one-shot channel.

use crate::config::ExecutorConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::PipelineMetrics;
use crate::models::inference::{InferenceModel, RawPrediction};
use crate::preprocessor::ModelInput;
use anyhow::{Context, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

struct Job {
    input: ModelInput,
    reply: oneshot::Sender<PipelineResult<RawPrediction>>,
}

/// Submission side of a model's worker queue
pub struct ModelExecutor {
    model_id: String,
    sender: SyncSender<Job>,
}

impl ModelExecutor {
    /// Spawn the worker thread that takes ownership of `backend`
    pub fn spawn(
        model_id: &str,
        version: &str,
        backend: Box<dyn InferenceModel>,
        config: &ExecutorConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity);
        let worker = BatchWorker {
            model_id: model_id.to_string(),
            version: version.to_string(),
            backend,
            max_batch_size: config.max_batch_size.max(1),
            batch_window: Duration::from_millis(config.batch_window_ms),
            metrics,
        };

        thread::Builder::new()
            .name(format!("model-{model_id}-{version}"))
            .spawn(move || worker.run(receiver))
            .with_context(|| format!("Failed to spawn worker for model {model_id}"))?;

        Ok(Self {
            model_id: model_id.to_string(),
            sender,
        })
    }

    /// Queue one input and wait for its prediction
    pub async fn infer(&self, input: ModelInput) -> PipelineResult<RawPrediction> {
        let (reply, response) = oneshot::channel();

        match self.sender.try_send(Job { input, reply }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(PipelineError::Compute(format!(
                    "model {} queue is full",
                    self.model_id
                )))
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(PipelineError::Compute(format!(
                    "model {} worker has stopped",
                    self.model_id
                )))
            }
        }

        response.await.map_err(|_| {
            PipelineError::Compute(format!("model {} dropped the request", self.model_id))
        })?
    }
}

struct BatchWorker {
    model_id: String,
    version: String,
    backend: Box<dyn InferenceModel>,
    max_batch_size: usize,
    batch_window: Duration,
    metrics: Arc<PipelineMetrics>,
}

impl BatchWorker {
    fn run(mut self, receiver: Receiver<Job>) {
        info!(model = %self.model_id, version = %self.version, "Model worker started");

        while let Some(batch) = self.collect_batch(&receiver) {
            self.execute(batch);
        }

        info!(model = %self.model_id, version = %self.version, "Model worker stopped");
    }

    /// Block for the first job, then fill the batch until it is full or the window closes.
    ///
    /// Returns `None` once every sender is gone and the queue is drained.
    fn collect_batch(&self, receiver: &Receiver<Job>) -> Option<Vec<Job>> {
        let first = receiver.recv().ok()?;
        let mut batch = vec![first];
        let deadline = Instant::now() + self.batch_window;

        while batch.len() < self.max_batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match receiver.recv_timeout(remaining) {
                Ok(job) => batch.push(job),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        Some(batch)
    }

    fn execute(&mut self, batch: Vec<Job>) {
        let (inputs, replies): (Vec<ModelInput>, Vec<_>) = batch
            .into_iter()
            .filter(|job| !job.reply.is_closed())
            .map(|job| (job.input, job.reply))
            .unzip();
        if inputs.is_empty() {
            return;
        }

        let started = Instant::now();
        let backend = &mut self.backend;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| backend.forward(&inputs)));
        let elapsed = started.elapsed();
        self.metrics.record_batch(&self.model_id, inputs.len(), elapsed);

        let outputs = match outcome {
            Ok(Ok(outputs)) if outputs.len() == inputs.len() => outputs,
            Ok(Ok(outputs)) => {
                return self.fail_all(
                    replies,
                    format!(
                        "model {} returned {} outputs for {} inputs",
                        self.model_id,
                        outputs.len(),
                        inputs.len()
                    ),
                );
            }
            Ok(Err(e)) => {
                return self.fail_all(replies, format!("model {}: {:#}", self.model_id, e));
            }
            Err(_) => {
                return self.fail_all(
                    replies,
                    format!("model {} panicked during forward pass", self.model_id),
                );
            }
        };

        debug!(
            model = %self.model_id,
            batch_size = inputs.len(),
            forward_us = elapsed.as_micros() as u64,
            "Batch complete"
        );

        for (reply, output) in replies.into_iter().zip(outputs) {
            // A closed channel means the requester timed out; the result is discarded.
            let _ = reply.send(Ok(RawPrediction {
                model_id: self.model_id.clone(),
                model_version: self.version.clone(),
                output,
            }));
        }
    }

    fn fail_all(&self, replies: Vec<oneshot::Sender<PipelineResult<RawPrediction>>>, message: String) {
        error!(
            model = %self.model_id,
            batch_size = replies.len(),
            error = %message,
            "Forward pass failed"
        );
        for reply in replies {
            let _ = reply.send(Err(PipelineError::Compute(message.clone())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::inference::ModelOutput;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes the first token id as a score and records batch sizes
    struct EchoModel {
        batches: Arc<std::sync::Mutex<Vec<usize>>>,
        delay: Duration,
    }

    impl InferenceModel for EchoModel {
        fn forward(&mut self, batch: &[ModelInput]) -> Result<Vec<ModelOutput>> {
            thread::sleep(self.delay);
            self.batches.lock().unwrap().push(batch.len());
            Ok(batch
                .iter()
                .map(|input| ModelOutput::Score(input.input_ids[0] as f32))
                .collect())
        }
    }

    struct FailingModel {
        calls: Arc<AtomicUsize>,
    }

    impl InferenceModel for FailingModel {
        fn forward(&mut self, _batch: &[ModelInput]) -> Result<Vec<ModelOutput>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("device out of memory")
        }
    }

    struct ShortModel;

    impl InferenceModel for ShortModel {
        fn forward(&mut self, _batch: &[ModelInput]) -> Result<Vec<ModelOutput>> {
            Ok(Vec::new())
        }
    }

    fn input(first: i64) -> ModelInput {
        ModelInput {
            input_ids: vec![first, 2, 1],
            attention_mask: vec![1, 1, 0],
        }
    }

    fn config(max_batch_size: usize, batch_window_ms: u64) -> ExecutorConfig {
        ExecutorConfig {
            max_batch_size,
            batch_window_ms,
            queue_capacity: 64,
        }
    }

    #[tokio::test]
    async fn test_results_fan_out_by_position() {
        let batches = Arc::new(std::sync::Mutex::new(Vec::new()));
        let model = EchoModel {
            batches: batches.clone(),
            delay: Duration::ZERO,
        };
        let executor = ModelExecutor::spawn(
            "echo",
            "1",
            Box::new(model),
            &config(8, 50),
            Arc::new(PipelineMetrics::new()),
        )
        .unwrap();

        let results = futures::future::join_all((0..6).map(|i| executor.infer(input(i)))).await;

        for (i, result) in results.into_iter().enumerate() {
            let prediction = result.unwrap();
            assert_eq!(prediction.output, ModelOutput::Score(i as f32));
            assert_eq!(prediction.model_version, "1");
        }
        let batches = batches.lock().unwrap();
        assert_eq!(batches.iter().sum::<usize>(), 6);
        assert!(batches.iter().all(|&size| size <= 8));
    }

    #[tokio::test]
    async fn test_batch_size_is_capped() {
        let batches = Arc::new(std::sync::Mutex::new(Vec::new()));
        let model = EchoModel {
            batches: batches.clone(),
            delay: Duration::ZERO,
        };
        let executor = ModelExecutor::spawn(
            "echo",
            "1",
            Box::new(model),
            &config(2, 50),
            Arc::new(PipelineMetrics::new()),
        )
        .unwrap();

        let results = futures::future::join_all((0..5).map(|i| executor.infer(input(i)))).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(batches.lock().unwrap().iter().all(|&size| size <= 2));
    }

    #[tokio::test]
    async fn test_backend_error_is_compute_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = ModelExecutor::spawn(
            "broken",
            "1",
            Box::new(FailingModel { calls: calls.clone() }),
            &config(4, 0),
            Arc::new(PipelineMetrics::new()),
        )
        .unwrap();

        let err = executor.infer(input(1)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Compute(ref m) if m.contains("out of memory")));
        assert!(err.is_retryable());

        // The worker survives and keeps serving
        assert!(executor.infer(input(2)).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_output_count_mismatch_fails_batch() {
        let executor = ModelExecutor::spawn(
            "short",
            "1",
            Box::new(ShortModel),
            &config(4, 0),
            Arc::new(PipelineMetrics::new()),
        )
        .unwrap();

        let err = executor.infer(input(1)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Compute(ref m) if m.contains("0 outputs for 1 inputs")));
    }

    #[tokio::test]
    async fn test_abandoned_request_is_discarded() {
        let batches = Arc::new(std::sync::Mutex::new(Vec::new()));
        let model = EchoModel {
            batches: batches.clone(),
            delay: Duration::from_millis(100),
        };
        let executor = ModelExecutor::spawn(
            "slow",
            "1",
            Box::new(model),
            &config(1, 0),
            Arc::new(PipelineMetrics::new()),
        )
        .unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), executor.infer(input(7))).await;
        assert!(abandoned.is_err());

        // The next request gets its own result, never the abandoned one
        let prediction = executor.infer(input(3)).await.unwrap();
        assert_eq!(prediction.output, ModelOutput::Score(3.0));
    }
}
