//! Model registry: owns every loaded model and publishes read-only handles.
//!
//! Handles are shared as `Arc<ModelHandle>`. A reload builds and warms a complete new
//! handle before swapping it into the map, so a request that already captured the old
//! handle finishes on the old weights. The old worker thread exits when the last
//! reference goes away and its queue is empty.

use crate::config::{validate_model, AppConfig, Capability, ExecutorConfig, ModelConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::PipelineMetrics;
use crate::models::executor::ModelExecutor;
use crate::models::inference::RawPrediction;
use crate::models::loader::ModelFactory;
use crate::preprocessor::ModelInput;
use crate::tokenizer::SourceTokenizer;
use crate::types::request::Language;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One loaded model
pub struct ModelHandle {
    config: ModelConfig,
    tokenizer: Arc<dyn SourceTokenizer>,
    executor: ModelExecutor,
    loaded_at: DateTime<Utc>,
}

impl ModelHandle {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn labels(&self) -> &[String] {
        &self.config.labels
    }

    pub fn max_input_length(&self) -> usize {
        self.config.max_input_length
    }

    pub fn tokenizer(&self) -> &dyn SourceTokenizer {
        self.tokenizer.as_ref()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn supports_language(&self, language: Language) -> bool {
        self.config.supported_languages.contains(&language)
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.config.has_capability(capability)
    }

    /// Run one input through this model's executor
    pub async fn infer(&self, input: ModelInput) -> PipelineResult<RawPrediction> {
        self.executor.infer(input).await
    }

    /// One forward pass over a framing-only sequence
    async fn warm_up(&self) -> Result<()> {
        let input = ModelInput::framing_only(self.max_input_length(), self.tokenizer.special_tokens());
        self.infer(input)
            .await
            .map_err(|e| anyhow!("warm-up failed for model {}: {}", self.id(), e))?;
        info!(model = %self.id(), version = %self.version(), "Model warmed up");
        Ok(())
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.config.id)
            .field("version", &self.config.version)
            .field("capabilities", &self.config.capabilities)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// Optional replacements applied to a model's configuration on reload
#[derive(Debug, Clone, Default)]
pub struct ReloadOverrides {
    pub path: Option<String>,
    pub version: Option<String>,
}

/// Process-scoped owner of all loaded models
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<ModelHandle>>>,
    /// Every configured model, loaded or not, as last successfully (re)loaded.
    /// Held for the whole of a reload, which serializes reloads.
    configured: Mutex<HashMap<String, ModelConfig>>,
    /// Set by `shutdown`; checked under the map's write lock
    closed: AtomicBool,
    factory: Arc<dyn ModelFactory>,
    executor_config: ExecutorConfig,
    metrics: Arc<PipelineMetrics>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("closed", &self.closed)
            .field("executor_config", &self.executor_config)
            .finish_non_exhaustive()
    }
}

impl ModelRegistry {
    /// Load and warm every configured model.
    ///
    /// A mandatory model that fails aborts the load; optional ones are skipped.
    pub async fn load(
        config: &AppConfig,
        factory: Arc<dyn ModelFactory>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self> {
        let mut models = HashMap::new();

        for model in &config.registry.models {
            validate_model(model)?;
            match build_handle(&factory, model.clone(), &config.executor, &metrics).await {
                Ok(handle) => {
                    models.insert(model.id.clone(), handle);
                }
                Err(e) if model.mandatory => {
                    return Err(e.context(format!("Failed to load mandatory model {}", model.id)));
                }
                Err(e) => {
                    warn!(model = %model.id, error = %format!("{e:#}"), "Failed to load optional model, skipping");
                }
            }
        }

        if models.is_empty() {
            bail!("No models loaded");
        }

        info!(count = models.len(), "Loaded {} models", models.len());

        let configured = config
            .registry
            .models
            .iter()
            .map(|model| (model.id.clone(), model.clone()))
            .collect();

        Ok(Self {
            models: RwLock::new(models),
            configured: Mutex::new(configured),
            closed: AtomicBool::new(false),
            factory,
            executor_config: config.executor.clone(),
            metrics,
        })
    }

    /// Look up a model by id
    pub fn get(&self, model_id: &str) -> PipelineResult<Arc<ModelHandle>> {
        self.read()
            .get(model_id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownModel(model_id.to_string()))
    }

    /// All published handles, ordered by id
    pub fn handles(&self) -> Vec<Arc<ModelHandle>> {
        let mut handles: Vec<_> = self.read().values().cloned().collect();
        handles.sort_by(|a, b| a.id().cmp(b.id()));
        handles
    }

    /// Handles with `capability` that support `language`, ordered by id
    pub fn handles_with(&self, capability: Capability, language: Language) -> Vec<Arc<ModelHandle>> {
        self.handles()
            .into_iter()
            .filter(|h| h.has_capability(capability) && h.supports_language(language))
            .collect()
    }

    /// First handle (by id) with `capability` that supports `language`
    pub fn first_with(&self, capability: Capability, language: Language) -> Option<Arc<ModelHandle>> {
        self.handles_with(capability, language).into_iter().next()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Load a fresh instance of `model_id` and publish it in place of the current one.
    ///
    /// Any configured model can be reloaded, including an optional one that failed at
    /// startup. Reloads run one at a time. The current handle stays published until the
    /// new one has loaded and warmed up; on failure nothing changes.
    pub async fn reload(&self, model_id: &str, overrides: ReloadOverrides) -> Result<Arc<ModelHandle>> {
        let mut configured = self.configured.lock().await;

        let current = self.read().get(model_id).cloned();
        let mut model = configured
            .get(model_id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownModel(model_id.to_string()))?;
        if let Some(path) = overrides.path {
            model.path = path;
        }
        if let Some(version) = overrides.version {
            model.version = version;
        }
        validate_model(&model)?;

        info!(
            model = %model_id,
            from_version = %current.as_ref().map_or("unloaded", |h| h.version()),
            to_version = %model.version,
            "Reloading model"
        );

        let handle = build_handle(&self.factory, model.clone(), &self.executor_config, &self.metrics)
            .await
            .with_context(|| format!("Failed to reload model {model_id}"))?;

        {
            let mut models = self.write();
            if self.closed.load(Ordering::Acquire) {
                bail!("Model registry is shut down, reload of {model_id} discarded");
            }
            models.insert(model_id.to_string(), handle.clone());
        }
        configured.insert(model_id.to_string(), model);

        info!(model = %model_id, version = %handle.version(), "Model reloaded");
        Ok(handle)
    }

    /// Unpublish every handle; workers exit once their last holders finish.
    ///
    /// Reloads that finish afterwards are discarded.
    pub fn shutdown(&self) {
        let mut models = self.write();
        self.closed.store(true, Ordering::Release);
        let drained: Vec<_> = models.drain().collect();
        drop(models);
        info!(count = drained.len(), "Model registry shut down");
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ModelHandle>>> {
        self.models.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ModelHandle>>> {
        self.models.write().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn build_handle(
    factory: &Arc<dyn ModelFactory>,
    model: ModelConfig,
    executor_config: &ExecutorConfig,
    metrics: &Arc<PipelineMetrics>,
) -> Result<Arc<ModelHandle>> {
    let loader = factory.clone();
    let load_config = model.clone();
    let loaded = tokio::task::spawn_blocking(move || loader.load(&load_config))
        .await
        .context("Model load task panicked")??;

    let executor = ModelExecutor::spawn(
        &model.id,
        &model.version,
        loaded.backend,
        executor_config,
        metrics.clone(),
    )?;

    let handle = Arc::new(ModelHandle {
        config: model,
        tokenizer: loaded.tokenizer,
        executor,
        loaded_at: Utc::now(),
    });

    if handle.config.warmup {
        handle.warm_up().await?;
    }

    Ok(handle)
}
