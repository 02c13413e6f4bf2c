//! Configuration management for the inference server

use crate::types::request::Language;
use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`]
pub const CONFIG_PATH_ENV: &str = "VULN_SERVER_CONFIG";

/// Analysis types a model can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Produces per-token label scores that become findings
    Detection,
    /// Predicts a CVSS score for the whole snippet
    Severity,
    /// Generates repaired code for a marked span
    PatchSuggestion,
    /// Predicts the snippet's CWE id and CWE abstract type
    Classification,
}

/// How a model's output tensors are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// `[batch, seq, labels]` scores
    #[default]
    TokenLabels,
    /// Function probability `[batch, 2]` plus attentions `[batch, layers, seq, seq]`
    AttentionLines,
    /// `[batch, 1]` scalar
    Regression,
    /// `[batch, len]` generated token ids
    Generation,
    /// Function-level class probabilities `[batch, labels]`, optionally followed by a
    /// second head `[batch, type_labels]`
    Classification,
}

/// Execution device for an ONNX session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    /// CUDA execution provider; ONNX Runtime falls back to CPU when it is unavailable
    Cuda,
}

/// Tokenizer used to prepare a model's input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenizerConfig {
    /// `tokenizer.json` loaded with the HuggingFace tokenizers library
    Huggingface {
        path: String,
        #[serde(default = "default_bos_token")]
        bos_token: Option<String>,
        #[serde(default = "default_eos_token")]
        eos_token: Option<String>,
        #[serde(default = "default_pad_token")]
        pad_token: String,
    },
    /// Built-in code splitter with a hashed vocabulary
    Basic {
        #[serde(default = "default_vocab_size")]
        vocab_size: u32,
    },
}

fn default_bos_token() -> Option<String> {
    Some("<s>".to_string())
}

fn default_eos_token() -> Option<String> {
    Some("</s>".to_string())
}

fn default_pad_token() -> String {
    "<pad>".to_string()
}

fn default_vocab_size() -> u32 {
    50265
}

/// One model slot in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Registry key
    pub id: String,
    /// Version stamp reported in responses
    pub version: String,
    /// Path to the model file
    pub path: String,
    /// Maximum tokens per input, special tokens included
    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,
    /// Languages the model was trained on
    pub supported_languages: Vec<Language>,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub layout: OutputLayout,
    /// Label taxonomy; index 0 is the background (non-vulnerable) label
    #[serde(default)]
    pub labels: Vec<String>,
    /// Second taxonomy for classifiers with an abstract-type head
    #[serde(default)]
    pub type_labels: Vec<String>,
    /// Apply softmax to raw logits before use
    #[serde(default)]
    pub apply_softmax: bool,
    #[serde(default)]
    pub device: Device,
    /// CUDA device ordinal, only meaningful with `device = "cuda"`
    #[serde(default)]
    pub device_id: i32,
    pub tokenizer: TokenizerConfig,
    /// Startup fails if a mandatory model cannot be loaded
    #[serde(default = "default_true")]
    pub mandatory: bool,
    /// Run one forward pass before publishing the model
    #[serde(default = "default_true")]
    pub warmup: bool,
}

fn default_max_input_length() -> usize {
    512
}

fn default_capabilities() -> Vec<Capability> {
    vec![Capability::Detection]
}

fn default_true() -> bool {
    true
}

impl ModelConfig {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub nats: NatsConfig,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// NATS connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,
    /// Subject for analysis requests
    #[serde(default = "default_request_subject")]
    pub request_subject: String,
    /// Queue group shared by all server processes
    #[serde(default = "default_queue_group")]
    pub queue_group: String,
    /// Subject for admin reload commands
    #[serde(default = "default_admin_subject")]
    pub admin_subject: String,
}

fn default_request_subject() -> String {
    "vuln.analyze".to_string()
}

fn default_queue_group() -> String {
    "vuln-inference".to_string()
}

fn default_admin_subject() -> String {
    "vuln.admin.reload".to_string()
}

/// Model registry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Intra-op threads per ONNX session
    #[serde(default = "default_onnx_threads")]
    pub onnx_threads: usize,
    pub models: Vec<ModelConfig>,
}

fn default_onnx_threads() -> usize {
    1
}

/// Detection policy
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Findings below this confidence are dropped
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Largest accepted snippet, in characters
    #[serde(default = "default_max_code_chars")]
    pub max_code_chars: usize,
    /// Deadline for a whole request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_confidence_threshold() -> f64 {
    0.5
}

fn default_max_code_chars() -> usize {
    100_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            max_code_chars: default_max_code_chars(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Per-model executor queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Largest batch sent to one forward pass
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// How long the worker waits to fill a batch
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    /// Pending jobs accepted per model before rejecting
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_max_batch_size() -> usize {
    8
}

fn default_batch_window_ms() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            batch_window_ms: default_batch_window_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Requests handled concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    16
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Metrics reporting configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Seconds between summary reports; 0 disables the reporter
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

fn default_report_interval_secs() -> u64 {
    60
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: default_report_interval_secs(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path, honoring [`CONFIG_PATH_ENV`]
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_path(path)
    }

    /// Load configuration from a specific path.
    ///
    /// Environment overrides use `VULN_SERVER_<SECTION>__<KEY>`, e.g.
    /// `VULN_SERVER_DETECTION__CONFIDENCE_THRESHOLD`.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("VULN_SERVER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot serve
    pub fn validate(&self) -> Result<()> {
        let threshold = self.detection.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            bail!("detection.confidence_threshold must be within [0, 1], got {threshold}");
        }
        if self.detection.max_code_chars == 0 {
            bail!("detection.max_code_chars must be positive");
        }
        if self.executor.max_batch_size == 0 || self.executor.queue_capacity == 0 {
            bail!("executor.max_batch_size and executor.queue_capacity must be positive");
        }
        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be positive");
        }

        let mut seen = HashSet::new();
        for model in &self.registry.models {
            if !seen.insert(model.id.as_str()) {
                bail!("duplicate model id '{}'", model.id);
            }
            validate_model(model)?;
        }
        Ok(())
    }
}

/// Per-model consistency checks, shared with reload
pub fn validate_model(model: &ModelConfig) -> Result<()> {
    if model.max_input_length < 3 {
        bail!("model '{}': max_input_length must be at least 3", model.id);
    }
    if model.supported_languages.is_empty() {
        bail!("model '{}': supported_languages is empty", model.id);
    }
    if model.has_capability(Capability::Detection) {
        if model.labels.len() < 2 {
            bail!(
                "model '{}': detection models need a background label and at least one category",
                model.id
            );
        }
        if matches!(
            model.layout,
            OutputLayout::Regression | OutputLayout::Generation | OutputLayout::Classification
        ) {
            bail!("model '{}': layout {:?} cannot serve detection", model.id, model.layout);
        }
    }
    if model.has_capability(Capability::Severity) && model.layout != OutputLayout::Regression {
        bail!("model '{}': severity models need the regression layout", model.id);
    }
    if model.has_capability(Capability::PatchSuggestion) && model.layout != OutputLayout::Generation
    {
        bail!("model '{}': patch_suggestion models need the generation layout", model.id);
    }
    if model.has_capability(Capability::Classification) {
        if model.layout != OutputLayout::Classification {
            bail!("model '{}': classification models need the classification layout", model.id);
        }
        if model.labels.is_empty() {
            bail!("model '{}': classification models need labels", model.id);
        }
    }
    if model.device_id < 0 {
        bail!("model '{}': device_id must not be negative", model.id);
    }
    if model.device == Device::Cpu && model.device_id != 0 {
        bail!("model '{}': device_id is only valid with device = \"cuda\"", model.id);
    }
    Ok(())
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                request_subject: default_request_subject(),
                queue_group: default_queue_group(),
                admin_subject: default_admin_subject(),
            },
            registry: RegistryConfig {
                onnx_threads: 1,
                models: Vec::new(),
            },
            detection: DetectionConfig::default(),
            executor: ExecutorConfig::default(),
            pipeline: PipelineConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn line_model() -> ModelConfig {
        ModelConfig {
            id: "line".to_string(),
            version: "1.0".to_string(),
            path: "models/line_model.onnx".to_string(),
            max_input_length: 512,
            supported_languages: vec![Language::C, Language::Cpp],
            capabilities: vec![Capability::Detection],
            layout: OutputLayout::AttentionLines,
            labels: vec!["benign".to_string(), "CWE-787".to_string()],
            type_labels: Vec::new(),
            apply_softmax: false,
            device: Device::Cpu,
            device_id: 0,
            tokenizer: TokenizerConfig::Basic { vocab_size: 1000 },
            mandatory: true,
            warmup: true,
        }
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.nats.url, "nats://localhost:4222");
        assert_eq!(config.nats.request_subject, "vuln.analyze");
        assert_eq!(config.detection.confidence_threshold, 0.5);
        assert_eq!(config.executor.max_batch_size, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_model_ids_rejected() {
        let mut config = AppConfig::default();
        config.registry.models = vec![line_model(), line_model()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_detection_model_needs_labels() {
        let mut model = line_model();
        model.labels = vec!["benign".to_string()];
        assert!(validate_model(&model).is_err());
    }

    #[test]
    fn test_device_settings_validated() {
        let mut model = line_model();
        model.device_id = 1;
        assert!(validate_model(&model).is_err());

        model.device = Device::Cuda;
        assert!(validate_model(&model).is_ok());

        model.device_id = -1;
        assert!(validate_model(&model).is_err());
    }

    #[test]
    fn test_classifier_needs_classification_layout() {
        let mut model = line_model();
        model.capabilities = vec![Capability::Classification];
        model.labels = vec!["CWE-787".to_string(), "CWE-119".to_string()];
        assert!(validate_model(&model).is_err());

        model.layout = OutputLayout::Classification;
        assert!(validate_model(&model).is_ok());

        model.labels.clear();
        assert!(validate_model(&model).is_err());
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config = AppConfig::default();
        config.detection.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let toml = r#"
            [nats]
            url = "nats://nats:4222"

            [registry]
            onnx_threads = 2

            [[registry.models]]
            id = "line"
            version = "2024.1"
            path = "models/line_model.onnx"
            supported_languages = ["c", "cpp"]
            layout = "attention_lines"
            labels = ["benign", "CWE-119"]
            tokenizer = { kind = "huggingface", path = "inference-common/tokenizer.json" }

            [[registry.models]]
            id = "sev"
            version = "2024.1"
            path = "models/sev_model.onnx"
            supported_languages = ["c"]
            capabilities = ["severity"]
            layout = "regression"
            mandatory = false
            device = "cuda"
            device_id = 1
            tokenizer = { kind = "basic" }

            [detection]
            confidence_threshold = 0.6
        "#;

        let path = std::env::temp_dir().join(format!("vuln-config-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(toml.as_bytes()).unwrap();

        let config = AppConfig::load_from_path(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.registry.onnx_threads, 2);
        assert_eq!(config.registry.models.len(), 2);
        assert_eq!(config.detection.confidence_threshold, 0.6);
        assert_eq!(config.detection.request_timeout_ms, 10_000);

        let line = &config.registry.models[0];
        assert_eq!(line.layout, OutputLayout::AttentionLines);
        assert_eq!(line.capabilities, vec![Capability::Detection]);
        assert!(line.mandatory);
        match &line.tokenizer {
            TokenizerConfig::Huggingface { pad_token, bos_token, .. } => {
                assert_eq!(pad_token, "<pad>");
                assert_eq!(bos_token.as_deref(), Some("<s>"));
            }
            other => panic!("unexpected tokenizer {other:?}"),
        }

        let sev = &config.registry.models[1];
        assert!(!sev.mandatory);
        assert_eq!(sev.device, Device::Cuda);
        assert_eq!(sev.device_id, 1);
        assert_eq!(line.device, Device::Cpu);
        assert_eq!(sev.tokenizer, TokenizerConfig::Basic { vocab_size: 50265 });
    }
}
