//! In-process fake models for driving the pipeline without model files
#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vuln_inference_server::config::{
    AppConfig, Capability, Device, ModelConfig, OutputLayout, TokenizerConfig,
};
use vuln_inference_server::metrics::PipelineMetrics;
use vuln_inference_server::models::inference::{InferenceModel, ModelOutput};
use vuln_inference_server::models::loader::{LoadedModel, ModelFactory};
use vuln_inference_server::models::registry::ModelRegistry;
use vuln_inference_server::orchestrator::Analyzer;
use vuln_inference_server::preprocessor::ModelInput;
use vuln_inference_server::tokenizer::BasicTokenizer;
use vuln_inference_server::types::Language;

pub const VOCAB: u32 = 50_265;

pub const LABELS: &[&str] = &[
    "benign",
    "CWE-120 buffer overflow",
    "CWE-242 dangerous function",
    "CWE-787 out-of-bounds write",
];

/// Seven-line C function with four dangerous calls on lines 3 to 6
pub const SNIPPET: &str = "void f(char *input) {\n  char buf[8];\n  strcpy(buf, input);\n  gets(buf);\n  sprintf(buf, \"%s\", input);\n  memcpy(buf, input, 64);\n}";

fn tokenizer() -> BasicTokenizer {
    BasicTokenizer::new(VOCAB).expect("valid vocab")
}

/// Scores tokens matching known dangerous identifiers; everything else is background
pub struct KeywordDetector {
    hits: HashMap<i64, (usize, f32)>,
    label_count: usize,
    delay: Duration,
    function_probability: Option<f32>,
}

impl KeywordDetector {
    pub fn new(hits: &[(&str, usize, f32)]) -> Self {
        let tokenizer = tokenizer();
        Self {
            hits: hits
                .iter()
                .map(|&(piece, label, score)| (i64::from(tokenizer.piece_id(piece)), (label, score)))
                .collect(),
            label_count: LABELS.len(),
            delay: Duration::ZERO,
            function_probability: None,
        }
    }

    /// The four calls in [`SNIPPET`]
    pub fn standard() -> Self {
        Self::new(&[
            ("strcpy", 1, 0.92),
            ("gets", 2, 0.95),
            ("sprintf", 1, 0.8),
            ("memcpy", 3, 0.8),
        ])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report a function-level `[benign, vulnerable]` verdict alongside the token scores,
    /// the way the attention line model does
    pub fn with_function_probability(mut self, vulnerable: f32) -> Self {
        self.function_probability = Some(vulnerable);
        self
    }

    fn score(&self, input: &ModelInput) -> Vec<Vec<f32>> {
        input
            .input_ids
            .iter()
            .zip(&input.attention_mask)
            .map(|(id, &mask)| {
                let mut row = vec![0.0; self.label_count];
                match self.hits.get(id) {
                    Some(&(label, score)) if mask == 1 => {
                        row[0] = 1.0 - score;
                        row[label] = score;
                    }
                    _ => {
                        row[0] = 0.9;
                        row[1] = 0.1;
                    }
                }
                row
            })
            .collect()
    }
}

impl InferenceModel for KeywordDetector {
    fn forward(&mut self, batch: &[ModelInput]) -> Result<Vec<ModelOutput>> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(batch
            .iter()
            .map(|input| match self.function_probability {
                Some(p) => ModelOutput::LineScores {
                    tokens: self.score(input),
                    function_probs: vec![1.0 - p, p],
                },
                None => ModelOutput::TokenScores(self.score(input)),
            })
            .collect())
    }
}

/// Always fails the forward pass
pub struct FailingModel;

impl InferenceModel for FailingModel {
    fn forward(&mut self, _batch: &[ModelInput]) -> Result<Vec<ModelOutput>> {
        bail!("CUDA error: out of memory")
    }
}

/// Constant CVSS score
pub struct SeverityModel(pub f32);

impl InferenceModel for SeverityModel {
    fn forward(&mut self, batch: &[ModelInput]) -> Result<Vec<ModelOutput>> {
        Ok(batch.iter().map(|_| ModelOutput::Score(self.0)).collect())
    }
}

/// Constant repair text
pub struct PatchModel(pub &'static str);

impl InferenceModel for PatchModel {
    fn forward(&mut self, batch: &[ModelInput]) -> Result<Vec<ModelOutput>> {
        Ok(batch
            .iter()
            .map(|_| ModelOutput::Text(self.0.to_string()))
            .collect())
    }
}

/// Fixed CWE id and abstract-type probabilities
pub struct CweClassifier {
    pub ids: Vec<f32>,
    pub types: Vec<f32>,
}

impl InferenceModel for CweClassifier {
    fn forward(&mut self, batch: &[ModelInput]) -> Result<Vec<ModelOutput>> {
        Ok(batch
            .iter()
            .map(|_| ModelOutput::Classes(vec![self.ids.clone(), self.types.clone()]))
            .collect())
    }
}

/// Sleeps before delegating, to outlast request deadlines
pub struct Delayed<M> {
    pub inner: M,
    pub delay: Duration,
}

impl<M: InferenceModel> InferenceModel for Delayed<M> {
    fn forward(&mut self, batch: &[ModelInput]) -> Result<Vec<ModelOutput>> {
        thread::sleep(self.delay);
        self.inner.forward(batch)
    }
}

type Builder = Arc<dyn Fn(&ModelConfig) -> Result<Box<dyn InferenceModel>> + Send + Sync>;

/// Builds fake backends by model id
#[derive(Default)]
pub struct FakeFactory {
    builders: HashMap<String, Builder>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, id: &str, builder: F) -> Self
    where
        F: Fn(&ModelConfig) -> Result<Box<dyn InferenceModel>> + Send + Sync + 'static,
    {
        self.builders.insert(id.to_string(), Arc::new(builder));
        self
    }
}

impl ModelFactory for FakeFactory {
    fn load(&self, model: &ModelConfig) -> Result<LoadedModel> {
        let builder = self
            .builders
            .get(&model.id)
            .ok_or_else(|| anyhow!("no fake backend for model {}", model.id))?;
        Ok(LoadedModel {
            backend: builder(model)?,
            tokenizer: Arc::new(tokenizer()),
        })
    }
}

fn model(id: &str, capability: Capability, layout: OutputLayout) -> ModelConfig {
    ModelConfig {
        id: id.to_string(),
        version: "1.0".to_string(),
        path: format!("models/{id}.onnx"),
        max_input_length: 128,
        supported_languages: vec![Language::C, Language::Cpp],
        capabilities: vec![capability],
        layout,
        labels: Vec::new(),
        type_labels: Vec::new(),
        apply_softmax: false,
        device: Device::Cpu,
        device_id: 0,
        tokenizer: TokenizerConfig::Basic { vocab_size: VOCAB },
        mandatory: true,
        warmup: true,
    }
}

pub fn detection_model(id: &str) -> ModelConfig {
    ModelConfig {
        labels: LABELS.iter().map(|l| l.to_string()).collect(),
        ..model(id, Capability::Detection, OutputLayout::TokenLabels)
    }
}

/// Detection model that scores lines with a single generic category
pub fn line_model(id: &str) -> ModelConfig {
    ModelConfig {
        labels: vec!["benign".to_string(), "vulnerable".to_string()],
        ..model(id, Capability::Detection, OutputLayout::AttentionLines)
    }
}

pub const CWE_IDS: &[&str] = &["CWE-787", "CWE-119", "CWE-20"];
pub const CWE_TYPES: &[&str] = &["Base", "Class", "Variant"];

pub fn classifier_model(id: &str) -> ModelConfig {
    ModelConfig {
        labels: CWE_IDS.iter().map(|l| l.to_string()).collect(),
        type_labels: CWE_TYPES.iter().map(|l| l.to_string()).collect(),
        ..model(id, Capability::Classification, OutputLayout::Classification)
    }
}

pub fn severity_model(id: &str) -> ModelConfig {
    model(id, Capability::Severity, OutputLayout::Regression)
}

pub fn patch_model(id: &str) -> ModelConfig {
    model(id, Capability::PatchSuggestion, OutputLayout::Generation)
}

pub fn app_config(models: Vec<ModelConfig>) -> AppConfig {
    let mut config = AppConfig::default();
    config.registry.models = models;
    config
}

pub async fn registry(config: &AppConfig, factory: FakeFactory) -> Arc<ModelRegistry> {
    Arc::new(
        ModelRegistry::load(config, Arc::new(factory), Arc::new(PipelineMetrics::new()))
            .await
            .expect("registry loads"),
    )
}

pub async fn analyzer(config: &AppConfig, factory: FakeFactory) -> Analyzer {
    let registry = registry(config, factory).await;
    Analyzer::new(registry, &config.detection, Arc::new(PipelineMetrics::new()))
}

/// Analyzer with one standard keyword detector named "line"
pub async fn single_detector() -> Analyzer {
    let config = app_config(vec![detection_model("line")]);
    let factory = FakeFactory::new().with("line", |_| Ok(Box::new(KeywordDetector::standard())));
    analyzer(&config, factory).await
}
