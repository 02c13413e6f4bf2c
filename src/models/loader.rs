//! Model loading: turns a [`ModelConfig`] into a runnable backend plus its tokenizer

use crate::config::{Device, ModelConfig};
use crate::models::inference::{InferenceModel, OnnxModel};
use crate::tokenizer::{build_tokenizer, SourceTokenizer};
use anyhow::{Context, Result};
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Backend and tokenizer for one model slot
pub struct LoadedModel {
    pub backend: Box<dyn InferenceModel>,
    pub tokenizer: Arc<dyn SourceTokenizer>,
}

/// Builds model backends from configuration.
///
/// Loading runs on a blocking thread; implementations may read files and allocate
/// freely.
pub trait ModelFactory: Send + Sync {
    fn load(&self, model: &ModelConfig) -> Result<LoadedModel>;
}

/// Loader for ONNX models
pub struct ModelLoader {
    /// Number of threads for ONNX inference
    onnx_threads: usize,
}

impl ModelLoader {
    /// Create a loader with the given intra-op thread count
    pub fn with_threads(onnx_threads: usize) -> Result<Self> {
        ort::init().commit()?;
        info!(onnx_threads = onnx_threads, "ONNX Runtime initialized");
        Ok(Self { onnx_threads })
    }

    fn open_session(&self, model: &ModelConfig) -> Result<Session> {
        let path = Path::new(&model.path);
        info!(
            model = %model.id,
            path = %path.display(),
            device = ?model.device,
            threads = self.onnx_threads,
            "Loading ONNX model"
        );

        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.onnx_threads)?;

        // CUDA registration failures are logged by ONNX Runtime and the CPU provider takes over
        let builder = match model.device {
            Device::Cpu => builder.with_execution_providers([CPUExecutionProvider::default().build()])?,
            Device::Cuda => builder.with_execution_providers([
                CUDAExecutionProvider::default()
                    .with_device_id(model.device_id)
                    .build(),
                CPUExecutionProvider::default().build(),
            ])?,
        };

        builder
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))
    }
}

impl ModelFactory for ModelLoader {
    fn load(&self, model: &ModelConfig) -> Result<LoadedModel> {
        let tokenizer = build_tokenizer(&model.tokenizer)
            .with_context(|| format!("Failed to build tokenizer for model {}", model.id))?;
        let session = self.open_session(model)?;
        let backend = OnnxModel::new(
            &model.id,
            session,
            model.layout,
            model.apply_softmax,
            tokenizer.clone(),
        )?;

        info!(
            model = %model.id,
            version = %model.version,
            layout = ?model.layout,
            device = ?model.device,
            "Model loaded successfully"
        );

        Ok(LoadedModel {
            backend: Box::new(backend),
            tokenizer,
        })
    }
}
