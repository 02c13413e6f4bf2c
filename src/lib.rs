//! Vulnerability Inference Server Library
//!
//! Serves source-code vulnerability predictions from resident ML models:
//! tokenization, batched model execution, finding aggregation and response
//! assembly behind a NATS request/reply interface.

pub mod admin;
pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod preprocessor;
pub mod producer;
pub mod tokenizer;
pub mod types;

pub use config::AppConfig;
pub use consumer::RequestConsumer;
pub use error::{ErrorKind, PipelineError, StructuredError};
pub use models::registry::{ModelHandle, ModelRegistry};
pub use orchestrator::Analyzer;
pub use producer::{AnalyzeReply, ReplyPublisher};
pub use types::{InferenceRequest, InferenceResponse, Language, VulnerabilityFinding};
