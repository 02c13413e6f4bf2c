//! Model lifecycle, execution and result aggregation

pub mod aggregator;
pub mod executor;
pub mod inference;
pub mod loader;
pub mod registry;

pub use aggregator::{FindingAggregator, ScoredPrediction};
pub use executor::ModelExecutor;
pub use inference::{InferenceModel, ModelOutput, OnnxModel, RawPrediction};
pub use loader::{LoadedModel, ModelFactory, ModelLoader};
pub use registry::{ModelHandle, ModelRegistry, ReloadOverrides};
