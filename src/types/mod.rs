//! Type definitions for the vulnerability inference server

pub mod finding;
pub mod request;

pub use finding::{
    CweClassification, FunctionVerdict, InferenceResponse, LineRange, SeverityAssessment,
    SeverityLevel, VulnerabilityFinding,
};
pub use request::{AnalysisOptions, InferenceRequest, Language};
