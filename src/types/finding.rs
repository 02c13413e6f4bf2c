//! Finding and response data structures

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Version of the response contract
pub const API_VERSION: &str = "v1";

/// Inclusive, 1-based range of source lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn single(line: u32) -> Self {
        Self::new(line, line)
    }

    /// True when the two ranges share at least one line
    pub fn overlaps(&self, other: &LineRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// One reported vulnerability instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityFinding {
    /// Lines the finding covers
    pub line_range: LineRange,

    /// Category from the reporting model's label taxonomy, or the snippet's predicted
    /// CWE id when the reporting model only scores lines
    pub category: String,

    /// CWE abstract type (e.g. "Base", "Class") of `category`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwe_type: Option<String>,

    /// Confidence (0.0 - 1.0)
    pub confidence: f64,

    /// Suggested replacement for the affected code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_suggestion: Option<String>,

    /// Model that produced the finding
    pub model_id: String,
}

impl VulnerabilityFinding {
    pub fn new(line_range: LineRange, category: String, confidence: f64, model_id: String) -> Self {
        Self {
            line_range,
            category,
            confidence: confidence.clamp(0.0, 1.0),
            cwe_type: None,
            patch_suggestion: None,
            model_id,
        }
    }

    /// Ranking order: confidence descending, then line range ascending.
    ///
    /// Category and model id close the remaining ties so the order is total.
    pub fn ranking_cmp(&self, other: &Self) -> Ordering {
        other
            .confidence
            .total_cmp(&self.confidence)
            .then(self.line_range.start.cmp(&other.line_range.start))
            .then(self.line_range.end.cmp(&other.line_range.end))
            .then_with(|| self.category.cmp(&other.category))
            .then_with(|| self.model_id.cmp(&other.model_id))
    }
}

/// CVSS-derived severity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityLevel {
    /// Classify a CVSS base score
    pub fn from_cvss(score: f64) -> Self {
        if score <= 0.0 {
            SeverityLevel::None
        } else if score < 4.0 {
            SeverityLevel::Low
        } else if score < 7.0 {
            SeverityLevel::Medium
        } else if score < 9.0 {
            SeverityLevel::High
        } else {
            SeverityLevel::Critical
        }
    }
}

/// Snippet-level severity estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityAssessment {
    /// Predicted CVSS score (0.0 - 10.0)
    pub score: f64,
    pub level: SeverityLevel,
    pub model_id: String,
}

impl SeverityAssessment {
    pub fn from_score(score: f64, model_id: String) -> Self {
        let score = score.clamp(0.0, 10.0);
        Self {
            score,
            level: SeverityLevel::from_cvss(score),
            model_id,
        }
    }
}

/// Snippet-level CWE prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CweClassification {
    pub cwe_id: String,
    pub cwe_id_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwe_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwe_type_confidence: Option<f64>,
    pub model_id: String,
}

/// Function-level vulnerable/benign prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionVerdict {
    pub vulnerable: bool,
    /// Probability of the predicted verdict
    pub probability: f64,
    pub model_id: String,
}

/// Result of a completed analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub api_version: String,

    /// Correlation token from the request
    #[serde(default)]
    pub request_id: Option<String>,

    /// Findings in ranking order
    pub findings: Vec<VulnerabilityFinding>,

    /// Versions of every model whose output contributed
    pub model_versions_used: BTreeMap<String, String>,

    /// Targeted detection models that failed for this request
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_models: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<SeverityAssessment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<CweClassification>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<FunctionVerdict>,
}

impl InferenceResponse {
    pub fn new(request_id: Option<String>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            request_id,
            findings: Vec::new(),
            model_versions_used: BTreeMap::new(),
            failed_models: Vec::new(),
            severity: None,
            classification: None,
            verdict: None,
        }
    }

    /// True when at least one targeted detection model failed
    pub fn is_degraded(&self) -> bool {
        !self.failed_models.is_empty()
    }
}
