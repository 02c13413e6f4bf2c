//! Inbound analysis request structures

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Source languages the server knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    #[serde(alias = "c++")]
    Cpp,
    #[serde(alias = "c#", alias = "cs")]
    Csharp,
    Go,
    Java,
    #[serde(alias = "js")]
    Javascript,
    Php,
    #[serde(alias = "py")]
    Python,
    Ruby,
    Rust,
    #[serde(alias = "ts")]
    Typescript,
}

impl Language {
    /// Canonical lowercase tag used on the wire and in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Csharp => "csharp",
            Language::Go => "go",
            Language::Java => "java",
            Language::Javascript => "javascript",
            Language::Php => "php",
            Language::Python => "python",
            Language::Ruby => "ruby",
            Language::Rust => "rust",
            Language::Typescript => "typescript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recognized request flags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisOptions {
    /// Ask the patch-suggestion model for a fix per finding
    #[serde(default)]
    pub include_patch_suggestion: bool,

    /// Upper bound on returned findings (unlimited when absent)
    #[serde(default)]
    pub max_results: Option<usize>,

    /// Replaces the server's confidence threshold for this request
    #[serde(default)]
    pub confidence_threshold_override: Option<f64>,

    /// Explicit set of detection models to run
    #[serde(default)]
    pub models: Option<BTreeSet<String>>,
}

/// A code snippet submitted for vulnerability analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Raw source text
    pub code: String,

    /// Language of the snippet
    pub language: Language,

    /// Analysis flags
    #[serde(default)]
    pub options: AnalysisOptions,

    /// Correlation token echoed back in the response
    #[serde(default, alias = "correlation_id")]
    pub request_id: Option<String>,
}

impl InferenceRequest {
    /// Create a request with default options
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            options: AnalysisOptions::default(),
            request_id: None,
        }
    }

    /// Attach a correlation token
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Replace the analysis options
    pub fn with_options(mut self, options: AnalysisOptions) -> Self {
        self.options = options;
        self
    }
}
