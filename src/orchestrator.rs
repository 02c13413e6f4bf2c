//! Request orchestration: validation, fan-out to models, aggregation and response assembly

use crate::config::{Capability, DetectionConfig, OutputLayout};
use crate::error::{ErrorKind, PipelineError, PipelineResult, StructuredError};
use crate::metrics::PipelineMetrics;
use crate::models::aggregator::{FindingAggregator, ScoredPrediction};
use crate::models::inference::{ModelOutput, RawPrediction};
use crate::models::registry::{ModelHandle, ModelRegistry};
use crate::preprocessor::{mark_span, prepare, OffsetMap, PreparedInput};
use crate::types::finding::{
    CweClassification, FunctionVerdict, InferenceResponse, LineRange, SeverityAssessment,
    VulnerabilityFinding,
};
use crate::types::request::{InferenceRequest, Language};
use futures::future::{join_all, select, Either};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::error::Elapsed;
use tracing::{debug, warn};

/// Lifecycle of a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Validated,
    Preprocessing,
    Inferring,
    Aggregating,
    Completed,
    Errored,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Received => "received",
            RequestState::Validated => "validated",
            RequestState::Preprocessing => "preprocessing",
            RequestState::Inferring => "inferring",
            RequestState::Aggregating => "aggregating",
            RequestState::Completed => "completed",
            RequestState::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Errored)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks and logs a request's state transitions
struct RequestTrace {
    trace_id: String,
    state: RequestState,
}

impl RequestTrace {
    fn new(request_id: Option<&str>) -> Self {
        let trace_id = request_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        debug!(request_id = %trace_id, state = %RequestState::Received, "Request received");
        Self {
            trace_id,
            state: RequestState::Received,
        }
    }

    fn advance(&mut self, next: RequestState) {
        if self.state.is_terminal() {
            return;
        }
        debug!(
            request_id = %self.trace_id,
            from = %self.state,
            to = %next,
            "Request state transition"
        );
        self.state = next;
    }
}

/// Successful output of one detection model
struct Detection {
    handle: Arc<ModelHandle>,
    raw: RawPrediction,
    offsets: OffsetMap,
}

/// Detection results for a request with at least one successful model
struct Detected {
    successes: Vec<Detection>,
    /// Ids of targeted models that failed, sorted
    failed: Vec<String>,
}

/// Entry point for analysis requests
pub struct Analyzer {
    registry: Arc<ModelRegistry>,
    aggregator: FindingAggregator,
    detection: DetectionConfig,
    metrics: Arc<PipelineMetrics>,
}

impl Analyzer {
    pub fn new(registry: Arc<ModelRegistry>, detection: &DetectionConfig, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            registry,
            aggregator: FindingAggregator::new(detection.confidence_threshold),
            detection: detection.clone(),
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Analyze one snippet within the configured request deadline.
    ///
    /// Only detection is bound to the deadline. Severity, classification and patch
    /// suggestions still in flight when it passes are left out of the response.
    pub async fn analyze(&self, request: InferenceRequest) -> Result<InferenceResponse, StructuredError> {
        let started = Instant::now();
        let mut trace = RequestTrace::new(request.request_id.as_deref());
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.detection.request_timeout_ms);

        let outcome = self.run(&request, &mut trace, deadline).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(response) => {
                trace.advance(RequestState::Completed);
                self.metrics.record_completed(elapsed, &response);
                debug!(
                    request_id = %trace.trace_id,
                    findings = response.findings.len(),
                    degraded = response.is_degraded(),
                    processing_time_us = elapsed.as_micros() as u64,
                    "Request completed"
                );
                Ok(response)
            }
            Err(e) => {
                trace.advance(RequestState::Errored);
                self.metrics.record_error(elapsed, e.kind());
                warn!(
                    request_id = %trace.trace_id,
                    kind = %e.kind(),
                    error = %e,
                    "Request failed"
                );
                Err(e.into_structured(request.request_id))
            }
        }
    }

    async fn run(
        &self,
        request: &InferenceRequest,
        trace: &mut RequestTrace,
        deadline: tokio::time::Instant,
    ) -> PipelineResult<InferenceResponse> {
        let timed_out = || PipelineError::Timeout(self.detection.request_timeout_ms);

        validate(request, &self.detection)?;
        trace.advance(RequestState::Validated);

        let targets = self.resolve_targets(request)?;
        let trace_id = trace.trace_id.clone();

        let detection = Box::pin(tokio::time::timeout_at(deadline, self.detect(request, targets, trace)));
        let enrichment = Box::pin(async {
            tokio::join!(
                tokio::time::timeout_at(deadline, self.assess_severity(request, &trace_id)),
                tokio::time::timeout_at(deadline, self.classify(request, &trace_id)),
            )
        });

        // A detection error ends the request without waiting for enrichment
        let (detected, (severity, classification)) = match select(detection, enrichment).await {
            Either::Left((detected, enrichment)) => {
                let detected = detected.map_err(|_| timed_out())??;
                (detected, enrichment.await)
            }
            Either::Right((enrichment, detection)) => {
                let detected = detection.await.map_err(|_| timed_out())??;
                (detected, enrichment)
            }
        };
        let severity = before_deadline(severity, &trace_id, "Severity assessment");
        let classification = before_deadline(classification, &trace_id, "CWE classification");

        trace.advance(RequestState::Aggregating);
        let Detected { successes, failed } = detected;
        let scored: Vec<ScoredPrediction<'_>> = successes
            .iter()
            .map(|d| ScoredPrediction {
                prediction: &d.raw,
                labels: d.handle.labels(),
                offsets: &d.offsets,
            })
            .collect();
        let mut findings = self.aggregator.aggregate(&scored, &request.options);

        let mut response = InferenceResponse::new(request.request_id.clone());
        for d in &successes {
            response
                .model_versions_used
                .insert(d.raw.model_id.clone(), d.raw.model_version.clone());
        }
        response.failed_models = failed;
        response.verdict = function_verdict(&successes);

        if let Some((assessment, version)) = severity {
            response
                .model_versions_used
                .insert(assessment.model_id.clone(), version);
            response.severity = Some(assessment);
        }

        if let Some((classification, version)) = classification {
            apply_classification(&mut findings, &successes, &classification);
            response
                .model_versions_used
                .insert(classification.model_id.clone(), version);
            response.classification = Some(classification);
        }

        if request.options.include_patch_suggestion && !findings.is_empty() {
            let patches = tokio::time::timeout_at(
                deadline,
                self.suggest_patches(request, &mut findings, &trace_id),
            )
            .await;
            match patches {
                Ok(Some((model_id, version))) => {
                    response.model_versions_used.insert(model_id, version);
                }
                Ok(None) => {}
                Err(_) => {
                    warn!(request_id = %trace_id, "Patch suggestions still running at the deadline, omitted");
                }
            }
        }

        response.findings = findings;
        Ok(response)
    }

    /// Prepare and run every target concurrently; fails only when all of them failed
    async fn detect(
        &self,
        request: &InferenceRequest,
        targets: Vec<Arc<ModelHandle>>,
        trace: &mut RequestTrace,
    ) -> PipelineResult<Detected> {
        trace.advance(RequestState::Preprocessing);
        let prepared: Vec<(Arc<ModelHandle>, PipelineResult<PreparedInput>)> = targets
            .into_iter()
            .map(|handle| {
                let prepared = prepare(&request.code, request.language, &handle);
                if let Ok(p) = &prepared {
                    debug!(
                        request_id = %trace.trace_id,
                        model = %handle.id(),
                        tokens = p.token_count,
                        "Input prepared"
                    );
                }
                (handle, prepared)
            })
            .collect();

        trace.advance(RequestState::Inferring);
        let outcomes = join_all(prepared.into_iter().map(|(handle, prepared)| async move {
            let outcome = match prepared {
                Ok(PreparedInput { input, offsets, .. }) => {
                    handle.infer(input).await.map(|raw| (raw, offsets))
                }
                Err(e) => Err(e),
            };
            (handle, outcome)
        }))
        .await;

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for (handle, outcome) in outcomes {
            match outcome {
                Ok((raw, offsets)) => successes.push(Detection { handle, raw, offsets }),
                Err(e) => {
                    warn!(
                        request_id = %trace.trace_id,
                        model = %handle.id(),
                        error = %e,
                        "Model failed"
                    );
                    failures.push((handle.id().to_string(), e));
                }
            }
        }
        if successes.is_empty() {
            return Err(combine_failures(failures));
        }

        let mut failed: Vec<String> = failures.into_iter().map(|(id, _)| id).collect();
        failed.sort();
        Ok(Detected { successes, failed })
    }

    /// Detection models for this request, captured once so a concurrent reload cannot
    /// change them mid-flight
    fn resolve_targets(&self, request: &InferenceRequest) -> PipelineResult<Vec<Arc<ModelHandle>>> {
        let language = request.language;

        match &request.options.models {
            Some(ids) => ids
                .iter()
                .map(|id| {
                    let handle = self.registry.get(id)?;
                    if !handle.has_capability(Capability::Detection) {
                        return Err(PipelineError::BadRequest(format!(
                            "model '{id}' is not a detection model"
                        )));
                    }
                    if !handle.supports_language(language) {
                        return Err(PipelineError::BadRequest(format!(
                            "model '{id}' does not support language '{language}'"
                        )));
                    }
                    Ok(handle)
                })
                .collect(),
            None => {
                let handles = self.registry.handles_with(Capability::Detection, language);
                if handles.is_empty() {
                    return Err(PipelineError::BadRequest(format!(
                        "no loaded model supports language '{language}'"
                    )));
                }
                Ok(handles)
            }
        }
    }

    /// Best-effort CVSS estimate; failures are logged and leave the response without one
    async fn assess_severity(&self, request: &InferenceRequest, trace_id: &str) -> Option<(SeverityAssessment, String)> {
        let handle = self.registry.first_with(Capability::Severity, request.language)?;

        let outcome: PipelineResult<RawPrediction> = async {
            let prepared = prepare(&request.code, request.language, &handle)?;
            handle.infer(prepared.input).await
        }
        .await;

        match outcome {
            Ok(RawPrediction {
                model_id,
                model_version,
                output: ModelOutput::Score(score),
            }) if score.is_finite() => Some((
                SeverityAssessment::from_score(f64::from(score), model_id),
                model_version,
            )),
            Ok(raw) => {
                warn!(request_id = %trace_id, model = %raw.model_id, "Severity model returned no usable score");
                None
            }
            Err(e) => {
                warn!(request_id = %trace_id, model = %handle.id(), error = %e, "Severity assessment failed");
                None
            }
        }
    }

    /// Best-effort CWE id and abstract type for the whole snippet
    async fn classify(&self, request: &InferenceRequest, trace_id: &str) -> Option<(CweClassification, String)> {
        let handle = self.registry.first_with(Capability::Classification, request.language)?;

        let outcome: PipelineResult<RawPrediction> = async {
            let prepared = prepare(&request.code, request.language, &handle)?;
            handle.infer(prepared.input).await
        }
        .await;

        match outcome {
            Ok(RawPrediction {
                model_id,
                model_version,
                output: ModelOutput::Classes(heads),
            }) => {
                let classification =
                    read_classification(&heads, handle.labels(), &handle.config().type_labels, model_id);
                if classification.is_none() {
                    warn!(request_id = %trace_id, model = %handle.id(), "Classifier output does not match its labels");
                }
                classification.map(|c| (c, model_version))
            }
            Ok(raw) => {
                warn!(request_id = %trace_id, model = %raw.model_id, "Classifier returned no class probabilities");
                None
            }
            Err(e) => {
                warn!(request_id = %trace_id, model = %handle.id(), error = %e, "CWE classification failed");
                None
            }
        }
    }

    /// Attach a suggested fix to each finding.
    ///
    /// Returns the contributing model's id and version when at least one patch was produced.
    async fn suggest_patches(
        &self,
        request: &InferenceRequest,
        findings: &mut [VulnerabilityFinding],
        trace_id: &str,
    ) -> Option<(String, String)> {
        let Some(handle) = self.registry.first_with(Capability::PatchSuggestion, request.language) else {
            debug!(request_id = %trace_id, language = %request.language, "No patch model for language");
            return None;
        };

        let suggestions = join_all(findings.iter().map(|finding| {
            suggest_patch(&handle, &request.code, request.language, finding.line_range)
        }))
        .await;

        let mut contributed = None;
        for (finding, suggestion) in findings.iter_mut().zip(suggestions) {
            match suggestion {
                Ok(RawPrediction {
                    model_id,
                    model_version,
                    output: ModelOutput::Text(text),
                }) if !text.is_empty() => {
                    finding.patch_suggestion = Some(text);
                    contributed = Some((model_id, model_version));
                }
                Ok(_) => {
                    debug!(request_id = %trace_id, model = %handle.id(), "Patch model returned no text");
                }
                Err(e) => {
                    warn!(
                        request_id = %trace_id,
                        model = %handle.id(),
                        start_line = finding.line_range.start,
                        error = %e,
                        "Patch suggestion failed"
                    );
                }
            }
        }
        contributed
    }
}

/// Result of a best-effort step, with a log line when the deadline cut it off
fn before_deadline<T>(outcome: Result<Option<T>, Elapsed>, trace_id: &str, step: &str) -> Option<T> {
    match outcome {
        Ok(value) => value,
        Err(_) => {
            warn!(request_id = %trace_id, step = step, "Still running at the deadline, omitted");
            None
        }
    }
}

/// Function-level verdict from the first detection model that reports one
fn function_verdict(successes: &[Detection]) -> Option<FunctionVerdict> {
    successes.iter().find_map(|d| {
        let (class, probability) = argmax(d.raw.output.function_probs()?)?;
        Some(FunctionVerdict {
            vulnerable: class != 0,
            probability: probability.clamp(0.0, 1.0),
            model_id: d.raw.model_id.clone(),
        })
    })
}

/// Label the findings of line-scoring models with the predicted CWE.
///
/// Findings from models with their own category taxonomy keep it.
fn apply_classification(
    findings: &mut [VulnerabilityFinding],
    successes: &[Detection],
    classification: &CweClassification,
) {
    for finding in findings.iter_mut() {
        let line_scorer = successes.iter().any(|d| {
            d.handle.id() == finding.model_id && d.handle.config().layout == OutputLayout::AttentionLines
        });
        if line_scorer {
            finding.category = classification.cwe_id.clone();
            finding.cwe_type = classification.cwe_type.clone();
        }
    }
}

/// Map classifier heads onto their label taxonomies.
///
/// The first head must match `labels`. A second head is read only when `type_labels`
/// matches its width.
fn read_classification(
    heads: &[Vec<f32>],
    labels: &[String],
    type_labels: &[String],
    model_id: String,
) -> Option<CweClassification> {
    let ids = heads.first().filter(|probs| probs.len() == labels.len())?;
    let (id_class, id_confidence) = argmax(ids)?;

    let cwe_type = heads
        .get(1)
        .filter(|probs| !type_labels.is_empty() && probs.len() == type_labels.len())
        .and_then(|probs| argmax(probs))
        .map(|(class, confidence)| (type_labels[class].clone(), confidence.clamp(0.0, 1.0)));

    Some(CweClassification {
        cwe_id: labels[id_class].clone(),
        cwe_id_confidence: id_confidence.clamp(0.0, 1.0),
        cwe_type_confidence: cwe_type.as_ref().map(|(_, confidence)| *confidence),
        cwe_type: cwe_type.map(|(label, _)| label),
        model_id,
    })
}

/// Index and value of the largest finite probability; ties go to the lower index
fn argmax(probs: &[f32]) -> Option<(usize, f64)> {
    probs
        .iter()
        .enumerate()
        .filter(|(_, p)| p.is_finite())
        .fold(None, |best: Option<(usize, f32)>, (idx, &p)| match best {
            Some((_, top)) if top >= p => best,
            _ => Some((idx, p)),
        })
        .map(|(idx, p)| (idx, f64::from(p)))
}

async fn suggest_patch(
    handle: &ModelHandle,
    code: &str,
    language: Language,
    range: LineRange,
) -> PipelineResult<RawPrediction> {
    let marked = mark_span(code, range);
    let prepared = prepare(&marked, language, handle)?;
    handle.infer(prepared.input).await
}

/// Structural checks that need no model
pub fn validate(request: &InferenceRequest, detection: &DetectionConfig) -> PipelineResult<()> {
    if request.code.trim().is_empty() {
        return Err(PipelineError::BadRequest("code is empty".to_string()));
    }
    let chars = request.code.chars().count();
    if chars > detection.max_code_chars {
        return Err(PipelineError::BadRequest(format!(
            "code is {} characters, limit is {}",
            chars, detection.max_code_chars
        )));
    }

    let options = &request.options;
    if options.max_results == Some(0) {
        return Err(PipelineError::BadRequest(
            "max_results must be at least 1".to_string(),
        ));
    }
    if let Some(threshold) = options.confidence_threshold_override {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::BadRequest(format!(
                "confidence_threshold_override must be within [0, 1], got {threshold}"
            )));
        }
    }
    if options.models.as_ref().is_some_and(|models| models.is_empty()) {
        return Err(PipelineError::BadRequest("models must not be empty".to_string()));
    }
    Ok(())
}

/// Error for a request where every targeted model failed.
///
/// A shared `InputTooLong` or `ComputeError` is surfaced as is; any other mix becomes
/// `AllModelsFailed`.
fn combine_failures(failures: Vec<(String, PipelineError)>) -> PipelineError {
    let first_kind = failures.first().map(|(_, e)| e.kind());
    let uniform = failures.iter().all(|(_, e)| Some(e.kind()) == first_kind);

    match first_kind {
        Some(ErrorKind::InputTooLong | ErrorKind::ComputeError) if uniform => failures
            .into_iter()
            .next()
            .map(|(_, e)| e)
            .unwrap_or_else(|| PipelineError::AllModelsFailed("no models ran".to_string())),
        _ => {
            let summary = failures
                .iter()
                .map(|(id, e)| format!("{id}: {e}"))
                .collect::<Vec<_>>()
                .join("; ");
            PipelineError::AllModelsFailed(summary)
        }
    }
}
