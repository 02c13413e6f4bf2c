//! Finding aggregation across detection models

use crate::models::inference::RawPrediction;
use crate::preprocessor::OffsetMap;
use crate::types::finding::{LineRange, VulnerabilityFinding};
use crate::types::request::AnalysisOptions;
use std::collections::BTreeMap;
use tracing::debug;

/// A detection model's output together with what is needed to read it
#[derive(Debug, Clone, Copy)]
pub struct ScoredPrediction<'a> {
    pub prediction: &'a RawPrediction,
    /// Label taxonomy; index 0 is background
    pub labels: &'a [String],
    pub offsets: &'a OffsetMap,
}

/// Turns per-token scores into ranked, non-overlapping findings.
pub struct FindingAggregator {
    /// Threshold used when the request does not override it
    default_threshold: f64,
}

impl FindingAggregator {
    pub fn new(default_threshold: f64) -> Self {
        Self { default_threshold }
    }

    /// Aggregate every model's findings into one ranked list.
    ///
    /// Overlapping ranges from different models collapse to the best-ranked one, and
    /// the result is truncated to `options.max_results`.
    pub fn aggregate(
        &self,
        predictions: &[ScoredPrediction<'_>],
        options: &AnalysisOptions,
    ) -> Vec<VulnerabilityFinding> {
        let threshold = options
            .confidence_threshold_override
            .unwrap_or(self.default_threshold);

        let mut candidates: Vec<VulnerabilityFinding> = predictions
            .iter()
            .flat_map(|scored| Self::model_findings(scored, threshold))
            .collect();
        candidates.sort_by(|a, b| a.ranking_cmp(b));

        let mut kept: Vec<VulnerabilityFinding> = Vec::with_capacity(candidates.len());
        for finding in candidates {
            if kept.iter().all(|k| !k.line_range.overlaps(&finding.line_range)) {
                kept.push(finding);
            }
        }

        if let Some(max_results) = options.max_results {
            kept.truncate(max_results);
        }
        kept
    }

    /// Findings of a single model: per-line best category, thresholded, adjacent lines merged
    pub fn model_findings(scored: &ScoredPrediction<'_>, threshold: f64) -> Vec<VulnerabilityFinding> {
        let Some(scores) = scored.prediction.output.token_scores() else {
            debug!(model = %scored.prediction.model_id, "Prediction carries no token scores, skipping");
            return Vec::new();
        };
        if scored.labels.len() < 2 {
            return Vec::new();
        }

        let lines = line_scores(scores, scored.offsets, scored.labels.len());

        let mut findings: Vec<VulnerabilityFinding> = Vec::new();
        for (line, label_scores) in lines {
            let Some((label, confidence)) = best_category(&label_scores) else {
                continue;
            };
            if confidence < threshold {
                continue;
            }
            let category = &scored.labels[label];

            match findings.last_mut() {
                Some(last)
                    if last.line_range.end + 1 == line && last.category == *category =>
                {
                    last.line_range.end = line;
                    last.confidence = last.confidence.max(confidence.clamp(0.0, 1.0));
                }
                _ => findings.push(VulnerabilityFinding::new(
                    LineRange::single(line),
                    category.clone(),
                    confidence,
                    scored.prediction.model_id.clone(),
                )),
            }
        }
        findings
    }
}

/// Maximum score per label for every line that has at least one token
fn line_scores(scores: &[Vec<f32>], offsets: &OffsetMap, label_count: usize) -> BTreeMap<u32, Vec<f32>> {
    let mut lines: BTreeMap<u32, Vec<f32>> = BTreeMap::new();

    for (position, token_scores) in scores.iter().enumerate().take(offsets.len()) {
        let Some(line) = offsets.line_of(position) else {
            continue;
        };
        let entry = lines.entry(line).or_insert_with(|| vec![0.0; label_count]);
        for (best, &score) in entry.iter_mut().zip(token_scores) {
            if score.is_finite() && score > *best {
                *best = score;
            }
        }
    }
    lines
}

/// Highest-scoring non-background label; ties go to the lower index
fn best_category(label_scores: &[f32]) -> Option<(usize, f64)> {
    label_scores
        .iter()
        .enumerate()
        .skip(1)
        .fold(None, |best: Option<(usize, f32)>, (idx, &score)| match best {
            Some((_, top)) if top >= score => best,
            _ => Some((idx, score)),
        })
        .map(|(idx, score)| (idx, f64::from(score)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::inference::ModelOutput;
    use crate::preprocessor::prepare_with;
    use crate::tokenizer::BasicTokenizer;

    const CODE: &str = "int f() {\n  char b[4];\n  gets(b);\n  strcpy(b, s);\n  return 0;\n}";

    fn labels() -> Vec<String> {
        vec!["benign".into(), "CWE-120".into(), "CWE-242".into()]
    }

    fn offsets() -> OffsetMap {
        prepare_with(CODE, &BasicTokenizer::new(1000).unwrap(), 64, "test")
            .unwrap()
            .offsets
    }

    /// Scores every token on the given lines with `[1 - s, s for label]`
    fn prediction(model_id: &str, offsets: &OffsetMap, hits: &[(u32, usize, f32)]) -> RawPrediction {
        let scores = (0..offsets.len())
            .map(|pos| {
                let mut row = vec![1.0, 0.0, 0.0];
                if let Some(line) = offsets.line_of(pos) {
                    for &(hit_line, label, score) in hits {
                        if hit_line == line {
                            row[label] = score;
                            row[0] = 1.0 - score;
                        }
                    }
                }
                row
            })
            .collect();
        RawPrediction {
            model_id: model_id.to_string(),
            model_version: "1".to_string(),
            output: ModelOutput::TokenScores(scores),
        }
    }

    fn scored<'a>(prediction: &'a RawPrediction, labels: &'a [String], offsets: &'a OffsetMap) -> ScoredPrediction<'a> {
        ScoredPrediction {
            prediction,
            labels,
            offsets,
        }
    }

    #[test]
    fn test_lines_above_threshold_become_findings() {
        let offsets = offsets();
        let labels = labels();
        let raw = prediction("m", &offsets, &[(3, 2, 0.9), (5, 1, 0.2)]);

        let findings = FindingAggregator::new(0.5)
            .aggregate(&[scored(&raw, &labels, &offsets)], &AnalysisOptions::default());

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line_range, LineRange::single(3));
        assert_eq!(findings[0].category, "CWE-242");
        assert!((findings[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(findings[0].model_id, "m");
    }

    #[test]
    fn test_adjacent_lines_with_same_category_merge() {
        let offsets = offsets();
        let labels = labels();
        let raw = prediction("m", &offsets, &[(3, 1, 0.7), (4, 1, 0.8), (2, 2, 0.6)]);

        let findings = FindingAggregator::new(0.5)
            .aggregate(&[scored(&raw, &labels, &offsets)], &AnalysisOptions::default());

        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].line_range, LineRange::new(3, 4));
        assert!((findings[0].confidence - 0.8).abs() < 1e-6);
        assert_eq!(findings[1].line_range, LineRange::single(2));
        assert_eq!(findings[1].category, "CWE-242");
    }

    #[test]
    fn test_overlapping_models_keep_higher_confidence() {
        let offsets = offsets();
        let labels = labels();
        let a = prediction("a", &offsets, &[(3, 1, 0.7), (4, 1, 0.7)]);
        let b = prediction("b", &offsets, &[(4, 2, 0.9)]);

        let findings = FindingAggregator::new(0.5).aggregate(
            &[scored(&a, &labels, &offsets), scored(&b, &labels, &offsets)],
            &AnalysisOptions::default(),
        );

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].model_id, "b");
        assert_eq!(findings[0].line_range, LineRange::single(4));
    }

    #[test]
    fn test_threshold_override_and_truncation() {
        let offsets = offsets();
        let labels = labels();
        let raw = prediction("m", &offsets, &[(1, 1, 0.3), (3, 2, 0.9), (5, 1, 0.4)]);
        let aggregator = FindingAggregator::new(0.5);

        let lenient = AnalysisOptions {
            confidence_threshold_override: Some(0.25),
            ..Default::default()
        };
        let all = aggregator.aggregate(&[scored(&raw, &labels, &offsets)], &lenient);
        let lines: Vec<u32> = all.iter().map(|f| f.line_range.start).collect();
        assert_eq!(lines, vec![3, 5, 1]);

        let top_two = AnalysisOptions {
            max_results: Some(2),
            ..lenient
        };
        let truncated = aggregator.aggregate(&[scored(&raw, &labels, &offsets)], &top_two);
        assert_eq!(truncated, all[..2].to_vec());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let offsets = offsets();
        let labels = labels();
        let raw = prediction("m", &offsets, &[(2, 1, 0.5)]);

        let findings = FindingAggregator::new(0.5)
            .aggregate(&[scored(&raw, &labels, &offsets)], &AnalysisOptions::default());
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_non_token_outputs_are_ignored() {
        let offsets = offsets();
        let labels = labels();
        let raw = RawPrediction {
            model_id: "sev".to_string(),
            model_version: "1".to_string(),
            output: ModelOutput::Score(7.5),
        };
        let findings = FindingAggregator::new(0.0)
            .aggregate(&[scored(&raw, &labels, &offsets)], &AnalysisOptions::default());
        assert!(findings.is_empty());
    }

    #[test]
    fn test_line_scores_from_attention_model() {
        let offsets = offsets();
        let labels = vec!["benign".to_string(), "vulnerable".to_string()];
        let tokens = (0..offsets.len())
            .map(|pos| match offsets.line_of(pos) {
                Some(4) => vec![0.2, 0.8],
                _ => vec![1.0, 0.0],
            })
            .collect();
        let raw = RawPrediction {
            model_id: "line".to_string(),
            model_version: "1".to_string(),
            output: ModelOutput::LineScores {
                tokens,
                function_probs: vec![0.1, 0.9],
            },
        };

        let findings = FindingAggregator::new(0.5)
            .aggregate(&[scored(&raw, &labels, &offsets)], &AnalysisOptions::default());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line_range, LineRange::single(4));
        assert_eq!(findings[0].category, "vulnerable");
    }

    #[test]
    fn test_best_category_prefers_lower_index_on_tie() {
        assert_eq!(best_category(&[0.1, 0.6, 0.6]), Some((1, f64::from(0.6f32))));
        assert_eq!(best_category(&[1.0]), None);
    }
}
