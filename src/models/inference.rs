//! Model backends: the uniform forward-pass contract and its ONNX Runtime implementation

use crate::config::OutputLayout;
use crate::preprocessor::ModelInput;
use crate::tokenizer::SourceTokenizer;
use anyhow::{anyhow, ensure, Context, Result};
use ort::session::Session;
use ort::value::Tensor;
use std::sync::Arc;
use tracing::debug;

/// Output of one sequence's forward pass
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    /// Per-position label scores, `[seq][labels]`
    TokenScores(Vec<Vec<f32>>),
    /// Per-position scores derived from a function-level verdict
    LineScores {
        tokens: Vec<Vec<f32>>,
        /// `[benign, vulnerable]` probabilities for the whole function
        function_probs: Vec<f32>,
    },
    /// One scalar for the whole sequence
    Score(f32),
    /// One probability vector per classifier head
    Classes(Vec<Vec<f32>>),
    /// Generated text
    Text(String),
}

impl ModelOutput {
    pub fn token_scores(&self) -> Option<&[Vec<f32>]> {
        match self {
            ModelOutput::TokenScores(tokens) | ModelOutput::LineScores { tokens, .. } => Some(tokens),
            _ => None,
        }
    }

    pub fn function_probs(&self) -> Option<&[f32]> {
        match self {
            ModelOutput::LineScores { function_probs, .. } => Some(function_probs),
            _ => None,
        }
    }
}

/// Output of one model invocation, stamped with the model that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct RawPrediction {
    pub model_id: String,
    pub model_version: String,
    pub output: ModelOutput,
}

/// A loaded model that runs batched forward passes.
///
/// Implementations are owned by exactly one executor worker, so `forward` takes
/// `&mut self` and needs no internal locking. Outputs must be returned in input order,
/// one per input.
pub trait InferenceModel: Send {
    fn forward(&mut self, batch: &[ModelInput]) -> Result<Vec<ModelOutput>>;
}

/// ONNX Runtime session with its input/output wiring
pub struct OnnxModel {
    name: String,
    session: Session,
    input_name: String,
    mask_name: Option<String>,
    output_names: Vec<String>,
    layout: OutputLayout,
    apply_softmax: bool,
    tokenizer: Arc<dyn SourceTokenizer>,
}

impl OnnxModel {
    pub fn new(
        name: &str,
        session: Session,
        layout: OutputLayout,
        apply_softmax: bool,
        tokenizer: Arc<dyn SourceTokenizer>,
    ) -> Result<Self> {
        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let input_name = input_names
            .iter()
            .find(|n| n.contains("input_ids"))
            .or_else(|| input_names.first())
            .cloned()
            .ok_or_else(|| anyhow!("model {} declares no inputs", name))?;
        let mask_name = input_names
            .iter()
            .find(|n| n.contains("attention_mask"))
            .cloned();

        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let required = match layout {
            OutputLayout::AttentionLines => 2,
            _ => 1,
        };
        ensure!(
            output_names.len() >= required,
            "model {} has {} outputs, layout {:?} needs {}",
            name,
            output_names.len(),
            layout,
            required
        );

        Ok(Self {
            name: name.to_string(),
            session,
            input_name,
            mask_name,
            output_names,
            layout,
            apply_softmax,
            tokenizer,
        })
    }
}

impl InferenceModel for OnnxModel {
    fn forward(&mut self, batch: &[ModelInput]) -> Result<Vec<ModelOutput>> {
        let rows = batch.len();
        if rows == 0 {
            return Ok(Vec::new());
        }
        let seq = batch[0].seq_len();
        ensure!(
            batch.iter().all(|input| input.seq_len() == seq),
            "inputs in one batch must share a sequence length"
        );

        // Prepare input tensors - shape [rows, seq]
        let shape = vec![rows as i64, seq as i64];
        let ids: Vec<i64> = batch.iter().flat_map(|i| i.input_ids.iter().copied()).collect();
        let ids_tensor =
            Tensor::from_array((shape.clone(), ids)).context("Failed to create input tensor")?;

        let outputs = match &self.mask_name {
            Some(mask_name) => {
                let masks: Vec<i64> = batch
                    .iter()
                    .flat_map(|i| i.attention_mask.iter().copied())
                    .collect();
                let mask_tensor = Tensor::from_array((shape, masks))
                    .context("Failed to create attention mask tensor")?;
                self.session.run(ort::inputs![
                    self.input_name.as_str() => ids_tensor,
                    mask_name.as_str() => mask_tensor
                ])?
            }
            None => self
                .session
                .run(ort::inputs![self.input_name.as_str() => ids_tensor])?,
        };

        let primary = outputs
            .get(self.output_names[0].as_str())
            .ok_or_else(|| anyhow!("missing output {}", self.output_names[0]))?;

        let results = match self.layout {
            OutputLayout::TokenLabels => {
                let (shape, data) = primary.try_extract_tensor::<f32>()?;
                split_token_scores(shape, data, rows, self.apply_softmax)?
            }
            OutputLayout::AttentionLines => {
                let (prob_shape, probs) = primary.try_extract_tensor::<f32>()?;
                let attentions = outputs
                    .get(self.output_names[1].as_str())
                    .ok_or_else(|| anyhow!("missing output {}", self.output_names[1]))?;
                let (att_shape, att) = attentions.try_extract_tensor::<f32>()?;
                let masks: Vec<&[i64]> = batch.iter().map(|i| i.attention_mask.as_slice()).collect();
                attention_token_scores(prob_shape, probs, att_shape, att, &masks)?
            }
            OutputLayout::Regression => {
                let (shape, data) = primary.try_extract_tensor::<f32>()?;
                regression_scores(shape, data, rows)?
            }
            OutputLayout::Generation => {
                let (shape, data) = primary.try_extract_tensor::<i64>()?;
                decode_generations(shape, data, rows, self.tokenizer.as_ref())?
            }
            OutputLayout::Classification => {
                let mut heads = Vec::with_capacity(self.output_names.len().min(2));
                for name in self.output_names.iter().take(2) {
                    let output = outputs
                        .get(name.as_str())
                        .ok_or_else(|| anyhow!("missing output {}", name))?;
                    let (shape, data) = output.try_extract_tensor::<f32>()?;
                    let shape: &[i64] = shape;
                    heads.push((shape, data));
                }
                classification_scores(&heads, rows, self.apply_softmax)?
            }
        };

        debug!(model = %self.name, rows = rows, layout = ?self.layout, "Forward pass complete");
        Ok(results)
    }
}

fn dims(shape: &[i64]) -> Vec<usize> {
    shape.iter().map(|&d| d.max(0) as usize).collect()
}

/// Split a `[rows, seq, labels]` tensor into per-row score matrices
pub fn split_token_scores(
    shape: &[i64],
    data: &[f32],
    rows: usize,
    apply_softmax: bool,
) -> Result<Vec<ModelOutput>> {
    let dims = dims(shape);
    ensure!(dims.len() == 3, "token_labels output must be rank 3, got {:?}", dims);
    ensure!(dims[0] == rows, "output batch {} != input batch {}", dims[0], rows);
    let (seq, labels) = (dims[1], dims[2]);
    ensure!(seq > 0 && labels > 0, "token_labels output has an empty dimension: {:?}", dims);
    ensure!(data.len() == rows * seq * labels, "output data does not match its shape");

    Ok(data
        .chunks(seq * labels)
        .map(|row| {
            ModelOutput::TokenScores(
                row.chunks(labels)
                    .map(|scores| {
                        if apply_softmax {
                            softmax(scores)
                        } else {
                            scores.to_vec()
                        }
                    })
                    .collect(),
            )
        })
        .collect())
}

/// Line-level attention scoring.
///
/// For every row, the attention each position receives is summed over all layers and
/// query positions, min-max normalized, zeroed on the framing tokens, and scaled by the
/// function-level vulnerable probability. The result is a `[benign, vulnerable]` pair
/// per position.
pub fn attention_token_scores(
    prob_shape: &[i64],
    probs: &[f32],
    att_shape: &[i64],
    attentions: &[f32],
    masks: &[&[i64]],
) -> Result<Vec<ModelOutput>> {
    let rows = masks.len();
    let prob_dims = dims(prob_shape);
    ensure!(
        prob_dims.len() == 2 && prob_dims[0] == rows && prob_dims[1] >= 2,
        "function probability output must be [batch, 2], got {:?}",
        prob_dims
    );
    let classes = prob_dims[1];

    let att_dims = dims(att_shape);
    ensure!(
        att_dims.len() == 4 && att_dims[0] == rows && att_dims[2] == att_dims[3],
        "attention output must be [batch, layers, seq, seq], got {:?}",
        att_dims
    );
    let (layers, seq) = (att_dims[1], att_dims[2]);
    ensure!(seq > 0, "attention output has an empty sequence dimension");
    ensure!(attentions.len() == rows * layers * seq * seq, "attention data does not match its shape");

    let mut results = Vec::with_capacity(rows);
    for (row, mask) in masks.iter().enumerate() {
        ensure!(mask.len() == seq, "attention mask length {} != sequence {}", mask.len(), seq);
        let vulnerable = probs[row * classes + 1].clamp(0.0, 1.0);

        let mut received = vec![0.0f32; seq];
        let row_att = &attentions[row * layers * seq * seq..(row + 1) * layers * seq * seq];
        for layer in row_att.chunks(seq * seq) {
            for query in layer.chunks(seq) {
                for (total, &weight) in received.iter_mut().zip(query) {
                    *total += weight;
                }
            }
        }

        let min = received.iter().copied().fold(f32::INFINITY, f32::min);
        let max = received.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let span = max - min;
        for value in received.iter_mut() {
            *value = if span > 0.0 { (*value - min) / span } else { 0.0 };
        }

        // <s> and </s> carry no line information
        received[0] = 0.0;
        if let Some(last) = mask.iter().rposition(|&m| m != 0) {
            received[last] = 0.0;
        }
        for (value, &m) in received.iter_mut().zip(mask.iter()) {
            if m == 0 {
                *value = 0.0;
            }
        }

        results.push(ModelOutput::LineScores {
            tokens: received
                .into_iter()
                .map(|score| {
                    let s = score * vulnerable;
                    vec![1.0 - s, s]
                })
                .collect(),
            function_probs: probs[row * classes..(row + 1) * classes].to_vec(),
        });
    }
    Ok(results)
}

/// Per-row class probabilities from one or more `[rows, classes]` heads
pub fn classification_scores(
    heads: &[(&[i64], &[f32])],
    rows: usize,
    apply_softmax: bool,
) -> Result<Vec<ModelOutput>> {
    ensure!(!heads.is_empty(), "classification needs at least one output head");

    let mut widths = Vec::with_capacity(heads.len());
    for (shape, data) in heads {
        let dims = dims(shape);
        ensure!(
            dims.len() == 2 && dims[0] == rows && dims[1] > 0,
            "classification output must be [batch, classes], got {:?}",
            dims
        );
        ensure!(data.len() == rows * dims[1], "classification data does not match its shape");
        widths.push(dims[1]);
    }

    Ok((0..rows)
        .map(|row| {
            ModelOutput::Classes(
                heads
                    .iter()
                    .zip(&widths)
                    .map(|((_, data), &width)| {
                        let probs = &data[row * width..(row + 1) * width];
                        if apply_softmax {
                            softmax(probs)
                        } else {
                            probs.to_vec()
                        }
                    })
                    .collect(),
            )
        })
        .collect())
}

/// One scalar per row from a `[rows]` or `[rows, 1]` tensor
pub fn regression_scores(shape: &[i64], data: &[f32], rows: usize) -> Result<Vec<ModelOutput>> {
    let dims = dims(shape);
    ensure!(
        !dims.is_empty() && dims[0] == rows && data.len() == rows,
        "regression output must hold one value per row, got {:?}",
        dims
    );
    Ok(data.iter().map(|&v| ModelOutput::Score(v)).collect())
}

/// Decode `[rows, len]` generated ids into cleaned text
pub fn decode_generations(
    shape: &[i64],
    data: &[i64],
    rows: usize,
    tokenizer: &dyn SourceTokenizer,
) -> Result<Vec<ModelOutput>> {
    let dims = dims(shape);
    ensure!(dims.len() == 2 && dims[0] == rows, "generation output must be [batch, len], got {:?}", dims);
    let len = dims[1];
    if len == 0 {
        return Ok(vec![ModelOutput::Text(String::new()); rows]);
    }

    data.chunks(len)
        .map(|row| {
            let ids: Vec<u32> = row
                .iter()
                .filter_map(|&id| u32::try_from(id).ok())
                .collect();
            Ok(ModelOutput::Text(clean_generated(&tokenizer.decode(&ids)?)))
        })
        .collect()
}

/// Strip leftover special tokens and surrounding whitespace from generated text
pub fn clean_generated(text: &str) -> String {
    text.replace("<pad>", "")
        .replace("<s>", "")
        .replace("</s>", "")
        .trim()
        .to_string()
}

/// Numerically stable softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        exps.into_iter().map(|e| e / sum).collect()
    } else {
        vec![0.0; logits.len()]
    }
}
