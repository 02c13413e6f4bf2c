//! Turns raw source text into fixed-shape model input.
//!
//! Preparation is a pure function of the text and the model's tokenizer and length
//! limit. Alongside the padded ids it records which source line every position came
//! from, so per-token model scores can be mapped back to line ranges.

use crate::error::{PipelineError, PipelineResult};
use crate::models::registry::ModelHandle;
use crate::tokenizer::{SourceTokenizer, SpecialTokens};
use crate::types::finding::LineRange;
use crate::types::request::Language;

/// Markers the repair model was trained with around the vulnerable span
pub const BUG_START_MARKER: &str = "<S2SV_StartBug>";
pub const BUG_END_MARKER: &str = "<S2SV_EndBug>";

/// Padded token ids and attention mask for one sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInput {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
}

impl ModelInput {
    pub fn seq_len(&self) -> usize {
        self.input_ids.len()
    }

    /// A sequence holding only the framing tokens, used to warm a model up
    pub fn framing_only(seq_len: usize, specials: SpecialTokens) -> Self {
        let mut input_ids = Vec::with_capacity(seq_len);
        input_ids.extend(specials.bos.map(i64::from));
        input_ids.extend(specials.eos.map(i64::from));
        let real = input_ids.len().min(seq_len);
        input_ids.truncate(seq_len);
        input_ids.resize(seq_len, i64::from(specials.pad));

        let mut attention_mask = vec![1; real];
        attention_mask.resize(seq_len, 0);

        Self {
            input_ids,
            attention_mask,
        }
    }
}

/// Maps sequence positions back to 1-based source lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetMap {
    token_lines: Vec<Option<u32>>,
}

impl OffsetMap {
    /// Source line of the token at `position`; `None` for framing, padding and whitespace
    pub fn line_of(&self, position: usize) -> Option<u32> {
        self.token_lines.get(position).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.token_lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_lines.is_empty()
    }
}

/// Input for one model invocation plus the mapping needed to read its output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedInput {
    pub input: ModelInput,
    pub offsets: OffsetMap,
    /// Real tokens in the sequence, framing included
    pub token_count: usize,
}

/// Prepare `code` for the model behind `handle`
pub fn prepare(code: &str, language: Language, handle: &ModelHandle) -> PipelineResult<PreparedInput> {
    if !handle.supports_language(language) {
        return Err(PipelineError::BadRequest(format!(
            "model '{}' does not support language '{}'",
            handle.id(),
            language
        )));
    }
    prepare_with(
        code,
        handle.tokenizer(),
        handle.max_input_length(),
        handle.id(),
    )
}

/// Tokenize, frame and pad `code` to `max_input_length` positions.
///
/// The length check counts framing tokens, so a sequence exactly at the limit is
/// accepted and one token more is rejected.
pub fn prepare_with(
    code: &str,
    tokenizer: &dyn SourceTokenizer,
    max_input_length: usize,
    model_id: &str,
) -> PipelineResult<PreparedInput> {
    let tokens = tokenizer.encode(code).map_err(|e| {
        PipelineError::Compute(format!("tokenization failed for model {model_id}: {e:#}"))
    })?;
    let specials = tokenizer.special_tokens();

    let token_count = tokens.len() + specials.framing_len();
    if token_count > max_input_length {
        return Err(PipelineError::InputTooLong {
            model_id: model_id.to_string(),
            tokens: token_count,
            max: max_input_length,
        });
    }

    let line_starts = line_starts(code);
    let mut input_ids = Vec::with_capacity(max_input_length);
    let mut token_lines = Vec::with_capacity(max_input_length);

    if let Some(bos) = specials.bos {
        input_ids.push(i64::from(bos));
        token_lines.push(None);
    }
    for token in &tokens {
        input_ids.push(i64::from(token.id));
        let whitespace_only = code
            .get(token.start..token.end)
            .is_some_and(|text| text.trim().is_empty());
        token_lines.push(if whitespace_only {
            None
        } else {
            Some(line_at(&line_starts, token.start))
        });
    }
    if let Some(eos) = specials.eos {
        input_ids.push(i64::from(eos));
        token_lines.push(None);
    }

    let mut attention_mask = vec![1; input_ids.len()];
    input_ids.resize(max_input_length, i64::from(specials.pad));
    attention_mask.resize(max_input_length, 0);
    token_lines.resize(max_input_length, None);

    Ok(PreparedInput {
        input: ModelInput {
            input_ids,
            attention_mask,
        },
        offsets: OffsetMap { token_lines },
        token_count,
    })
}

/// Wrap the lines of `range` in the repair model's bug markers
pub fn mark_span(code: &str, range: LineRange) -> String {
    let mut marked = String::with_capacity(code.len() + BUG_START_MARKER.len() + BUG_END_MARKER.len() + 2);
    for (idx, line) in code.split('\n').enumerate() {
        let line_no = idx as u32 + 1;
        if idx > 0 {
            marked.push('\n');
        }
        if line_no == range.start {
            marked.push_str(BUG_START_MARKER);
            marked.push(' ');
        }
        marked.push_str(line);
        if line_no == range.end {
            marked.push(' ');
            marked.push_str(BUG_END_MARKER);
        }
    }
    marked
}

fn line_starts(code: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(code.match_indices('\n').map(|(idx, _)| idx + 1))
        .collect()
}

fn line_at(line_starts: &[usize], byte_offset: usize) -> u32 {
    line_starts.partition_point(|&start| start <= byte_offset) as u32
}
