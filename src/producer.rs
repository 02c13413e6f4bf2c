//! Reply envelopes and their NATS publisher

use crate::error::StructuredError;
use crate::types::finding::InferenceResponse;
use anyhow::Result;
use async_nats::{Client, Subject};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Reply to an analysis request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AnalyzeReply {
    Completed(InferenceResponse),
    Errored { error: StructuredError },
}

impl AnalyzeReply {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            AnalyzeReply::Completed(response) => response.request_id.as_deref(),
            AnalyzeReply::Errored { error } => error.request_id.as_deref(),
        }
    }
}

impl From<Result<InferenceResponse, StructuredError>> for AnalyzeReply {
    fn from(outcome: Result<InferenceResponse, StructuredError>) -> Self {
        match outcome {
            Ok(response) => AnalyzeReply::Completed(response),
            Err(error) => AnalyzeReply::Errored { error },
        }
    }
}

/// Publishes replies to requesters' inboxes
#[derive(Clone)]
pub struct ReplyPublisher {
    client: Client,
}

impl ReplyPublisher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Serialize `reply` as JSON and publish it to `subject`
    pub async fn publish<T: Serialize>(&self, subject: Subject, reply: &T) -> Result<()> {
        let payload = serde_json::to_vec(reply)?;
        let bytes = payload.len();

        self.client.publish(subject.clone(), payload.into()).await?;

        debug!(subject = %subject, bytes = bytes, "Published reply");
        Ok(())
    }
}
