//! NATS subscriptions for analysis requests and admin commands

use crate::config::NatsConfig;
use crate::error::StructuredError;
use crate::types::request::InferenceRequest;
use anyhow::Result;
use async_nats::{Client, Subscriber};
use tracing::info;

/// Subscribes to the request and admin subjects
pub struct RequestConsumer {
    client: Client,
    subject: String,
    queue_group: String,
    admin_subject: String,
}

impl RequestConsumer {
    pub fn new(client: Client, config: &NatsConfig) -> Self {
        Self {
            client,
            subject: config.request_subject.clone(),
            queue_group: config.queue_group.clone(),
            admin_subject: config.admin_subject.clone(),
        }
    }

    /// Join the queue group on the request subject so server processes share load
    pub async fn subscribe(&self) -> Result<Subscriber> {
        let subscriber = self
            .client
            .queue_subscribe(self.subject.clone(), self.queue_group.clone())
            .await?;
        info!(subject = %self.subject, queue_group = %self.queue_group, "Subscribed to request subject");
        Ok(subscriber)
    }

    /// Subscribe to admin commands; every process receives each command
    pub async fn subscribe_admin(&self) -> Result<Subscriber> {
        let subscriber = self.client.subscribe(self.admin_subject.clone()).await?;
        info!(subject = %self.admin_subject, "Subscribed to admin subject");
        Ok(subscriber)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Parse a request payload, mapping malformed input to `BadRequest`.
///
/// When the payload is JSON but not a valid request, its `request_id` is still echoed.
pub fn decode_request(payload: &[u8]) -> Result<InferenceRequest, StructuredError> {
    serde_json::from_slice::<InferenceRequest>(payload).map_err(|e| {
        let request_id = serde_json::from_slice::<serde_json::Value>(payload)
            .ok()
            .and_then(|value| {
                value
                    .get("request_id")
                    .or_else(|| value.get("correlation_id"))
                    .and_then(|id| id.as_str())
                    .map(str::to_string)
            });
        StructuredError::bad_request(format!("invalid request payload: {e}"), request_id)
    })
}
