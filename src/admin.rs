//! Admin commands: hot model reload

use crate::models::registry::{ModelRegistry, ReloadOverrides};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Request to reload one model, optionally from a new path or under a new version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReloadCommand {
    pub model_id: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Outcome of a reload command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadReply {
    pub model_id: String,
    pub ok: bool,
    /// Version now published for the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// When the published instance finished loading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl ReloadReply {
    fn failed(model_id: String, error: String) -> Self {
        Self {
            model_id,
            ok: false,
            version: None,
            loaded_at: None,
            error: Some(error),
            completed_at: Utc::now(),
        }
    }
}

/// Decode and run an admin payload against the registry
pub async fn handle_admin_payload(registry: &ModelRegistry, payload: &[u8]) -> ReloadReply {
    match serde_json::from_slice::<ReloadCommand>(payload) {
        Ok(command) => execute_reload(registry, command).await,
        Err(e) => ReloadReply::failed(String::new(), format!("invalid reload command: {e}")),
    }
}

/// Reload a model and report the result
pub async fn execute_reload(registry: &ModelRegistry, command: ReloadCommand) -> ReloadReply {
    let ReloadCommand {
        model_id,
        path,
        version,
    } = command;
    info!(model = %model_id, "Reload requested");

    match registry.reload(&model_id, ReloadOverrides { path, version }).await {
        Ok(handle) => ReloadReply {
            model_id,
            ok: true,
            version: Some(handle.version().to_string()),
            loaded_at: Some(handle.loaded_at()),
            error: None,
            completed_at: Utc::now(),
        },
        Err(e) => {
            let message = format!("{e:#}");
            error!(model = %model_id, error = %message, "Reload failed");
            ReloadReply::failed(model_id, message)
        }
    }
}
