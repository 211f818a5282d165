//! Webhook Intake: persists raw inbound events before any downstream
//! work, normalizes them, and records the terminal `processed`/`error`
//! status. Re-delivery is the caller's concern; intake performs no
//! internal retries.

use std::sync::Arc;

use chrono::Utc;
use flow_core::{FlowResult, Store, WebhookMessage, WebhookMetadata, WebhookStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::adapter::{is_scheduled_trigger_webhook, normalize, NormalizedEvent};

/// Body of `POST /webhook/message`.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookMessageRequest {
    pub sender: String,
    pub brand_id: i64,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub channel_identifier: Option<String>,
    #[serde(default)]
    pub channel_phone_number_id: Option<String>,
    pub message_type: String,
    pub message_body: Value,
    pub channel: String,
}

impl WebhookMessageRequest {
    /// The single `channel_account_id` disambiguator, normalized at
    /// intake so downstream components never again have to choose
    /// between `channel_identifier` and a channel-specific phone id.
    pub fn channel_account_id(&self) -> String {
        self.channel_phone_number_id
            .clone()
            .or_else(|| self.channel_identifier.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookResponse {
    pub status: String,
    pub message: String,
    pub automation_triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

/// Persists the raw+normalized pair and returns the normalized event
/// together with the webhook row id, ready for the orchestrator.
pub async fn intake(
    store: &Arc<dyn Store>,
    request: &WebhookMessageRequest,
) -> FlowResult<(String, NormalizedEvent)> {
    let normalized = normalize(&request.channel, &request.message_type, &request.message_body);
    let data = serde_json::to_value(&normalized).unwrap_or(Value::Null);

    let webhook = WebhookMessage {
        id: Uuid::new_v4().to_string(),
        metadata: WebhookMetadata {
            sender: request.sender.clone(),
            brand_id: request.brand_id,
            user_id: request.user_id.clone(),
            channel_identifier: Some(request.channel_account_id()),
            channel: request.channel.clone(),
            message_type: request.message_type.clone(),
            status: WebhookStatus::Pending,
        },
        raw_payload: request.message_body.clone(),
        data,
        created_at: Utc::now(),
    };
    let id = store.insert_webhook(webhook).await?;
    Ok((id, normalized))
}

/// Marks the audit row terminal. Never propagates its own failure —
/// a failed status update is logged and the caller's response proceeds
/// regardless.
pub async fn finalize(store: &Arc<dyn Store>, webhook_id: &str, ok: bool) {
    let status = if ok { WebhookStatus::Processed } else { WebhookStatus::Error };
    if let Err(err) = store.mark_webhook(webhook_id, status).await {
        warn!(webhook_id, error = %err, "failed to update webhook audit status");
    }
}

pub fn is_synthetic_scheduled_trigger(request: &WebhookMessageRequest) -> bool {
    is_scheduled_trigger_webhook(&request.sender, &request.channel, &request.message_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::MemoryStore;
    use serde_json::json;

    fn sample_request() -> WebhookMessageRequest {
        WebhookMessageRequest {
            sender: "+1555".into(),
            brand_id: 1,
            user_id: None,
            channel_identifier: None,
            channel_phone_number_id: Some("waba-1".into()),
            message_type: "text".into(),
            message_body: json!({"text": {"body": "Learn now"}}),
            channel: "whatsapp".into(),
        }
    }

    #[tokio::test]
    async fn intake_persists_pending_row_and_normalizes() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let request = sample_request();
        let (id, normalized) = intake(&store, &request).await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(normalized.user_reply.as_deref(), Some("Learn now"));
    }

    #[tokio::test]
    async fn finalize_never_panics_on_missing_row() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        finalize(&store, "missing-id", true).await;
    }

    #[test]
    fn channel_account_id_prefers_phone_number_id() {
        let request = sample_request();
        assert_eq!(request.channel_account_id(), "waba-1");
    }

    #[test]
    fn scheduled_trigger_requires_system_sender() {
        let mut request = sample_request();
        request.message_type = "scheduled_trigger".into();
        request.sender = "system".into();
        request.channel = "system".into();
        assert!(is_synthetic_scheduled_trigger(&request));
    }
}
