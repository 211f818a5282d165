//! External channel-delivery dispatch. The walker never renders or
//! sends outbound content itself; it POSTs a `ProcessNodeRequest` to a
//! per-channel delivery service and treats a non-success reply as a
//! `ChannelDispatch` error. Only WhatsApp has a delivery endpoint wired
//! in-core today — other channels are no-ops from the walker's point of
//! view, matching the channel surface the spec carries over.

use std::time::Duration;

use flow_core::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessNodeRequest {
    pub flow_id: String,
    pub current_node_id: Option<String>,
    pub next_node_id: Option<String>,
    pub next_node_data: Option<serde_json::Value>,
    pub user_identifier: String,
    pub brand_id: i64,
    pub user_id: Option<String>,
    pub channel: String,
    pub fallback_message: Option<String>,
    pub is_validation_error: bool,
}

#[async_trait::async_trait]
pub trait ChannelDispatcher: Send + Sync {
    async fn dispatch(&self, request: ProcessNodeRequest) -> FlowResult<()>;
}

/// Posts to a configured `whatsapp/node/process`-style endpoint. Other
/// channels accept the call and no-op, since they have no node-process
/// RPC surface of their own.
pub struct HttpChannelDispatcher {
    client: reqwest::Client,
    node_process_url: String,
}

impl HttpChannelDispatcher {
    pub fn new(node_process_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            node_process_url: node_process_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl ChannelDispatcher for HttpChannelDispatcher {
    async fn dispatch(&self, request: ProcessNodeRequest) -> FlowResult<()> {
        if request.channel != "whatsapp" {
            return Ok(());
        }
        let response = self
            .client
            .post(&self.node_process_url)
            .json(&request)
            .send()
            .await
            .map_err(|err| FlowError::ChannelDispatch(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(%status, "channel delivery endpoint returned non-success");
            return Err(FlowError::ChannelDispatch(format!("delivery endpoint returned {status}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopDispatcher;

    #[async_trait::async_trait]
    impl ChannelDispatcher for NoopDispatcher {
        async fn dispatch(&self, _request: ProcessNodeRequest) -> FlowResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn noop_dispatcher_accepts_any_request() {
        let dispatcher = NoopDispatcher;
        let request = ProcessNodeRequest {
            flow_id: "f1".into(),
            current_node_id: Some("A".into()),
            next_node_id: Some("B".into()),
            next_node_data: None,
            user_identifier: "u".into(),
            brand_id: 1,
            user_id: None,
            channel: "email".into(),
            fallback_message: None,
            is_validation_error: false,
        };
        dispatcher.dispatch(request).await.unwrap();
    }
}
