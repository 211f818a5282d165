//! Append-only per-node execution log. Deliberately thin: one row per
//! processed node, aggregated elsewhere for analytics.

use std::sync::Arc;

use chrono::Utc;
use flow_core::{FlowResult, ProcessedStatus, Store, UserKey, UserTransaction};
use uuid::Uuid;

pub struct TransactionRecorder {
    store: Arc<dyn Store>,
}

impl TransactionRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        user_key: &UserKey,
        flow_id: &str,
        node_id: &str,
        node_type: &str,
        status: ProcessedStatus,
        processed_value: Option<serde_json::Value>,
        node_data: Option<serde_json::Value>,
    ) -> FlowResult<()> {
        self.store
            .record_transaction(UserTransaction {
                id: Uuid::new_v4().to_string(),
                node_id: node_id.to_string(),
                flow_id: flow_id.to_string(),
                user_identifier: user_key.user_identifier.clone(),
                brand_id: user_key.brand_id,
                channel: user_key.channel.clone(),
                processed_status: status,
                node_type: node_type.to_string(),
                processed_value,
                node_data,
                created_at: Utc::now(),
            })
            .await
    }
}
