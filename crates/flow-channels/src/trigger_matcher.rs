//! Given a brand and a normalized event, selects the `(flow_id,
//! trigger_node_id)` of the first matching published trigger.

use std::sync::Arc;

use flow_core::{FlowResult, Store, TriggerType};

/// Result of a successful match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMatch {
    pub flow_id: String,
    pub trigger_node_id: String,
}

pub struct TriggerMatcher {
    store: Arc<dyn Store>,
}

impl TriggerMatcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// `message_type` gates keyword triggers to `"text"`; template
    /// triggers apply regardless. Triggers are checked in stored order
    /// and the first match wins, making the result deterministic for a
    /// fixed trigger table and input.
    pub async fn find_match(
        &self,
        brand_id: i64,
        message_type: &str,
        user_reply: Option<&str>,
    ) -> FlowResult<Option<TriggerMatch>> {
        let text = match user_reply.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Ok(None),
        };

        let triggers = self.store.published_triggers(brand_id).await?;
        for trigger in triggers {
            let hit = match trigger.trigger_type {
                TriggerType::Keyword => {
                    message_type == "text"
                        && trigger
                            .trigger_values
                            .iter()
                            .any(|kw| text.to_lowercase().contains(&kw.to_lowercase()))
                }
                TriggerType::Template => trigger
                    .trigger_values
                    .iter()
                    .any(|v| v.to_lowercase() == text.to_lowercase()),
            };
            if hit {
                return Ok(Some(TriggerMatch {
                    flow_id: trigger.flow_id,
                    trigger_node_id: trigger.node_id,
                }));
            }
        }
        Ok(None)
    }
}
