//! Top-level per-user state machine. On an inbound normalized event,
//! performs exactly one of: unknown-user bootstrap, delay-complete
//! resumption, or natural-event handling (trigger / delay-interrupt /
//! validation-retry / plain advance). Every transition holds the
//! per-user lock for its whole duration so concurrent events for the
//! same identity never interleave.

use std::sync::Arc;

use chrono::Utc;
use flow_core::{
    Delay, Flow, FlowError, FlowResult, NodeType, Store, User, UserKey, ValidationState,
};
use flow_channels::{NormalizedEvent, TriggerMatcher};
use tracing::info;

use crate::node_walker::{NodeWalker, WalkRequest, WalkStatus};
use crate::reply_validator::{Outcome, ReplyValidator};

pub struct Orchestrator {
    store: Arc<dyn Store>,
    matcher: TriggerMatcher,
    validator: ReplyValidator,
    walker: NodeWalker,
}

#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    pub automation_triggered: bool,
    pub flow_id: Option<String>,
    pub current_node_id: Option<String>,
    pub message: String,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, walker: NodeWalker) -> Self {
        Self {
            matcher: TriggerMatcher::new(store.clone()),
            validator: ReplyValidator::new(store.clone()),
            walker,
            store,
        }
    }

    pub async fn handle(
        &self,
        key: UserKey,
        user_id: Option<String>,
        message_type: &str,
        event: NormalizedEvent,
    ) -> FlowResult<OrchestrationResult> {
        let _guard = self.store.lock_user(&key).await;

        if message_type == "delay_complete" {
            return self.handle_delay_complete(&key, &user_id, &event).await;
        }

        let existing = self.store.get_user(&key).await?;
        match existing {
            None => self.handle_unknown_user(&key, &user_id, message_type, &event).await,
            Some(user) if user.is_in_automation && user.delay_node_data.is_some() => {
                self.handle_delay_interrupt(&key, &user_id, user, &event).await
            }
            Some(user) if user.is_in_automation && user.current_node_id.is_some() => {
                self.handle_in_automation(&key, &user_id, user, &event).await
            }
            Some(user) => self.handle_not_in_automation(&key, &user_id, user, message_type, &event).await,
        }
    }

    async fn handle_unknown_user(
        &self,
        key: &UserKey,
        user_id: &Option<String>,
        message_type: &str,
        event: &NormalizedEvent,
    ) -> FlowResult<OrchestrationResult> {
        let user = User {
            user_identifier: key.user_identifier.clone(),
            brand_id: key.brand_id,
            channel: key.channel.clone(),
            channel_account_id: key.channel_account_id.clone(),
            lead_id: None,
            is_in_automation: false,
            current_flow_id: None,
            current_node_id: None,
            validation: ValidationState::default(),
            delay_node_data: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.create_user(user).await?;
        self.trigger_path(key, user_id, message_type, event).await
    }

    async fn handle_not_in_automation(
        &self,
        key: &UserKey,
        user_id: &Option<String>,
        _user: User,
        message_type: &str,
        event: &NormalizedEvent,
    ) -> FlowResult<OrchestrationResult> {
        self.trigger_path(key, user_id, message_type, event).await
    }

    async fn trigger_path(
        &self,
        key: &UserKey,
        user_id: &Option<String>,
        message_type: &str,
        event: &NormalizedEvent,
    ) -> FlowResult<OrchestrationResult> {
        let matched = self
            .matcher
            .find_match(key.brand_id, message_type, event.user_reply.as_deref())
            .await?;

        let Some(matched) = matched else {
            return Ok(OrchestrationResult {
                automation_triggered: false,
                flow_id: None,
                current_node_id: None,
                message: "No trigger matched".into(),
            });
        };

        let flow = self.store.get_flow(&matched.flow_id).await?;
        let walk = self
            .walker
            .identify_and_process(
                &flow,
                WalkRequest {
                    user_key: key.clone(),
                    user_id: user_id.clone(),
                    is_validation_error: false,
                    fallback_message: None,
                    node_id_to_process: None,
                    current_node_id: Some(matched.trigger_node_id.clone()),
                    matched_answer_id: None,
                },
            )
            .await?;

        self.post_process(key, &flow, walk).await?;

        Ok(OrchestrationResult {
            automation_triggered: true,
            flow_id: Some(matched.flow_id),
            current_node_id: self.store.get_user(key).await?.and_then(|u| u.current_node_id),
            message: "Trigger matched".into(),
        })
    }

    async fn handle_delay_complete(
        &self,
        key: &UserKey,
        user_id: &Option<String>,
        event: &NormalizedEvent,
    ) -> FlowResult<OrchestrationResult> {
        let user = self.store.get_user(key).await?;
        let Some(user) = user else {
            return Ok(stale_result());
        };
        let Some(delay_node) = &user.delay_node_data else {
            return Ok(stale_result());
        };
        if !user.is_in_automation {
            return Ok(stale_result());
        }
        let _ = event;

        let selector_id = delay_node
            .delay_result
            .iter()
            .find(|id| id.ends_with("__not_interrupted"))
            .cloned()
            .ok_or_else(|| FlowError::InternalInvariant("delay node missing __not_interrupted selector".into()))?;

        let flow_id = user
            .current_flow_id
            .clone()
            .ok_or_else(|| FlowError::InternalInvariant("in-automation user missing current_flow_id".into()))?;
        let flow = self.store.get_flow(&flow_id).await?;

        let walk = self
            .walker
            .identify_and_process(
                &flow,
                WalkRequest {
                    user_key: key.clone(),
                    user_id: user_id.clone(),
                    is_validation_error: false,
                    fallback_message: None,
                    node_id_to_process: None,
                    current_node_id: Some(selector_id),
                    matched_answer_id: None,
                },
            )
            .await?;

        if walk.status == WalkStatus::Advanced && walk.next_node_id.is_some() {
            self.post_process(key, &flow, walk).await?;
            self.clear_delay_data(key).await?;
        }

        Ok(OrchestrationResult {
            automation_triggered: true,
            flow_id: Some(flow_id),
            current_node_id: self.store.get_user(key).await?.and_then(|u| u.current_node_id),
            message: "Delay resumed".into(),
        })
    }

    async fn handle_delay_interrupt(
        &self,
        key: &UserKey,
        user_id: &Option<String>,
        user: User,
        _event: &NormalizedEvent,
    ) -> FlowResult<OrchestrationResult> {
        let delay_node = user.delay_node_data.clone().expect("checked by caller");
        if !delay_node.delay_interrupt {
            return Ok(OrchestrationResult {
                automation_triggered: false,
                flow_id: user.current_flow_id.clone(),
                current_node_id: user.current_node_id.clone(),
                message: "Delay in progress, reply ignored".into(),
            });
        }

        if let Some(active) = self.store.active_delay_for_user(key).await? {
            self.store.mark_delay_processed(&active.id).await?;
        }

        let selector_id = delay_node
            .delay_result
            .iter()
            .find(|id| id.ends_with("__interrupted"))
            .cloned()
            .ok_or_else(|| FlowError::InternalInvariant("delay node missing __interrupted selector".into()))?;

        let flow_id = user
            .current_flow_id
            .clone()
            .ok_or_else(|| FlowError::InternalInvariant("in-automation user missing current_flow_id".into()))?;
        let flow = self.store.get_flow(&flow_id).await?;

        let walk = self
            .walker
            .identify_and_process(
                &flow,
                WalkRequest {
                    user_key: key.clone(),
                    user_id: user_id.clone(),
                    is_validation_error: false,
                    fallback_message: None,
                    node_id_to_process: None,
                    current_node_id: Some(selector_id),
                    matched_answer_id: None,
                },
            )
            .await?;

        self.post_process(key, &flow, walk).await?;
        self.clear_delay_data(key).await?;

        Ok(OrchestrationResult {
            automation_triggered: true,
            flow_id: Some(flow_id),
            current_node_id: self.store.get_user(key).await?.and_then(|u| u.current_node_id),
            message: "Delay interrupted".into(),
        })
    }

    async fn handle_in_automation(
        &self,
        key: &UserKey,
        user_id: &Option<String>,
        user: User,
        event: &NormalizedEvent,
    ) -> FlowResult<OrchestrationResult> {
        let flow_id = user
            .current_flow_id
            .clone()
            .ok_or_else(|| FlowError::InternalInvariant("in-automation user missing current_flow_id".into()))?;
        let current_node_id = user
            .current_node_id
            .clone()
            .ok_or_else(|| FlowError::InternalInvariant("in-automation user missing current_node_id".into()))?;
        let flow = self.store.get_flow(&flow_id).await?;
        let current_node = flow
            .node(&current_node_id)
            .ok_or_else(|| FlowError::InternalInvariant(format!("node {current_node_id} not in flow")))?;

        let is_user_input = current_node.node_type().map(NodeType::is_user_input).unwrap_or(false);

        if !is_user_input {
            let walk = self
                .walker
                .identify_and_process(
                    &flow,
                    WalkRequest {
                        user_key: key.clone(),
                        user_id: user_id.clone(),
                        is_validation_error: false,
                        fallback_message: None,
                        node_id_to_process: None,
                        current_node_id: Some(current_node_id.clone()),
                        matched_answer_id: None,
                    },
                )
                .await?;
            self.post_process(key, &flow, walk).await?;
            return Ok(OrchestrationResult {
                automation_triggered: false,
                flow_id: Some(flow_id),
                current_node_id: self.store.get_user(key).await?.and_then(|u| u.current_node_id),
                message: "Advanced".into(),
            });
        }

        let is_text = current_node.node_type() == Some(NodeType::Question);
        let user_reply = event.user_reply.clone().unwrap_or_default();
        let outcome = self
            .validator
            .validate_and_match(key, &flow, &current_node_id, &user_reply, is_text, user.validation.failure_count)
            .await?;

        let (walk_request, reset_on_success) = match outcome {
            Outcome::Matched { answer_id } => (
                WalkRequest {
                    user_key: key.clone(),
                    user_id: user_id.clone(),
                    is_validation_error: false,
                    fallback_message: None,
                    node_id_to_process: None,
                    current_node_id: Some(current_node_id.clone()),
                    matched_answer_id: Some(answer_id),
                },
                true,
            ),
            Outcome::MatchedOtherNode { node_id } => (
                WalkRequest {
                    user_key: key.clone(),
                    user_id: user_id.clone(),
                    is_validation_error: false,
                    fallback_message: None,
                    node_id_to_process: Some(node_id),
                    current_node_id: Some(current_node_id.clone()),
                    matched_answer_id: None,
                },
                true,
            ),
            Outcome::MismatchRetry { fallback_message } => {
                let mut updated = user.clone();
                updated.validation.failure_count += 1;
                updated.validation.failed = true;
                updated.validation.failure_message = Some(fallback_message.clone());
                self.store.save_user(updated).await?;
                (
                    WalkRequest {
                        user_key: key.clone(),
                        user_id: user_id.clone(),
                        is_validation_error: true,
                        fallback_message: Some(fallback_message),
                        node_id_to_process: Some(current_node_id.clone()),
                        current_node_id: Some(current_node_id.clone()),
                        matched_answer_id: None,
                    },
                    false,
                )
            }
            Outcome::ValidationExit { fallback_message } => {
                // Does not advance, does not reset the counter, does not
                // exit automation — only sends the fallback.
                let walk = self
                    .walker
                    .identify_and_process(
                        &flow,
                        WalkRequest {
                            user_key: key.clone(),
                            user_id: user_id.clone(),
                            is_validation_error: true,
                            fallback_message: Some(fallback_message),
                            node_id_to_process: None,
                            current_node_id: Some(current_node_id.clone()),
                            matched_answer_id: None,
                        },
                    )
                    .await?;
                let _ = walk;
                return Ok(OrchestrationResult {
                    automation_triggered: false,
                    flow_id: Some(flow_id),
                    current_node_id: Some(current_node_id),
                    message: "Validation cap reached".into(),
                });
            }
            Outcome::UseDefaultEdge => (
                WalkRequest {
                    user_key: key.clone(),
                    user_id: user_id.clone(),
                    is_validation_error: false,
                    fallback_message: None,
                    node_id_to_process: None,
                    current_node_id: Some(current_node_id.clone()),
                    matched_answer_id: None,
                },
                true,
            ),
        };

        let walk = self.walker.identify_and_process(&flow, walk_request).await?;

        if reset_on_success && walk.status == WalkStatus::Advanced {
            if let Some(mut u) = self.store.get_user(key).await? {
                u.validation = ValidationState::default();
                self.store.save_user(u).await?;
            }
        }

        self.post_process(key, &flow, walk).await?;

        Ok(OrchestrationResult {
            automation_triggered: false,
            flow_id: Some(flow_id),
            current_node_id: self.store.get_user(key).await?.and_then(|u| u.current_node_id),
            message: "Advanced".into(),
        })
    }

    /// After the walker returns a `next_node_id`, classify it and either
    /// recurse, park on a delay, persist in-automation state, or end the
    /// automation on a terminal node with no outgoing edges.
    async fn post_process(
        &self,
        key: &UserKey,
        flow: &Flow,
        walk: crate::node_walker::WalkResult,
    ) -> FlowResult<()> {
        if walk.status != WalkStatus::Advanced {
            return Ok(());
        }
        let Some(next_id) = &walk.next_node_id else {
            return Ok(());
        };
        let Some(next_node) = flow.node(next_id) else {
            return Err(FlowError::InternalInvariant(format!("node {next_id} not in flow")));
        };
        let node_type = next_node.node_type();

        if node_type == Some(NodeType::Condition) {
            if let Some(selector) = walk.processed_value.as_ref().and_then(|v| v.as_str()) {
                let recursed = self
                    .walker
                    .identify_and_process(
                        flow,
                        WalkRequest {
                            user_key: key.clone(),
                            user_id: None,
                            is_validation_error: false,
                            fallback_message: None,
                            node_id_to_process: None,
                            current_node_id: Some(selector.to_string()),
                            matched_answer_id: None,
                        },
                    )
                    .await?;
                return Box::pin(self.post_process(key, flow, recursed)).await;
            }
            return Ok(());
        }

        if node_type == Some(NodeType::Delay) {
            let wait_time_seconds = walk
                .processed_value
                .as_ref()
                .and_then(|v| v.get("wait_time_seconds"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let mut user = self
                .store
                .get_user(key)
                .await?
                .ok_or_else(|| FlowError::InternalInvariant("user disappeared mid-transition".into()))?;
            user.is_in_automation = true;
            user.current_flow_id = Some(flow.flow_id.clone());
            user.current_node_id = Some(next_id.clone());
            user.delay_node_data = Some(next_node.clone());
            self.store.save_user(user).await?;

            let now = Utc::now();
            self.store
                .insert_delay(Delay {
                    id: uuid::Uuid::new_v4().to_string(),
                    user_identifier: key.user_identifier.clone(),
                    brand_id: key.brand_id,
                    channel: key.channel.clone(),
                    channel_account_id: key.channel_account_id.clone(),
                    flow_id: flow.flow_id.clone(),
                    delay_node_id: next_id.clone(),
                    delay_node_data: next_node.clone(),
                    delay_started_at: now,
                    delay_completes_at: now + chrono::Duration::seconds(wait_time_seconds),
                    processed: false,
                })
                .await?;
            return Ok(());
        }

        let is_user_input = node_type.map(NodeType::is_user_input).unwrap_or(false);
        if is_user_input {
            let mut user = self
                .store
                .get_user(key)
                .await?
                .ok_or_else(|| FlowError::InternalInvariant("user disappeared mid-transition".into()))?;
            user.is_in_automation = true;
            user.current_flow_id = Some(flow.flow_id.clone());
            user.current_node_id = Some(next_id.clone());
            self.store.save_user(user).await?;
            return Ok(());
        }

        if flow.edge_from(next_id).is_none() {
            // Terminal node: clean exit.
            let mut user = self
                .store
                .get_user(key)
                .await?
                .ok_or_else(|| FlowError::InternalInvariant("user disappeared mid-transition".into()))?;
            user.is_in_automation = false;
            user.current_flow_id = None;
            user.current_node_id = None;
            self.store.save_user(user).await?;
            info!(node_id = %next_id, "flow reached terminal node, automation ended");
            return Ok(());
        }

        let recursed = self
            .walker
            .identify_and_process(
                flow,
                WalkRequest {
                    user_key: key.clone(),
                    user_id: None,
                    is_validation_error: false,
                    fallback_message: None,
                    node_id_to_process: None,
                    current_node_id: Some(next_id.clone()),
                    matched_answer_id: None,
                },
            )
            .await?;
        Box::pin(self.post_process(key, flow, recursed)).await
    }

    async fn clear_delay_data(&self, key: &UserKey) -> FlowResult<()> {
        if let Some(mut user) = self.store.get_user(key).await? {
            user.delay_node_data = None;
            self.store.save_user(user).await?;
        }
        Ok(())
    }
}

fn stale_result() -> OrchestrationResult {
    OrchestrationResult {
        automation_triggered: false,
        flow_id: None,
        current_node_id: None,
        message: "Stale delay, ignored".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_dispatch::ChannelDispatcher;
    use flow_core::{ExpectedAnswer, FlowEdge, FlowNode, FlowStatus, MemoryStore};
    use std::collections::HashMap;

    struct NoopDispatcher;

    #[async_trait::async_trait]
    impl ChannelDispatcher for NoopDispatcher {
        async fn dispatch(&self, _request: crate::channel_dispatch::ProcessNodeRequest) -> FlowResult<()> {
            Ok(())
        }
    }

    fn key() -> UserKey {
        UserKey { brand_id: 1, channel: "whatsapp".into(), channel_account_id: "waba-1".into(), user_identifier: "+1555".into() }
    }

    fn build_orchestrator() -> (Orchestrator, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let walker = NodeWalker::new(store.clone(), Arc::new(NoopDispatcher));
        (Orchestrator::new(store.clone(), walker), store)
    }

    fn keyword_trigger_flow() -> Flow {
        Flow {
            flow_id: "f1".into(),
            brand_id: 1,
            author_user_id: "a".into(),
            name: "Learn".into(),
            status: FlowStatus::Published,
            nodes: vec![
                FlowNode {
                    id: "T".into(),
                    node_type_name: "trigger_keyword".into(),
                    is_start_node: true,
                    extra: HashMap::from([("triggerValues".to_string(), serde_json::json!(["Learn"]))]),
                    ..Default::default()
                },
                FlowNode {
                    id: "B".into(),
                    node_type_name: "button_question".into(),
                    expected_answers: vec![
                        ExpectedAnswer { answer_id: "B_btn_cuet".into(), expected_input: "CUET".into() },
                        ExpectedAnswer { answer_id: "B_btn_iit".into(), expected_input: "IIT".into() },
                    ],
                    answer_validation: Some(flow_core::AnswerValidation {
                        validation_type: flow_core::ValidationType::Text,
                        regex: None,
                        min_value: None,
                        max_value: None,
                        fails_count: "2".into(),
                        fallback: Some("Pick one.".into()),
                    }),
                    ..Default::default()
                },
                FlowNode { id: "M".into(), node_type_name: "message".into(), ..Default::default() },
            ],
            edges: vec![
                FlowEdge { id: "e1".into(), source_node_id: "T".into(), target_node_id: "B".into() },
                FlowEdge { id: "e2".into(), source_node_id: "B_btn_cuet".into(), target_node_id: "M".into() },
                FlowEdge { id: "e3".into(), source_node_id: "B_btn_iit".into(), target_node_id: "M".into() },
            ],
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn keyword_trigger_ignites_flow_for_unknown_user() {
        let (orchestrator, store) = build_orchestrator();
        store.create_flow(keyword_trigger_flow()).await.unwrap();
        store.set_flow_status("f1", FlowStatus::Published).await.unwrap();

        let result = orchestrator
            .handle(key(), None, "text", NormalizedEvent { user_reply: Some("Learn now".into()), ..Default::default() })
            .await
            .unwrap();

        assert!(result.automation_triggered);
        assert_eq!(result.flow_id.as_deref(), Some("f1"));
        assert_eq!(result.current_node_id.as_deref(), Some("B"));

        let user = store.get_user(&key()).await.unwrap().unwrap();
        assert!(user.is_in_automation);
        assert_eq!(user.current_node_id.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn button_reply_advances_and_auto_chains_through_message() {
        let (orchestrator, store) = build_orchestrator();
        store.create_flow(keyword_trigger_flow()).await.unwrap();
        store.set_flow_status("f1", FlowStatus::Published).await.unwrap();
        orchestrator
            .handle(key(), None, "text", NormalizedEvent { user_reply: Some("Learn now".into()), ..Default::default() })
            .await
            .unwrap();

        orchestrator
            .handle(key(), None, "button", NormalizedEvent { user_reply: Some("CUET".into()), ..Default::default() })
            .await
            .unwrap();

        let user = store.get_user(&key()).await.unwrap().unwrap();
        // M has no outgoing edge -> terminal, automation ends.
        assert!(!user.is_in_automation);
        assert_eq!(user.current_node_id, None);
    }

    #[tokio::test]
    async fn mismatch_then_cap_then_valid_reply_resets_counter() {
        let (orchestrator, store) = build_orchestrator();
        store.create_flow(keyword_trigger_flow()).await.unwrap();
        store.set_flow_status("f1", FlowStatus::Published).await.unwrap();
        orchestrator
            .handle(key(), None, "text", NormalizedEvent { user_reply: Some("Learn now".into()), ..Default::default() })
            .await
            .unwrap();

        for _ in 0..2 {
            orchestrator
                .handle(key(), None, "button", NormalizedEvent { user_reply: Some("xyz".into()), ..Default::default() })
                .await
                .unwrap();
        }
        let user = store.get_user(&key()).await.unwrap().unwrap();
        assert_eq!(user.validation.failure_count, 2);
        assert!(user.is_in_automation);

        // Third mismatch: validation_exit. Counter unchanged, still in automation.
        orchestrator
            .handle(key(), None, "button", NormalizedEvent { user_reply: Some("xyz".into()), ..Default::default() })
            .await
            .unwrap();
        let user = store.get_user(&key()).await.unwrap().unwrap();
        assert_eq!(user.validation.failure_count, 2);
        assert!(user.is_in_automation);

        orchestrator
            .handle(key(), None, "button", NormalizedEvent { user_reply: Some("IIT".into()), ..Default::default() })
            .await
            .unwrap();
        let user = store.get_user(&key()).await.unwrap().unwrap();
        assert_eq!(user.validation.failure_count, 0);
    }
}
