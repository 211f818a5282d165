//! Computes the next node via edges, handles internal nodes in-process,
//! invokes external channel-delivery for outbound nodes, and auto-chains
//! consecutive message nodes.

use std::sync::Arc;

use flow_core::{Flow, FlowError, FlowResult, NodeType, ProcessedStatus, Store, UserKey};
use serde_json::Value;

use crate::channel_dispatch::{ChannelDispatcher, ProcessNodeRequest};
use crate::internal_node::{process_internal_node, InternalOutcome};
use crate::transaction::TransactionRecorder;

#[derive(Debug, Clone)]
pub struct WalkRequest {
    pub user_key: UserKey,
    pub user_id: Option<String>,
    pub is_validation_error: bool,
    pub fallback_message: Option<String>,
    pub node_id_to_process: Option<String>,
    pub current_node_id: Option<String>,
    pub matched_answer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalkStatus {
    Advanced,
    ValidationExit,
}

#[derive(Debug, Clone)]
pub struct WalkResult {
    pub status: WalkStatus,
    pub next_node_id: Option<String>,
    pub processed_value: Option<Value>,
}

pub struct NodeWalker {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn ChannelDispatcher>,
    transactions: TransactionRecorder,
}

impl NodeWalker {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<dyn ChannelDispatcher>) -> Self {
        let transactions = TransactionRecorder::new(store.clone());
        Self { store, dispatcher, transactions }
    }

    pub async fn identify_and_process(&self, flow: &Flow, request: WalkRequest) -> FlowResult<WalkResult> {
        Box::pin(self.identify_and_process_inner(flow, request)).await
    }

    async fn identify_and_process_inner(&self, flow: &Flow, request: WalkRequest) -> FlowResult<WalkResult> {
        // Step 2: determine next node.
        let next_node_id = if request.is_validation_error {
            match &request.node_id_to_process {
                Some(retry_node) => retry_node.clone(),
                None => {
                    self.dispatch(flow, None, None, request.fallback_message.clone(), true, &request)
                        .await?;
                    return Ok(WalkResult { status: WalkStatus::ValidationExit, next_node_id: None, processed_value: None });
                }
            }
        } else if let Some(explicit) = &request.node_id_to_process {
            explicit.clone()
        } else {
            let source = request
                .matched_answer_id
                .clone()
                .or_else(|| request.current_node_id.clone())
                .ok_or_else(|| FlowError::InternalInvariant("no source to resolve an edge from".into()))?;
            let edge = flow
                .edge_from(&source)
                .ok_or_else(|| FlowError::InternalInvariant(format!("no edge with source_node_id = {source}")))?;
            edge.target_node_id.clone()
        };

        let next_node = flow
            .node(&next_node_id)
            .ok_or_else(|| FlowError::InternalInvariant(format!("node {next_node_id} not in flow")))?
            .clone();

        // Step 3: internal dispatch.
        if next_node.node_type().map(NodeType::is_internal).unwrap_or(false) {
            let context = self.store.all_context(&request.user_key, &flow.flow_id).await?;
            let outcome = process_internal_node(&next_node, &context)?;
            let processed_value = match &outcome {
                InternalOutcome::Condition { selector_id } => Value::String(selector_id.clone()),
                InternalOutcome::Delay { delay_duration, delay_unit, wait_time_seconds, wait_for_reply } => {
                    serde_json::json!({
                        "delay_duration": delay_duration,
                        "delay_unit": delay_unit,
                        "wait_time_seconds": wait_time_seconds,
                        "wait_for_reply": wait_for_reply,
                    })
                }
            };
            self.transactions
                .record(
                    &request.user_key,
                    &flow.flow_id,
                    &next_node.id,
                    &next_node.node_type_name,
                    ProcessedStatus::Success,
                    Some(processed_value.clone()),
                    None,
                )
                .await?;
            return Ok(WalkResult {
                status: WalkStatus::Advanced,
                next_node_id: Some(next_node.id.clone()),
                processed_value: Some(processed_value),
            });
        }

        // Step 4: external dispatch.
        self.dispatch(
            flow,
            request.current_node_id.as_deref(),
            Some(&next_node),
            request.fallback_message.clone(),
            request.is_validation_error,
            &request,
        )
        .await?;

        // Step 5: auto-chain consecutive message nodes (WhatsApp only).
        let final_node_id = if request.user_key.channel == "whatsapp" && next_node.node_type() == Some(NodeType::Message) {
            if let Some(chain_edge) = flow.edge_from(&next_node.id) {
                if let Some(target) = flow.node(&chain_edge.target_node_id) {
                    if target.node_type() == Some(NodeType::Message) {
                        let chained = self
                            .identify_and_process(
                                flow,
                                WalkRequest {
                                    user_key: request.user_key.clone(),
                                    user_id: request.user_id.clone(),
                                    is_validation_error: false,
                                    fallback_message: None,
                                    node_id_to_process: None,
                                    current_node_id: Some(target.id.clone()),
                                    matched_answer_id: None,
                                },
                            )
                            .await?;
                        return Ok(chained);
                    }
                }
            }
            next_node.id.clone()
        } else {
            next_node.id.clone()
        };

        // Step 6: record transaction for the regular dispatch path.
        self.transactions
            .record(
                &request.user_key,
                &flow.flow_id,
                &final_node_id,
                &next_node.node_type_name,
                ProcessedStatus::Success,
                None,
                Some(serde_json::to_value(&next_node).unwrap_or(Value::Null)),
            )
            .await?;

        Ok(WalkResult { status: WalkStatus::Advanced, next_node_id: Some(final_node_id), processed_value: None })
    }

    async fn dispatch(
        &self,
        flow: &Flow,
        current_node_id: Option<&str>,
        next_node: Option<&flow_core::FlowNode>,
        fallback_message: Option<String>,
        is_validation_error: bool,
        request: &WalkRequest,
    ) -> FlowResult<()> {
        if request.user_key.channel != "whatsapp" {
            return Ok(());
        }
        let payload = ProcessNodeRequest {
            flow_id: flow.flow_id.clone(),
            current_node_id: current_node_id.map(String::from),
            next_node_id: next_node.map(|n| n.id.clone()),
            next_node_data: next_node.map(|n| serde_json::to_value(n).unwrap_or(Value::Null)),
            user_identifier: request.user_key.user_identifier.clone(),
            brand_id: request.user_key.brand_id,
            user_id: request.user_id.clone(),
            channel: request.user_key.channel.clone(),
            fallback_message,
            is_validation_error,
        };
        self.dispatcher.dispatch(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::{FlowEdge, FlowNode, FlowStatus, MemoryStore};

    struct NoopDispatcher;

    #[async_trait::async_trait]
    impl ChannelDispatcher for NoopDispatcher {
        async fn dispatch(&self, _request: ProcessNodeRequest) -> FlowResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        last: std::sync::Mutex<Option<ProcessNodeRequest>>,
    }

    #[async_trait::async_trait]
    impl ChannelDispatcher for RecordingDispatcher {
        async fn dispatch(&self, request: ProcessNodeRequest) -> FlowResult<()> {
            *self.last.lock().unwrap() = Some(request);
            Ok(())
        }
    }

    fn key() -> UserKey {
        UserKey { brand_id: 1, channel: "whatsapp".into(), channel_account_id: "w".into(), user_identifier: "u".into() }
    }

    fn button_to_message_flow() -> Flow {
        Flow {
            flow_id: "f1".into(),
            brand_id: 1,
            author_user_id: "a".into(),
            name: "f".into(),
            status: FlowStatus::Published,
            nodes: vec![
                FlowNode { id: "B".into(), node_type_name: "button_question".into(), ..Default::default() },
                FlowNode { id: "M".into(), node_type_name: "message".into(), ..Default::default() },
                FlowNode { id: "Q".into(), node_type_name: "question".into(), ..Default::default() },
            ],
            edges: vec![
                FlowEdge { id: "e1".into(), source_node_id: "B_btn_cuet".into(), target_node_id: "M".into() },
                FlowEdge { id: "e2".into(), source_node_id: "M".into(), target_node_id: "Q".into() },
            ],
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn edge_lookup_resolves_via_matched_answer_id() {
        let walker = NodeWalker::new(Arc::new(MemoryStore::new()), Arc::new(NoopDispatcher));
        let flow = button_to_message_flow();
        let result = walker
            .identify_and_process(
                &flow,
                WalkRequest {
                    user_key: key(),
                    user_id: None,
                    is_validation_error: false,
                    fallback_message: None,
                    node_id_to_process: None,
                    current_node_id: Some("B".into()),
                    matched_answer_id: Some("B_btn_cuet".into()),
                },
            )
            .await
            .unwrap();
        // No auto-chain: the node after M is a question, not a message,
        // so the chain stops at M (only consecutive message nodes merge).
        assert_eq!(result.next_node_id.as_deref(), Some("M"));
    }

    #[tokio::test]
    async fn missing_edge_is_internal_invariant_error() {
        let walker = NodeWalker::new(Arc::new(MemoryStore::new()), Arc::new(NoopDispatcher));
        let flow = button_to_message_flow();
        let err = walker
            .identify_and_process(
                &flow,
                WalkRequest {
                    user_key: key(),
                    user_id: None,
                    is_validation_error: false,
                    fallback_message: None,
                    node_id_to_process: None,
                    current_node_id: Some("nonexistent".into()),
                    matched_answer_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InternalInvariant(_)));
    }

    #[tokio::test]
    async fn validation_error_without_retry_node_is_exit() {
        let walker = NodeWalker::new(Arc::new(MemoryStore::new()), Arc::new(NoopDispatcher));
        let flow = button_to_message_flow();
        let result = walker
            .identify_and_process(
                &flow,
                WalkRequest {
                    user_key: key(),
                    user_id: None,
                    is_validation_error: true,
                    fallback_message: Some("try again".into()),
                    node_id_to_process: None,
                    current_node_id: Some("B".into()),
                    matched_answer_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(result.status, WalkStatus::ValidationExit);
        assert_eq!(result.next_node_id, None);
    }

    #[tokio::test]
    async fn condition_node_returns_processed_value() {
        let store = Arc::new(MemoryStore::new());
        let walker = NodeWalker::new(store.clone(), Arc::new(NoopDispatcher));
        let mut flow = button_to_message_flow();
        flow.nodes.push(FlowNode {
            id: "cond1".into(),
            node_type_name: "condition".into(),
            condition_result: vec!["cond1__true".into(), "cond1__false".into()],
            flow_node_conditions: vec![],
            condition_operator: flow_core::ConditionOperator::And,
            ..Default::default()
        });
        flow.edges.push(FlowEdge { id: "e3".into(), source_node_id: "Q".into(), target_node_id: "cond1".into() });
        let result = walker
            .identify_and_process(
                &flow,
                WalkRequest {
                    user_key: key(),
                    user_id: None,
                    is_validation_error: false,
                    fallback_message: None,
                    node_id_to_process: None,
                    current_node_id: Some("Q".into()),
                    matched_answer_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(result.next_node_id.as_deref(), Some("cond1"));
        assert_eq!(result.processed_value, Some(Value::String("cond1__true".into())));
    }

    #[tokio::test]
    async fn mismatch_retry_dispatch_reports_is_validation_error() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let walker = NodeWalker::new(Arc::new(MemoryStore::new()), dispatcher.clone());
        let flow = button_to_message_flow();
        walker
            .identify_and_process(
                &flow,
                WalkRequest {
                    user_key: key(),
                    user_id: None,
                    is_validation_error: true,
                    fallback_message: Some("Pick one.".into()),
                    node_id_to_process: Some("B".into()),
                    current_node_id: Some("B".into()),
                    matched_answer_id: None,
                },
            )
            .await
            .unwrap();
        let dispatched = dispatcher.last.lock().unwrap().clone().expect("dispatch was recorded");
        assert!(dispatched.is_validation_error);
    }
}
