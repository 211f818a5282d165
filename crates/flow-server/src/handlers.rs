use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use flow_channels::{finalize, intake, is_synthetic_scheduled_trigger, NormalizedEvent, WebhookMessageRequest, WebhookResponse};
use flow_core::{Flow, FlowError, FlowPatch, FlowStatus, NodeDetail, UserKey};
use flow_runtime::ProcessNodeRequest;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::state::AppState;

/// Every flow-management endpoint requires this header; its absence is a
/// client error, not a missing-resource one.
fn require_user_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ApiError(FlowError::Unauthorized("missing x-user-id header".into())))
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "service": format!("flow-server/{}", flow_core::VERSION)}))
}

pub async fn webhook_message(
    State(state): State<AppState>,
    Json(request): Json<WebhookMessageRequest>,
) -> Result<Json<WebhookResponse>, ApiError> {
    let (webhook_id, normalized) = intake(&state.store, &request).await?;

    if is_synthetic_scheduled_trigger(&request) {
        // Scheduled triggers are handed off to the out-of-core
        // Time-Triggered service, never to the per-user orchestrator —
        // routing one through `Orchestrator::handle` would materialize a
        // spurious User row keyed on the synthetic flow_id identifier.
        finalize(&state.store, &webhook_id, true).await;
        return Ok(Json(WebhookResponse {
            status: "ok".into(),
            message: "scheduled trigger accepted".into(),
            automation_triggered: false,
            flow_id: normalized.flow_id,
            current_node_id: None,
            error_details: None,
        }));
    }

    let key = UserKey {
        brand_id: request.brand_id,
        channel: request.channel.clone(),
        channel_account_id: request.channel_account_id(),
        user_identifier: resolve_identifier(&request, &normalized),
    };

    let result = state
        .orchestrator
        .handle(key, request.user_id.clone(), &request.message_type, normalized)
        .await;

    match result {
        Ok(outcome) => {
            finalize(&state.store, &webhook_id, true).await;
            Ok(Json(WebhookResponse {
                status: "ok".into(),
                message: outcome.message,
                automation_triggered: outcome.automation_triggered,
                flow_id: outcome.flow_id,
                current_node_id: outcome.current_node_id,
                error_details: None,
            }))
        }
        Err(err) => {
            finalize(&state.store, &webhook_id, false).await;
            warn!(error = %err, "webhook processing failed");
            Ok(Json(WebhookResponse {
                status: "error".into(),
                message: "processing failed".into(),
                automation_triggered: false,
                flow_id: None,
                current_node_id: None,
                error_details: Some(err.to_string()),
            }))
        }
    }
}

/// `delay_complete` and `scheduled_trigger` synthetic events carry their
/// own identifier field; real channel messages key off the sender.
fn resolve_identifier(request: &WebhookMessageRequest, normalized: &NormalizedEvent) -> String {
    normalized
        .user_state_id
        .clone()
        .or_else(|| normalized.flow_id.clone())
        .unwrap_or_else(|| request.sender.clone())
}

#[derive(Debug, Deserialize)]
pub struct CreateFlowRequest {
    pub brand_id: i64,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<flow_core::FlowNode>,
    #[serde(default)]
    pub edges: Vec<flow_core::FlowEdge>,
}

pub async fn create_flow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateFlowRequest>,
) -> Result<Json<Flow>, ApiError> {
    let author_user_id = require_user_id(&headers)?;
    let now = chrono::Utc::now();
    let flow = Flow {
        flow_id: uuid::Uuid::new_v4().to_string(),
        brand_id: request.brand_id,
        author_user_id,
        name: request.name,
        status: FlowStatus::Draft,
        nodes: request.nodes,
        edges: request.edges,
        created_at: now,
        updated_at: now,
    };
    let created = state.store.create_flow(flow).await?;
    Ok(Json(created))
}

#[derive(Debug, Deserialize)]
pub struct UpdateFlowRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nodes: Option<Vec<flow_core::FlowNode>>,
    #[serde(default)]
    pub edges: Option<Vec<flow_core::FlowEdge>>,
}

pub async fn update_flow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(flow_id): Path<String>,
    Json(request): Json<UpdateFlowRequest>,
) -> Result<Json<Flow>, ApiError> {
    require_user_id(&headers)?;
    let patch = FlowPatch { name: request.name, nodes: request.nodes, edges: request.edges };
    let updated = state.store.update_flow(&flow_id, patch).await?;
    Ok(Json(updated))
}

pub async fn list_flows(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Flow>>, ApiError> {
    let author_user_id = require_user_id(&headers)?;
    let flows = state.store.list_flows(&author_user_id).await?;
    Ok(Json(flows))
}

pub async fn flow_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(flow_id): Path<String>,
) -> Result<Json<Flow>, ApiError> {
    require_user_id(&headers)?;
    let flow = state.store.get_flow(&flow_id).await?;
    Ok(Json(flow))
}

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub status: FlowStatus,
}

pub async fn set_flow_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(flow_id): Path<String>,
    Json(request): Json<SetStatusRequest>,
) -> Result<Json<Flow>, ApiError> {
    require_user_id(&headers)?;
    let flow = state.store.set_flow_status(&flow_id, request.status).await?;
    Ok(Json(flow))
}

pub async fn node_details_list(State(state): State<AppState>) -> Json<Vec<NodeDetail>> {
    Json(state.store.all_node_details())
}

pub async fn node_detail(
    State(state): State<AppState>,
    Path(node_type): Path<String>,
) -> Result<Json<NodeDetail>, ApiError> {
    state
        .store
        .node_detail(&node_type)
        .map(Json)
        .ok_or_else(|| ApiError(FlowError::NotFound(format!("node type {node_type}"))))
}

pub async fn node_details_by_category(
    State(state): State<AppState>,
    Path(category): Path<String>,
) -> Json<Vec<NodeDetail>> {
    Json(state.store.node_details_by_category(&category))
}

/// Sink for the WhatsApp node-delivery callback; in this deployment the
/// work is already done by the orchestrator before dispatch, so this
/// just acknowledges receipt for the channel-delivery client.
pub async fn agentflow_node_process(Json(request): Json<ProcessNodeRequest>) -> StatusCode {
    info!(flow_id = %request.flow_id, next_node_id = ?request.next_node_id, "node process acknowledged");
    StatusCode::OK
}
