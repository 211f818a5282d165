//! Core data model: flows, nodes, edges, triggers, users and their
//! supporting records. These types are owned exclusively by the Store;
//! every other component only ever holds a read-only snapshot, obtained
//! through a Store accessor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status of a [`Flow`]. Only `Published` flows are considered by the
/// trigger matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    #[default]
    Draft,
    Published,
    Stop,
}

/// The node types a flow graph can contain. `Condition` and `Delay` are
/// internal (evaluated in-process); the rest are dispatched to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    TriggerKeyword,
    TriggerTemplate,
    Message,
    Question,
    ButtonQuestion,
    ListQuestion,
    Condition,
    Delay,
    SendTemplate,
    SendEmailTemplate,
}

impl NodeType {
    /// `condition` and `delay` nodes are processed entirely by the
    /// Internal Node Processor and never dispatched to a channel.
    pub fn is_internal(self) -> bool {
        matches!(self, NodeType::Condition | NodeType::Delay)
    }

    /// Nodes that block on a user reply before the walker may advance.
    pub fn is_user_input(self) -> bool {
        matches!(
            self,
            NodeType::Question | NodeType::ButtonQuestion | NodeType::ListQuestion
        )
    }

    pub fn is_trigger(self) -> bool {
        matches!(self, NodeType::TriggerKeyword | NodeType::TriggerTemplate)
    }
}

/// One expected answer on a `trigger_template`/`button_question`/`list_question`
/// node: the id of the outgoing selector edge and the text that matches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedAnswer {
    #[serde(rename = "answerId")]
    pub answer_id: String,
    #[serde(rename = "expectedInput")]
    pub expected_input: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ValidationType {
    Number,
    Text,
    Email,
    Phone,
}

/// Validation rule attached to a free-text `question` node, or the retry
/// policy attached to an interactive node's expected answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerValidation {
    #[serde(rename = "type")]
    pub validation_type: ValidationType,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default, rename = "minValue")]
    pub min_value: Option<f64>,
    #[serde(default, rename = "maxValue")]
    pub max_value: Option<f64>,
    /// Stored as a string in the original flow editor payload; default "3".
    #[serde(default = "default_fails_count", rename = "failsCount")]
    pub fails_count: String,
    #[serde(default)]
    pub fallback: Option<String>,
}

fn default_fails_count() -> String {
    "3".to_string()
}

impl AnswerValidation {
    /// Parses `failsCount`, falling back to 3 on anything unparseable
    /// (mirrors the prototype's defensive `int(...)` fallback).
    pub fn fails_count(&self) -> u32 {
        self.fails_count.trim().parse().unwrap_or(3)
    }

    pub fn fallback_message(&self) -> String {
        self.fallback
            .clone()
            .unwrap_or_else(|| "This is not the valid response. Please try again below".into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    Equal,
    NotEqual,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNodeCondition {
    pub variable: String,
    #[serde(rename = "flowConditionType")]
    pub flow_condition_type: ConditionType,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionOperator {
    And,
    Or,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
    Seconds,
    #[default]
    Minutes,
    Hours,
    Days,
}

/// A node's type-specific payload. Flattened so a node document only
/// carries the fields relevant to its own `node_type`; everything else
/// stays `None`/empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type_name: String,
    #[serde(default, rename = "isStartNode")]
    pub is_start_node: bool,

    #[serde(default, rename = "expectedAnswers")]
    pub expected_answers: Vec<ExpectedAnswer>,
    #[serde(default, rename = "answerValidation")]
    pub answer_validation: Option<AnswerValidation>,
    #[serde(default, rename = "userInputVariable")]
    pub user_input_variable: Option<String>,

    #[serde(default, rename = "flowNodeConditions")]
    pub flow_node_conditions: Vec<FlowNodeCondition>,
    /// Ids of the two branch selector edges reachable from this condition
    /// node, e.g. `["cond1__true", "cond1__false"]`.
    #[serde(default, rename = "conditionResult")]
    pub condition_result: Vec<String>,
    #[serde(default, rename = "conditionOperator")]
    pub condition_operator: ConditionOperator,

    #[serde(default, rename = "delayDuration")]
    pub delay_duration: Option<i64>,
    #[serde(default, rename = "delayUnit")]
    pub delay_unit: DelayUnit,
    #[serde(default, rename = "waitForReply")]
    pub wait_for_reply: bool,
    #[serde(default, rename = "delayInterrupt")]
    pub delay_interrupt: bool,
    #[serde(default, rename = "delayResult")]
    pub delay_result: Vec<String>,

    /// Everything else the node editor stuffs in (message text, template
    /// refs, button labels...) that the walker never has to interpret.
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl FlowNode {
    pub fn node_type(&self) -> Option<NodeType> {
        match self.node_type_name.as_str() {
            "trigger_keyword" => Some(NodeType::TriggerKeyword),
            "trigger_template" => Some(NodeType::TriggerTemplate),
            "message" => Some(NodeType::Message),
            "question" => Some(NodeType::Question),
            "button_question" => Some(NodeType::ButtonQuestion),
            "list_question" => Some(NodeType::ListQuestion),
            "condition" => Some(NodeType::Condition),
            "delay" => Some(NodeType::Delay),
            "send_template" => Some(NodeType::SendTemplate),
            "send_email_template" => Some(NodeType::SendEmailTemplate),
            _ => None,
        }
    }
}

/// A directed edge. `source_node_id` may name a real node id or a
/// synthetic selector id (`{node}__true`, `{node}__interrupted`, a
/// button's answer id, ...) — callers must never parse the string to
/// decide which; membership in the node set is the only valid test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdge {
    pub id: String,
    #[serde(rename = "sourceNodeId")]
    pub source_node_id: String,
    #[serde(rename = "targetNodeId")]
    pub target_node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub flow_id: String,
    pub brand_id: i64,
    pub author_user_id: String,
    pub name: String,
    #[serde(default)]
    pub status: FlowStatus,
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn node(&self, node_id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn is_real_node(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    /// First edge whose `source_node_id` matches; per §9 this is the
    /// stable-but-unspecified tiebreak for nodes with multiple outgoing
    /// edges.
    pub fn edge_from(&self, source_node_id: &str) -> Option<&FlowEdge> {
        self.edges.iter().find(|e| e.source_node_id == source_node_id)
    }

    pub fn start_node(&self) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.is_start_node)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Keyword,
    Template,
}

/// Derived from a flow's start node when the flow is saved; queried by
/// brand and joined against `published` flows by the matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub flow_id: String,
    pub node_id: String,
    pub brand_id: i64,
    pub trigger_type: TriggerType,
    pub trigger_values: Vec<String>,
}

/// Metadata registry entry classifying a node type for runtime dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDetail {
    pub node_type: String,
    pub category: String,
    pub user_input_required: bool,
    pub is_internal: bool,
}

pub fn default_node_details() -> Vec<NodeDetail> {
    vec![
        ("trigger_keyword", "Trigger", false, false),
        ("trigger_template", "Trigger", false, false),
        ("message", "Action", false, false),
        ("question", "Action", true, false),
        ("button_question", "Action", true, false),
        ("list_question", "Action", true, false),
        ("condition", "Condition", false, true),
        ("delay", "Delay", false, true),
        ("send_template", "Action", false, false),
        ("send_email_template", "Action", false, false),
    ]
    .into_iter()
    .map(|(node_type, category, user_input_required, is_internal)| NodeDetail {
        node_type: node_type.to_string(),
        category: category.to_string(),
        user_input_required,
        is_internal,
    })
    .collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationState {
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub failure_message: Option<String>,
}

/// A single conversational end-user, keyed by brand + channel + the
/// channel's own account/identifier pair. The same phone number on two
/// brand WABA accounts is two distinct `User` rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_identifier: String,
    pub brand_id: i64,
    pub channel: String,
    pub channel_account_id: String,
    #[serde(default)]
    pub lead_id: Option<String>,
    #[serde(default)]
    pub is_in_automation: bool,
    #[serde(default)]
    pub current_flow_id: Option<String>,
    #[serde(default)]
    pub current_node_id: Option<String>,
    #[serde(default)]
    pub validation: ValidationState,
    /// Set while the user is parked on a `delay` node; holds the node's
    /// own payload so the orchestrator can read `delayResult`/`delayInterrupt`
    /// without re-fetching the flow.
    #[serde(default)]
    pub delay_node_data: Option<FlowNode>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn key(&self) -> UserKey {
        UserKey {
            brand_id: self.brand_id,
            channel: self.channel.clone(),
            channel_account_id: self.channel_account_id.clone(),
            user_identifier: self.user_identifier.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserKey {
    pub brand_id: i64,
    pub channel: String,
    pub channel_account_id: String,
    pub user_identifier: String,
}

impl std::fmt::Display for UserKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.brand_id, self.channel, self.channel_account_id, self.user_identifier
        )
    }
}

/// One captured variable, bound to a user + flow. Upserted as questions
/// are answered; read by condition evaluation with or without a leading
/// `@`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowUserContext {
    pub user_identifier: String,
    pub brand_id: i64,
    pub flow_id: String,
    pub variable_name: String,
    pub variable_value: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Pending,
    Processed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookMetadata {
    pub sender: String,
    pub brand_id: i64,
    pub user_id: Option<String>,
    pub channel_identifier: Option<String>,
    pub channel: String,
    pub message_type: String,
    pub status: WebhookStatus,
}

/// Immutable-after-terminal audit row: the raw payload plus the
/// normalized event, persisted before any downstream dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookMessage {
    pub id: String,
    pub metadata: WebhookMetadata,
    pub raw_payload: serde_json::Value,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delay {
    pub id: String,
    pub user_identifier: String,
    pub brand_id: i64,
    pub channel: String,
    pub channel_account_id: String,
    pub flow_id: String,
    pub delay_node_id: String,
    pub delay_node_data: FlowNode,
    pub delay_started_at: DateTime<Utc>,
    pub delay_completes_at: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
}

impl Delay {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.processed && self.delay_completes_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedStatus {
    Success,
    Error,
}

/// Append-only per-node execution record, aggregated for analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTransaction {
    pub id: String,
    pub node_id: String,
    pub flow_id: String,
    pub user_identifier: String,
    pub brand_id: i64,
    pub channel: String,
    pub processed_status: ProcessedStatus,
    pub node_type: String,
    pub processed_value: Option<serde_json::Value>,
    pub node_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Per-node, per-channel configuration an outbound node may need (e.g.
/// the source email address for `send_email_template`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSettings {
    pub flow_id: String,
    pub node_id: String,
    #[serde(default)]
    pub email_source_email: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}
