//! Evaluates a user reply against the active node's expected answers
//! and/or declared validation rules, deciding retry/exit/accept/cross-match.
//! Reads the failure counter but never mutates user state itself; the
//! caller persists whatever `Outcome` implies.

use std::sync::Arc;

use flow_core::{AnswerValidation, Flow, FlowResult, FlowUserContext, NodeType, Store, UserKey, ValidationType};
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Matched { answer_id: String },
    MatchedOtherNode { node_id: String },
    MismatchRetry { fallback_message: String },
    ValidationExit { fallback_message: String },
    UseDefaultEdge,
}

pub struct ReplyValidator {
    store: Arc<dyn Store>,
}

impl ReplyValidator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// `is_text` is true for free-text `question` nodes; interactive
    /// nodes (`button_question`/`list_question`/`trigger_template`) are
    /// matched by exact expected-answer equality instead.
    pub async fn validate_and_match(
        &self,
        user_key: &UserKey,
        flow: &Flow,
        current_node_id: &str,
        user_reply: &str,
        is_text: bool,
        current_validation_count: u32,
    ) -> FlowResult<Outcome> {
        let current_node = flow
            .node(current_node_id)
            .ok_or_else(|| flow_core::FlowError::InternalInvariant(format!("node {current_node_id} not in flow")))?;

        // Step 1: match against the current node's own expected answers.
        if let Some(answer_id) = match_expected_answer(current_node, user_reply) {
            if is_text {
                if let Some(var) = &current_node.user_input_variable {
                    self.save_variable(user_key, &flow.flow_id, var, user_reply, current_node_id)
                        .await?;
                }
            }
            return Ok(Outcome::Matched { answer_id });
        }

        // Step 2: free-text validation rules.
        if is_text {
            if let Some(validation) = &current_node.answer_validation {
                return self
                    .apply_validation(
                        user_key,
                        flow,
                        current_node_id,
                        user_reply,
                        validation,
                        current_validation_count,
                    )
                    .await;
            }
            return Ok(Outcome::UseDefaultEdge);
        }

        // Step 3: cross-flow match across every interactive node.
        if let Some(node_id) = match_any_interactive_node(flow, user_reply) {
            return Ok(Outcome::MatchedOtherNode { node_id });
        }

        // Step 4: validation-cap check on the current interactive node.
        let node_type = current_node.node_type();
        if matches!(node_type, Some(NodeType::ButtonQuestion) | Some(NodeType::ListQuestion)) {
            let (fails_count, fallback) = match &current_node.answer_validation {
                Some(v) => (v.fails_count(), v.fallback_message()),
                None => (3, "This is not the valid response. Please try again below".to_string()),
            };
            return Ok(if current_validation_count >= fails_count {
                Outcome::ValidationExit { fallback_message: fallback }
            } else {
                Outcome::MismatchRetry { fallback_message: fallback }
            });
        }

        Ok(Outcome::UseDefaultEdge)
    }

    async fn apply_validation(
        &self,
        user_key: &UserKey,
        flow: &Flow,
        current_node_id: &str,
        user_reply: &str,
        validation: &AnswerValidation,
        current_validation_count: u32,
    ) -> FlowResult<Outcome> {
        let passes = validate_value(user_reply, validation);
        if passes {
            let current_node = flow.node(current_node_id).unwrap();
            if let Some(var) = &current_node.user_input_variable {
                self.save_variable(user_key, &flow.flow_id, var, user_reply, current_node_id)
                    .await?;
            }
            return Ok(Outcome::UseDefaultEdge);
        }

        let fails_count = validation.fails_count();
        let fallback = validation.fallback_message();
        Ok(if current_validation_count >= fails_count {
            Outcome::ValidationExit { fallback_message: fallback }
        } else {
            Outcome::MismatchRetry { fallback_message: fallback }
        })
    }

    async fn save_variable(
        &self,
        user_key: &UserKey,
        flow_id: &str,
        variable: &str,
        value: &str,
        node_id: &str,
    ) -> FlowResult<()> {
        self.store
            .upsert_context(FlowUserContext {
                user_identifier: user_key.user_identifier.clone(),
                brand_id: user_key.brand_id,
                flow_id: flow_id.to_string(),
                variable_name: variable.to_string(),
                variable_value: value.to_string(),
                node_id: node_id.to_string(),
            })
            .await
    }
}

fn match_expected_answer(node: &flow_core::FlowNode, user_reply: &str) -> Option<String> {
    let node_type = node.node_type()?;
    if !matches!(
        node_type,
        NodeType::TriggerTemplate | NodeType::ButtonQuestion | NodeType::ListQuestion
    ) {
        return None;
    }
    if node.expected_answers.is_empty() {
        return None;
    }
    node.expected_answers
        .iter()
        .find(|a| a.expected_input.to_lowercase() == user_reply.to_lowercase())
        .map(|a| a.answer_id.clone())
}

fn match_any_interactive_node(flow: &Flow, user_reply: &str) -> Option<String> {
    for node in &flow.nodes {
        if !matches!(
            node.node_type(),
            Some(NodeType::ButtonQuestion) | Some(NodeType::ListQuestion)
        ) {
            continue;
        }
        if node
            .expected_answers
            .iter()
            .any(|a| a.expected_input.to_lowercase() == user_reply.to_lowercase())
        {
            // The edge resolver needs the matched answer id, but the
            // prototype cross-match resolves straight to the node id of
            // the matched question node; callers treat it like any other
            // `node_id_to_process`.
            return Some(node.id.clone());
        }
    }
    None
}

fn validate_value(reply: &str, validation: &AnswerValidation) -> bool {
    let base_ok = match validation.validation_type {
        ValidationType::Number => match reply.trim().parse::<f64>() {
            Ok(n) => within_bounds(n, validation.min_value, validation.max_value),
            Err(_) => false,
        },
        ValidationType::Text => {
            let len = reply.chars().count() as f64;
            within_bounds(len, validation.min_value, validation.max_value)
        }
        ValidationType::Email => Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$")
            .unwrap()
            .is_match(reply),
        ValidationType::Phone => {
            let stripped: String = reply
                .chars()
                .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')' | '+'))
                .collect();
            !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) && stripped.len() >= 7
        }
    };
    if !base_ok {
        return false;
    }
    match &validation.regex {
        Some(pattern) => Regex::new(pattern).map(|re| re.is_match(reply)).unwrap_or(false),
        None => true,
    }
}

fn within_bounds(value: f64, min: Option<f64>, max: Option<f64>) -> bool {
    if let Some(min) = min {
        if value < min {
            return false;
        }
    }
    if let Some(max) = max {
        if value > max {
            return false;
        }
    }
    true
}
