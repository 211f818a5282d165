//! Pure evaluators for `condition` and `delay` nodes. Neither has side
//! effects of its own; the orchestrator performs the Store writes their
//! result implies.

use std::collections::HashMap;

use flow_core::{ConditionOperator, ConditionType, DelayUnit, FlowError, FlowNode, FlowResult};

#[derive(Debug, Clone, PartialEq)]
pub enum InternalOutcome {
    /// One of the node's two branch selector ids (`{node}__true`/`__false`).
    Condition { selector_id: String },
    Delay {
        delay_duration: i64,
        delay_unit: DelayUnit,
        wait_time_seconds: i64,
        wait_for_reply: bool,
    },
}

/// Evaluates `condition`/`delay` nodes. `context` is the full set of
/// captured `FlowUserContext` variables for this user+flow.
pub fn process_internal_node(node: &FlowNode, context: &HashMap<String, String>) -> FlowResult<InternalOutcome> {
    match node.node_type() {
        Some(flow_core::NodeType::Condition) => process_condition(node, context),
        Some(flow_core::NodeType::Delay) => process_delay(node),
        _ => Err(FlowError::InternalInvariant(format!(
            "node {} is not an internal node",
            node.id
        ))),
    }
}

fn process_condition(node: &FlowNode, context: &HashMap<String, String>) -> FlowResult<InternalOutcome> {
    let results: Vec<bool> = node
        .flow_node_conditions
        .iter()
        .map(|cond| evaluate_condition(cond, context))
        .collect();

    let combined = match node.condition_operator {
        ConditionOperator::Or => results.iter().any(|b| *b),
        ConditionOperator::And | ConditionOperator::None => results.iter().all(|b| *b),
    };

    let suffix = if combined { "__true" } else { "__false" };
    let selector_id = node
        .condition_result
        .iter()
        .find(|id| id.ends_with(suffix))
        .cloned()
        .ok_or_else(|| {
            FlowError::InternalInvariant(format!(
                "condition node {} has no {suffix} selector in conditionResult",
                node.id
            ))
        })?;

    Ok(InternalOutcome::Condition { selector_id })
}

fn evaluate_condition(cond: &flow_core::FlowNodeCondition, context: &HashMap<String, String>) -> bool {
    let actual = lookup_variable(context, &cond.variable).unwrap_or_default();
    let expected = cond.value.clone();

    match cond.flow_condition_type {
        ConditionType::Equal => actual.to_lowercase() == expected.to_lowercase(),
        ConditionType::NotEqual => actual.to_lowercase() != expected.to_lowercase(),
        ConditionType::Contains => actual.to_lowercase().contains(&expected.to_lowercase()),
        ConditionType::NotContains => !actual.to_lowercase().contains(&expected.to_lowercase()),
        ConditionType::GreaterThan => match (actual.parse::<f64>(), expected.parse::<f64>()) {
            (Ok(a), Ok(b)) => a > b,
            _ => false,
        },
        ConditionType::LessThan => match (actual.parse::<f64>(), expected.parse::<f64>()) {
            (Ok(a), Ok(b)) => a < b,
            _ => false,
        },
    }
}

/// Variables may be declared with or without a leading `@`; try the
/// `@`-prefixed form first, as the prototype does.
fn lookup_variable(context: &HashMap<String, String>, variable: &str) -> Option<String> {
    let bare = variable.trim_start_matches('@');
    let prefixed = format!("@{bare}");
    context.get(&prefixed).or_else(|| context.get(bare)).cloned()
}

fn process_delay(node: &FlowNode) -> FlowResult<InternalOutcome> {
    let delay_duration = node
        .delay_duration
        .ok_or_else(|| FlowError::InternalInvariant(format!("delay node {} missing delayDuration", node.id)))?;
    let wait_time_seconds = match node.delay_unit {
        DelayUnit::Seconds => delay_duration,
        DelayUnit::Minutes => delay_duration * 60,
        DelayUnit::Hours => delay_duration * 3600,
        DelayUnit::Days => delay_duration * 86_400,
    };
    Ok(InternalOutcome::Delay {
        delay_duration,
        delay_unit: node.delay_unit,
        wait_time_seconds,
        wait_for_reply: node.wait_for_reply,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::FlowNodeCondition;

    fn condition_node(operator: ConditionOperator, conditions: Vec<FlowNodeCondition>) -> FlowNode {
        FlowNode {
            id: "cond1".into(),
            node_type_name: "condition".into(),
            flow_node_conditions: conditions,
            condition_result: vec!["cond1__true".into(), "cond1__false".into()],
            condition_operator: operator,
            ..Default::default()
        }
    }

    #[test]
    fn equal_condition_true_branch() {
        let node = condition_node(
            ConditionOperator::None,
            vec![FlowNodeCondition {
                variable: "@name".into(),
                flow_condition_type: ConditionType::Equal,
                value: "Abhishek".into(),
            }],
        );
        let ctx = HashMap::from([("@name".to_string(), "Abhishek".to_string())]);
        let outcome = process_internal_node(&node, &ctx).unwrap();
        assert_eq!(outcome, InternalOutcome::Condition { selector_id: "cond1__true".into() });
    }

    #[test]
    fn not_equal_is_negation_of_equal() {
        let ctx = HashMap::from([("x".to_string(), "v".to_string())]);
        let eq = evaluate_condition(
            &FlowNodeCondition { variable: "x".into(), flow_condition_type: ConditionType::Equal, value: "v".into() },
            &ctx,
        );
        let neq = evaluate_condition(
            &FlowNodeCondition { variable: "x".into(), flow_condition_type: ConditionType::NotEqual, value: "v".into() },
            &ctx,
        );
        assert_eq!(eq, !neq);
    }

    #[test]
    fn variable_lookup_tries_at_prefix_first() {
        let ctx = HashMap::from([("@x".to_string(), "1".to_string())]);
        assert_eq!(lookup_variable(&ctx, "x").as_deref(), Some("1"));
        assert_eq!(lookup_variable(&ctx, "@x").as_deref(), Some("1"));
    }

    #[test]
    fn missing_variable_is_empty_string_not_error() {
        let node = condition_node(
            ConditionOperator::And,
            vec![FlowNodeCondition { variable: "@missing".into(), flow_condition_type: ConditionType::Equal, value: "".into() }],
        );
        let outcome = process_internal_node(&node, &HashMap::new()).unwrap();
        assert_eq!(outcome, InternalOutcome::Condition { selector_id: "cond1__true".into() });
    }

    #[test]
    fn numeric_comparison_defaults_false_on_parse_failure() {
        let ctx = HashMap::from([("@age".to_string(), "not-a-number".to_string())]);
        let result = evaluate_condition(
            &FlowNodeCondition { variable: "@age".into(), flow_condition_type: ConditionType::GreaterThan, value: "5".into() },
            &ctx,
        );
        assert!(!result);
    }

    #[test]
    fn delay_minutes_converts_to_seconds() {
        let node = FlowNode {
            id: "d1".into(),
            node_type_name: "delay".into(),
            delay_duration: Some(1),
            delay_unit: DelayUnit::Minutes,
            ..Default::default()
        };
        let ctx = HashMap::new();
        let outcome = process_internal_node(&node, &ctx).unwrap();
        assert_eq!(
            outcome,
            InternalOutcome::Delay { delay_duration: 1, delay_unit: DelayUnit::Minutes, wait_time_seconds: 60, wait_for_reply: false }
        );
    }
}
