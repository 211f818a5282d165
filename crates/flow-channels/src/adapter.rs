//! Normalizes heterogeneous inbound payloads into a single
//! [`NormalizedEvent`], and recognizes the two synthetic event kinds the
//! rest of the engine treats as ordinary channels: `delay_complete` and
//! `scheduled_trigger`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Channel-agnostic view of an inbound message. Downstream components
/// must never branch on the original channel or payload shape, only on
/// these fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NormalizedEvent {
    #[serde(default)]
    pub user_reply: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    /// Set only by a matched interactive reply; carries forward through
    /// the pipeline rather than being re-derived.
    #[serde(default)]
    pub matched_answer_id: Option<String>,
    /// Carried by the two synthetic event kinds.
    #[serde(default)]
    pub user_state_id: Option<String>,
    #[serde(default)]
    pub flow_id: Option<String>,
}

fn first_text(v: &Value, paths: &[&[&str]]) -> Option<String> {
    for path in paths {
        let mut cur = v;
        let mut ok = true;
        for key in *path {
            match cur.get(key) {
                Some(next) => cur = next,
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            if let Some(s) = cur.as_str() {
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}

/// Normalizes one inbound payload. `channel` is ignored for the two
/// synthetic message types, which are recognized by `message_type` alone.
pub fn normalize(channel: &str, message_type: &str, payload: &Value) -> NormalizedEvent {
    match message_type {
        "delay_complete" => {
            return NormalizedEvent {
                user_state_id: payload
                    .get("user_state_id")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                ..Default::default()
            };
        }
        "scheduled_trigger" => {
            return NormalizedEvent {
                flow_id: payload.get("flow_id").and_then(|v| v.as_str()).map(String::from),
                ..Default::default()
            };
        }
        _ => {}
    }

    let (user_reply, media_url, media_type) = match channel {
        "whatsapp" => normalize_whatsapp(message_type, payload),
        "email" | "gmail" => normalize_email(payload),
        "telegram" => normalize_telegram(payload),
        "sms" => normalize_sms(payload),
        "instagram" | "facebook" => normalize_meta(payload),
        _ => (
            payload.get("user_reply").and_then(|v| v.as_str()).map(String::from),
            None,
            None,
        ),
    };

    NormalizedEvent {
        user_reply,
        media_url,
        media_type,
        ..Default::default()
    }
}

fn normalize_whatsapp(message_type: &str, payload: &Value) -> (Option<String>, Option<String>, Option<String>) {
    let reply = match message_type {
        "text" => first_text(payload, &[&["text", "body"]]),
        "button" => first_text(payload, &[&["button", "text"]]),
        "interactive" => first_text(
            payload,
            &[
                &["interactive", "button_reply", "title"],
                &["interactive", "list_reply", "title"],
            ],
        ),
        _ => None,
    };
    if reply.is_some() {
        return (reply, None, None);
    }
    // media types: fall back to the caption, keep the media reference.
    let media_url = payload
        .get(message_type)
        .and_then(|m| m.get("link").or_else(|| m.get("id")))
        .and_then(|v| v.as_str())
        .map(String::from);
    let caption = payload
        .get(message_type)
        .and_then(|m| m.get("caption"))
        .and_then(|v| v.as_str())
        .map(String::from);
    (caption, media_url, Some(message_type.to_string()))
}

fn normalize_email(payload: &Value) -> (Option<String>, Option<String>, Option<String>) {
    let reply = first_text(payload, &[&["subject"], &["body"]]);
    (reply, None, None)
}

fn normalize_telegram(payload: &Value) -> (Option<String>, Option<String>, Option<String>) {
    let reply = first_text(payload, &[&["message", "text"], &["callback_query", "data"]]);
    (reply, None, None)
}

fn normalize_sms(payload: &Value) -> (Option<String>, Option<String>, Option<String>) {
    let reply = first_text(payload, &[&["text"], &["body"], &["message"]]);
    (reply, None, None)
}

fn normalize_meta(payload: &Value) -> (Option<String>, Option<String>, Option<String>) {
    let reply = first_text(
        payload,
        &[&["message", "text"], &["text"], &["postback", "title"]],
    );
    (reply, None, None)
}

/// `sender == "system" && channel == "system"` with one of the two
/// synthetic message types designates an engine-originated event rather
/// than a real inbound message.
pub fn is_scheduled_trigger_webhook(sender: &str, channel: &str, message_type: &str) -> bool {
    message_type == "scheduled_trigger" && sender == "system" && channel == "system"
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whatsapp_text_extracts_body() {
        let event = normalize("whatsapp", "text", &json!({"text": {"body": "Learn now"}}));
        assert_eq!(event.user_reply.as_deref(), Some("Learn now"));
    }

    #[test]
    fn whatsapp_interactive_button_reply() {
        let event = normalize(
            "whatsapp",
            "interactive",
            &json!({"interactive": {"button_reply": {"title": "CUET"}}}),
        );
        assert_eq!(event.user_reply.as_deref(), Some("CUET"));
    }

    #[test]
    fn delay_complete_is_channel_agnostic() {
        let event = normalize("sms", "delay_complete", &json!({"user_state_id": "u-1"}));
        assert_eq!(event.user_state_id.as_deref(), Some("u-1"));
        assert!(event.user_reply.is_none());
    }

    #[test]
    fn scheduled_trigger_carries_flow_id() {
        let event = normalize("system", "scheduled_trigger", &json!({"flow_id": "f-1"}));
        assert_eq!(event.flow_id.as_deref(), Some("f-1"));
    }

    #[test]
    fn normalization_is_deterministic() {
        let payload = json!({"text": {"body": "hi"}});
        let a = normalize("whatsapp", "text", &payload);
        let b = normalize("whatsapp", "text", &payload);
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_message_type_falls_back_to_user_reply_field() {
        let event = normalize("telegram", "unsupported", &json!({"user_reply": "hey"}));
        assert!(event.user_reply.is_none());
    }

    #[test]
    fn scheduled_trigger_webhook_requires_system_sender_and_channel() {
        assert!(is_scheduled_trigger_webhook("system", "system", "scheduled_trigger"));
        assert!(!is_scheduled_trigger_webhook("+1555", "whatsapp", "scheduled_trigger"));
    }
}
