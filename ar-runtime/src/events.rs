//! AR event normalization. See SPEC_FULL.md §4.7's redesign-flag note: one
//! normalizer, used by both the foreground await loop and `subscribeToEvents`,
//! rather than the teacher's `run()`/`connect_event_stream()` duplication.

use serde::{Deserialize, Serialize};

/// `{type, properties}`, the shape every AR event arrives in over the
/// `text/event-stream` connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: serde_json::Value,
}

/// How a session-scoped event affects the activity-then-idle protocol of
/// `ConversationManager::send_*_prompt_and_await_messages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// A message changed; the caller should poll and re-emit deltas.
    Activity,
    /// The AR finished processing the prompt.
    Idle,
    /// The AR reported a session-level failure.
    Error,
    /// Anything else — still delivered to general/log subscribers, but does
    /// not affect the await loop's deadline or termination.
    Other,
}

const ACTIVITY_EVENT_TYPES: &[&str] = &[
    "message.updated",
    "message.part.updated",
    "message.part.removed",
    "message.removed",
];

/// Parse a raw `"data: {...}"` SSE line into an [`ArEvent`]. Returns `None`
/// for lines that are not a well-formed `data:` frame or fail to parse —
/// callers skip those rather than treating them as fatal.
pub fn parse_sse_line(line: &str) -> Option<ArEvent> {
    let payload = line.strip_prefix("data: ")?;
    serde_json::from_str(payload).ok()
}

/// Three-level fallback used throughout the teacher's event handling:
/// top-level `sessionID`, then `info.sessionID`, then `part.sessionID`.
pub fn extract_session_id(event: &ArEvent) -> Option<String> {
    let props = &event.properties;
    props
        .get("sessionID")
        .and_then(|v| v.as_str())
        .or_else(|| {
            props
                .get("info")
                .and_then(|i| i.get("sessionID"))
                .and_then(|v| v.as_str())
        })
        .or_else(|| {
            props
                .get("part")
                .and_then(|p| p.get("sessionID"))
                .and_then(|v| v.as_str())
        })
        .map(|s| s.to_string())
}

/// Whether `event` is scoped to `session_id` — events with no discoverable
/// session id are never treated as session-scoped.
pub fn is_session_scoped(event: &ArEvent, session_id: &str) -> bool {
    extract_session_id(event).as_deref() == Some(session_id)
}

/// Classify an already-session-scoped event for the await loop.
pub fn classify(event: &ArEvent) -> EventClass {
    if ACTIVITY_EVENT_TYPES.contains(&event.event_type.as_str()) {
        return EventClass::Activity;
    }
    match event.event_type.as_str() {
        "session.idle" | "session.completed" => EventClass::Idle,
        "session.status" => {
            let status_type = event
                .properties
                .get("status")
                .and_then(|s| s.get("type"))
                .and_then(|v| v.as_str());
            match status_type {
                Some("idle") | Some("completed") | Some("done") => EventClass::Idle,
                _ => EventClass::Other,
            }
        }
        "session.error" => EventClass::Error,
        _ => EventClass::Other,
    }
}

/// Human-readable error message for a `session.error` event:
/// `properties.error.data.message` > `.name` > a fixed fallback.
pub fn extract_error_message(event: &ArEvent) -> String {
    let error = event.properties.get("error");
    error
        .and_then(|e| e.get("data"))
        .and_then(|d| d.get("message"))
        .and_then(|v| v.as_str())
        .or_else(|| error.and_then(|e| e.get("name")).and_then(|v| v.as_str()))
        .unwrap_or("Session execution failed.")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, properties: serde_json::Value) -> ArEvent {
        ArEvent {
            event_type: event_type.to_string(),
            properties,
        }
    }

    #[test]
    fn extracts_top_level_session_id() {
        let e = event("message.updated", serde_json::json!({"sessionID": "s1"}));
        assert_eq!(extract_session_id(&e).as_deref(), Some("s1"));
    }

    #[test]
    fn falls_back_to_info_session_id() {
        let e = event(
            "message.updated",
            serde_json::json!({"info": {"sessionID": "s1"}}),
        );
        assert_eq!(extract_session_id(&e).as_deref(), Some("s1"));
    }

    #[test]
    fn falls_back_to_part_session_id() {
        let e = event(
            "message.part.updated",
            serde_json::json!({"part": {"sessionID": "s1"}}),
        );
        assert_eq!(extract_session_id(&e).as_deref(), Some("s1"));
    }

    #[test]
    fn returns_none_when_absent() {
        let e = event("message.updated", serde_json::json!({}));
        assert_eq!(extract_session_id(&e), None);
    }

    #[test]
    fn classifies_activity_events() {
        for ty in ACTIVITY_EVENT_TYPES {
            let e = event(ty, serde_json::json!({}));
            assert_eq!(classify(&e), EventClass::Activity);
        }
    }

    #[test]
    fn classifies_idle_events() {
        assert_eq!(classify(&event("session.idle", serde_json::json!({}))), EventClass::Idle);
        assert_eq!(
            classify(&event("session.completed", serde_json::json!({}))),
            EventClass::Idle
        );
        assert_eq!(
            classify(&event(
                "session.status",
                serde_json::json!({"status": {"type": "done"}})
            )),
            EventClass::Idle
        );
    }

    #[test]
    fn session_status_running_is_other() {
        let e = event(
            "session.status",
            serde_json::json!({"status": {"type": "running"}}),
        );
        assert_eq!(classify(&e), EventClass::Other);
    }

    #[test]
    fn classifies_error_events() {
        assert_eq!(classify(&event("session.error", serde_json::json!({}))), EventClass::Error);
    }

    #[test]
    fn error_message_prefers_data_message() {
        let e = event(
            "session.error",
            serde_json::json!({"error": {"data": {"message": "boom"}, "name": "Err"}}),
        );
        assert_eq!(extract_error_message(&e), "boom");
    }

    #[test]
    fn error_message_falls_back_to_name_then_default() {
        let e = event("session.error", serde_json::json!({"error": {"name": "Err"}}));
        assert_eq!(extract_error_message(&e), "Err");

        let e = event("session.error", serde_json::json!({}));
        assert_eq!(extract_error_message(&e), "Session execution failed.");
    }

    #[test]
    fn parses_sse_data_line() {
        let line = r#"data: {"type":"session.idle","properties":{"sessionID":"s1"}}"#;
        let event = parse_sse_line(line).unwrap();
        assert_eq!(event.event_type, "session.idle");
        assert_eq!(extract_session_id(&event).as_deref(), Some("s1"));
    }

    #[test]
    fn rejects_non_data_lines() {
        assert!(parse_sse_line("event: ping").is_none());
        assert!(parse_sse_line("data: not json").is_none());
    }
}
