//! Message state-signature fingerprinting. See SPEC_FULL.md §4.7 step 3.
//!
//! Grounded on `session.rs`'s compare-and-emit `update_status` pattern
//! (detect a change by comparing a cheap fingerprint, not the whole value)
//! combined with the message shape `opencode_client.rs` treats as opaque
//! JSON.

use serde_json::Value;

const TEXT_PREVIEW_LEN: usize = 200;

/// A deterministic fingerprint of a message used to detect new or changed
/// messages between polls: role, createdAt, a joined-text preview, part
/// count, and whether any part carries an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSignature {
    pub role: String,
    pub created_at: String,
    pub text_preview: String,
    pub part_count: usize,
    pub has_error: bool,
}

/// The message's own id, used as the key messages are diffed by. Messages
/// missing an `id` field are skipped entirely — they can't be diffed.
pub fn message_id(message: &Value) -> Option<String> {
    message
        .get("id")
        .or_else(|| message.get("info").and_then(|i| i.get("id")))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn message_role(message: &Value) -> Option<String> {
    message
        .get("role")
        .or_else(|| message.get("info").and_then(|i| i.get("role")))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn parts(message: &Value) -> &[Value] {
    message
        .get("parts")
        .and_then(|v| v.as_array())
        .map(|v| v.as_slice())
        .unwrap_or(&[])
}

fn joined_text_preview(message: &Value) -> String {
    let joined = parts(message)
        .iter()
        .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
        .collect::<Vec<_>>()
        .join("");
    joined.chars().take(TEXT_PREVIEW_LEN).collect()
}

fn has_error(message: &Value) -> bool {
    message.get("error").is_some()
        || message
            .get("info")
            .and_then(|i| i.get("error"))
            .map(|e| !e.is_null())
            .unwrap_or(false)
        || parts(message).iter().any(|p| p.get("error").is_some())
}

/// Fingerprint `message`. Returns `None` when the message carries no `id`
/// (it cannot be tracked across polls) — callers skip such entries.
pub fn signature(message: &Value) -> Option<(String, MessageSignature)> {
    let id = message_id(message)?;
    let created_at = message
        .get("createdAt")
        .or_else(|| message.get("info").and_then(|i| i.get("createdAt")))
        .map(|v| v.to_string())
        .unwrap_or_default();
    Some((
        id,
        MessageSignature {
            role: message_role(message).unwrap_or_default(),
            created_at,
            text_preview: joined_text_preview(message),
            part_count: parts(message).len(),
            has_error: has_error(message),
        },
    ))
}
