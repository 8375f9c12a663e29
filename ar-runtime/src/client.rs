//! A typed client bound to one directory on a running AR instance. See
//! SPEC_FULL.md §4.3/§4.7.
//!
//! Grounded in `opencode_client.rs`'s `create_session`/`send_message`/
//! `connect_event_stream`/`abort` request shapes (query-param-scoped
//! `?directory=`, `"data: "`-prefixed SSE framing), minus the Basic-auth
//! header construction (see DESIGN.md's dependency-drop note on `base64`).

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use acp_core::ModelSelection;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::{ArError, Result};
use crate::events::{parse_sse_line, ArEvent};

/// A model offered by a provider, as returned by `GET /provider`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
}

/// `GET /provider` response entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

/// `GET /provider` response: `{providers:[...], default:{providerID ->
/// modelID}}`. `default` is kept as a `serde_json::Map` (order-preserving,
/// via the `preserve_order` feature) since it is consulted in order — the
/// first entry whose provider/model pair actually exists wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderList {
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub default: serde_json::Map<String, serde_json::Value>,
}

impl ProviderList {
    /// Iterates `default` in order as `(providerID, modelID)` pairs, skipping
    /// any entry whose value isn't a string.
    pub fn default_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.default.iter().filter_map(|(k, v)| v.as_str().map(|v| (k.as_str(), v)))
    }
}

/// A message as returned by `GET /session/{id}/message`. The body is kept
/// as `serde_json::Value` — the conversation manager only needs to compute
/// a state signature over it, never the full typed SDK shape.
pub type RawMessage = serde_json::Value;

pub struct ArClient {
    http: reqwest::Client,
    base_url: String,
    directory: PathBuf,
    timeout: Duration,
}

impl ArClient {
    pub fn new(http: reqwest::Client, base_url: String, directory: PathBuf, timeout: Duration) -> Self {
        Self {
            http,
            base_url,
            directory,
            timeout,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn directory_query(&self) -> String {
        urlencoding::encode(&self.directory.to_string_lossy()).into_owned()
    }

    async fn check_status(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(ArError::Http {
                status,
                body: format!("{what}: {body}"),
            })
        }
    }

    /// `POST /session?directory=...` → the new session's opaque id.
    pub async fn create_session(&self) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/session?directory={}", self.base_url, self.directory_query()))
            .timeout(self.timeout)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let resp = Self::check_status(resp, "create session").await?;
        let data: serde_json::Value = resp.json().await?;
        data.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ArError::UnexpectedResponse("session response had no 'id' field".into()))
    }

    /// `GET /session/{id}/message?directory=...` → every message currently
    /// recorded for the session.
    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<RawMessage>> {
        let resp = self
            .http
            .get(format!(
                "{}/session/{}/message?directory={}",
                self.base_url,
                session_id,
                self.directory_query()
            ))
            .timeout(self.timeout)
            .send()
            .await?;
        let resp = Self::check_status(resp, "list messages").await?;
        let data: serde_json::Value = resp.json().await?;
        match data {
            serde_json::Value::Array(items) => Ok(items),
            other => Err(ArError::UnexpectedResponse(format!(
                "expected a message array, got {other}"
            ))),
        }
    }

    /// `POST /session/{id}/message?directory=...`: fire-and-acknowledge —
    /// the await loop learns about progress from the event stream, not from
    /// this call's response body.
    pub async fn send_prompt_async(
        &self,
        session_id: &str,
        prompt: &str,
        agent: Option<&str>,
        model: Option<&ModelSelection>,
    ) -> Result<()> {
        let mut body = serde_json::json!({
            "parts": [{"type": "text", "text": prompt}],
        });
        if let Some(agent) = agent {
            body["agent"] = serde_json::Value::String(agent.to_string());
        }
        if let Some(model) = model {
            body["providerID"] = serde_json::Value::String(model.provider_id.clone());
            body["modelID"] = serde_json::Value::String(model.model_id.clone());
        }

        let resp = self
            .http
            .post(format!(
                "{}/session/{}/message?directory={}",
                self.base_url,
                session_id,
                self.directory_query()
            ))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        Self::check_status(resp, "send prompt").await?;
        Ok(())
    }

    /// `POST /session/{id}/abort?directory=...`. Best-effort: errors are
    /// swallowed, matching the teacher's `abort()` (there is no meaningful
    /// recovery from a failed abort other than letting the task time out).
    pub async fn abort(&self, session_id: &str) {
        let _ = self
            .http
            .post(format!(
                "{}/session/{}/abort?directory={}",
                self.base_url,
                session_id,
                self.directory_query()
            ))
            .timeout(self.timeout)
            .send()
            .await;
    }

    /// `GET /provider` → the providers, models, and ordered per-provider
    /// default model map the AR currently exposes.
    pub async fn providers(&self) -> Result<ProviderList> {
        let resp = self
            .http
            .get(format!("{}/provider", self.base_url))
            .timeout(self.timeout)
            .send()
            .await?;
        let resp = Self::check_status(resp, "list providers").await?;
        let data: serde_json::Value = resp.json().await?;
        // Some AR builds return a bare array instead of {providers, default}.
        let data = match data {
            serde_json::Value::Array(_) => serde_json::json!({"providers": data}),
            other => other,
        };
        serde_json::from_value(data).map_err(|e| ArError::UnexpectedResponse(format!("malformed provider list: {e}")))
    }

    /// Open `GET /event?directory=...` as a `text/event-stream` connection
    /// and yield normalized [`ArEvent`]s, one per `"data: "` frame. Used by
    /// both the conversation manager's foreground await loop and
    /// `subscribeToEvents` — the single normalizer the §9 redesign flag
    /// calls for.
    pub async fn open_event_stream(&self) -> Result<BoxStream<'static, ArEvent>> {
        let resp = self
            .http
            .get(format!("{}/event?directory={}", self.base_url, self.directory_query()))
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        let resp = Self::check_status(resp, "open event stream").await?;

        let state = (resp.bytes_stream(), String::new(), VecDeque::new());
        let stream = futures::stream::unfold(state, |(mut bytes, mut buffer, mut queue)| async move {
            loop {
                if let Some(event) = queue.pop_front() {
                    return Some((event, (bytes, buffer, queue)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = buffer.find('\n') {
                            let line: String = buffer.drain(..=pos).collect();
                            if let Some(event) = parse_sse_line(line.trim_end_matches(['\r', '\n'])) {
                                queue.push_back(event);
                            }
                        }
                    }
                    Some(Err(_)) | None => {
                        if queue.is_empty() {
                            return None;
                        }
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_query_url_encodes() {
        let client = ArClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1234".to_string(),
            PathBuf::from("/tmp/a b"),
            Duration::from_secs(5),
        );
        assert_eq!(client.directory_query(), "%2Ftmp%2Fa%20b");
    }
}
