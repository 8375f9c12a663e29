//! Session-scoped conversation manager. See SPEC_FULL.md §4.7.
//!
//! Grounded on `agent-runner/src/session.rs`'s state map + compare-and-emit
//! `update_status` pattern, combined with `opencode_client.rs`'s wire
//! handling — unified here behind `ar_runtime`'s single event normalizer
//! rather than the teacher's separate await-loop/subscription codepaths.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use acp_core::{LogContext, LogLevel, Logger, ModelSelection, NoopLogger, Session};
use ar_runtime::{classify, extract_error_message, is_session_scoped, ArClient, ArEvent, ArRuntimeHandle, EventClass, Provider, ProviderList};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{ConversationError, Result};
use crate::signature::{signature, MessageSignature};

const DEFAULT_TIMEOUT_MS: u64 = 45_000;
const POLL_TICK: Duration = Duration::from_millis(1000);

/// Input to [`ConversationManager::create_task_session`].
#[derive(Debug, Clone)]
pub struct CreateTaskSessionRequest {
    pub project_id: String,
    pub task_id: String,
    pub worktree_directory: PathBuf,
    pub title: Option<String>,
}

/// Callback invoked for each message observed as new or changed (by state
/// signature) during an await loop.
pub type OnMessage = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Input to [`ConversationManager::send_initial_prompt_and_await_messages`]
/// and [`ConversationManager::send_follow_up_prompt_and_await_messages`].
#[derive(Clone)]
pub struct PromptRequest {
    pub session_id: String,
    pub prompt: String,
    /// Overrides the remembered worktree directory for this session, if given.
    pub worktree_directory: Option<PathBuf>,
    pub agent: Option<String>,
    /// Overrides the remembered model for this session, if given.
    pub model: Option<ModelSelection>,
    pub timeout_ms: Option<u64>,
    /// Invoked once per message that is new or whose signature changed since
    /// the previous poll — never replayed for unchanged prior-turn messages.
    pub on_message: Option<OnMessage>,
}

impl std::fmt::Debug for PromptRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptRequest")
            .field("session_id", &self.session_id)
            .field("prompt", &self.prompt)
            .field("worktree_directory", &self.worktree_directory)
            .field("agent", &self.agent)
            .field("model", &self.model)
            .field("timeout_ms", &self.timeout_ms)
            .field("on_message", &self.on_message.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PromptSubmission {
    pub session_id: String,
    pub prompt: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AwaitedMessages {
    pub submission: PromptSubmission,
    pub sdk_messages: Vec<serde_json::Value>,
}

struct SessionEntry {
    session: Session,
    remembered_model: Option<ModelSelection>,
}

/// Handle returned by [`ConversationManager::subscribe_to_events`]. Dropping
/// it, or calling `unsubscribe` explicitly, stops event delivery.
pub struct Subscription {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Drives one or more [`Session`]s against the agent runtime: creation,
/// prompt submission with the activity-then-idle await protocol, message
/// listing, and raw event subscription.
pub struct ConversationManager {
    ar: Arc<ArRuntimeHandle>,
    logger: Arc<dyn Logger>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    task_sessions: RwLock<HashMap<String, String>>,
}

impl ConversationManager {
    pub fn new(ar: Arc<ArRuntimeHandle>) -> Self {
        Self::with_logger(ar, Arc::new(NoopLogger))
    }

    pub fn with_logger(ar: Arc<ArRuntimeHandle>, logger: Arc<dyn Logger>) -> Self {
        Self {
            ar,
            logger,
            sessions: RwLock::new(HashMap::new()),
            task_sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a new AR session bound to `req.worktree_directory` and
    /// records it under both `session_id` and `task_id`.
    pub async fn create_task_session(&self, req: CreateTaskSessionRequest) -> Result<Session> {
        if req.task_id.trim().is_empty() {
            return Err(ConversationError::InvalidArgument("task id must not be empty".into()));
        }

        let client = self.ar.get_client(&req.worktree_directory).await?;
        let session_id = client.create_session().await?;
        let now = Utc::now();
        let session = Session {
            session_id: session_id.clone(),
            project_id: req.project_id,
            task_id: req.task_id.clone(),
            worktree_directory: req.worktree_directory,
            title: req.title,
            created_at: now,
            updated_at: now,
            last_message_at: None,
        };

        self.sessions.write().await.insert(
            session_id.clone(),
            SessionEntry {
                session: session.clone(),
                remembered_model: None,
            },
        );
        self.task_sessions.write().await.insert(req.task_id, session_id);

        Ok(session)
    }

    /// Identical protocol to [`Self::send_follow_up_prompt_and_await_messages`];
    /// spec.md §4.7 makes no distinction between the first prompt of a
    /// session and any later one.
    pub async fn send_initial_prompt_and_await_messages(&self, req: PromptRequest) -> Result<AwaitedMessages> {
        self.await_prompt(req).await
    }

    pub async fn send_follow_up_prompt_and_await_messages(&self, req: PromptRequest) -> Result<AwaitedMessages> {
        self.await_prompt(req).await
    }

    async fn await_prompt(&self, req: PromptRequest) -> Result<AwaitedMessages> {
        let session_id = req.session_id.trim().to_string();
        if session_id.is_empty() {
            return Err(ConversationError::InvalidArgument("session id must not be empty".into()));
        }
        let prompt = req.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(ConversationError::InvalidArgument("prompt must not be empty".into()));
        }

        let worktree_directory = match req.worktree_directory {
            Some(dir) => dir,
            None => self
                .get_session_directory(&session_id)
                .await
                .ok_or_else(|| ConversationError::WorktreeNotResolved(session_id.clone()))?,
        };

        let client = self.ar.get_client(&worktree_directory).await?;
        let model = self.resolve_model(&session_id, &client, req.model).await?;

        // Snapshot every message's state signature before submitting, so the
        // loop below only reports what actually changed.
        let mut baseline: HashMap<String, MessageSignature> = HashMap::new();
        let mut seen_assistant_message = false;
        for message in client.list_messages(&session_id).await? {
            if let Some((id, sig)) = signature(&message) {
                if sig.role == "assistant" {
                    seen_assistant_message = true;
                }
                baseline.insert(id, sig);
            }
        }

        let mut stream = client.open_event_stream().await?;

        let submitted_at = Utc::now();
        client
            .send_prompt_async(&session_id, &prompt, req.agent.as_deref(), model.as_ref())
            .await?;

        if let Err(e) = self
            .run_await_loop(
                &client,
                &session_id,
                req.timeout_ms,
                &mut stream,
                &mut baseline,
                &mut seen_assistant_message,
                req.on_message.as_deref(),
            )
            .await
        {
            self.logger.log(
                LogLevel::Warn,
                "conversation.await_prompt",
                "prompt await loop ended without a clean idle",
                None,
                Some(&acp_core::LoggedError::from(&e)),
            );
            return Err(e);
        }

        // One final poll in case the idle event raced the last write; any
        // message that changed since the last poll is still forwarded
        // through `on_message` by `poll_and_diff`, not replayed wholesale.
        seen_assistant_message |= self
            .poll_and_diff(&client, &session_id, &mut baseline, req.on_message.as_deref())
            .await?;
        let sdk_messages = client.list_messages(&session_id).await?;

        if !seen_assistant_message {
            return Err(ConversationError::NoAssistantMessage);
        }

        self.touch_session(&session_id, submitted_at).await;

        Ok(AwaitedMessages {
            submission: PromptSubmission {
                session_id,
                prompt,
                submitted_at,
            },
            sdk_messages,
        })
    }

    /// Consumes `stream` until an idle event is observed after at least one
    /// activity event, a session error event arrives, or `timeout_ms`
    /// elapses with no session-scoped event resetting the deadline.
    async fn run_await_loop(
        &self,
        client: &ArClient,
        session_id: &str,
        timeout_ms: Option<u64>,
        stream: &mut (impl futures::Stream<Item = ArEvent> + Unpin),
        baseline: &mut HashMap<String, MessageSignature>,
        seen_assistant_message: &mut bool,
        on_message: Option<&(dyn Fn(&serde_json::Value) + Send + Sync)>,
    ) -> Result<()> {
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        let mut deadline = Instant::now() + timeout;
        let mut activity_seen = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ConversationError::Timeout);
            }
            let wait = remaining.min(POLL_TICK);

            match tokio::time::timeout(wait, stream.next()).await {
                Ok(Some(event)) => {
                    if !is_session_scoped(&event, session_id) {
                        continue;
                    }
                    deadline = Instant::now() + timeout;

                    match classify(&event) {
                        EventClass::Activity => {
                            *seen_assistant_message |= self.poll_and_diff(client, session_id, baseline, on_message).await?;
                            activity_seen = true;
                        }
                        EventClass::Idle => {
                            if activity_seen {
                                return Ok(());
                            }
                            // Idle observed before any activity: this is the
                            // race the activity-then-idle gate exists for.
                            // Keep waiting rather than returning early.
                        }
                        EventClass::Error => {
                            return Err(ConversationError::SessionError(extract_error_message(&event)));
                        }
                        EventClass::Other => {}
                    }
                }
                Ok(None) => {
                    // Stream closed; fall through to the timeout tick below
                    // and keep polling until the deadline.
                }
                Err(_) => {
                    *seen_assistant_message |= self.poll_and_diff(client, session_id, baseline, on_message).await?;
                }
            }
        }
    }

    /// Re-fetches messages, diffs them against `baseline` by signature, and
    /// updates `baseline` in place. Invokes `on_message` once for each
    /// message that is new or whose signature changed since the prior
    /// baseline — never for a message already present with the same
    /// signature. Returns whether an assistant-role message is present (new
    /// or previously seen).
    async fn poll_and_diff(
        &self,
        client: &ArClient,
        session_id: &str,
        baseline: &mut HashMap<String, MessageSignature>,
        on_message: Option<&(dyn Fn(&serde_json::Value) + Send + Sync)>,
    ) -> Result<bool> {
        let messages = client.list_messages(session_id).await?;
        let mut saw_assistant = false;
        for message in messages {
            let Some((id, sig)) = signature(&message) else {
                continue;
            };
            if sig.role == "assistant" {
                saw_assistant = true;
            }
            let changed = baseline.get(&id) != Some(&sig);
            baseline.insert(id, sig);
            if changed {
                if let Some(cb) = on_message {
                    cb(&message);
                }
            }
        }
        Ok(saw_assistant)
    }

    /// Caller override > remembered selection > the AR's own default-model
    /// map (first `providerID`/`modelID` pair that actually exists in a
    /// provider's model set) > first model of the first provider, as a
    /// last-resort fallback when no default entry resolves.
    async fn resolve_model(
        &self,
        session_id: &str,
        client: &ArClient,
        override_model: Option<ModelSelection>,
    ) -> Result<Option<ModelSelection>> {
        if let Some(model) = override_model {
            self.remember_model(session_id, model.clone()).await;
            return Ok(Some(model));
        }

        if let Some(remembered) = self.remembered_model(session_id).await {
            return Ok(Some(remembered));
        }

        let providers = client.providers().await.unwrap_or_default();
        let default_model = resolve_default_model(&providers);
        if let Some(model) = &default_model {
            self.remember_model(session_id, model.clone()).await;
        }
        Ok(default_model)
    }

    async fn remember_model(&self, session_id: &str, model: ModelSelection) {
        if let Some(entry) = self.sessions.write().await.get_mut(session_id) {
            entry.remembered_model = Some(model);
        }
    }

    async fn remembered_model(&self, session_id: &str) -> Option<ModelSelection> {
        self.sessions.read().await.get(session_id).and_then(|e| e.remembered_model.clone())
    }

    async fn touch_session(&self, session_id: &str, at: DateTime<Utc>) {
        if let Some(entry) = self.sessions.write().await.get_mut(session_id) {
            entry.session.last_message_at = Some(at);
            entry.session.updated_at = at;
        }
    }

    pub async fn list_conversation_messages(
        &self,
        session_id: &str,
        worktree_directory: Option<PathBuf>,
    ) -> Result<Vec<serde_json::Value>> {
        let directory = match worktree_directory {
            Some(dir) => dir,
            None => self
                .get_session_directory(session_id)
                .await
                .ok_or_else(|| ConversationError::WorktreeNotResolved(session_id.to_string()))?,
        };
        let client = self.ar.get_client(&directory).await?;
        Ok(client.list_messages(session_id).await?)
    }

    /// Opens an event stream on `worktree_directory` and forwards every
    /// event matching `session_id` (or every event, when `session_id` is
    /// `None`) to `on_event` until the returned [`Subscription`] is dropped.
    pub async fn subscribe_to_events(
        &self,
        session_id: Option<String>,
        worktree_directory: PathBuf,
        on_event: impl Fn(ArEvent) + Send + 'static,
    ) -> Result<Subscription> {
        let client = self.ar.get_client(&worktree_directory).await?;
        let mut stream = client.open_event_stream().await?;

        let handle = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let Some(sid) = &session_id {
                    if !is_session_scoped(&event, sid) {
                        continue;
                    }
                }
                on_event(event);
            }
        });

        Ok(Subscription { handle: Some(handle) })
    }

    pub async fn get_task_session_id(&self, task_id: &str) -> Option<String> {
        self.task_sessions.read().await.get(task_id).cloned()
    }

    pub async fn get_session_directory(&self, session_id: &str) -> Option<PathBuf> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.session.worktree_directory.clone())
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).map(|e| e.session.clone())
    }
}

/// Walks `list.default` in order, returning the first `providerID`/`modelID`
/// pair that actually exists in `list.providers`. Falls back to the first
/// model of the first provider when no default entry resolves.
fn resolve_default_model(list: &ProviderList) -> Option<ModelSelection> {
    for (provider_id, model_id) in list.default_pairs() {
        let exists = list
            .providers
            .iter()
            .any(|p| p.id == provider_id && p.models.iter().any(|m| m.id == model_id));
        if exists {
            return Some(ModelSelection {
                provider_id: provider_id.to_string(),
                model_id: model_id.to_string(),
            });
        }
    }
    first_default_model(&list.providers)
}

fn first_default_model(providers: &[Provider]) -> Option<ModelSelection> {
    providers.iter().find_map(|p| {
        p.models.first().map(|m| ModelSelection {
            provider_id: p.id.clone(),
            model_id: m.id.clone(),
        })
    })
}
