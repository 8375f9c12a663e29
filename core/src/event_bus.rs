//! Sequenced envelope dispatch. See SPEC_FULL.md §4.8.
//!
//! Grounded on the `broadcast`-channel fan-out idiom of
//! `core/src/agent/opencode_client.rs`'s `subscribe()`, but delivery is a
//! synchronous callback list rather than a channel: the spec requires
//! filterable, cooperative delivery with an idempotent disposer, which reads
//! closer to an observer list than to a channel a subscriber must poll.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;

use crate::logger::{LogLevel, Logger};
use crate::model::{EventEnvelope, LogEntry};

/// `{sequence, emittedAt, taskId, projectId, scope, action, eventType}`,
/// derived from a lifecycle event's dotted type (`scope.action`).
#[derive(Debug, Clone, PartialEq)]
pub struct UiUpdate {
    pub sequence: u64,
    pub emitted_at: chrono::DateTime<Utc>,
    pub task_id: Option<String>,
    pub project_id: Option<String>,
    pub scope: String,
    pub action: String,
    pub event_type: String,
}

type GeneralListener = dyn Fn(&EventEnvelope) + Send + Sync;
type UiListener = dyn Fn(&UiUpdate) + Send + Sync;
type LogListener = dyn Fn(&LogEntry) + Send + Sync;

struct Subscription<F: ?Sized> {
    id: u64,
    filter: Option<HashSet<String>>,
    callback: Arc<F>,
}

/// Single-threaded cooperative dispatcher. See SPEC_FULL.md §4.8.
pub struct EventBus {
    sequence: AtomicU64,
    disposer_id: AtomicU64,
    general: Arc<Mutex<Vec<Subscription<GeneralListener>>>>,
    ui: Arc<Mutex<Vec<Subscription<UiListener>>>>,
    log: Arc<Mutex<Vec<Subscription<LogListener>>>>,
    logger: Arc<dyn Logger>,
}

/// Returned by `subscribe*`; calling `dispose()` more than once is a no-op.
pub struct Disposer {
    id: u64,
    disposed: bool,
    remove: Box<dyn FnMut(u64) + Send>,
}

impl Disposer {
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        (self.remove)(self.id);
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl EventBus {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            disposer_id: AtomicU64::new(0),
            general: Arc::new(Mutex::new(Vec::new())),
            ui: Arc::new(Mutex::new(Vec::new())),
            log: Arc::new(Mutex::new(Vec::new())),
            logger,
        }
    }

    /// Assigns `sequence = ++counter` and `emittedAt = now`, then dispatches
    /// to general, UI (for lifecycle events), and log subscribers in turn.
    pub fn emit(&self, event_type: impl Into<String>, payload: Value) -> EventEnvelope {
        let event_type = event_type.into();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = EventEnvelope {
            event_type: event_type.clone(),
            payload,
            sequence,
            emitted_at: Utc::now(),
        };

        self.dispatch_general(&envelope);

        if is_lifecycle_event(&event_type) {
            let (scope, action) = split_dotted(&event_type);
            let update = UiUpdate {
                sequence,
                emitted_at: envelope.emitted_at,
                task_id: string_field(&envelope.payload, "taskId"),
                project_id: string_field(&envelope.payload, "projectId"),
                scope,
                action,
                event_type: event_type.clone(),
            };
            self.dispatch_ui(&update);
        }

        let log_entry = self.derive_log_entry(&envelope);
        self.dispatch_log(&log_entry);

        envelope
    }

    fn derive_log_entry(&self, envelope: &EventEnvelope) -> LogEntry {
        if envelope.event_type == "log.appended" {
            let level = envelope
                .payload
                .get("level")
                .and_then(Value::as_str)
                .map(parse_level)
                .unwrap_or(LogLevel::Info);
            let message = envelope
                .payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return LogEntry {
                sequence: envelope.sequence,
                emitted_at: envelope.emitted_at,
                level,
                message,
                task_id: string_field(&envelope.payload, "taskId"),
                project_id: string_field(&envelope.payload, "projectId"),
                source: envelope
                    .payload
                    .get("source")
                    .and_then(Value::as_str)
                    .unwrap_or("event-bus")
                    .to_string(),
                event_type: Some(envelope.event_type.clone()),
                raw: envelope.payload.get("raw").cloned(),
            };
        }

        let level = if envelope.event_type == "task.failed" {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        LogEntry {
            sequence: envelope.sequence,
            emitted_at: envelope.emitted_at,
            level,
            message: default_lifecycle_message(&envelope.event_type),
            task_id: string_field(&envelope.payload, "taskId"),
            project_id: string_field(&envelope.payload, "projectId"),
            source: "event-bus".to_string(),
            event_type: Some(envelope.event_type.clone()),
            raw: Some(envelope.payload.clone()),
        }
    }

    fn dispatch_general(&self, envelope: &EventEnvelope) {
        let subs: Vec<_> = {
            let guard = self.general.lock().unwrap();
            guard
                .iter()
                .filter(|s| matches_filter(&s.filter, &envelope.event_type))
                .map(|s| s.callback.clone())
                .collect()
        };
        for callback in subs {
            self.guarded_call(std::panic::AssertUnwindSafe(|| callback(envelope)), "runtime.listener");
        }
    }

    fn dispatch_ui(&self, update: &UiUpdate) {
        let subs: Vec<_> = {
            let guard = self.ui.lock().unwrap();
            guard
                .iter()
                .filter(|s| matches_filter(&s.filter, &update.event_type))
                .map(|s| s.callback.clone())
                .collect()
        };
        for callback in subs {
            self.guarded_call(std::panic::AssertUnwindSafe(|| callback(update)), "runtime.listener");
        }
    }

    fn dispatch_log(&self, entry: &LogEntry) {
        let subs: Vec<_> = {
            let guard = self.log.lock().unwrap();
            guard
                .iter()
                .filter(|s| {
                    matches_filter(
                        &s.filter,
                        entry.event_type.as_deref().unwrap_or(""),
                    )
                })
                .map(|s| s.callback.clone())
                .collect()
        };
        for callback in subs {
            self.guarded_call(std::panic::AssertUnwindSafe(|| callback(entry)), "runtime.listener");
        }
    }

    /// Listener exceptions are caught and logged; they never prevent
    /// delivery to other listeners. Rust has no catchable panics across an
    /// `Fn` boundary without `catch_unwind`, so listeners are expected to
    /// return `Result`-free and we guard with `catch_unwind` to honor the
    /// "never propagated" contract even if a listener panics. The closures
    /// passed in only capture `Arc<dyn Fn + Send + Sync>` clones, which are
    /// not `RefUnwindSafe` on their own, so call sites wrap them in
    /// `AssertUnwindSafe`: a panicking listener never leaves this bus's own
    /// state (the subscription lists) in a torn state, so asserting
    /// unwind-safety here is sound.
    fn guarded_call<F: FnOnce() + std::panic::UnwindSafe>(&self, f: F, source: &str) {
        if let Err(_panic) = std::panic::catch_unwind(f) {
            self.logger.error(
                source,
                "event bus listener panicked; delivery to other listeners continues",
                None,
            );
        }
    }

    pub fn subscribe(
        &self,
        filter: Option<HashSet<String>>,
        callback: impl Fn(&EventEnvelope) + Send + Sync + 'static,
    ) -> Disposer {
        let id = self.disposer_id.fetch_add(1, Ordering::SeqCst);
        self.general.lock().unwrap().push(Subscription {
            id,
            filter,
            callback: Arc::new(callback),
        });
        let list = self.general.clone();
        Disposer {
            id,
            disposed: false,
            remove: Box::new(move |id| list.lock().unwrap().retain(|s| s.id != id)),
        }
    }

    pub fn subscribe_ui(
        &self,
        filter: Option<HashSet<String>>,
        callback: impl Fn(&UiUpdate) + Send + Sync + 'static,
    ) -> Disposer {
        let id = self.disposer_id.fetch_add(1, Ordering::SeqCst);
        self.ui.lock().unwrap().push(Subscription {
            id,
            filter,
            callback: Arc::new(callback),
        });
        let list = self.ui.clone();
        Disposer {
            id,
            disposed: false,
            remove: Box::new(move |id| list.lock().unwrap().retain(|s| s.id != id)),
        }
    }

    pub fn subscribe_log(
        &self,
        filter: Option<HashSet<String>>,
        callback: impl Fn(&LogEntry) + Send + Sync + 'static,
    ) -> Disposer {
        let id = self.disposer_id.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(Subscription {
            id,
            filter,
            callback: Arc::new(callback),
        });
        let list = self.log.clone();
        Disposer {
            id,
            disposed: false,
            remove: Box::new(move |id| list.lock().unwrap().retain(|s| s.id != id)),
        }
    }
}

fn matches_filter(filter: &Option<HashSet<String>>, event_type: &str) -> bool {
    match filter {
        None => true,
        Some(set) => set.contains(event_type),
    }
}

fn is_lifecycle_event(event_type: &str) -> bool {
    event_type.starts_with("task.")
}

fn split_dotted(event_type: &str) -> (String, String) {
    match event_type.split_once('.') {
        Some((scope, action)) => (scope.to_string(), action.to_string()),
        None => (event_type.to_string(), String::new()),
    }
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

fn parse_level(raw: &str) -> LogLevel {
    match raw {
        "debug" => LogLevel::Debug,
        "warn" => LogLevel::Warn,
        "error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

fn default_lifecycle_message(event_type: &str) -> String {
    format!("{event_type} event emitted")
}

/// Sorted view of every sequence number ever emitted; exposed for tests that
/// assert ordering (§8 testable property #2). Not part of the
/// production API surface.
#[cfg(test)]
fn collect_sequences(envelopes: &[EventEnvelope]) -> BTreeSet<u64> {
    envelopes.iter().map(|e| e.sequence).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use std::sync::Mutex as StdMutex;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(NoopLogger))
    }

    #[test]
    fn emit_assigns_strictly_increasing_sequence() {
        let bus = bus();
        let e1 = bus.emit("task.enqueued", serde_json::json!({}));
        let e2 = bus.emit("task.enqueued", serde_json::json!({}));
        assert!(e1.sequence < e2.sequence);
        assert_eq!(collect_sequences(&[e1, e2]).len(), 2);
    }

    #[test]
    fn general_subscribers_receive_envelopes() {
        let bus = bus();
        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _d = bus.subscribe(None, move |env| {
            seen2.lock().unwrap().push(env.event_type.clone());
        });
        bus.emit("task.enqueued", serde_json::json!({}));
        assert_eq!(seen.lock().unwrap().as_slice(), ["task.enqueued"]);
    }

    #[test]
    fn lifecycle_event_derives_ui_update_with_scope_action() {
        let bus = bus();
        let captured: Arc<StdMutex<Option<UiUpdate>>> = Arc::new(StdMutex::new(None));
        let captured2 = captured.clone();
        let _d = bus.subscribe_ui(None, move |u| {
            *captured2.lock().unwrap() = Some(u.clone());
        });
        bus.emit(
            "task.state.changed",
            serde_json::json!({"taskId": "t-1", "projectId": "p-1"}),
        );
        let update = captured.lock().unwrap().clone().unwrap();
        assert_eq!(update.scope, "task");
        assert_eq!(update.action, "state.changed");
        assert_eq!(update.task_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn non_lifecycle_event_does_not_reach_ui_subscribers() {
        let bus = bus();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        let _d = bus.subscribe_ui(None, move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit("log.appended", serde_json::json!({"level": "info", "message": "hi"}));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn task_failed_logs_at_error_level() {
        let bus = bus();
        let captured: Arc<StdMutex<Option<LogEntry>>> = Arc::new(StdMutex::new(None));
        let captured2 = captured.clone();
        let _d = bus.subscribe_log(None, move |entry| {
            *captured2.lock().unwrap() = Some(entry.clone());
        });
        bus.emit("task.failed", serde_json::json!({"taskId": "t-1"}));
        let entry = captured.lock().unwrap().clone().unwrap();
        assert_eq!(entry.level, LogLevel::Error);
    }

    #[test]
    fn log_appended_passes_through_fields() {
        let bus = bus();
        let captured: Arc<StdMutex<Option<LogEntry>>> = Arc::new(StdMutex::new(None));
        let captured2 = captured.clone();
        let _d = bus.subscribe_log(None, move |entry| {
            *captured2.lock().unwrap() = Some(entry.clone());
        });
        bus.emit(
            "log.appended",
            serde_json::json!({"level": "warn", "message": "careful", "source": "custom.source"}),
        );
        let entry = captured.lock().unwrap().clone().unwrap();
        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.message, "careful");
        assert_eq!(entry.source, "custom.source");
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let bus = bus();
        let _d1 = bus.subscribe(None, |_| panic!("boom"));
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        let _d2 = bus.subscribe(None, move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit("task.enqueued", serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn filter_restricts_delivery() {
        let bus = bus();
        let mut filter = HashSet::new();
        filter.insert("task.enqueued".to_string());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        let _d = bus.subscribe(Some(filter), move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit("task.failed", serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.emit("task.enqueued", serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disposer_stops_delivery_and_is_idempotent() {
        let bus = bus();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        let mut disposer = bus.subscribe(None, move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit("task.enqueued", serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        disposer.dispose();
        disposer.dispose();
        bus.emit("task.enqueued", serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
