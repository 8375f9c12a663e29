//! The task orchestrator. See SPEC_FULL.md §4.9.
//!
//! Wires the Project/Task registries, the worktree manager, the
//! conversation manager, and the event bus behind `run_task` (admission +
//! the execution pipeline), the post-`review` user operations
//! (`send_follow_up_prompt`, `merge_task`, `delete_task`), and the cleanup
//! subroutine shared by every path that leaves a task `completed` or
//! `failed`. Grounded on `agent-runner/src/executor.rs`'s `cancel_session`/
//! `cleanup_session` shape, extended with the `review` state the teacher's
//! executor has no equivalent of.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use acp_core::config::TasksConfig;
use acp_core::{
    CleanupPolicy, Disposer, EventBus, EventEnvelope, LogLevel, Logger, LoggedError, NoopLogger, Project,
    ProjectRegistry, Task, TaskRegistry, TaskState,
};
use conversation::{ConversationManager, PromptRequest};
use git_worktree::WorktreeManager;
use tokio::sync::{oneshot, Mutex};

use crate::error::{OrchestratorError, Result, TaskRunFailedError};
use crate::pipeline::{self, TaskExecution};
use crate::scheduler::Scheduler;

/// Input to [`Orchestrator::run_task`].
#[derive(Debug, Clone)]
pub struct RunTaskInput {
    pub task_id: String,
    pub project_id: Option<String>,
    pub prompt: String,
    pub timestamp: i64,
}

type PipelineResult = std::result::Result<Task, TaskRunFailedError>;

/// Owns every collaborator and the in-memory scheduling state layered on
/// top of the durable registries.
pub struct Orchestrator {
    config: TasksConfig,
    projects: Arc<ProjectRegistry>,
    tasks: Arc<TaskRegistry>,
    worktrees: Arc<WorktreeManager>,
    conversations: Arc<ConversationManager>,
    events: Arc<EventBus>,
    logger: Arc<dyn Logger>,
    scheduler: Scheduler,
    initialized: Mutex<bool>,
    waiters: Mutex<HashMap<String, oneshot::Sender<PipelineResult>>>,
    pending_prompts: Mutex<HashMap<String, String>>,
}

impl Orchestrator {
    pub fn new(
        config: TasksConfig,
        projects: Arc<ProjectRegistry>,
        tasks: Arc<TaskRegistry>,
        worktrees: Arc<WorktreeManager>,
        conversations: Arc<ConversationManager>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Self::with_logger(config, projects, tasks, worktrees, conversations, events, Arc::new(NoopLogger))
    }

    pub fn with_logger(
        config: TasksConfig,
        projects: Arc<ProjectRegistry>,
        tasks: Arc<TaskRegistry>,
        worktrees: Arc<WorktreeManager>,
        conversations: Arc<ConversationManager>,
        events: Arc<EventBus>,
        logger: Arc<dyn Logger>,
    ) -> Arc<Self> {
        let scheduler = Scheduler::new(config.max_concurrent);
        Arc::new(Self {
            config,
            projects,
            tasks,
            worktrees,
            conversations,
            events,
            logger,
            scheduler,
            initialized: Mutex::new(false),
            waiters: Mutex::new(HashMap::new()),
            pending_prompts: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn projects(&self) -> &ProjectRegistry {
        &self.projects
    }

    pub(crate) fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub(crate) fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    pub(crate) fn conversations(&self) -> &ConversationManager {
        &self.conversations
    }

    /// Returns an owned handle rather than a borrow so callers (e.g. the
    /// pipeline's `on_message` callbacks) can capture it in a `'static`
    /// closure instead of the short-lived `&Orchestrator` they're handed.
    pub(crate) fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    async fn ensure_initialized(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }
        self.tasks.list().await?;
        self.projects.list_projects().await?;
        *initialized = true;
        Ok(())
    }

    /// Validates `input`, rejects a duplicate currently-active task,
    /// persists a `queued` record, emits `task.enqueued`, and enqueues the
    /// task for execution. Awaits the pipeline's eventual outcome: `Ok(task)`
    /// once the task reaches `review`, or the structured failure otherwise.
    pub async fn run_task(self: &Arc<Self>, input: RunTaskInput) -> Result<Task> {
        self.ensure_initialized().await?;

        let task_id = input.task_id.trim().to_string();
        if task_id.is_empty() {
            return Err(OrchestratorError::EmptyTaskId);
        }
        let prompt = input.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(OrchestratorError::EmptyPrompt);
        }
        if input.timestamp <= 0 {
            return Err(OrchestratorError::NonPositiveTimestamp);
        }
        if self.scheduler.has_active(&task_id).await {
            return Err(OrchestratorError::DuplicateTask(task_id));
        }

        let project = self.resolve_project(input.project_id.as_deref()).await?;

        let task = Task::new(task_id.clone(), project.id.clone());
        self.tasks.insert(task.clone()).await?;
        self.events.emit(
            "task.enqueued",
            serde_json::json!({"taskId": task_id, "projectId": project.id}),
        );

        self.pending_prompts.lock().await.insert(task_id.clone(), prompt);

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(task_id.clone(), tx);

        self.scheduler.enqueue(task_id.clone()).await;
        self.schedule();

        rx.await
            .map_err(|_| OrchestratorError::ResultChannelClosed(task_id))?
            .map_err(OrchestratorError::Run)
    }

    /// Drains as many queued tasks as current capacity allows and spawns
    /// their pipelines. Re-invoked after every enqueue and every completion.
    fn schedule(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            for task_id in orchestrator.scheduler.drain_ready().await {
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    let result = pipeline::execute(&orchestrator, &task_id).await;
                    if let Some(tx) = orchestrator.waiters.lock().await.remove(&task_id) {
                        let _ = tx.send(result);
                    }
                    orchestrator.scheduler.complete(&task_id).await;
                    orchestrator.schedule();
                });
            }
        });
    }

    async fn resolve_project(&self, explicit: Option<&str>) -> Result<Project> {
        match explicit {
            Some(id) => self
                .projects
                .get_project(id)
                .await?
                .ok_or_else(|| OrchestratorError::ProjectNotFound(id.to_string())),
            None => self
                .projects
                .get_active_project()
                .await?
                .ok_or(OrchestratorError::NoActiveProject),
        }
    }

    async fn get_task_or_not_found(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))
    }

    pub(crate) async fn take_pending_prompt(&self, task_id: &str) -> Option<String> {
        self.pending_prompts.lock().await.remove(task_id)
    }

    /// Transitions `task` to `to`, persisting and announcing the change. An
    /// invalid transition is logged and the task is returned unchanged —
    /// this is a programming bug in the pipeline, not a user-facing error.
    pub(crate) async fn transition(&self, mut task: Task, to: TaskState) -> Task {
        if let Err(e) = task.transition(to) {
            self.logger.error(
                "task-orchestrator.transition",
                "invalid state transition attempted",
                Some(&LoggedError::from(&e)),
            );
            return task;
        }
        if let Err(e) = self.tasks.upsert(task.clone()).await {
            self.logger.error(
                "task-orchestrator.persist",
                "failed to persist task after transition",
                Some(&LoggedError::from(&e)),
            );
        }
        self.events.emit(
            "task.state.changed",
            serde_json::json!({"taskId": task.task_id, "projectId": task.project_id, "state": task.state}),
        );
        task
    }

    /// Logs the failure, sets/overwrites the task's error field, transitions
    /// it to `failed` (unless already there), emits `task.failed`, and runs
    /// the cleanup subroutine with the failure cleanup policy.
    pub(crate) async fn fail_and_cleanup(&self, mut exec: TaskExecution, err: OrchestratorError) -> TaskRunFailedError {
        self.logger.log(
            LogLevel::Error,
            "task-orchestrator.execute",
            &err.to_string(),
            None,
            Some(&LoggedError::from(&err)),
        );

        exec.task.error = Some(match exec.task.error.take() {
            Some(prior) => format!("{prior}; {err}"),
            None => err.to_string(),
        });

        if exec.task.state == TaskState::Failed {
            if let Err(e) = self.tasks.upsert(exec.task.clone()).await {
                self.logger.error(
                    "task-orchestrator.persist",
                    "failed to persist overwritten error on already-failed task",
                    Some(&LoggedError::from(&e)),
                );
            }
        } else {
            exec.task = self.transition(exec.task, TaskState::Failed).await;
        }

        self.events.emit(
            "task.failed",
            serde_json::json!({"taskId": exec.task.task_id, "projectId": exec.task.project_id, "error": exec.task.error}),
        );

        exec.task = self
            .cleanup(exec.task, Some(exec.project_directory.clone()), self.config.cleanup_on_failure)
            .await;

        TaskRunFailedError {
            task: exec.task,
            worktree: exec.worktree,
            session: exec.session,
        }
    }

    /// Cleanup subroutine shared by pipeline failure and `merge_task`
    /// success. No-op when the task never got a worktree. Transitions to
    /// `cleaning`, calls the worktree manager, then transitions to the
    /// final `completed`/`failed` state (preserving a prior error).
    pub(crate) async fn cleanup(&self, mut task: Task, project_directory: Option<std::path::PathBuf>, policy: CleanupPolicy) -> Task {
        let (Some(worktree_directory), Some(project_directory)) = (task.worktree_directory.clone(), project_directory) else {
            return task;
        };

        if task.state != TaskState::Cleaning {
            task = self.transition(task, TaskState::Cleaning).await;
        }

        match self
            .worktrees
            .cleanup_task_worktree(&task.task_id, &project_directory, &worktree_directory, policy)
            .await
        {
            Ok(_) => {
                let final_state = if task.error.is_none() { TaskState::Completed } else { TaskState::Failed };
                task = self.transition(task, final_state).await;
                self.events.emit(
                    "task.cleanup.completed",
                    serde_json::json!({"taskId": task.task_id, "projectId": task.project_id, "policy": policy}),
                );
            }
            Err(e) => {
                self.logger.error(
                    "task-orchestrator.cleanup",
                    "worktree cleanup failed",
                    Some(&LoggedError::from(&e)),
                );
                let combined = match task.error.take() {
                    Some(prior) => format!("{prior} Cleanup failed: {e}"),
                    None => format!("Cleanup failed: {e}"),
                };
                task.error = Some(combined);
                task = self.transition(task, TaskState::Failed).await;
            }
        }
        task
    }

    /// Requires `review`. Transitions review -> running, re-occupies the
    /// task's scheduler slot, submits the follow-up prompt with the same
    /// await protocol as the initial prompt, forwards every observed
    /// message, and on success transitions back to `review`. On failure
    /// transitions to `failed` (cleanup runs on a later `delete_task` or
    /// never, matching spec: only the initial pipeline's failure path and
    /// `merge_task`'s success path invoke cleanup automatically).
    pub async fn send_follow_up_prompt(&self, task_id: &str, prompt: &str) -> Result<Task> {
        self.ensure_initialized().await?;
        let mut task = self.get_task_or_not_found(task_id).await?;
        if task.state != TaskState::Review {
            return Err(OrchestratorError::WrongState {
                task_id: task_id.to_string(),
                expected: TaskState::Review,
                actual: task.state,
            });
        }
        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(OrchestratorError::EmptyPrompt);
        }
        let session_id = task
            .session_id
            .clone()
            .ok_or_else(|| OrchestratorError::NoSession(task_id.to_string()))?;
        let worktree_directory = task.worktree_directory.clone();

        task = self.transition(task, TaskState::Running).await;
        self.scheduler.mark_running(task_id.to_string()).await;

        let events = Arc::clone(&self.events);
        let on_message_task_id = task.task_id.clone();
        let on_message_session_id = session_id.clone();
        let result = self
            .conversations
            .send_follow_up_prompt_and_await_messages(PromptRequest {
                session_id: session_id.clone(),
                prompt,
                worktree_directory,
                agent: None,
                model: None,
                timeout_ms: None,
                on_message: Some(Arc::new(move |message: &serde_json::Value| {
                    events.emit(
                        "task.session.message.received",
                        serde_json::json!({"taskId": on_message_task_id, "sessionID": on_message_session_id, "message": message}),
                    );
                })),
            })
            .await;

        let outcome = match result {
            Ok(_awaited) => {
                task = self.transition(task, TaskState::Review).await;
                self.events.emit(
                    "task.review",
                    serde_json::json!({"taskId": task.task_id, "projectId": task.project_id}),
                );
                Ok(task)
            }
            Err(e) => {
                self.logger.error(
                    "task-orchestrator.execute",
                    "follow-up prompt failed",
                    Some(&LoggedError::from(&e)),
                );
                task.error = Some(e.to_string());
                task = self.transition(task, TaskState::Failed).await;
                self.events.emit(
                    "task.failed",
                    serde_json::json!({"taskId": task.task_id, "projectId": task.project_id, "error": task.error}),
                );
                Err(OrchestratorError::Conversation(e))
            }
        };

        self.scheduler.complete(task_id).await;
        outcome
    }

    /// Requires `review` and a worktree. Merges via the worktree manager,
    /// transitions review -> completed, emits `task.merged`, and runs the
    /// cleanup subroutine with the success cleanup policy. On merge failure
    /// transitions to `failed` and re-raises.
    pub async fn merge_task(&self, task_id: &str) -> Result<Task> {
        self.ensure_initialized().await?;
        let mut task = self.get_task_or_not_found(task_id).await?;
        if task.state != TaskState::Review {
            return Err(OrchestratorError::WrongState {
                task_id: task_id.to_string(),
                expected: TaskState::Review,
                actual: task.state,
            });
        }
        let worktree_directory = task
            .worktree_directory
            .clone()
            .ok_or_else(|| OrchestratorError::NoWorktree(task_id.to_string()))?;
        let project = self
            .projects
            .get_project(&task.project_id)
            .await?
            .ok_or_else(|| OrchestratorError::ProjectNotFound(task.project_id.clone()))?;

        match self
            .worktrees
            .merge_task_worktree(&project.root_directory, task_id, &worktree_directory)
            .await
        {
            Ok(_) => {
                task = self.transition(task, TaskState::Completed).await;
                self.events.emit(
                    "task.merged",
                    serde_json::json!({"taskId": task.task_id, "projectId": task.project_id}),
                );
                task = self
                    .cleanup(task, Some(project.root_directory), self.config.cleanup_on_success)
                    .await;
                Ok(task)
            }
            Err(e) => {
                self.logger.error("task-orchestrator.execute", "merge failed", Some(&LoggedError::from(&e)));
                task.error = Some(e.to_string());
                task = self.transition(task, TaskState::Failed).await;
                self.events.emit(
                    "task.failed",
                    serde_json::json!({"taskId": task.task_id, "projectId": task.project_id, "error": task.error}),
                );
                Err(OrchestratorError::Worktree(e))
            }
        }
    }

    /// Rejects a task that is actively executing. Otherwise removes any
    /// still-queued entry (rejecting its outstanding `run_task` call with
    /// "deleted before execution"), force-removes its worktree if one
    /// exists and the project is known, then removes it from the registry.
    /// Returns whether a task was found.
    pub async fn delete_task(&self, task_id: &str) -> Result<bool> {
        self.ensure_initialized().await?;

        let Some(task) = self.tasks.get(task_id).await? else {
            return Ok(false);
        };

        if task.state.is_active() {
            return Err(OrchestratorError::WrongState {
                task_id: task_id.to_string(),
                expected: TaskState::Review,
                actual: task.state,
            });
        }

        if self.scheduler.remove_queued(task_id).await {
            if let Some(tx) = self.waiters.lock().await.remove(task_id) {
                let mut rejected = task.clone();
                rejected.error = Some("deleted before execution".to_string());
                let _ = tx.send(Err(TaskRunFailedError {
                    task: rejected,
                    worktree: None,
                    session: None,
                }));
            }
        }

        if let Some(worktree_directory) = task.worktree_directory.clone() {
            if let Ok(Some(project)) = self.projects.get_project(&task.project_id).await {
                if let Err(e) = self
                    .worktrees
                    .cleanup_task_worktree(task_id, &project.root_directory, &worktree_directory, CleanupPolicy::Remove)
                    .await
                {
                    self.logger.error(
                        "task-orchestrator.delete",
                        "force worktree removal failed",
                        Some(&LoggedError::from(&e)),
                    );
                }
            }
        }

        self.tasks.remove(task_id).await?;
        self.pending_prompts.lock().await.remove(task_id);
        Ok(true)
    }

    /// Delegates to the event bus. Listener errors are caught and logged by
    /// the bus itself and never prevent delivery to other subscribers.
    pub fn subscribe(&self, filter: Option<HashSet<String>>, listener: impl Fn(&EventEnvelope) + Send + Sync + 'static) -> Disposer {
        self.events.subscribe(filter, listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_runtime::{ArRuntimeConfig, ArRuntimeHandle};
    use tempfile::TempDir;

    fn build() -> (Arc<Orchestrator>, TempDir) {
        let dir = TempDir::new().unwrap();
        let projects = Arc::new(ProjectRegistry::new(dir.path().join("projects.json"), vec![]));
        let tasks = Arc::new(TaskRegistry::new(dir.path().join("tasks.json")));
        let worktrees = Arc::new(WorktreeManager::new());
        let ar = Arc::new(ArRuntimeHandle::new(ArRuntimeConfig::default()));
        let conversations = Arc::new(ConversationManager::new(ar));
        let events = Arc::new(EventBus::new(Arc::new(NoopLogger)));
        let orchestrator = Orchestrator::new(TasksConfig::default(), projects, tasks, worktrees, conversations, events);
        (orchestrator, dir)
    }

    #[tokio::test]
    async fn rejects_empty_task_id() {
        let (orchestrator, _dir) = build();
        let err = orchestrator
            .run_task(RunTaskInput {
                task_id: "   ".into(),
                project_id: None,
                prompt: "do it".into(),
                timestamp: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::EmptyTaskId));
    }

    #[tokio::test]
    async fn rejects_empty_prompt() {
        let (orchestrator, _dir) = build();
        let err = orchestrator
            .run_task(RunTaskInput {
                task_id: "t1".into(),
                project_id: None,
                prompt: "   ".into(),
                timestamp: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::EmptyPrompt));
    }

    #[tokio::test]
    async fn rejects_non_positive_timestamp() {
        let (orchestrator, _dir) = build();
        let err = orchestrator
            .run_task(RunTaskInput {
                task_id: "t1".into(),
                project_id: None,
                prompt: "do it".into(),
                timestamp: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NonPositiveTimestamp));
    }

    #[tokio::test]
    async fn send_follow_up_prompt_requires_review_state() {
        let (orchestrator, _dir) = build();
        let task = Task::new("t1", "p1");
        orchestrator.tasks.insert(task).await.unwrap();

        let err = orchestrator.send_follow_up_prompt("t1", "more please").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::WrongState { .. }));
    }

    #[tokio::test]
    async fn merge_task_requires_review_state() {
        let (orchestrator, _dir) = build();
        let task = Task::new("t1", "p1");
        orchestrator.tasks.insert(task).await.unwrap();

        let err = orchestrator.merge_task("t1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::WrongState { .. }));
    }

    #[tokio::test]
    async fn delete_task_reports_not_found() {
        let (orchestrator, _dir) = build();
        let found = orchestrator.delete_task("missing").await.unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn delete_task_rejects_active_task() {
        let (orchestrator, _dir) = build();
        let mut task = Task::new("t1", "p1");
        task.state = TaskState::Running;
        task.worktree_directory = Some(std::path::PathBuf::from("/tmp/wt"));
        task.session_id = Some("s1".into());
        orchestrator.tasks.insert(task).await.unwrap();

        let err = orchestrator.delete_task("t1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::WrongState { .. }));
    }

    #[tokio::test]
    async fn delete_task_removes_a_queued_task() {
        let (orchestrator, _dir) = build();
        let task = Task::new("t1", "p1");
        orchestrator.tasks.insert(task).await.unwrap();

        let found = orchestrator.delete_task("t1").await.unwrap();
        assert!(found);
        assert!(orchestrator.tasks.get("t1").await.unwrap().is_none());
    }
}
