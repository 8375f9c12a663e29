//! The per-task execution pipeline. See SPEC_FULL.md §4.9 "Execution
//! pipeline".
//!
//! Grounded on `agent-runner/src/executor.rs`'s `run_session()` dual-spawn
//! structure, restructured to thread one named [`TaskExecution`] value
//! through each step instead of capturing mutable locals in closures.

use std::path::PathBuf;
use std::sync::Arc;

use acp_core::{ManagedWorktree, Session, Task, TaskState};
use conversation::{CreateTaskSessionRequest, OnMessage, PromptRequest};

use crate::error::{OrchestratorError, Result, TaskRunFailedError};
use crate::orchestrator::Orchestrator;

/// Builds the `on_message` callback passed to the conversation manager:
/// forwards each new or changed message as `task.session.message.received`.
/// Captures an owned `Arc<EventBus>` and owned id copies rather than
/// borrowing `orchestrator`, since the callback's trait object is `'static`.
fn on_message_callback(orchestrator: &Orchestrator, task_id: &str, session_id: &str) -> OnMessage {
    let events = orchestrator.events();
    let task_id = task_id.to_string();
    let session_id = session_id.to_string();
    Arc::new(move |message: &serde_json::Value| {
        events.emit(
            "task.session.message.received",
            serde_json::json!({
                "taskId": task_id,
                "sessionID": session_id,
                "message": message,
            }),
        );
    })
}

/// Resources accumulated while driving one task through the pipeline.
/// Carried explicitly step to step rather than closed over, so a failure at
/// any point can report exactly what had already been created.
pub struct TaskExecution {
    pub task: Task,
    pub project_directory: PathBuf,
    pub worktree: Option<ManagedWorktree>,
    pub session: Option<Session>,
}

/// Runs the full pipeline for an already-`queued`, already-persisted task.
/// On success the task is left in `review`. On failure the task is left in
/// `failed` (or `completed`/`failed` again after the cleanup subroutine, if
/// a worktree had already been created) and the error is reported back as
/// [`TaskRunFailedError`].
pub async fn execute(orchestrator: &Orchestrator, task_id: &str) -> std::result::Result<Task, TaskRunFailedError> {
    let task = match orchestrator.tasks().get(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => return Err(orphaned_failure(task_id, "task vanished from the registry before execution began")),
        Err(e) => return Err(orphaned_failure(task_id, &e.to_string())),
    };

    let project_directory = match orchestrator.projects().get_project(&task.project_id).await {
        Ok(Some(project)) => project.root_directory,
        Ok(None) => {
            return Err(orchestrator
                .fail_and_cleanup(
                    TaskExecution {
                        task,
                        project_directory: PathBuf::new(),
                        worktree: None,
                        session: None,
                    },
                    OrchestratorError::ProjectNotFound(task_id.to_string()),
                )
                .await)
        }
        Err(e) => {
            return Err(orchestrator
                .fail_and_cleanup(
                    TaskExecution {
                        task,
                        project_directory: PathBuf::new(),
                        worktree: None,
                        session: None,
                    },
                    OrchestratorError::Project(e),
                )
                .await)
        }
    };

    let mut exec = TaskExecution {
        task,
        project_directory,
        worktree: None,
        session: None,
    };

    match run_steps(orchestrator, &mut exec).await {
        Ok(()) => Ok(exec.task),
        Err(e) => Err(orchestrator.fail_and_cleanup(exec, e).await),
    }
}

async fn run_steps(orchestrator: &Orchestrator, exec: &mut TaskExecution) -> Result<()> {
    // Step: transition queued -> creating_worktree.
    exec.task = orchestrator.transition(exec.task.clone(), TaskState::CreatingWorktree).await;

    // Step: create the worktree, patch the task, announce it.
    let worktree = orchestrator
        .worktrees()
        .create_task_worktree(&exec.project_directory, &exec.task.task_id)
        .await?;
    exec.task.worktree_directory = Some(worktree.worktree_directory.clone());
    exec.worktree = Some(worktree.clone());
    orchestrator.events().emit(
        "task.worktree.created",
        serde_json::json!({
            "taskId": exec.task.task_id,
            "projectId": exec.task.project_id,
            "worktreeDirectory": worktree.worktree_directory,
        }),
    );

    // Step: create the session, announce it.
    let session = orchestrator
        .conversations()
        .create_task_session(CreateTaskSessionRequest {
            project_id: exec.task.project_id.clone(),
            task_id: exec.task.task_id.clone(),
            worktree_directory: worktree.worktree_directory.clone(),
            title: None,
        })
        .await?;
    exec.session = Some(session.clone());
    orchestrator.events().emit(
        "task.session.created",
        serde_json::json!({
            "taskId": exec.task.task_id,
            "projectId": exec.task.project_id,
            "sessionID": session.session_id,
        }),
    );

    // Step: transition creating_worktree -> running, set sessionID.
    exec.task.session_id = Some(session.session_id.clone());
    exec.task = orchestrator.transition(exec.task.clone(), TaskState::Running).await;

    // Step: send the initial prompt, await messages, forward each new or
    // changed message as it's observed, then announce submission.
    let prompt = orchestrator
        .take_pending_prompt(&exec.task.task_id)
        .await
        .ok_or_else(|| OrchestratorError::NoPendingPrompt(exec.task.task_id.clone()))?;
    let awaited = orchestrator
        .conversations()
        .send_initial_prompt_and_await_messages(PromptRequest {
            session_id: session.session_id.clone(),
            prompt,
            worktree_directory: Some(worktree.worktree_directory.clone()),
            agent: None,
            model: None,
            timeout_ms: None,
            on_message: Some(on_message_callback(orchestrator, &exec.task.task_id, &session.session_id)),
        })
        .await?;
    orchestrator.events().emit(
        "task.prompt.submitted",
        serde_json::json!({
            "taskId": exec.task.task_id,
            "sessionID": session.session_id,
            "prompt": awaited.submission.prompt,
        }),
    );

    // Step: transition running -> review, announce it.
    exec.task = orchestrator.transition(exec.task.clone(), TaskState::Review).await;
    orchestrator.events().emit(
        "task.review",
        serde_json::json!({
            "taskId": exec.task.task_id,
            "projectId": exec.task.project_id,
        }),
    );

    Ok(())
}

/// A task record the registry no longer has by the time its turn to execute
/// arrived (removed out from under the scheduler). Synthesizes a minimal
/// failed record so the waiting caller still gets a structured rejection.
fn orphaned_failure(task_id: &str, reason: &str) -> TaskRunFailedError {
    let mut task = Task::new(task_id, "");
    task.error = Some(reason.to_string());
    TaskRunFailedError {
        task,
        worktree: None,
        session: None,
    }
}
