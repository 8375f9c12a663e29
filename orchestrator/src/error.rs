//! Errors for the task orchestrator. See SPEC_FULL.md §4.9/§7.

use acp_core::{Task, TaskState};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// The structured failure handed back to a rejected `run_task` call: the
/// task's final (failed) record plus whatever collaborators the pipeline
/// had already created before the failure.
#[derive(Debug, Clone, Error)]
#[error(
    "task '{}' failed: {}",
    task.task_id,
    task.error.as_deref().unwrap_or("unknown error")
)]
pub struct TaskRunFailedError {
    pub task: Task,
    pub worktree: Option<acp_core::ManagedWorktree>,
    pub session: Option<acp_core::Session>,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("task id must not be empty")]
    EmptyTaskId,

    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("timestamp must be a positive integer")]
    NonPositiveTimestamp,

    #[error("a task with id '{0}' is already queued or running")]
    DuplicateTask(String),

    #[error("project '{0}' was not found")]
    ProjectNotFound(String),

    #[error("no projectId was given and no project is currently active")]
    NoActiveProject,

    #[error("task '{0}' was not found")]
    TaskNotFound(String),

    #[error("task '{task_id}' is in state {actual:?}, expected {expected:?}")]
    WrongState {
        task_id: String,
        expected: TaskState,
        actual: TaskState,
    },

    #[error("task '{0}' has no associated worktree")]
    NoWorktree(String),

    #[error("task '{0}' has no associated session")]
    NoSession(String),

    #[error("no pending prompt was recorded for task '{0}'")]
    NoPendingPrompt(String),

    #[error("the execution pipeline's result channel closed before reporting for task '{0}'")]
    ResultChannelClosed(String),

    #[error(transparent)]
    Run(#[from] TaskRunFailedError),

    #[error(transparent)]
    Project(#[from] acp_core::ProjectError),

    #[error(transparent)]
    TaskRegistry(#[from] acp_core::TaskRegistryError),

    #[error(transparent)]
    Worktree(#[from] git_worktree::WorktreeError),

    #[error(transparent)]
    Conversation(#[from] conversation::ConversationError),

    #[error(transparent)]
    Model(#[from] acp_core::ModelError),
}
