//! Core data model. See SPEC_FULL.md §3.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logger::LogLevel;

/// Violations of the invariants in SPEC_FULL.md §3, or a rejected
/// transition in the state graph of §4.9.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ModelError {
    #[error("task id must not be empty")]
    EmptyTaskId,
    #[error("project id must not be empty")]
    EmptyProjectId,
    #[error("updatedAt ({updated_at}) must be >= createdAt ({created_at})")]
    UpdatedBeforeCreated {
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
    #[error("state {state:?} requires worktreeDirectory to be unset")]
    WorktreeMustBeUnset { state: TaskState },
    #[error("state {state:?} requires sessionID to be unset")]
    SessionMustBeUnset { state: TaskState },
    #[error("state {state:?} requires worktreeDirectory to be set")]
    WorktreeMustBeSet { state: TaskState },
    #[error("state {state:?} requires sessionID to be set")]
    SessionMustBeSet { state: TaskState },
    #[error("state failed requires a non-empty error string")]
    FailedRequiresError,
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: TaskState, to: TaskState },
}

/// The task state machine. See SPEC_FULL.md §4.9 for the transition graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    CreatingWorktree,
    Running,
    Review,
    Completed,
    Failed,
    Cleaning,
}

impl TaskState {
    /// Whether `self -> to` is a permitted edge in the transition graph.
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Queued, CreatingWorktree)
                | (Queued, Failed)
                | (CreatingWorktree, Running)
                | (CreatingWorktree, Failed)
                | (Running, Review)
                | (Running, Failed)
                | (Running, Cleaning)
                | (Review, Running)
                | (Review, Completed)
                | (Review, Failed)
                | (Review, Cleaning)
                | (Completed, Cleaning)
                | (Failed, Cleaning)
                | (Cleaning, Completed)
                | (Cleaning, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskState::CreatingWorktree | TaskState::Running | TaskState::Cleaning
        )
    }
}

/// `{providerID, modelID}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

/// A registered repository the orchestrator may create tasks against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub root_directory: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, root_directory: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            root_directory,
            created_at: now,
        }
    }
}

/// The central runtime entity: a task's current state and associated
/// resources. See SPEC_FULL.md §3 for the invariants enforced by
/// [`Task::validate`] on every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub project_id: String,
    pub state: TaskState,
    pub worktree_directory: Option<PathBuf>,
    #[serde(rename = "sessionID")]
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub model: Option<ModelSelection>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            project_id: project_id.into(),
            state: TaskState::Queued,
            worktree_directory: None,
            session_id: None,
            error: None,
            model: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Re-validate the §3 invariants against the task's current fields.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.task_id.trim().is_empty() {
            return Err(ModelError::EmptyTaskId);
        }
        if self.project_id.trim().is_empty() {
            return Err(ModelError::EmptyProjectId);
        }
        if self.updated_at < self.created_at {
            return Err(ModelError::UpdatedBeforeCreated {
                created_at: self.created_at,
                updated_at: self.updated_at,
            });
        }
        use TaskState::*;
        match self.state {
            Queued => {
                if self.worktree_directory.is_some() {
                    return Err(ModelError::WorktreeMustBeUnset { state: self.state });
                }
                if self.session_id.is_some() {
                    return Err(ModelError::SessionMustBeUnset { state: self.state });
                }
            }
            CreatingWorktree => {
                if self.session_id.is_some() {
                    return Err(ModelError::SessionMustBeUnset { state: self.state });
                }
            }
            _ => {}
        }
        if matches!(self.state, Running | Review | Completed | Cleaning)
            && self.worktree_directory.is_none()
        {
            return Err(ModelError::WorktreeMustBeSet { state: self.state });
        }
        if matches!(self.state, Running | Review | Completed) && self.session_id.is_none() {
            return Err(ModelError::SessionMustBeSet { state: self.state });
        }
        if self.state == Failed
            && self.error.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            return Err(ModelError::FailedRequiresError);
        }
        Ok(())
    }

    /// Transition to `to`, stamping a new `updatedAt` and re-validating.
    /// Rejects transitions not in the graph of SPEC_FULL.md §4.9.
    pub fn transition(&mut self, to: TaskState) -> Result<(), ModelError> {
        if !self.state.can_transition_to(to) {
            return Err(ModelError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = Utc::now();
        self.validate()?;
        Ok(())
    }
}

/// An isolated on-disk working copy of a repository bound to a task-specific
/// branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedWorktree {
    pub task_id: String,
    pub project_directory: PathBuf,
    pub worktree_directory: PathBuf,
    pub branch_name: String,
    pub name: String,
    /// The branch checked out in the project root when the worktree was
    /// created; used as the merge target when no explicit default branch is
    /// configured (see DESIGN.md open-question decision #3).
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
}

/// A conversation with the AR scoped to a worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub project_id: String,
    pub task_id: String,
    pub worktree_directory: PathBuf,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// `{type, payload, sequence, emittedAt}`. Sequence is assigned at emit time
/// and envelopes are never re-ordered or re-numbered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
}

/// `{sequence, emittedAt, level, message, taskId?, projectId?, source, eventType?, raw?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    #[serde(with = "log_level_serde")]
    pub level: LogLevel,
    pub message: String,
    pub task_id: Option<String>,
    pub project_id: Option<String>,
    pub source: String,
    pub event_type: Option<String>,
    pub raw: Option<serde_json::Value>,
}

mod log_level_serde {
    use super::LogLevel;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(level: &LogLevel, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&level.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<LogLevel, D::Error> {
        let raw = String::deserialize(d)?;
        match raw.as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(serde::de::Error::custom(format!("unknown log level: {other}"))),
        }
    }
}

/// Presence of a VCS marker directory at `path` (".git", the only marker we
/// currently recognize — worktrees and bare repos both satisfy this).
pub fn has_vcs_marker(path: &Path) -> bool {
    path.join(".git").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_task() -> Task {
        Task::new("task-1", "project-1")
    }

    #[test]
    fn queued_task_is_valid() {
        assert!(base_task().validate().is_ok());
    }

    #[test]
    fn queued_with_worktree_is_invalid() {
        let mut task = base_task();
        task.worktree_directory = Some(PathBuf::from("/tmp/wt"));
        assert_eq!(
            task.validate(),
            Err(ModelError::WorktreeMustBeUnset {
                state: TaskState::Queued
            })
        );
    }

    #[test]
    fn running_without_worktree_is_invalid() {
        let mut task = base_task();
        task.state = TaskState::Running;
        task.session_id = Some("sess-1".into());
        assert_eq!(
            task.validate(),
            Err(ModelError::WorktreeMustBeSet {
                state: TaskState::Running
            })
        );
    }

    #[test]
    fn running_without_session_is_invalid() {
        let mut task = base_task();
        task.state = TaskState::Running;
        task.worktree_directory = Some(PathBuf::from("/tmp/wt"));
        assert_eq!(
            task.validate(),
            Err(ModelError::SessionMustBeSet {
                state: TaskState::Running
            })
        );
    }

    #[test]
    fn failed_requires_error_message() {
        let mut task = base_task();
        task.state = TaskState::Failed;
        assert_eq!(task.validate(), Err(ModelError::FailedRequiresError));
        task.error = Some("boom".into());
        assert!(task.validate().is_ok());
    }

    #[test]
    fn valid_transition_updates_timestamp() {
        let mut task = base_task();
        let before = task.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        task.transition(TaskState::CreatingWorktree).unwrap();
        assert_eq!(task.state, TaskState::CreatingWorktree);
        assert!(task.updated_at >= before);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut task = base_task();
        let err = task.transition(TaskState::Running).unwrap_err();
        assert_eq!(
            err,
            ModelError::InvalidTransition {
                from: TaskState::Queued,
                to: TaskState::Running
            }
        );
    }

    #[test]
    fn full_happy_path_transition_sequence() {
        let mut task = base_task();
        task.transition(TaskState::CreatingWorktree).unwrap();
        task.worktree_directory = Some(PathBuf::from("/tmp/wt"));
        task.session_id = Some("sess-1".into());
        task.transition(TaskState::Running).unwrap();
        task.transition(TaskState::Review).unwrap();
        task.transition(TaskState::Completed).unwrap();
        task.transition(TaskState::Cleaning).unwrap();
        task.transition(TaskState::Completed).unwrap();
        assert_eq!(task.state, TaskState::Completed);
    }

    #[test]
    fn state_terminal_and_active_helpers() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Review.is_terminal());
        assert!(TaskState::Running.is_active());
        assert!(!TaskState::Queued.is_active());
    }
}
