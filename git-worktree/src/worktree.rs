//! Worktree manager. See SPEC_FULL.md §4.6.
//!
//! Grounded directly on the teacher's `create`/`list`/`remove` structure;
//! `merge_task_worktree` is new code following the same `git_command_checked`
//! idiom (no teacher analog).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use acp_core::{CleanupPolicy, ManagedWorktree};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::commands::{branch_exists, current_branch, delete_branch, git_command_checked, is_git_repository};
use crate::error::{Result, WorktreeError};

const WORKTREE_SUBDIR: &str = ".worktrees";
const BRANCH_PREFIX: &str = "task/";

/// Outcome of `cleanup_task_worktree`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOutcome {
    pub policy: CleanupPolicy,
    pub worktree_directory: PathBuf,
    pub removed: bool,
}

/// Outcome of `merge_task_worktree`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub branch: String,
}

/// Manages Git worktrees for task isolation. A single instance is shared
/// across every project the orchestrator knows about; each operation takes
/// the owning project's root directory explicitly.
#[derive(Debug, Default)]
pub struct WorktreeManager {
    /// `taskId -> ManagedWorktree`, populated on creation. Backs
    /// `get_task_worktree_directory` without re-deriving the timestamped
    /// directory name from the task id alone.
    known: RwLock<HashMap<String, ManagedWorktree>>,
}

impl WorktreeManager {
    pub fn new() -> Self {
        Self {
            known: RwLock::new(HashMap::new()),
        }
    }

    fn worktree_root(project_directory: &Path) -> PathBuf {
        project_directory.join(WORKTREE_SUBDIR)
    }

    /// Branch name is deterministic from the task id alone.
    fn branch_name(task_id: &str) -> String {
        format!("{BRANCH_PREFIX}{task_id}")
    }

    /// Worktree directory name is deterministic from the task id and a
    /// creation timestamp, so re-running the same task id never collides
    /// with a still-present directory from a prior run.
    fn worktree_dir_name(task_id: &str) -> String {
        format!("{task_id}-{}", Utc::now().format("%Y%m%dT%H%M%S%3f"))
    }

    /// `createTaskWorktree(projectDirectory, taskId)` → `ManagedWorktree`.
    pub async fn create_task_worktree(
        &self,
        project_directory: &Path,
        task_id: &str,
    ) -> Result<ManagedWorktree> {
        if !is_git_repository(project_directory).await? {
            return Err(WorktreeError::NotAGitRepository {
                path: project_directory.to_path_buf(),
            });
        }

        let branch_name = Self::branch_name(task_id);
        if branch_exists(project_directory, &branch_name).await? {
            return Err(WorktreeError::BranchExists { branch: branch_name });
        }

        let base_branch = current_branch(project_directory).await?;

        let worktree_root = Self::worktree_root(project_directory);
        tokio::fs::create_dir_all(&worktree_root).await?;

        let worktree_directory = worktree_root.join(Self::worktree_dir_name(task_id));
        if worktree_directory.exists() {
            return Err(WorktreeError::WorktreeExists {
                path: worktree_directory,
            });
        }

        info!(
            task_id,
            branch = %branch_name,
            base_branch = %base_branch,
            path = %worktree_directory.display(),
            "creating task worktree"
        );

        git_command_checked(
            project_directory,
            &[
                "worktree",
                "add",
                "-b",
                &branch_name,
                worktree_directory.to_str().ok_or_else(|| WorktreeError::InvalidPath {
                    path: worktree_directory.clone(),
                })?,
                &base_branch,
            ],
        )
        .await?;

        let managed = ManagedWorktree {
            task_id: task_id.to_string(),
            project_directory: project_directory.to_path_buf(),
            worktree_directory,
            branch_name,
            name: format!("task-{task_id}"),
            base_branch,
            created_at: Utc::now(),
        };

        self.known
            .write()
            .await
            .insert(task_id.to_string(), managed.clone());

        Ok(managed)
    }

    /// `cleanupTaskWorktree({taskId, projectDirectory, worktreeDirectory,
    /// policy})`. Idempotent: `policy=keep` is a no-op; `policy=remove`
    /// removes the worktree directory and its branch.
    pub async fn cleanup_task_worktree(
        &self,
        task_id: &str,
        project_directory: &Path,
        worktree_directory: &Path,
        policy: CleanupPolicy,
    ) -> Result<CleanupOutcome> {
        if policy == CleanupPolicy::Keep {
            return Ok(CleanupOutcome {
                policy,
                worktree_directory: worktree_directory.to_path_buf(),
                removed: false,
            });
        }

        let branch_name = Self::branch_name(task_id);

        if worktree_directory.exists() {
            let path_str = worktree_directory.to_str().ok_or_else(|| WorktreeError::InvalidPath {
                path: worktree_directory.to_path_buf(),
            })?;
            git_command_checked(project_directory, &["worktree", "remove", "--force", path_str])
                .await
                .map_err(|e| WorktreeError::git_failed(format!("Cleanup failed: {e}")))?;
        } else {
            // Worktree already gone from disk; still prune stale metadata
            // and fall through to branch deletion below.
            let _ = git_command_checked(project_directory, &["worktree", "prune"]).await;
        }

        if branch_exists(project_directory, &branch_name).await? {
            delete_branch(project_directory, &branch_name, true)
                .await
                .map_err(|e| WorktreeError::git_failed(format!("Cleanup failed: {e}")))?;
        }

        self.known.write().await.remove(task_id);

        Ok(CleanupOutcome {
            policy,
            worktree_directory: worktree_directory.to_path_buf(),
            removed: true,
        })
    }

    /// `mergeTaskWorktree(projectDirectory, taskId, worktreeDirectory)` →
    /// `{branch}`. Fast-forwards or merges the task branch back into the
    /// project's default branch; fails loudly on conflict, leaving no
    /// partial merge state behind.
    pub async fn merge_task_worktree(
        &self,
        project_directory: &Path,
        task_id: &str,
        worktree_directory: &Path,
    ) -> Result<MergeOutcome> {
        let branch_name = Self::branch_name(task_id);
        if !branch_exists(project_directory, &branch_name).await? {
            return Err(WorktreeError::BranchNotFound { branch: branch_name });
        }

        let base_branch = self
            .known
            .read()
            .await
            .get(task_id)
            .map(|w| w.base_branch.clone());
        let base_branch = match base_branch {
            Some(b) => b,
            None => current_branch(project_directory).await?,
        };

        // The merge operates on the project's branches directly; the
        // caller's worktree checkout is left untouched either way.
        let _ = worktree_directory;

        git_command_checked(project_directory, &["checkout", &base_branch])
            .await
            .map_err(|e| WorktreeError::git_failed(format!("Cleanup failed: {e}")))?;

        let merge =
            crate::commands::git_command(project_directory, &["merge", "--no-edit", &branch_name])
                .await?;

        if !merge.success {
            // Leave no partial merge state behind.
            let _ = crate::commands::git_command(project_directory, &["merge", "--abort"]).await;
            return Err(WorktreeError::MergeConflict {
                branch: branch_name,
                base_branch,
                stderr: merge.stderr.trim().to_string(),
            });
        }

        Ok(MergeOutcome { branch: branch_name })
    }

    /// `getTaskWorktreeDirectory(taskId)`.
    pub async fn get_task_worktree_directory(&self, task_id: &str) -> Option<PathBuf> {
        self.known
            .read()
            .await
            .get(task_id)
            .map(|w| w.worktree_directory.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn init_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        git_command_checked(dir.path(), &["init", "-b", "main"])
            .await
            .unwrap();
        git_command_checked(dir.path(), &["config", "user.email", "test@test.com"])
            .await
            .unwrap();
        git_command_checked(dir.path(), &["config", "user.name", "Test"])
            .await
            .unwrap();

        let test_file = dir.path().join("test.txt");
        tokio::fs::write(&test_file, "test content").await.unwrap();
        git_command_checked(dir.path(), &["add", "."])
            .await
            .unwrap();
        git_command_checked(dir.path(), &["commit", "-m", "Initial commit"])
            .await
            .unwrap();

        dir
    }

    #[tokio::test]
    async fn create_task_worktree_checks_out_new_branch() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new();

        let managed = manager
            .create_task_worktree(dir.path(), "task-1")
            .await
            .unwrap();

        assert!(managed.worktree_directory.exists());
        assert_eq!(managed.branch_name, "task/task-1");
        assert_eq!(managed.base_branch, "main");
    }

    #[tokio::test]
    async fn create_task_worktree_rejects_duplicate_branch() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new();

        manager
            .create_task_worktree(dir.path(), "task-1")
            .await
            .unwrap();
        let err = manager
            .create_task_worktree(dir.path(), "task-1")
            .await
            .unwrap_err();
        assert!(matches!(err, WorktreeError::BranchExists { .. }));
    }

    #[tokio::test]
    async fn get_task_worktree_directory_round_trips() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new();

        assert!(manager.get_task_worktree_directory("task-1").await.is_none());

        let managed = manager
            .create_task_worktree(dir.path(), "task-1")
            .await
            .unwrap();
        let found = manager.get_task_worktree_directory("task-1").await.unwrap();
        assert_eq!(found, managed.worktree_directory);
    }

    #[tokio::test]
    async fn cleanup_with_keep_policy_is_a_noop() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new();
        let managed = manager
            .create_task_worktree(dir.path(), "task-1")
            .await
            .unwrap();

        let outcome = manager
            .cleanup_task_worktree(
                "task-1",
                dir.path(),
                &managed.worktree_directory,
                CleanupPolicy::Keep,
            )
            .await
            .unwrap();

        assert!(!outcome.removed);
        assert!(managed.worktree_directory.exists());
    }

    #[tokio::test]
    async fn cleanup_with_remove_policy_deletes_worktree_and_branch() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new();
        let managed = manager
            .create_task_worktree(dir.path(), "task-1")
            .await
            .unwrap();

        let outcome = manager
            .cleanup_task_worktree(
                "task-1",
                dir.path(),
                &managed.worktree_directory,
                CleanupPolicy::Remove,
            )
            .await
            .unwrap();

        assert!(outcome.removed);
        assert!(!managed.worktree_directory.exists());
        assert!(!branch_exists(dir.path(), "task/task-1").await.unwrap());
        assert!(manager.get_task_worktree_directory("task-1").await.is_none());
    }

    #[tokio::test]
    async fn merge_task_worktree_fast_forwards_into_base_branch() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new();
        let managed = manager
            .create_task_worktree(dir.path(), "task-1")
            .await
            .unwrap();

        let new_file = managed.worktree_directory.join("from_task.txt");
        tokio::fs::write(&new_file, "hello").await.unwrap();
        git_command_checked(&managed.worktree_directory, &["add", "."])
            .await
            .unwrap();
        git_command_checked(&managed.worktree_directory, &["commit", "-m", "task work"])
            .await
            .unwrap();

        let outcome = manager
            .merge_task_worktree(dir.path(), "task-1", &managed.worktree_directory)
            .await
            .unwrap();
        assert_eq!(outcome.branch, "task/task-1");
        assert!(dir.path().join("from_task.txt").exists());
    }

    #[tokio::test]
    async fn merge_task_worktree_fails_loudly_on_conflict() {
        let dir = init_test_repo().await;
        let manager = WorktreeManager::new();
        let managed = manager
            .create_task_worktree(dir.path(), "task-1")
            .await
            .unwrap();

        // Conflicting edit on the task branch.
        tokio::fs::write(managed.worktree_directory.join("test.txt"), "from task")
            .await
            .unwrap();
        git_command_checked(&managed.worktree_directory, &["add", "."])
            .await
            .unwrap();
        git_command_checked(&managed.worktree_directory, &["commit", "-m", "conflicting"])
            .await
            .unwrap();

        // Conflicting edit on main.
        tokio::fs::write(dir.path().join("test.txt"), "from main")
            .await
            .unwrap();
        git_command_checked(dir.path(), &["add", "."]).await.unwrap();
        git_command_checked(dir.path(), &["commit", "-m", "conflicting on main"])
            .await
            .unwrap();

        let err = manager
            .merge_task_worktree(dir.path(), "task-1", &managed.worktree_directory)
            .await
            .unwrap_err();
        assert!(matches!(err, WorktreeError::MergeConflict { .. }));

        // No partial merge state left behind.
        let status = git_command_checked(dir.path(), &["status", "--porcelain"])
            .await
            .unwrap();
        assert!(!status.contains("UU "));
    }
}
