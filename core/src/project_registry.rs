//! Durable project registry. See SPEC_FULL.md §4.4.
//!
//! Persistence idiom grounded on `core/src/task/file_store.rs`'s array-JSON
//! + `HashMap` cache + full-rewrite pattern (not `core/src/project/store.rs`'s
//! `HashMap`-object shape, which doesn't match the array format this spec
//! requires).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::model::{has_vcs_marker, Project};

pub const PROJECT_REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("project id must not be empty")]
    EmptyId,
    #[error("project with id '{0}' already exists")]
    IdAlreadyExists(String),
    #[error("project with id '{0}' was not found")]
    NotFound(String),
    #[error("rootDirectory must be an absolute path, got '{0}'")]
    RootNotAbsolute(PathBuf),
    #[error("rootDirectory '{0}' does not exist")]
    RootDoesNotExist(PathBuf),
    #[error("rootDirectory '{0}' is not a directory")]
    RootNotADirectory(PathBuf),
    #[error("rootDirectory '{0}' does not contain a VCS marker")]
    RootMissingVcsMarker(PathBuf),
    #[error("rootDirectory '{0}' is already registered")]
    RootAlreadyRegistered(PathBuf),
    #[error("rootDirectory '{0}' is outside the allowed project roots")]
    RootNotAllowed(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unknown project registry version: {0}")]
    UnknownVersion(u32),
    #[error("project registry file's 'projects' field must be an array")]
    ProjectsNotArray,
    #[error("duplicate project id '{0}' in persisted registry")]
    DuplicateIdOnLoad(String),
    #[error("duplicate rootDirectory '{0}' in persisted registry")]
    DuplicateRootOnLoad(PathBuf),
}

pub type Result<T> = std::result::Result<T, ProjectError>;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedFile {
    version: serde_json::Value,
    #[serde(rename = "activeProjectId")]
    active_project_id: Option<String>,
    projects: serde_json::Value,
}

struct State {
    projects: HashMap<String, Project>,
    active_project_id: Option<String>,
}

/// Durable set of registered repositories plus one "active" selection. All
/// operations ensure durable state is loaded from disk (once; concurrent
/// callers serialize on the load and observe the same result).
pub struct ProjectRegistry {
    file_path: PathBuf,
    allowed_roots: Vec<PathBuf>,
    loaded: Mutex<bool>,
    state: RwLock<State>,
}

impl ProjectRegistry {
    pub fn new(file_path: PathBuf, allowed_roots: Vec<PathBuf>) -> Self {
        Self {
            file_path,
            allowed_roots,
            loaded: Mutex::new(false),
            state: RwLock::new(State {
                projects: HashMap::new(),
                active_project_id: None,
            }),
        }
    }

    async fn ensure_loaded(&self) -> Result<()> {
        let mut loaded = self.loaded.lock().await;
        if *loaded {
            return Ok(());
        }
        if !self.file_path.exists() {
            *loaded = true;
            return Ok(());
        }
        let content = tokio::fs::read_to_string(&self.file_path).await?;
        let file: PersistedFile = serde_json::from_str(&content)?;

        let version = file
            .version
            .as_u64()
            .map(|v| v as u32)
            .unwrap_or(u32::MAX);
        if version != PROJECT_REGISTRY_VERSION {
            return Err(ProjectError::UnknownVersion(version));
        }

        let projects_value = file.projects;
        let raw_projects: Vec<Project> = match projects_value {
            serde_json::Value::Array(_) => serde_json::from_value(projects_value)?,
            _ => return Err(ProjectError::ProjectsNotArray),
        };

        let mut projects = HashMap::new();
        let mut seen_roots = std::collections::HashSet::new();
        for project in raw_projects {
            if projects.contains_key(&project.id) {
                return Err(ProjectError::DuplicateIdOnLoad(project.id));
            }
            if !seen_roots.insert(project.root_directory.clone()) {
                return Err(ProjectError::DuplicateRootOnLoad(project.root_directory));
            }
            projects.insert(project.id.clone(), project);
        }

        let mut guard = self.state.write().await;
        guard.projects = projects;
        guard.active_project_id = file.active_project_id;
        drop(guard);

        *loaded = true;
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let guard = self.state.read().await;
        let mut projects: Vec<&Project> = guard.projects.values().collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let file = serde_json::json!({
            "version": PROJECT_REGISTRY_VERSION,
            "activeProjectId": guard.active_project_id,
            "projects": projects,
        });
        drop(guard);
        let mut content = serde_json::to_string_pretty(&file)?;
        content.push('\n');
        tokio::fs::write(&self.file_path, content).await?;
        Ok(())
    }

    fn validate_new_project(&self, id: &str, root_directory: &Path) -> Result<()> {
        if id.trim().is_empty() {
            return Err(ProjectError::EmptyId);
        }
        if !root_directory.is_absolute() {
            return Err(ProjectError::RootNotAbsolute(root_directory.to_path_buf()));
        }
        if !root_directory.exists() {
            return Err(ProjectError::RootDoesNotExist(root_directory.to_path_buf()));
        }
        if !root_directory.is_dir() {
            return Err(ProjectError::RootNotADirectory(root_directory.to_path_buf()));
        }
        if !has_vcs_marker(root_directory) {
            return Err(ProjectError::RootMissingVcsMarker(root_directory.to_path_buf()));
        }
        if !self.allowed_roots.is_empty()
            && !self
                .allowed_roots
                .iter()
                .any(|allowed| root_directory.starts_with(allowed))
        {
            return Err(ProjectError::RootNotAllowed(root_directory.to_path_buf()));
        }
        Ok(())
    }

    /// Register a new project. The first project ever added becomes active.
    pub async fn add_project(&self, id: impl Into<String>, name: impl Into<String>, root_directory: PathBuf) -> Result<Project> {
        self.ensure_loaded().await?;
        let id = id.into().trim().to_string();

        self.validate_new_project(&id, &root_directory)?;

        {
            let guard = self.state.read().await;
            if guard.projects.contains_key(&id) {
                return Err(ProjectError::IdAlreadyExists(id));
            }
            if guard
                .projects
                .values()
                .any(|p| p.root_directory == root_directory)
            {
                return Err(ProjectError::RootAlreadyRegistered(root_directory));
            }
        }

        let project = Project::new(id.clone(), name, root_directory);
        {
            let mut guard = self.state.write().await;
            let is_first = guard.projects.is_empty();
            guard.projects.insert(id.clone(), project.clone());
            if is_first {
                guard.active_project_id = Some(id.clone());
            }
        }
        self.persist().await?;
        Ok(project)
    }

    /// Remove a project. If it was active, the next project by sort order
    /// becomes active, or the selection clears if none remain.
    pub async fn remove_project(&self, id: &str) -> Result<()> {
        self.ensure_loaded().await?;
        {
            let mut guard = self.state.write().await;
            if guard.projects.remove(id).is_none() {
                return Err(ProjectError::NotFound(id.to_string()));
            }
            if guard.active_project_id.as_deref() == Some(id) {
                let mut remaining: Vec<&Project> = guard.projects.values().collect();
                remaining.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                guard.active_project_id = remaining.first().map(|p| p.id.clone());
            }
        }
        self.persist().await?;
        Ok(())
    }

    /// Sorted by `createdAt` then `id`.
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.ensure_loaded().await?;
        let guard = self.state.read().await;
        let mut projects: Vec<Project> = guard.projects.values().cloned().collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(projects)
    }

    pub async fn select_project(&self, id: &str) -> Result<()> {
        self.ensure_loaded().await?;
        {
            let mut guard = self.state.write().await;
            if !guard.projects.contains_key(id) {
                return Err(ProjectError::NotFound(id.to_string()));
            }
            guard.active_project_id = Some(id.to_string());
        }
        self.persist().await?;
        Ok(())
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.ensure_loaded().await?;
        Ok(self.state.read().await.projects.get(id).cloned())
    }

    pub async fn get_active_project_id(&self) -> Result<Option<String>> {
        self.ensure_loaded().await?;
        Ok(self.state.read().await.active_project_id.clone())
    }

    pub async fn get_active_project(&self) -> Result<Option<Project>> {
        self.ensure_loaded().await?;
        let guard = self.state.read().await;
        match &guard.active_project_id {
            Some(id) => Ok(guard.projects.get(id).cloned()),
            None => Ok(None),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_repo(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::create_dir_all(dir.join(".git")).unwrap();
    }

    fn registry(file_path: PathBuf) -> ProjectRegistry {
        ProjectRegistry::new(file_path, Vec::new())
    }

    #[tokio::test]
    async fn first_added_project_becomes_active() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo-one");
        init_repo(&repo);
        let reg = registry(dir.path().join("projects.json"));

        let project = reg.add_project("p1", "Repo One", repo.clone()).await.unwrap();
        assert_eq!(reg.get_active_project_id().await.unwrap(), Some(project.id));
    }

    #[tokio::test]
    async fn rejects_non_absolute_root() {
        let dir = TempDir::new().unwrap();
        let reg = registry(dir.path().join("projects.json"));
        let err = reg
            .add_project("p1", "Repo", PathBuf::from("relative/path"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectError::RootNotAbsolute(_)));
    }

    #[tokio::test]
    async fn rejects_root_without_vcs_marker() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("not-a-repo");
        std::fs::create_dir_all(&repo).unwrap();
        let reg = registry(dir.path().join("projects.json"));
        let err = reg.add_project("p1", "Repo", repo).await.unwrap_err();
        assert!(matches!(err, ProjectError::RootMissingVcsMarker(_)));
    }

    #[tokio::test]
    async fn rejects_duplicate_root() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        init_repo(&repo);
        let reg = registry(dir.path().join("projects.json"));
        reg.add_project("p1", "Repo", repo.clone()).await.unwrap();
        let err = reg.add_project("p2", "Repo Again", repo).await.unwrap_err();
        assert!(matches!(err, ProjectError::RootAlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn rejects_root_outside_allowed_whitelist() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        init_repo(&repo);
        let allowed = dir.path().join("elsewhere");
        std::fs::create_dir_all(&allowed).unwrap();
        let reg = ProjectRegistry::new(dir.path().join("projects.json"), vec![allowed]);
        let err = reg.add_project("p1", "Repo", repo).await.unwrap_err();
        assert!(matches!(err, ProjectError::RootNotAllowed(_)));
    }

    #[tokio::test]
    async fn removing_active_selects_next_by_sort_order() {
        let dir = TempDir::new().unwrap();
        let repo_a = dir.path().join("a");
        let repo_b = dir.path().join("b");
        init_repo(&repo_a);
        init_repo(&repo_b);
        let reg = registry(dir.path().join("projects.json"));
        reg.add_project("a", "A", repo_a).await.unwrap();
        reg.add_project("b", "B", repo_b).await.unwrap();
        reg.remove_project("a").await.unwrap();
        assert_eq!(reg.get_active_project_id().await.unwrap(), Some("b".into()));
    }

    #[tokio::test]
    async fn s5_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let repo_one = dir.path().join("repo-one");
        let repo_two = dir.path().join("repo-two");
        init_repo(&repo_one);
        init_repo(&repo_two);
        let file_path = dir.path().join("projects.json");

        {
            let reg = registry(file_path.clone());
            reg.add_project("project-one", "One", repo_one).await.unwrap();
            reg.add_project("project-two", "Two", repo_two).await.unwrap();
            reg.select_project("project-two").await.unwrap();
        }

        let reg2 = registry(file_path);
        let projects = reg2.list_projects().await.unwrap();
        assert_eq!(
            projects.iter().map(|p| p.id.clone()).collect::<Vec<_>>(),
            vec!["project-one", "project-two"]
        );
        let active = reg2.get_active_project().await.unwrap().unwrap();
        assert_eq!(active.id, "project-two");
    }

    #[tokio::test]
    async fn persisted_file_has_trailing_newline_and_version() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        init_repo(&repo);
        let file_path = dir.path().join("projects.json");
        let reg = registry(file_path.clone());
        reg.add_project("p1", "Repo", repo).await.unwrap();

        let content = tokio::fs::read_to_string(&file_path).await.unwrap();
        assert!(content.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["version"], 1);
    }

    #[tokio::test]
    async fn rejects_unknown_version_on_load() {
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("projects.json");
        tokio::fs::write(
            &file_path,
            serde_json::json!({"version": 2, "activeProjectId": null, "projects": []})
                .to_string(),
        )
        .await
        .unwrap();
        let reg = registry(file_path);
        let err = reg.list_projects().await.unwrap_err();
        assert!(matches!(err, ProjectError::UnknownVersion(2)));
    }

    #[tokio::test]
    async fn rejects_non_array_projects_field() {
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("projects.json");
        tokio::fs::write(
            &file_path,
            serde_json::json!({"version": 1, "activeProjectId": null, "projects": {}})
                .to_string(),
        )
        .await
        .unwrap();
        let reg = registry(file_path);
        let err = reg.list_projects().await.unwrap_err();
        assert!(matches!(err, ProjectError::ProjectsNotArray));
    }
}
