//! Durable task registry. See SPEC_FULL.md §4.5.
//!
//! Same array-JSON + `HashMap` cache + full-rewrite persistence idiom as
//! [`crate::project_registry`], grounded on `core/src/task/file_store.rs`.

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::model::{ModelError, Task};

pub const TASK_REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum TaskRegistryError {
    #[error("task with id '{0}' already exists")]
    AlreadyExists(String),
    #[error("task with id '{0}' was not found")]
    NotFound(String),
    #[error("invariant violation: {0}")]
    Invariant(#[from] ModelError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unknown task registry version: {0}")]
    UnknownVersion(u32),
    #[error("task registry file's 'tasks' field must be an array")]
    TasksNotArray,
}

pub type Result<T> = std::result::Result<T, TaskRegistryError>;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PersistedFile {
    version: serde_json::Value,
    tasks: serde_json::Value,
}

/// Durable set of task runtime records, replayed on startup. §3 invariants
/// are re-validated against every entry on load.
pub struct TaskRegistry {
    file_path: PathBuf,
    loaded: Mutex<bool>,
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskRegistry {
    pub fn new(file_path: PathBuf) -> Self {
        Self {
            file_path,
            loaded: Mutex::new(false),
            tasks: RwLock::new(HashMap::new()),
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

        let version = file.version.as_u64().map(|v| v as u32).unwrap_or(u32::MAX);
        if version != TASK_REGISTRY_VERSION {
            return Err(TaskRegistryError::UnknownVersion(version));
        }

        let raw_tasks: Vec<Task> = match file.tasks {
            serde_json::Value::Array(_) => serde_json::from_value(file.tasks)?,
            _ => return Err(TaskRegistryError::TasksNotArray),
        };

        let mut tasks = HashMap::new();
        for task in raw_tasks {
            task.validate()?;
            tasks.insert(task.task_id.clone(), task);
        }

        *self.tasks.write().await = tasks;
        *loaded = true;
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let guard = self.tasks.read().await;
        let mut tasks: Vec<&Task> = guard.values().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.task_id.cmp(&b.task_id)));
        let file = serde_json::json!({
            "version": TASK_REGISTRY_VERSION,
            "tasks": tasks,
        });
        drop(guard);
        let mut content = serde_json::to_string_pretty(&file)?;
        content.push('\n');
        tokio::fs::write(&self.file_path, content).await?;
        Ok(())
    }

    /// Insert a new task record. Rejects a duplicate task id.
    pub async fn insert(&self, task: Task) -> Result<Task> {
        self.ensure_loaded().await?;
        task.validate()?;
        {
            let mut guard = self.tasks.write().await;
            if guard.contains_key(&task.task_id) {
                return Err(TaskRegistryError::AlreadyExists(task.task_id));
            }
            guard.insert(task.task_id.clone(), task.clone());
        }
        self.persist().await?;
        Ok(task)
    }

    /// Upsert (used after every state transition).
    pub async fn upsert(&self, task: Task) -> Result<Task> {
        self.ensure_loaded().await?;
        task.validate()?;
        {
            let mut guard = self.tasks.write().await;
            guard.insert(task.task_id.clone(), task.clone());
        }
        self.persist().await?;
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        self.ensure_loaded().await?;
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    pub async fn remove(&self, task_id: &str) -> Result<bool> {
        self.ensure_loaded().await?;
        let removed = self.tasks.write().await.remove(task_id).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<Task>> {
        self.ensure_loaded().await?;
        let guard = self.tasks.read().await;
        let mut tasks: Vec<Task> = guard.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.task_id.cmp(&b.task_id)));
        Ok(tasks)
    }
}
