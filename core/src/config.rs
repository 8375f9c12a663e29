//! Typed configuration loaded from the environment. See SPEC_FULL.md §4.1.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use thiserror::Error;

/// Errors rejected during config loading: non-positive integers, cleanup
/// policies outside `{keep,remove}`, relative allowed paths.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got '{value}'")]
    NotAPositiveInteger { key: String, value: String },

    #[error("{key} must be one of 'keep' or 'remove', got '{value}'")]
    InvalidCleanupPolicy { key: String, value: String },

    #[error("ALLOWED_PROJECT_PATHS entry must be an absolute path, got '{0}'")]
    RelativeAllowedPath(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// `keep` or `remove`: whether a task's worktree is preserved or erased on a
/// terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    Keep,
    Remove,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        CleanupPolicy::Keep
    }
}

impl CleanupPolicy {
    fn parse(key: &str, value: &str) -> Result<Self> {
        match value.trim() {
            "keep" => Ok(CleanupPolicy::Keep),
            "remove" => Ok(CleanupPolicy::Remove),
            other => Err(ConfigError::InvalidCleanupPolicy {
                key: key.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// `AR: {hostname?, port?, timeoutMs?}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArConfig {
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub timeout_ms: Option<u64>,
}

/// `tasks: {maxConcurrent, cleanupOnSuccess, cleanupOnFailure}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TasksConfig {
    pub max_concurrent: u32,
    pub cleanup_on_success: CleanupPolicy,
    pub cleanup_on_failure: CleanupPolicy,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            cleanup_on_success: CleanupPolicy::Keep,
            cleanup_on_failure: CleanupPolicy::Keep,
        }
    }
}

/// `projects: {allowedRootDirectories}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectsConfig {
    /// Deduplicated and lexicographically sorted.
    pub allowed_root_directories: Vec<PathBuf>,
}

/// The fully validated, typed configuration value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub ar: ArConfig,
    pub tasks: TasksConfig,
    pub projects: ProjectsConfig,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        let map: HashMap<String, String> = [
            "AR_HOSTNAME",
            "AR_PORT",
            "AR_TIMEOUT_MS",
            "TASK_MAX_CONCURRENT",
            "TASK_CLEANUP_ON_SUCCESS",
            "TASK_CLEANUP_ON_FAILURE",
            "ALLOWED_PROJECT_PATHS",
        ]
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect();
        Self::from_map(&map)
    }

    /// Load from an injectable key/value map — used by tests to avoid
    /// mutating process environment across parallel test runs.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let hostname = map
            .get("AR_HOSTNAME")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let port = parse_optional_positive(map, "AR_PORT")?.map(|v| v as u16);
        let timeout_ms = parse_optional_positive(map, "AR_TIMEOUT_MS")?;

        let max_concurrent = match map.get("TASK_MAX_CONCURRENT") {
            Some(v) => parse_positive_integer("TASK_MAX_CONCURRENT", v)? as u32,
            None => 2,
        };

        let cleanup_on_success = match map.get("TASK_CLEANUP_ON_SUCCESS") {
            Some(v) => CleanupPolicy::parse("TASK_CLEANUP_ON_SUCCESS", v)?,
            None => CleanupPolicy::Keep,
        };
        let cleanup_on_failure = match map.get("TASK_CLEANUP_ON_FAILURE") {
            Some(v) => CleanupPolicy::parse("TASK_CLEANUP_ON_FAILURE", v)?,
            None => CleanupPolicy::Keep,
        };

        let allowed_root_directories = match map.get("ALLOWED_PROJECT_PATHS") {
            Some(v) if !v.trim().is_empty() => {
                let mut set: BTreeSet<PathBuf> = BTreeSet::new();
                for entry in std::env::split_paths(v.trim()) {
                    if !entry.is_absolute() {
                        return Err(ConfigError::RelativeAllowedPath(
                            entry.to_string_lossy().into_owned(),
                        ));
                    }
                    set.insert(entry);
                }
                set.into_iter().collect()
            }
            _ => Vec::new(),
        };

        Ok(Config {
            ar: ArConfig {
                hostname,
                port,
                timeout_ms,
            },
            tasks: TasksConfig {
                max_concurrent,
                cleanup_on_success,
                cleanup_on_failure,
            },
            projects: ProjectsConfig {
                allowed_root_directories,
            },
        })
    }
}

fn parse_positive_integer(key: &str, value: &str) -> Result<u64> {
    let trimmed = value.trim();
    match trimmed.parse::<i64>() {
        Ok(n) if n > 0 => Ok(n as u64),
        _ => Err(ConfigError::NotAPositiveInteger {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_optional_positive(map: &HashMap<String, String>, key: &str) -> Result<Option<u64>> {
    match map.get(key) {
        Some(v) if v.trim().is_empty() => Ok(None),
        Some(v) => Ok(Some(parse_positive_integer(key, v)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_map(&HashMap::new()).unwrap();
        assert_eq!(config.tasks.max_concurrent, 2);
        assert_eq!(config.tasks.cleanup_on_success, CleanupPolicy::Keep);
        assert_eq!(config.tasks.cleanup_on_failure, CleanupPolicy::Keep);
        assert!(config.projects.allowed_root_directories.is_empty());
        assert_eq!(config.ar.hostname, None);
    }

    #[test]
    fn rejects_non_positive_max_concurrent() {
        let err = Config::from_map(&map(&[("TASK_MAX_CONCURRENT", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::NotAPositiveInteger { .. }));

        let err = Config::from_map(&map(&[("TASK_MAX_CONCURRENT", "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::NotAPositiveInteger { .. }));

        let err = Config::from_map(&map(&[("TASK_MAX_CONCURRENT", "nope")])).unwrap_err();
        assert!(matches!(err, ConfigError::NotAPositiveInteger { .. }));
    }

    #[test]
    fn rejects_invalid_cleanup_policy() {
        let err = Config::from_map(&map(&[("TASK_CLEANUP_ON_SUCCESS", "destroy")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCleanupPolicy { .. }));
    }

    #[test]
    fn rejects_relative_allowed_path() {
        let err = Config::from_map(&map(&[("ALLOWED_PROJECT_PATHS", "relative/path")])).unwrap_err();
        assert!(matches!(err, ConfigError::RelativeAllowedPath(_)));
    }

    #[test]
    fn dedups_and_sorts_allowed_paths() {
        let joined = std::env::join_paths(["/z", "/a", "/a"]).unwrap();
        let config = Config::from_map(&map(&[(
            "ALLOWED_PROJECT_PATHS",
            joined.to_str().unwrap(),
        )]))
        .unwrap();
        assert_eq!(
            config.projects.allowed_root_directories,
            vec![PathBuf::from("/a"), PathBuf::from("/z")]
        );
    }

    #[test]
    fn blank_hostname_is_ignored() {
        let config = Config::from_map(&map(&[("AR_HOSTNAME", "   ")])).unwrap();
        assert_eq!(config.ar.hostname, None);
    }

    #[test]
    fn parses_ar_section() {
        let config = Config::from_map(&map(&[
            ("AR_HOSTNAME", "127.0.0.1"),
            ("AR_PORT", "4096"),
            ("AR_TIMEOUT_MS", "5000"),
        ]))
        .unwrap();
        assert_eq!(config.ar.hostname.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.ar.port, Some(4096));
        assert_eq!(config.ar.timeout_ms, Some(5000));
    }
}
