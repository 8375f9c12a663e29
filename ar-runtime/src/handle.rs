//! AR runtime handle. See SPEC_FULL.md §4.3.
//!
//! Grounded in `opencode_client.rs`'s `start()`/`stop()`/`wait_for_health()`
//! process-lifecycle management, generalized from "one client owns one
//! process" to "one handle owns one process, many directory-scoped clients
//! share it" — the AR serves every directory through the same listening
//! process via a `?directory=` query parameter, so the handle stores the
//! resolved base URL once and each [`ArClient`] is just a thin
//! `{base_url, directory}` view over a shared `reqwest::Client`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use acp_core::{LogContext, LogLevel, Logger, NoopLogger};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::client::ArClient;
use crate::error::{ArError, Result};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(20);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Launch configuration for the AR process.
#[derive(Debug, Clone)]
pub struct ArRuntimeConfig {
    pub program: String,
    pub hostname: String,
    /// `0` lets the AR pick an ephemeral port; its stdout is scraped for the
    /// resolved listen address either way.
    pub port: u16,
    pub timeout_ms: u64,
}

impl Default for ArRuntimeConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            hostname: "127.0.0.1".to_string(),
            port: 0,
            timeout_ms: 45_000,
        }
    }
}

fn default_program() -> String {
    if cfg!(windows) {
        "opencode.cmd".to_string()
    } else {
        "opencode".to_string()
    }
}

/// Owns the AR server process and hands out directory-scoped clients.
/// `start`/`stop`/`restart`/`is_running`/`get_client` per spec.md §4.3.
pub struct ArRuntimeHandle {
    config: ArRuntimeConfig,
    logger: Arc<dyn Logger>,
    start_lock: Mutex<()>,
    process: Mutex<Option<Child>>,
    base_url: RwLock<Option<String>>,
    clients: RwLock<HashMap<PathBuf, Arc<ArClient>>>,
    http: reqwest::Client,
}

impl ArRuntimeHandle {
    pub fn new(config: ArRuntimeConfig) -> Self {
        Self::with_logger(config, Arc::new(NoopLogger))
    }

    pub fn with_logger(config: ArRuntimeConfig, logger: Arc<dyn Logger>) -> Self {
        Self {
            config,
            logger,
            start_lock: Mutex::new(()),
            process: Mutex::new(None),
            base_url: RwLock::new(None),
            clients: RwLock::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    /// Idempotent. Concurrent callers serialize on `start_lock`; any call
    /// that arrives while another is spawning blocks until that spawn
    /// resolves and then observes the now-cached base URL instead of
    /// spawning a second process — the "in-flight promise" semantics of
    /// spec.md §4.3 without a separate shared-future type.
    pub async fn start(&self) -> Result<String> {
        let _guard = self.start_lock.lock().await;

        if let Some(url) = self.base_url.read().await.clone() {
            return Ok(url);
        }

        match self.spawn_and_wait_ready().await {
            Ok(url) => Ok(url),
            Err(e) => {
                self.logger.log(
                    LogLevel::Error,
                    "ar-runtime.start",
                    "failed to start AR process",
                    None,
                    Some(&acp_core::LoggedError::from(&e)),
                );
                Err(e)
            }
        }
    }

    async fn spawn_and_wait_ready(&self) -> Result<String> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args([
            "serve",
            "--hostname",
            &self.config.hostname,
            "--port",
            &self.config.port.to_string(),
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(ArError::Spawn)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ArError::Spawn(std::io::Error::other("no stdout handle")))?;

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let mut ready_tx = Some(ready_tx);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(line, "AR stdout");
                if let Some(url) = extract_server_url(&line) {
                    info!(url, "AR server ready");
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(url);
                    }
                }
            }
        });

        *self.process.lock().await = Some(child);

        let url = tokio::time::timeout(STARTUP_TIMEOUT, ready_rx)
            .await
            .map_err(|_| ArError::StartupTimeout)?
            .map_err(|_| ArError::StartupFailed)?;

        *self.base_url.write().await = Some(url.clone());
        Ok(url)
    }

    /// Closes the underlying process, clears the client cache. Safe when
    /// never started.
    pub async fn stop(&self) {
        if let Some(mut child) = self.process.lock().await.take() {
            let _ = child.kill().await;
        }
        *self.base_url.write().await = None;
        self.clients.write().await.clear();
    }

    /// Stop then start, yielding a fresh instance.
    pub async fn restart(&self) -> Result<String> {
        self.stop().await;
        self.start().await
    }

    pub async fn is_running(&self) -> bool {
        self.base_url.read().await.is_some()
    }

    /// Returns a client bound to `directory`, caching by the normalized
    /// (absolute) path. Cache is cleared on `stop`.
    pub async fn get_client(&self, directory: &Path) -> Result<Arc<ArClient>> {
        let normalized = normalize_directory(directory).map_err(|e| {
            ArError::UnexpectedResponse(format!("cannot resolve directory {directory:?}: {e}"))
        })?;

        if let Some(client) = self.clients.read().await.get(&normalized) {
            return Ok(client.clone());
        }

        let result = async {
            let base_url = self
                .base_url
                .read()
                .await
                .clone()
                .ok_or(ArError::NotStarted)?;
            Ok::<_, ArError>(Arc::new(ArClient::new(
                self.http.clone(),
                base_url,
                normalized.clone(),
                Duration::from_millis(self.config.timeout_ms),
            )))
        }
        .await;

        match result {
            Ok(client) => {
                self.clients
                    .write()
                    .await
                    .insert(normalized, client.clone());
                Ok(client)
            }
            Err(e) => {
                let mut ctx = LogContext::new();
                ctx.insert(
                    "directory".to_string(),
                    directory.to_string_lossy().into_owned(),
                );
                self.logger.log(
                    LogLevel::Error,
                    "ar-runtime.client",
                    "failed to build AR client",
                    Some(&ctx),
                    Some(&acp_core::LoggedError::from(&e)),
                );
                Err(e)
            }
        }
    }

    /// Health-check the running AR instance, polling until success or
    /// timeout.
    pub async fn wait_for_health(&self) -> Result<bool> {
        let base_url = self
            .base_url
            .read()
            .await
            .clone()
            .ok_or(ArError::NotStarted)?;

        let deadline = tokio::time::Instant::now() + HEALTH_CHECK_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if let Ok(resp) = self
                .http
                .get(format!("{base_url}/global/health"))
                .send()
                .await
            {
                if resp.status().is_success() {
                    if let Ok(data) = resp.json::<serde_json::Value>().await {
                        if data.get("healthy") == Some(&serde_json::Value::Bool(true)) {
                            return Ok(true);
                        }
                    }
                }
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
        Ok(false)
    }
}

fn extract_server_url(line: &str) -> Option<String> {
    if line.to_lowercase().contains("listening on") {
        if let Some(idx) = line.find("http://") {
            return Some(line[idx..].trim().to_string());
        }
    }
    None
}

fn normalize_directory(directory: &Path) -> std::io::Result<PathBuf> {
    if directory.is_absolute() {
        Ok(directory.to_path_buf())
    } else {
        std::env::current_dir().map(|cwd| cwd.join(directory))
    }
}
