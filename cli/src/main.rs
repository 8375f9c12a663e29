//! Process bootstrap for the local control plane.
//!
//! This is the main entry point for the Rust backend.

use std::path::PathBuf;
use std::sync::Arc;

use acp_core::{Config, EventBus, Logger, ProjectRegistry, TaskRegistry, TracingLogger};
use ar_runtime::{ArRuntimeConfig, ArRuntimeHandle};
use conversation::ConversationManager;
use git_worktree::WorktreeManager;
use orchestrator::Orchestrator;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cli=debug,orchestrator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().expect("invalid configuration in the process environment");

    // Determine data directory
    let data_dir = std::env::var("ACP_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".acp-data"));
    tracing::info!("Using data directory: {:?}", data_dir);

    let logger: Arc<dyn Logger> = Arc::new(TracingLogger);

    let projects = Arc::new(ProjectRegistry::new(
        data_dir.join("projects.json"),
        config.projects.allowed_root_directories.clone(),
    ));
    let tasks = Arc::new(TaskRegistry::new(data_dir.join("tasks.json")));
    let worktrees = Arc::new(WorktreeManager::new());

    let ar_config = ArRuntimeConfig {
        hostname: config.ar.hostname.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
        port: config.ar.port.unwrap_or(0),
        timeout_ms: config.ar.timeout_ms.unwrap_or(60_000),
        ..ArRuntimeConfig::default()
    };
    let ar_handle = Arc::new(ArRuntimeHandle::with_logger(ar_config, Arc::clone(&logger)));
    let conversations = Arc::new(ConversationManager::with_logger(Arc::clone(&ar_handle), Arc::clone(&logger)));
    let events = Arc::new(EventBus::new(Arc::clone(&logger)));

    let orchestrator = Orchestrator::with_logger(
        config.tasks.clone(),
        projects,
        tasks,
        worktrees,
        conversations,
        events,
        Arc::clone(&logger),
    );

    tracing::info!(maxConcurrent = config.tasks.max_concurrent, "orchestrator ready");

    // Nothing in this crate drives the orchestrator over a network or UI
    // surface; that belongs to an external caller. Keep the process (and its
    // background scheduler tasks) alive until asked to stop.
    let _ = orchestrator;
    tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    tracing::info!("shutting down");
}
