//! Errors for the AR runtime handle and client. See SPEC_FULL.md §4.3/§7.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArError>;

/// Failures from starting, stopping, or talking to the AR process.
///
/// Startup failures are logged at `ar-runtime.start`; scoped-client creation
/// failures are logged at `ar-runtime.client` with `{directory}` context —
/// both per spec.md §4.3. The logging itself happens at the call site (the
/// handle holds the shared `Logger`), this enum only carries the data.
#[derive(Debug, Error)]
pub enum ArError {
    #[error("failed to spawn AR process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("AR process did not report a ready URL within the startup timeout")]
    StartupTimeout,

    #[error("AR process exited before reporting a ready URL")]
    StartupFailed,

    #[error("AR runtime has not been started")]
    NotStarted,

    #[error("AR health check did not succeed within the timeout")]
    HealthCheckFailed,

    #[error("AR request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("AR responded with HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("unexpected AR response shape: {0}")]
    UnexpectedResponse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
