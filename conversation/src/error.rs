//! Errors for the conversation manager. See SPEC_FULL.md §4.7/§7.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConversationError>;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("session '{0}' is not known to this conversation manager")]
    UnknownSession(String),

    #[error("no worktree directory given and none remembered for session '{0}'")]
    WorktreeNotResolved(String),

    #[error("could not resolve a model: no override, no remembered selection, and the AR reported no usable default")]
    ModelNotResolved,

    #[error("session reported an error: {0}")]
    SessionError(String),

    #[error("timed out waiting for the session to go idle")]
    Timeout,

    #[error("session went idle but no assistant message was observed")]
    NoAssistantMessage,

    #[error("{0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Ar(#[from] ar_runtime::ArError),
}
