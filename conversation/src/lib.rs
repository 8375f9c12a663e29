//! Session-scoped conversation manager driving the agent runtime. See
//! SPEC_FULL.md §4.7.

pub mod error;
pub mod manager;
pub mod signature;

pub use error::{ConversationError, Result};
pub use manager::{
    AwaitedMessages, ConversationManager, CreateTaskSessionRequest, OnMessage, PromptRequest, PromptSubmission, Subscription,
};
pub use signature::{message_id, message_role, signature, MessageSignature};
