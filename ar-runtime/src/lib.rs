//! Process lifecycle and typed client for the external agent runtime (AR).
//! See SPEC_FULL.md §4.3.

pub mod client;
pub mod error;
pub mod events;
pub mod handle;

pub use client::{ArClient, ModelInfo, Provider, ProviderList, RawMessage};
pub use error::{ArError, Result};
pub use events::{classify, extract_error_message, extract_session_id, is_session_scoped, ArEvent, EventClass};
pub use handle::{ArRuntimeConfig, ArRuntimeHandle};
