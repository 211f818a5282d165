//! Error kinds shared by every layer of the engine.
//!
//! Kinds map onto the HTTP surface at the edge (see `flow-server`) and are
//! otherwise handled internally: a `NotFound` inside the orchestrator, for
//! instance, is logged and turned into a typed result, never a panic.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("validation failed: {0}")]
    ValidationRule(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("store unavailable: {0}")]
    StoreTransient(String),

    #[error("channel dispatch failed: {0}")]
    ChannelDispatch(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

pub type FlowResult<T> = Result<T, FlowError>;

impl FlowError {
    /// Stable string discriminator, used by API responses and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::ValidationRule(_) => "validation_rule",
            FlowError::NotFound(_) => "not_found",
            FlowError::Unauthorized(_) => "unauthorized",
            FlowError::StoreTransient(_) => "store_transient",
            FlowError::ChannelDispatch(_) => "channel_dispatch",
            FlowError::InternalInvariant(_) => "internal_invariant",
        }
    }
}
