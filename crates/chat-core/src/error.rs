use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::LifecycleState;

/// Broad error category used for caller handling and poll-loop recovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChatErrorCategory {
    /// Bad credential, or the token endpoint returned no usable token.
    Authentication,
    /// The operation needs a chat token and none is stored.
    NotAuthenticated,
    /// Caller contract violation (poll rate too low, unbounded chat query).
    InvalidArgument,
    /// The service rejected a poll cycle.
    Poll,
    /// The service rejected an account/channel metadata refresh.
    Refresh,
    /// A message send was rejected or ran out of retries.
    Send,
    /// The operation was aborted through its cancellation token.
    Cancelled,
    /// The transport failed before the service could answer.
    Transport,
    /// The engine was disposed and accepts no further work.
    Disposed,
    /// Lifecycle misuse or an internal invariant break.
    Internal,
}

/// Stable error payload returned by engine operations and carried in events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    /// High-level error category.
    pub category: ChatErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message, usually the service-provided `msg`.
    pub message: String,
}

impl ChatError {
    /// Construct a new chat error.
    pub fn new(
        category: ChatErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Authentication, "auth_failed", message)
    }

    pub fn not_authenticated() -> Self {
        Self::new(
            ChatErrorCategory::NotAuthenticated,
            "not_authenticated",
            "client is not authenticated",
        )
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::InvalidArgument, "invalid_argument", message)
    }

    pub fn poll(message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Poll, "poll_failed", message)
    }

    pub fn refresh(message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Refresh, "refresh_failed", message)
    }

    pub fn send(message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Send, "send_failed", message)
    }

    /// Send error raised after the retry budget was spent on rate-limit rejections.
    pub fn send_rate_limited(message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Send, "send_rate_limited", message)
    }

    pub fn cancelled() -> Self {
        Self::new(
            ChatErrorCategory::Cancelled,
            "cancelled",
            "operation was cancelled",
        )
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Transport, "transport_error", message)
    }

    pub fn disposed() -> Self {
        Self::new(
            ChatErrorCategory::Disposed,
            "engine_disposed",
            "chat engine has been disposed",
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ChatErrorCategory::Internal, "internal_error", message)
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: LifecycleState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ChatErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while engine is in state {current:?}"),
        )
    }

    /// Whether the poll loop should keep ticking after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            ChatErrorCategory::Poll | ChatErrorCategory::Refresh | ChatErrorCategory::Transport
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.category == ChatErrorCategory::Cancelled
    }
}
