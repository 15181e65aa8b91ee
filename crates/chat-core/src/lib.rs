//! Core contract of the mudchat client shared by the engine, transports and hosts.
//!
//! This crate defines the message/event types, the error taxonomy, the
//! transport call contract, and the pure coordination pieces the engine is
//! built from: the per-category rate limiter, poll-cycle dedup and watermark
//! arithmetic, send backoff, and the lifecycle state machine.

/// Broadcast event channel primitives.
pub mod channel;
/// Wall-clock sources in epoch seconds.
pub mod clock;
/// Poll-cycle dedup and watermark advancement.
pub mod dedup;
/// Stable error types.
pub mod error;
/// Mapping of service responses to results and retry decisions.
pub mod normalization;
/// Per-category serializing rate limiter.
pub mod rate_limit;
/// Backoff policy for rate-limited sends.
pub mod retry;
/// Engine lifecycle state machine.
pub mod state_machine;
/// Transport call contract.
pub mod transport;
/// Host-facing types (messages, events, configuration).
pub mod types;

pub use channel::{ChatChannels, EventStream};
pub use clock::{ManualClock, SystemClock, WallClock};
pub use dedup::{CycleOutcome, advance_watermark, fold_cycle};
pub use error::{ChatError, ChatErrorCategory};
pub use normalization::{
    RATE_LIMITED_MARKER, SendRejection, classify_send_rejection,
    normalize_account_data_response, normalize_chats_response, normalize_send_response,
    normalize_token_response,
};
pub use rate_limit::{RateLimiter, RateSlot, sleep_cancellable};
pub use retry::SendRetryPolicy;
pub use state_machine::ClientStateMachine;
pub use transport::{
    AccountDataResponse, ChatTransport, ChatsRequest, ChatsResponse, SendResponse, TokenResponse,
};
pub use types::{
    AccountData, ChannelSet, ChatEvent, ChatMap, EngineConfig, LifecycleState, MIN_POLL_RATE_MS,
    Message, PollBatch, RateCategory, SendKind, SendRequest,
};
