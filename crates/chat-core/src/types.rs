use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};

use crate::retry::SendRetryPolicy;

/// Lowest poll rate the service tolerates, in milliseconds.
pub const MIN_POLL_RATE_MS: u64 = 2_000;
/// Poll rate used until the host picks another one.
pub const DEFAULT_POLL_RATE_MS: u64 = 3_000;
/// Spacing applied to rate categories without an explicit interval.
pub const DEFAULT_RATE_INTERVAL_MS: u64 = 1_000;
/// How far the watermark may lag wall-clock time before it is pulled forward.
pub const DEFAULT_DRIFT_LIMIT_SECS: f64 = 300.0;
/// Account/channel metadata is refreshed from the poll loop at this age.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60 * 60;

/// Channel name → members of that channel, as reported for one user.
pub type ChannelSet = HashMap<String, Vec<String>>;
/// User name → channels joined by that user.
pub type AccountData = HashMap<String, ChannelSet>;
/// User name → messages for that user.
pub type ChatMap = HashMap<String, Vec<Message>>;
/// User name → messages not seen in the previous poll cycle.
pub type PollBatch = ChatMap;

/// Engine lifecycle state reported to the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LifecycleState {
    /// No token is stored; polling and sending are refused.
    Unauthenticated,
    /// A connect (token fetch and first metadata refresh) is running.
    Authenticating,
    /// Authenticated with the poll timer stopped.
    Idle,
    /// Authenticated with the poll timer running.
    Polling,
    /// Engine was disposed; every operation fails.
    Disposed,
}

/// One outbound endpoint group sharing a minimum call spacing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RateCategory {
    /// Exchanging a pass for a chat token.
    Token,
    /// Account and channel metadata.
    AccountData,
    /// Fetching chat messages (polling and history).
    Chats,
    /// Creating chat messages (channel sends and tells).
    CreateChat,
}

impl RateCategory {
    pub const ALL: [RateCategory; 4] = [
        RateCategory::Token,
        RateCategory::AccountData,
        RateCategory::Chats,
        RateCategory::CreateChat,
    ];

    /// Stable upper-case key used in configuration names.
    pub fn config_key(self) -> &'static str {
        match self {
            RateCategory::Token => "TOKEN",
            RateCategory::AccountData => "ACCOUNT_DATA",
            RateCategory::Chats => "CHATS",
            RateCategory::CreateChat => "CREATE_CHAT",
        }
    }
}

/// A chat message as returned by the service. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Service-assigned unique message ID.
    pub id: String,
    /// Send time in fractional epoch seconds.
    pub timestamp: f64,
    /// Sending user.
    pub sender: String,
    /// Message body.
    pub text: String,
    /// Channel the message was posted in; `None` for a direct message (tell).
    pub channel: Option<String>,
    /// Whether this is a channel join notice.
    pub is_join: bool,
    /// Whether this is a channel leave notice.
    pub is_leave: bool,
}

impl Message {
    /// Whether this message was sent directly to a user instead of a channel.
    pub fn is_direct(&self) -> bool {
        self.channel.is_none()
    }

    /// Send time, floored to whole milliseconds.
    pub fn sent_at(&self) -> SystemTime {
        let millis = (self.timestamp * 1_000.0).floor().max(0.0) as u64;
        SystemTime::UNIX_EPOCH + Duration::from_millis(millis)
    }
}

/// Destination kind of an outbound message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SendKind {
    /// Post into a channel the sending user has joined.
    Channel,
    /// Send directly to another user.
    Tell,
}

/// One outbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendRequest {
    /// Channel or tell.
    pub kind: SendKind,
    /// Account user sending the message.
    pub username: String,
    /// Channel name or receiving user, depending on `kind`.
    pub target: String,
    /// Message body.
    pub body: String,
}

impl SendRequest {
    pub fn channel(
        username: impl Into<String>,
        channel: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind: SendKind::Channel,
            username: username.into(),
            target: channel.into(),
            body: body.into(),
        }
    }

    pub fn tell(
        username: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind: SendKind::Tell,
            username: username.into(),
            target: recipient.into(),
            body: body.into(),
        }
    }
}

/// Notification emitted to engine subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ChatEvent {
    /// Engine lifecycle changed.
    StateChanged { state: LifecycleState },
    /// Connect finished: token stored, metadata loaded, polling started.
    Ready,
    /// One poll cycle completed. Users whose messages were all seen before map
    /// to an empty list.
    MessagesReceived { batch: PollBatch },
    /// A timer-driven poll cycle failed; the timer keeps running.
    PollFailed { error: crate::error::ChatError },
    /// Account/channel metadata was merged into the cached mapping.
    AccountDataRefreshed { users: Vec<String> },
}

/// Tuning values for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Interval between poll ticks (at least [`MIN_POLL_RATE_MS`]).
    pub poll_rate_ms: u64,
    /// Spacing for rate categories missing from `rate_intervals_ms`.
    pub default_rate_interval_ms: u64,
    /// Per-category minimum spacing between calls.
    pub rate_intervals_ms: HashMap<RateCategory, u64>,
    /// Capacity of the broadcast event channel.
    pub event_buffer: usize,
    /// Backoff applied to sends rejected for being too frequent.
    pub send_retry: SendRetryPolicy,
    /// Maximum watermark lag behind wall-clock time, in seconds.
    pub drift_limit_secs: f64,
    /// Age after which the poll loop refreshes metadata, in seconds.
    pub refresh_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_rate_ms: DEFAULT_POLL_RATE_MS,
            default_rate_interval_ms: DEFAULT_RATE_INTERVAL_MS,
            rate_intervals_ms: HashMap::new(),
            event_buffer: 256,
            send_retry: SendRetryPolicy::default(),
            drift_limit_secs: DEFAULT_DRIFT_LIMIT_SECS,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
        }
    }
}

impl EngineConfig {
    pub fn with_poll_rate_ms(mut self, poll_rate_ms: u64) -> Self {
        self.poll_rate_ms = poll_rate_ms;
        self
    }

    pub fn with_rate_interval(mut self, category: RateCategory, interval_ms: u64) -> Self {
        self.rate_intervals_ms.insert(category, interval_ms);
        self
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), crate::error::ChatError> {
        validate_poll_rate(self.poll_rate_ms)?;
        if self.drift_limit_secs.is_nan() || self.drift_limit_secs <= 0.0 {
            return Err(crate::error::ChatError::invalid_argument(
                "drift limit must be greater than 0 seconds",
            ));
        }
        Ok(())
    }
}

/// Check a poll rate against [`MIN_POLL_RATE_MS`].
pub fn validate_poll_rate(poll_rate_ms: u64) -> Result<(), crate::error::ChatError> {
    if poll_rate_ms < MIN_POLL_RATE_MS {
        return Err(crate::error::ChatError::invalid_argument(format!(
            "cannot set poll rate below {MIN_POLL_RATE_MS}ms (got {poll_rate_ms}ms)"
        )));
    }
    Ok(())
}
