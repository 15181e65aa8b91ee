//! Polling session engine for the mudchat client.
//!
//! [`ChatEngine`] owns one account session: it exchanges a pass for a chat
//! token, keeps the account/channel mapping current, runs the background poll
//! timer that turns service responses into de-duplicated message batches, and
//! sends channel messages and tells with rate-limit backoff. Every outbound
//! call goes through a per-category rate limiter. Results reach the host as
//! [`ChatEvent`]s on a broadcast stream.

use std::{
    collections::HashSet,
    future::Future,
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use chat_core::{
    AccountData, ChatChannels, ChatError, ChatEvent, ChatMap, ChatTransport, ClientStateMachine,
    EngineConfig, EventStream, LifecycleState, PollBatch, RateCategory, RateLimiter, SendRequest,
    SystemClock, WallClock, normalize_token_response, types::validate_poll_rate,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    poll::{RunningPollTask, spawn_poll_loop},
    session::Session,
};

mod poll;
mod send;
mod session;

/// State shared between the engine handle and its poll task.
struct EngineShared {
    transport: Arc<dyn ChatTransport>,
    clock: Arc<dyn WallClock>,
    limiter: RateLimiter<RateCategory>,
    session: Session,
    channels: ChatChannels,
    config: EngineConfig,
    lifecycle: StdMutex<ClientStateMachine>,
    cycle_gate: Mutex<()>,
    poll_rate_ms: AtomicU64,
    shutdown: CancellationToken,
}

impl EngineShared {
    fn state(&self) -> LifecycleState {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    fn ensure_live(&self) -> Result<(), ChatError> {
        if self.state() == LifecycleState::Disposed {
            return Err(ChatError::disposed());
        }
        Ok(())
    }

    /// Apply a lifecycle transition and publish the events it produced.
    fn transition(
        &self,
        apply: impl FnOnce(&mut ClientStateMachine) -> Result<Vec<ChatEvent>, ChatError>,
    ) -> Result<(), ChatError> {
        let events = {
            let mut machine = self
                .lifecycle
                .lock()
                .map_err(|_| ChatError::internal("lifecycle lock poisoned"))?;
            apply(&mut machine)?
        };
        self.channels.emit_all(events);
        Ok(())
    }

    fn poll_rate_ms(&self) -> u64 {
        self.poll_rate_ms.load(Ordering::Relaxed)
    }
}

/// Race a transport call against `cancel`.
async fn cancellable<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, ChatError>>,
) -> Result<T, ChatError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ChatError::cancelled()),
        result = call => result,
    }
}

/// Host-facing handle to one chat session.
///
/// Operations without a `_with` suffix are cancelled by [`ChatEngine::dispose`];
/// the `_with` variants observe the caller's token instead.
pub struct ChatEngine {
    shared: Arc<EngineShared>,
    poll_task: Mutex<Option<RunningPollTask>>,
}

impl ChatEngine {
    /// Create an engine using the system clock.
    pub fn new(transport: Arc<dyn ChatTransport>, config: EngineConfig) -> Result<Self, ChatError> {
        Self::with_clock(transport, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        transport: Arc<dyn ChatTransport>,
        config: EngineConfig,
        clock: Arc<dyn WallClock>,
    ) -> Result<Self, ChatError> {
        config.validate()?;

        let limiter = RateLimiter::new(config.rate_intervals_ms.clone())
            .with_default_interval_ms(config.default_rate_interval_ms);
        let shared = EngineShared {
            transport,
            clock,
            limiter,
            session: Session::default(),
            channels: ChatChannels::new(config.event_buffer),
            poll_rate_ms: AtomicU64::new(config.poll_rate_ms),
            lifecycle: StdMutex::new(ClientStateMachine::default()),
            cycle_gate: Mutex::new(()),
            shutdown: CancellationToken::new(),
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            poll_task: Mutex::new(None),
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.session.token().is_some()
    }

    /// Stored chat token, if connected.
    pub fn token(&self) -> Option<String> {
        self.shared.session.token()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Subscribe to engine events emitted from now on.
    pub fn subscribe(&self) -> EventStream {
        self.shared.channels.subscribe()
    }

    /// Exchange a pass for a chat token, then connect with it.
    pub async fn connect_password(&self, pass: &str) -> Result<String, ChatError> {
        let cancel = self.shared.shutdown.child_token();
        self.connect_password_with(pass, &cancel).await
    }

    pub async fn connect_password_with(
        &self,
        pass: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ChatError> {
        self.shared.ensure_live()?;

        let slot = self
            .shared
            .limiter
            .acquire(RateCategory::Token, cancel)
            .await?;
        let response = cancellable(cancel, self.shared.transport.get_token(pass)).await?;
        slot.release();

        let token = normalize_token_response(response).inspect_err(|err| {
            warn!(message = %err.message, "token exchange failed");
        })?;
        self.connect_token_with(&token, cancel).await?;
        Ok(token)
    }

    /// Store `token`, load account data, start polling and emit [`ChatEvent::Ready`].
    ///
    /// If the account data cannot be loaded the token is dropped again and
    /// the engine returns to `Unauthenticated`.
    pub async fn connect_token(&self, token: &str) -> Result<(), ChatError> {
        let cancel = self.shared.shutdown.child_token();
        self.connect_token_with(token, &cancel).await
    }

    pub async fn connect_token_with(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        self.shared.transition(ClientStateMachine::begin_connect)?;
        self.stop_poll_task().await;
        info!("connecting");

        self.shared.session.set_token(Some(token.to_owned()));
        self.shared
            .session
            .init_watermark(self.shared.clock.now_secs());

        if let Err(err) = self.shared.refresh_account_data(cancel).await {
            warn!(code = %err.code, message = %err.message, "connect failed");
            self.shared.session.clear();
            self.shared.transition(|machine| machine.on_auth_result(false))?;
            return Err(err);
        }
        self.shared.transition(|machine| machine.on_auth_result(true))?;

        self.start_polling().await?;
        info!(
            users = self.shared.session.user_keys().len(),
            watermark = self.shared.session.watermark(),
            "connected"
        );
        self.shared.channels.emit(ChatEvent::Ready);
        Ok(())
    }

    pub fn is_polling(&self) -> bool {
        self.state() == LifecycleState::Polling
    }

    /// Start or stop the poll timer. Requires a connected session.
    pub async fn set_polling(&self, enabled: bool) -> Result<(), ChatError> {
        if enabled {
            self.start_polling().await
        } else {
            self.shared.transition(ClientStateMachine::stop_polling)?;
            self.stop_poll_task().await;
            Ok(())
        }
    }

    pub fn poll_rate_ms(&self) -> u64 {
        self.shared.poll_rate_ms()
    }

    /// Change the poll interval; takes effect from the next tick.
    pub fn set_poll_rate_ms(&self, poll_rate_ms: u64) -> Result<(), ChatError> {
        validate_poll_rate(poll_rate_ms)?;
        self.shared
            .poll_rate_ms
            .store(poll_rate_ms, Ordering::Relaxed);
        debug!(poll_rate_ms, "poll rate changed");
        Ok(())
    }

    /// Lower bound of the next poll query, in epoch seconds.
    pub fn watermark(&self) -> f64 {
        self.shared.session.watermark()
    }

    pub fn set_watermark(&self, watermark: f64) {
        self.shared.session.set_watermark(watermark);
    }

    /// IDs seen in the most recent poll cycle.
    pub fn known_message_ids(&self) -> HashSet<String> {
        self.shared.session.known_ids()
    }

    /// Snapshot of the cached account/channel mapping.
    pub fn account_data(&self) -> AccountData {
        self.shared.session.account_data()
    }

    pub async fn refresh_account_data(&self) -> Result<AccountData, ChatError> {
        let cancel = self.shared.shutdown.child_token();
        self.refresh_account_data_with(&cancel).await
    }

    pub async fn refresh_account_data_with(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AccountData, ChatError> {
        self.shared.ensure_live()?;
        self.shared.refresh_account_data(cancel).await
    }

    /// Run one poll cycle now. Returns `None` if a cycle is already running.
    pub async fn poll_once(&self) -> Result<Option<PollBatch>, ChatError> {
        let cancel = self.shared.shutdown.child_token();
        self.poll_once_with(&cancel).await
    }

    pub async fn poll_once_with(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<PollBatch>, ChatError> {
        self.shared.ensure_live()?;
        self.shared.run_cycle(cancel).await
    }

    /// Fetch messages for every account user between the given bounds.
    ///
    /// At least one bound is required. The result bypasses dedup and leaves
    /// the watermark alone.
    pub async fn fetch_chats(
        &self,
        before: Option<f64>,
        after: Option<f64>,
    ) -> Result<ChatMap, ChatError> {
        let cancel = self.shared.shutdown.child_token();
        self.fetch_chats_with(before, after, &cancel).await
    }

    pub async fn fetch_chats_with(
        &self,
        before: Option<f64>,
        after: Option<f64>,
        cancel: &CancellationToken,
    ) -> Result<ChatMap, ChatError> {
        self.shared.ensure_live()?;
        self.shared.fetch_chats(before, after, cancel).await
    }

    /// Messages older than `before`.
    pub async fn fetch_history(&self, before: f64) -> Result<ChatMap, ChatError> {
        self.fetch_chats(Some(before), None).await
    }

    pub async fn send_channel(
        &self,
        username: &str,
        channel: &str,
        body: &str,
    ) -> Result<(), ChatError> {
        let cancel = self.shared.shutdown.child_token();
        self.send(SendRequest::channel(username, channel, body), &cancel)
            .await
    }

    pub async fn send_tell(
        &self,
        username: &str,
        recipient: &str,
        body: &str,
    ) -> Result<(), ChatError> {
        let cancel = self.shared.shutdown.child_token();
        self.send(SendRequest::tell(username, recipient, body), &cancel)
            .await
    }

    /// Send one message, retrying while the service reports it as too fast.
    pub async fn send(
        &self,
        request: SendRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        self.shared.ensure_live()?;
        self.shared.send(&request, cancel).await
    }

    /// Forget the token, account data and known IDs. The watermark is kept.
    pub async fn reset(&self) -> Result<(), ChatError> {
        self.shared.transition(ClientStateMachine::reset)?;
        self.stop_poll_task().await;

        let _cycle = self.shared.cycle_gate.lock().await;
        self.shared.session.clear();
        info!("session reset");
        Ok(())
    }

    /// Stop polling, cancel in-flight work and refuse every later operation.
    pub async fn dispose(&self) {
        if self.state() == LifecycleState::Disposed {
            return;
        }

        self.shared.shutdown.cancel();
        self.stop_poll_task().await;
        let events = self
            .shared
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dispose();
        self.shared.channels.emit_all(events);
        self.shared.session.clear();
        info!("engine disposed");
    }

    async fn start_polling(&self) -> Result<(), ChatError> {
        let mut task = self.poll_task.lock().await;
        self.shared.transition(ClientStateMachine::start_polling)?;
        if task.is_none() {
            *task = Some(spawn_poll_loop(Arc::clone(&self.shared)));
            info!(poll_rate_ms = self.poll_rate_ms(), "polling started");
        }
        Ok(())
    }

    async fn stop_poll_task(&self) {
        let running = self.poll_task.lock().await.take();
        if let Some(running) = running {
            running.stop().await;
            info!("polling stopped");
        }
    }
}

impl Drop for ChatEngine {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use chat_core::{ChatEvent, EngineConfig, EventStream, ManualClock, Message};
    use chat_loopback::InMemoryTransport;

    use crate::ChatEngine;

    pub(crate) struct Fixture {
        pub(crate) engine: ChatEngine,
        pub(crate) service: InMemoryTransport,
        pub(crate) clock: ManualClock,
    }

    /// Engine over a loopback service where `alice` and `bob` share channel
    /// `0000` and `tok` is a valid token.
    pub(crate) fn fixture(start_secs: f64) -> Fixture {
        let clock = ManualClock::new(start_secs);
        let service = InMemoryTransport::new(clock.clone())
            .with_pass("pass", "tok")
            .with_token("tok");
        service.join_channel("alice", "0000").expect("join alice");
        service.join_channel("bob", "0000").expect("join bob");

        let engine = ChatEngine::with_clock(
            Arc::new(service.clone()),
            EngineConfig::default(),
            Arc::new(clock.clone()),
        )
        .expect("default config is valid");

        Fixture {
            engine,
            service,
            clock,
        }
    }

    pub(crate) fn message(id: &str, timestamp: f64) -> Message {
        Message {
            id: id.to_owned(),
            timestamp,
            sender: "bob".to_owned(),
            text: format!("message {id}"),
            channel: Some("0000".to_owned()),
            is_join: false,
            is_leave: false,
        }
    }

    pub(crate) async fn next_matching(
        events: &mut EventStream,
        matches: impl Fn(&ChatEvent) -> bool,
    ) -> ChatEvent {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    }
}
