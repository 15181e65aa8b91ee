//! In-memory chat service implementing [`ChatTransport`].
//!
//! Accounts, channel membership and message delivery live in process memory.
//! Sends are stamped with the injected clock and delivered to every account
//! user in the target channel (or to the tell recipient), so a poll after a
//! send sees the message. Rejections, poll failures and transport errors can
//! be queued up front, and every call is counted per endpoint.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use chat_core::{
    AccountData, AccountDataResponse, ChatError, ChatMap, ChatTransport, ChatsRequest,
    ChatsResponse, Message, RateCategory, SendKind, SendRequest, SendResponse, TokenResponse,
    WallClock,
};

const INVALID_TOKEN: &str = "invalid chat_token";

#[derive(Default)]
struct LoopbackState {
    passes: HashMap<String, String>,
    tokens: HashSet<String>,
    accounts: AccountData,
    inbox: HashMap<String, Vec<Message>>,
    sent: Vec<SendRequest>,
    next_message_id: u64,
    send_rejections: VecDeque<String>,
    poll_failures: VecDeque<String>,
    poll_errors: VecDeque<ChatError>,
    account_data_failures: VecDeque<String>,
    calls: HashMap<RateCategory, usize>,
}

impl LoopbackState {
    fn count(&mut self, category: RateCategory) {
        *self.calls.entry(category).or_default() += 1;
    }

    fn channel_members(&self, channel: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .accounts
            .iter()
            .filter(|(_, channels)| channels.contains_key(channel))
            .map(|(user, _)| user.clone())
            .collect();
        members.sort_unstable();
        members
    }

    fn next_id(&mut self) -> String {
        self.next_message_id += 1;
        format!("loopback-{}", self.next_message_id)
    }
}

/// Shared handle to one in-memory chat service.
#[derive(Clone)]
pub struct InMemoryTransport {
    state: Arc<Mutex<LoopbackState>>,
    clock: Arc<dyn WallClock>,
}

impl InMemoryTransport {
    pub fn new(clock: impl WallClock + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackState::default())),
            clock: Arc::new(clock),
        }
    }

    /// Accept `pass` at the token endpoint and answer it with `token`.
    pub fn with_pass(self, pass: impl Into<String>, token: impl Into<String>) -> Self {
        if let Ok(mut state) = self.lock() {
            state.passes.insert(pass.into(), token.into());
        }
        self
    }

    /// Accept `token` without going through the token endpoint.
    pub fn with_token(self, token: impl Into<String>) -> Self {
        if let Ok(mut state) = self.lock() {
            state.tokens.insert(token.into());
        }
        self
    }

    /// Register an account user with no channels.
    pub fn add_user(&self, user: &str) -> Result<(), ChatError> {
        let mut state = self.lock()?;
        state.accounts.entry(user.to_owned()).or_default();
        Ok(())
    }

    /// Put an account user into a channel and refresh that channel's member lists.
    pub fn join_channel(&self, user: &str, channel: &str) -> Result<(), ChatError> {
        let mut state = self.lock()?;
        state
            .accounts
            .entry(user.to_owned())
            .or_default()
            .insert(channel.to_owned(), Vec::new());

        let members = state.channel_members(channel);
        for channels in state.accounts.values_mut() {
            if let Some(entry) = channels.get_mut(channel) {
                entry.clone_from(&members);
            }
        }
        Ok(())
    }

    /// Place a message in a user's inbox as-is.
    pub fn deliver(&self, user: &str, message: Message) -> Result<(), ChatError> {
        let mut state = self.lock()?;
        state
            .inbox
            .entry(user.to_owned())
            .or_default()
            .push(message);
        Ok(())
    }

    /// Reject the next `count` sends with `message`.
    pub fn reject_next_sends(&self, count: usize, message: &str) -> Result<(), ChatError> {
        let mut state = self.lock()?;
        state
            .send_rejections
            .extend(std::iter::repeat_n(message.to_owned(), count));
        Ok(())
    }

    /// Answer the next `count` chat fetches with `ok: false`.
    pub fn fail_next_polls(&self, count: usize, message: &str) -> Result<(), ChatError> {
        let mut state = self.lock()?;
        state
            .poll_failures
            .extend(std::iter::repeat_n(message.to_owned(), count));
        Ok(())
    }

    /// Fail the next `count` chat fetches with `error` before any response.
    pub fn error_next_polls(&self, count: usize, error: ChatError) -> Result<(), ChatError> {
        let mut state = self.lock()?;
        state.poll_errors.extend(std::iter::repeat_n(error, count));
        Ok(())
    }

    /// Answer the next `count` account-data fetches with `ok: false`.
    pub fn fail_next_account_data(&self, count: usize, message: &str) -> Result<(), ChatError> {
        let mut state = self.lock()?;
        state
            .account_data_failures
            .extend(std::iter::repeat_n(message.to_owned(), count));
        Ok(())
    }

    /// Number of calls made to the endpoint behind `category`.
    pub fn calls(&self, category: RateCategory) -> usize {
        self.lock()
            .map(|state| state.calls.get(&category).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Sends the service accepted, in order.
    pub fn sent(&self) -> Vec<SendRequest> {
        self.lock()
            .map(|state| state.sent.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LoopbackState>, ChatError> {
        self.state
            .lock()
            .map_err(|_| ChatError::internal("loopback state lock poisoned"))
    }

    fn accept_send(&self, request: SendRequest) -> Result<SendResponse, ChatError> {
        let now = self.clock.now_secs();
        let mut state = self.lock()?;

        if let Some(message) = state.send_rejections.pop_front() {
            return Ok(SendResponse::rejected(message));
        }

        let Some(sender_channels) = state.accounts.get(&request.username) else {
            return Ok(SendResponse::rejected(format!(
                "user {} is not on this account",
                request.username
            )));
        };

        let (channel, recipients) = match request.kind {
            SendKind::Channel => {
                if !sender_channels.contains_key(&request.target) {
                    return Ok(SendResponse::rejected(format!(
                        "{} is not in channel {}",
                        request.username, request.target
                    )));
                }
                (
                    Some(request.target.clone()),
                    state.channel_members(&request.target),
                )
            }
            SendKind::Tell => {
                let mut recipients = vec![request.username.clone()];
                if request.target != request.username
                    && state.accounts.contains_key(&request.target)
                {
                    recipients.push(request.target.clone());
                }
                (None, recipients)
            }
        };

        let message = Message {
            id: state.next_id(),
            timestamp: now,
            sender: request.username.clone(),
            text: request.body.clone(),
            channel,
            is_join: false,
            is_leave: false,
        };
        for user in recipients {
            state.inbox.entry(user).or_default().push(message.clone());
        }
        state.sent.push(request);

        Ok(SendResponse::accepted())
    }
}

#[async_trait]
impl ChatTransport for InMemoryTransport {
    async fn get_token(&self, password: &str) -> Result<TokenResponse, ChatError> {
        let mut state = self.lock()?;
        state.count(RateCategory::Token);

        let Some(token) = state.passes.get(password).cloned() else {
            return Ok(TokenResponse::rejected("invalid pass"));
        };
        state.tokens.insert(token.clone());
        Ok(TokenResponse::granted(token))
    }

    async fn get_account_data(&self, token: &str) -> Result<AccountDataResponse, ChatError> {
        let mut state = self.lock()?;
        state.count(RateCategory::AccountData);

        if let Some(message) = state.account_data_failures.pop_front() {
            return Ok(AccountDataResponse::rejected(message));
        }
        if !state.tokens.contains(token) {
            return Ok(AccountDataResponse::rejected(INVALID_TOKEN));
        }
        Ok(AccountDataResponse::with_users(state.accounts.clone()))
    }

    async fn get_chats(&self, request: &ChatsRequest) -> Result<ChatsResponse, ChatError> {
        let mut state = self.lock()?;
        state.count(RateCategory::Chats);

        if let Some(error) = state.poll_errors.pop_front() {
            return Err(error);
        }
        if let Some(message) = state.poll_failures.pop_front() {
            return Ok(ChatsResponse::rejected(message));
        }
        if !state.tokens.contains(request.token()) {
            return Ok(ChatsResponse::rejected(INVALID_TOKEN));
        }

        let mut chats = ChatMap::new();
        for user in request.usernames() {
            let mut messages: Vec<Message> = state
                .inbox
                .get(user)
                .into_iter()
                .flatten()
                .filter(|message| {
                    request
                        .after_bound()
                        .is_none_or(|after| message.timestamp > after)
                        && request
                            .before_bound()
                            .is_none_or(|before| message.timestamp < before)
                })
                .cloned()
                .collect();
            messages.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
            chats.insert(user.clone(), messages);
        }

        Ok(ChatsResponse::with_chats(chats))
    }

    async fn send_channel(
        &self,
        token: &str,
        username: &str,
        channel: &str,
        body: &str,
    ) -> Result<SendResponse, ChatError> {
        {
            let mut state = self.lock()?;
            state.count(RateCategory::CreateChat);
            if !state.tokens.contains(token) {
                return Ok(SendResponse::rejected(INVALID_TOKEN));
            }
        }
        self.accept_send(SendRequest::channel(username, channel, body))
    }

    async fn send_tell(
        &self,
        token: &str,
        username: &str,
        recipient: &str,
        body: &str,
    ) -> Result<SendResponse, ChatError> {
        {
            let mut state = self.lock()?;
            state.count(RateCategory::CreateChat);
            if !state.tokens.contains(token) {
                return Ok(SendResponse::rejected(INVALID_TOKEN));
            }
        }
        self.accept_send(SendRequest::tell(username, recipient, body))
    }
}
