//! Call contract of the chat service transport.
//!
//! The engine only talks to the service through [`ChatTransport`]. Responses
//! mirror the service's `{ ok, msg }` envelope: a transport `Err` means the
//! call itself failed, while `ok == false` is a service-side rejection that the
//! engine maps through [`crate::normalization`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::ChatError,
    types::{AccountData, ChatMap},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub ok: bool,
    pub token: Option<String>,
    pub message: Option<String>,
}

impl TokenResponse {
    pub fn granted(token: impl Into<String>) -> Self {
        Self {
            ok: true,
            token: Some(token.into()),
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            token: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountDataResponse {
    pub ok: bool,
    pub users: Option<AccountData>,
    pub message: Option<String>,
}

impl AccountDataResponse {
    pub fn with_users(users: AccountData) -> Self {
        Self {
            ok: true,
            users: Some(users),
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            users: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatsResponse {
    pub ok: bool,
    pub chats: Option<ChatMap>,
    pub message: Option<String>,
}

impl ChatsResponse {
    pub fn with_chats(chats: ChatMap) -> Self {
        Self {
            ok: true,
            chats: Some(chats),
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            chats: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendResponse {
    pub ok: bool,
    pub message: Option<String>,
}

impl SendResponse {
    pub fn accepted() -> Self {
        Self {
            ok: true,
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
        }
    }
}

/// Bounded message query. At least one of `before`/`after` is always set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatsRequest {
    token: String,
    usernames: Vec<String>,
    before: Option<f64>,
    after: Option<f64>,
}

impl ChatsRequest {
    /// Build a query; fails with `InvalidArgument` when neither bound is given.
    pub fn new(
        token: impl Into<String>,
        usernames: Vec<String>,
        before: Option<f64>,
        after: Option<f64>,
    ) -> Result<Self, ChatError> {
        if before.is_none() && after.is_none() {
            return Err(ChatError::invalid_argument(
                "either 'before' or 'after' must be specified when fetching chats",
            ));
        }

        Ok(Self {
            token: token.into(),
            usernames,
            before,
            after,
        })
    }

    /// Messages newer than `after` (epoch seconds).
    pub fn after(token: impl Into<String>, usernames: Vec<String>, after: f64) -> Self {
        Self {
            token: token.into(),
            usernames,
            before: None,
            after: Some(after),
        }
    }

    /// Messages older than `before` (epoch seconds).
    pub fn before(token: impl Into<String>, usernames: Vec<String>, before: f64) -> Self {
        Self {
            token: token.into(),
            usernames,
            before: Some(before),
            after: None,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn usernames(&self) -> &[String] {
        &self.usernames
    }

    pub fn before_bound(&self) -> Option<f64> {
        self.before
    }

    pub fn after_bound(&self) -> Option<f64> {
        self.after
    }
}

/// Network access to the chat service, one method per endpoint.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Exchange a pass for a chat token.
    async fn get_token(&self, password: &str) -> Result<TokenResponse, ChatError>;

    /// Fetch the users on the account and the channels each one has joined.
    async fn get_account_data(&self, token: &str) -> Result<AccountDataResponse, ChatError>;

    async fn get_chats(&self, request: &ChatsRequest) -> Result<ChatsResponse, ChatError>;

    async fn send_channel(
        &self,
        token: &str,
        username: &str,
        channel: &str,
        body: &str,
    ) -> Result<SendResponse, ChatError>;

    async fn send_tell(
        &self,
        token: &str,
        username: &str,
        recipient: &str,
        body: &str,
    ) -> Result<SendResponse, ChatError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatErrorCategory;

    #[test]
    fn rejects_unbounded_chats_request() {
        let err = ChatsRequest::new("tok", vec!["alice".into()], None, None)
            .expect_err("unbounded query must be rejected");
        assert_eq!(err.category, ChatErrorCategory::InvalidArgument);
    }

    #[test]
    fn accepts_either_bound() {
        let after = ChatsRequest::new("tok", Vec::new(), None, Some(10.0)).expect("after only");
        assert_eq!(after.after_bound(), Some(10.0));
        assert_eq!(after.before_bound(), None);

        let before = ChatsRequest::before("tok", vec!["bob".into()], 5.0);
        assert_eq!(before.before_bound(), Some(5.0));
        assert_eq!(before.usernames(), ["bob".to_owned()]);
        assert_eq!(before.token(), "tok");
    }
}
