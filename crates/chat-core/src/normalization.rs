use crate::{
    error::ChatError,
    transport::{AccountDataResponse, ChatsResponse, SendResponse, TokenResponse},
    types::{AccountData, ChatMap},
};

/// Substring the service uses when a send arrives too soon after the last one.
pub const RATE_LIMITED_MARKER: &str = "sending messages too fast";

const UNKNOWN_REASON: &str = "Unknown";

/// How a rejected send should be handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendRejection {
    /// Transient; the send may be retried after a backoff.
    RateLimited { message: String },
    /// Terminal rejection.
    Rejected { message: String },
}

/// Classify a not-ok send response by its service message.
pub fn classify_send_rejection(message: Option<&str>) -> SendRejection {
    match message {
        Some(message) if message.to_ascii_lowercase().contains(RATE_LIMITED_MARKER) => {
            SendRejection::RateLimited {
                message: message.to_owned(),
            }
        }
        Some(message) if !message.trim().is_empty() => SendRejection::Rejected {
            message: message.to_owned(),
        },
        _ => SendRejection::Rejected {
            message: "Unknown error".to_owned(),
        },
    }
}

/// `None` for an accepted send, otherwise the classified rejection.
pub fn normalize_send_response(response: SendResponse) -> Option<SendRejection> {
    if response.ok {
        None
    } else {
        Some(classify_send_rejection(response.message.as_deref()))
    }
}

/// Extract the chat token or fail with an authentication error.
pub fn normalize_token_response(response: TokenResponse) -> Result<String, ChatError> {
    match response {
        TokenResponse {
            ok: true,
            token: Some(token),
            ..
        } if !token.is_empty() => Ok(token),
        TokenResponse { message, .. } => Err(ChatError::authentication(format!(
            "failed to get token: {}",
            reason(message)
        ))),
    }
}

/// Extract account data or fail with a refresh error.
pub fn normalize_account_data_response(
    response: AccountDataResponse,
) -> Result<AccountData, ChatError> {
    match response {
        AccountDataResponse {
            ok: true,
            users: Some(users),
            ..
        } => Ok(users),
        AccountDataResponse { message, .. } => Err(ChatError::refresh(format!(
            "failed to get account data: {}",
            reason(message)
        ))),
    }
}

/// Extract polled chats or fail with a poll error.
pub fn normalize_chats_response(response: ChatsResponse) -> Result<ChatMap, ChatError> {
    match response {
        ChatsResponse {
            ok: true,
            chats: Some(chats),
            ..
        } => Ok(chats),
        ChatsResponse { message, .. } => Err(ChatError::poll(format!(
            "failed to poll chat messages: {}",
            reason(message)
        ))),
    }
}

fn reason(message: Option<String>) -> String {
    message
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_REASON.to_owned())
}
