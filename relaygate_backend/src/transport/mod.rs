//! The message-transport RPC boundary.

pub mod http;
pub mod retry;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

pub use http::HttpTransport;
pub use retry::{RetryDecision, RetryPolicy};
pub use types::{
    ForumTopic, InlineButton, InlineKeyboard, MemberStatus, OutgoingText, SentMessage,
    ThreadProbe,
};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("transport rejected call ({code}): {description}")]
    Api { code: i64, description: String },
    #[error("malformed transport response: {0}")]
    Malformed(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl TransportError {
    pub fn api(code: i64, description: impl Into<String>) -> Self {
        TransportError::Api {
            code,
            description: description.into(),
        }
    }

    fn description(&self) -> Option<String> {
        match self {
            TransportError::Api { description, .. } => Some(description.to_ascii_lowercase()),
            _ => None,
        }
    }

    /// The destination thread no longer exists (deleted or never created).
    pub fn is_thread_missing(&self) -> bool {
        self.description().is_some_and(|desc| {
            desc.contains("thread not found")
                || desc.contains("topic_deleted")
                || desc.contains("topic_id_invalid")
        })
    }

    pub fn is_formatting_rejected(&self) -> bool {
        self.description()
            .is_some_and(|desc| desc.contains("can't parse entities"))
    }

    /// Native forwarding refused (protected content, privacy settings).
    pub fn is_forward_rejected(&self) -> bool {
        self.description().is_some_and(|desc| {
            desc.contains("can't be forwarded") || desc.contains("forward")
        })
    }

    /// The user blocked the bot or the private chat is gone.
    pub fn is_user_unreachable(&self) -> bool {
        match self {
            TransportError::Api { code, description } => {
                let desc = description.to_ascii_lowercase();
                *code == 403
                    || desc.contains("bot was blocked")
                    || desc.contains("user is deactivated")
                    || desc.contains("chat not found")
            }
            _ => false,
        }
    }

    pub fn is_not_modified(&self) -> bool {
        self.description()
            .is_some_and(|desc| desc.contains("message is not modified"))
    }

    pub fn is_content_rejected(&self) -> bool {
        matches!(self, TransportError::Api { code: 400, .. })
            && !self.is_thread_missing()
            && !self.is_user_unreachable()
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Operations the relay needs from the transport endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&self, chat_id: i64, message: OutgoingText) -> TransportResult<SentMessage>;

    async fn forward(
        &self,
        to_chat: i64,
        thread_id: Option<i64>,
        from_chat: i64,
        message_id: i64,
    ) -> TransportResult<i64>;

    async fn copy(
        &self,
        to_chat: i64,
        thread_id: Option<i64>,
        from_chat: i64,
        message_id: i64,
    ) -> TransportResult<i64>;

    /// Copies several messages as one call so albums stay grouped.
    async fn copy_group(
        &self,
        to_chat: i64,
        thread_id: Option<i64>,
        from_chat: i64,
        message_ids: &[i64],
    ) -> TransportResult<Vec<i64>>;

    async fn create_thread(&self, chat_id: i64, name: &str) -> TransportResult<ForumTopic>;

    async fn delete_thread(&self, chat_id: i64, thread_id: i64) -> TransportResult<()>;

    /// Read-only existence check. Transports without one return
    /// [`TransportError::Unsupported`].
    async fn probe_thread(&self, chat_id: i64, thread_id: i64) -> TransportResult<ThreadProbe>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> TransportResult<()>;

    async fn member_status(&self, chat_id: i64, user_id: i64) -> TransportResult<MemberStatus>;

    async fn edit_keyboard(
        &self,
        chat_id: i64,
        message_id: i64,
        keyboard: Option<InlineKeyboard>,
    ) -> TransportResult<()>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> TransportResult<()>;
}
