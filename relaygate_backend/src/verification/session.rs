use super::ProviderKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeState {
    pub challenge_id: String,
    pub issued_at: i64,
    /// Message carrying the challenge UI, so it can be stripped later.
    #[serde(default)]
    pub prompt_message_id: Option<i64>,
}

impl ChallengeState {
    pub fn is_expired(&self, now: i64, ttl_secs: i64) -> bool {
        now >= self.issued_at + ttl_secs
    }
}

/// One in-progress verification attempt. The provider never changes for
/// the lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSession {
    pub user_id: i64,
    pub session_id: String,
    pub provider: ProviderKind,
    pub created_at: i64,
    /// Queue contents when the session started.
    #[serde(default)]
    pub pending_snapshot: Vec<i64>,
    /// Whether messages sent during this session are buffered for later
    /// delivery.
    #[serde(default = "default_enable_storage")]
    pub enable_storage: bool,
    #[serde(default)]
    pub challenge: Option<ChallengeState>,
}

fn default_enable_storage() -> bool {
    true
}

impl VerificationSession {
    pub fn new(user_id: i64, provider: ProviderKind, now: i64) -> Self {
        Self {
            user_id,
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            provider,
            created_at: now,
            pending_snapshot: Vec::new(),
            enable_storage: true,
            challenge: None,
        }
    }

    pub fn is_expired(&self, now: i64, ttl_secs: i64) -> bool {
        now >= self.created_at + ttl_secs
    }

    pub fn challenge_id(&self) -> Option<&str> {
        self.challenge
            .as_ref()
            .map(|challenge| challenge.challenge_id.as_str())
    }

    pub fn prompt_message_id(&self) -> Option<i64> {
        self.challenge
            .as_ref()
            .and_then(|challenge| challenge.prompt_message_id)
    }
}
