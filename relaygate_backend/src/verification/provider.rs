use super::session::VerificationSession;
use super::ProviderKind;
use crate::error::Result;
use crate::notices::Notice;
use crate::transport::InlineKeyboard;
use async_trait::async_trait;

/// A challenge ready to show to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedChallenge {
    pub challenge_id: String,
    pub notice: Notice,
    pub keyboard: InlineKeyboard,
}

impl IssuedChallenge {
    /// Challenge prompt text without the surrounding notice.
    pub fn prompt(&self) -> Option<&str> {
        match &self.notice {
            Notice::QuizPrompt { prompt } => Some(prompt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Passed,
    Failed,
    /// Unknown, expired, already used, or not the session's current
    /// challenge.
    Stale,
}

/// Proof delivered by an external verification page.
#[derive(Debug, Clone)]
pub struct ExternalProof {
    pub token: String,
    pub remote_ip: Option<String>,
}

/// One verification mechanism. A session is bound to exactly one of these.
#[async_trait]
pub trait ChallengeProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Creates and persists a new challenge for `session`.
    async fn issue_challenge(&self, session: &VerificationSession) -> Result<IssuedChallenge>;

    /// In-chat answer (button press). Consumes the challenge.
    async fn validate_attempt(
        &self,
        session: &VerificationSession,
        challenge_id: &str,
        answer: &str,
    ) -> Result<AttemptOutcome>;

    /// Proof posted back from outside the chat. Consumes the challenge.
    async fn on_external_callback(
        &self,
        session: &VerificationSession,
        proof: &ExternalProof,
    ) -> Result<AttemptOutcome>;

    /// Drops any stored challenge state.
    async fn discard(&self, challenge_id: &str) -> Result<()>;
}
