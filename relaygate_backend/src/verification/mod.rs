//! Verification state machine.
//!
//! `Unverified → AwaitingChallenge(provider) → Verified`. Sessions expire
//! lazily: an expired session is cleaned up the next time it is read, and an
//! unverified user simply gets a fresh challenge on their next message.
//!
//! The grace mark written next to the verified mark is honored on its own,
//! without re-checking the original proof. That is a deliberate trade of
//! strictness for availability while the store propagates the real mark.

pub mod captcha;
pub mod provider;
pub mod quiz;
pub mod session;
pub mod token;

pub use captcha::{CaptchaVerifier, SiteVerifyClient, WebCaptchaProvider};
pub use provider::{AttemptOutcome, ChallengeProvider, ExternalProof, IssuedChallenge};
pub use quiz::QuizProvider;
pub use session::{ChallengeState, VerificationSession};
pub use token::{FinalizeSigner, TokenError};

use crate::config::VerificationConfig;
use crate::error::{RelayError, Result};
use crate::notices::Notice;
use crate::queue::PendingQueue;
use crate::settings::Settings;
use crate::store::{keys, KvOp, Storage, MIN_TTL};
use crate::transport::{InlineButton, InlineKeyboard, OutgoingText, Transport};
use crate::utils::{now_unix, spawn_background};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Quiz,
    WebCaptcha,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Quiz => "quiz",
            ProviderKind::WebCaptcha => "web_captcha",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "quiz" => Ok(ProviderKind::Quiz),
            "web_captcha" | "captcha" | "turnstile" => Ok(ProviderKind::WebCaptcha),
            other => anyhow::bail!("unknown verification provider {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "provider", rename_all = "snake_case")]
pub enum VerificationState {
    Unverified,
    AwaitingChallenge(ProviderKind),
    Verified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    Issued { challenge_id: String },
    /// A lapsed challenge or session was replaced.
    Renewed { challenge_id: String },
    /// A live challenge exists; the user got a reminder.
    Reminded,
    /// A live challenge exists and a notice went out recently.
    Deduplicated,
    RateLimited,
    AlreadyVerified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    NewlyVerified,
    AlreadyVerified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerOutcome {
    Completed(CompletionOutcome),
    Reissued { challenge_id: String },
    /// Not the current challenge; nothing changed.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalOutcome {
    /// Proof accepted; a finalize button was sent to the user.
    FinalizeIssued,
    /// Proof rejected; a fresh challenge replaced the old one.
    Reissued,
}

#[derive(Debug, Clone, Copy)]
enum IssueReason {
    Fresh,
    Renewed,
    Incorrect,
}

#[derive(Clone)]
pub struct VerificationService {
    storage: Storage,
    transport: Arc<dyn Transport>,
    settings: Settings,
    queue: PendingQueue,
    quiz: Arc<dyn ChallengeProvider>,
    web: Arc<dyn ChallengeProvider>,
    signer: FinalizeSigner,
    config: VerificationConfig,
}

impl VerificationService {
    pub fn new(
        storage: Storage,
        transport: Arc<dyn Transport>,
        settings: Settings,
        queue: PendingQueue,
        config: VerificationConfig,
        captcha: Option<Arc<dyn CaptchaVerifier>>,
    ) -> Self {
        let quiz = Arc::new(QuizProvider::new(storage.clone(), config.challenge_ttl));
        let web = Arc::new(WebCaptchaProvider::new(
            storage.clone(),
            captcha,
            config.public_url.clone(),
            config.challenge_ttl,
        ));
        Self {
            signer: FinalizeSigner::new(config.finalize_secret.clone()),
            storage,
            transport,
            settings,
            queue,
            quiz,
            web,
            config,
        }
    }

    fn provider(&self, kind: ProviderKind) -> &Arc<dyn ChallengeProvider> {
        match kind {
            ProviderKind::Quiz => &self.quiz,
            ProviderKind::WebCaptcha => &self.web,
        }
    }

    /// Verified mark, or a grace mark standing in for it. Seeing only the
    /// grace mark re-writes the verified mark in the background.
    pub async fn is_verified(&self, user_id: i64) -> Result<bool> {
        if self.storage.exists(&keys::verified(user_id)).await? {
            return Ok(true);
        }
        if self.storage.exists(&keys::grace(user_id)).await? {
            tracing::debug!(user_id, "grace mark without verified mark; re-writing");
            let storage = self.storage.clone();
            let ttl = self.config.verified_ttl;
            spawn_background("rewrite-verified-mark", async move {
                storage.put(&keys::verified(user_id), "1", ttl).await
            });
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn state(&self, user_id: i64) -> Result<VerificationState> {
        if self.is_verified(user_id).await? {
            return Ok(VerificationState::Verified);
        }
        Ok(match self.active_session(user_id).await? {
            Some(session) => VerificationState::AwaitingChallenge(session.provider),
            None => VerificationState::Unverified,
        })
    }

    /// Live session, with expired ones cleaned up on the way.
    pub async fn active_session(&self, user_id: i64) -> Result<Option<VerificationSession>> {
        let Some(session) = self.load_session(user_id).await? else {
            return Ok(None);
        };
        if session.is_expired(now_unix(), self.session_ttl_secs()) {
            self.expire(&session).await?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Starts a session or nudges the user along the one they already have.
    /// `enable_storage` marks sessions whose trigger was a real message that
    /// is being buffered.
    pub async fn begin_or_continue(&self, user_id: i64, enable_storage: bool) -> Result<BeginOutcome> {
        if self.is_verified(user_id).await? {
            return Ok(BeginOutcome::AlreadyVerified);
        }
        let now = now_unix();

        let renewal = match self.load_session(user_id).await? {
            Some(mut session) if !session.is_expired(now, self.session_ttl_secs()) => {
                if enable_storage && !session.enable_storage {
                    session.enable_storage = true;
                    self.save_session(&session).await?;
                }
                let challenge_live = session
                    .challenge
                    .as_ref()
                    .is_some_and(|challenge| !challenge.is_expired(now, self.challenge_ttl_secs()));
                if challenge_live {
                    if self.cooldown_active(user_id, now).await? {
                        return Ok(BeginOutcome::Deduplicated);
                    }
                    self.start_cooldown(user_id, now).await?;
                    self.notify(user_id, Notice::ChallengeActive).await;
                    return Ok(BeginOutcome::Reminded);
                }
                let challenge_id = self.issue(&mut session, IssueReason::Renewed).await?;
                return Ok(BeginOutcome::Renewed { challenge_id });
            }
            Some(expired) => {
                self.expire(&expired).await?;
                true
            }
            None => false,
        };

        if !renewal && !self.admit_new_session(user_id, now).await? {
            if !self.cooldown_active(user_id, now).await? {
                self.start_cooldown(user_id, now).await?;
                self.notify(user_id, Notice::ChallengeRateLimited).await;
            }
            tracing::info!(user_id, "verification session rate limited");
            return Ok(BeginOutcome::RateLimited);
        }

        let provider = self.settings.verify_provider().await?;
        let mut session = VerificationSession::new(user_id, provider, now);
        session.enable_storage = enable_storage;
        session.pending_snapshot = self.queue.snapshot(user_id).await?;
        let reason = if renewal {
            IssueReason::Renewed
        } else {
            IssueReason::Fresh
        };
        let challenge_id = self.issue(&mut session, reason).await?;
        tracing::info!(user_id, %provider, session_id = %session.session_id, "verification session started");
        Ok(if renewal {
            BeginOutcome::Renewed { challenge_id }
        } else {
            BeginOutcome::Issued { challenge_id }
        })
    }

    /// Explicit request for a new challenge within the current session.
    pub async fn refresh(&self, user_id: i64) -> Result<BeginOutcome> {
        if self.is_verified(user_id).await? {
            return Ok(BeginOutcome::AlreadyVerified);
        }
        let Some(mut session) = self.active_session(user_id).await? else {
            return self.begin_or_continue(user_id, false).await;
        };
        if self.cooldown_active(user_id, now_unix()).await? {
            return Ok(BeginOutcome::Deduplicated);
        }
        let challenge_id = self.issue(&mut session, IssueReason::Fresh).await?;
        Ok(BeginOutcome::Renewed { challenge_id })
    }

    /// Handles an in-chat answer. A wrong answer burns the challenge and
    /// sends a replacement in the same message as the rejection.
    pub async fn answer(&self, user_id: i64, challenge_id: &str, answer: &str) -> Result<AnswerOutcome> {
        let Some(mut session) = self.active_session(user_id).await? else {
            if self.is_verified(user_id).await? {
                return Ok(AnswerOutcome::Completed(self.complete(user_id).await?));
            }
            return Ok(AnswerOutcome::Stale);
        };
        if session.challenge_id() != Some(challenge_id) {
            return Ok(AnswerOutcome::Stale);
        }
        let outcome = self
            .provider(session.provider)
            .validate_attempt(&session, challenge_id, answer)
            .await?;
        match outcome {
            AttemptOutcome::Passed => Ok(AnswerOutcome::Completed(self.complete(user_id).await?)),
            AttemptOutcome::Failed => {
                tracing::info!(user_id, "incorrect challenge answer");
                let challenge_id = self.issue(&mut session, IssueReason::Incorrect).await?;
                Ok(AnswerOutcome::Reissued { challenge_id })
            }
            AttemptOutcome::Stale => Ok(AnswerOutcome::Stale),
        }
    }

    /// Proof posted by the external verification page. Success sends a
    /// signed finalize button; the verified mark is only granted once the
    /// user presses it.
    pub async fn external_callback(
        &self,
        session_id: &str,
        user_id: i64,
        proof: ExternalProof,
    ) -> Result<ExternalOutcome> {
        let Some(mut session) = self.active_session(user_id).await? else {
            return Err(RelayError::Validation("no active verification session".into()));
        };
        if session.session_id != session_id {
            return Err(RelayError::Validation("session mismatch".into()));
        }
        let outcome = self
            .provider(session.provider)
            .on_external_callback(&session, &proof)
            .await?;
        if outcome != AttemptOutcome::Passed {
            tracing::info!(user_id, ?outcome, "external proof rejected");
            self.issue(&mut session, IssueReason::Renewed).await?;
            return Ok(ExternalOutcome::Reissued);
        }

        let expires_at = now_unix() + self.config.finalize_ttl.as_secs() as i64;
        let token = self.signer.sign(user_id, &session.session_id, expires_at);
        let keyboard =
            InlineKeyboard::single_row(vec![InlineButton::callback("Finish verification", format!("f:{token}"))]);
        let sent = self
            .transport
            .send_text(
                user_id,
                OutgoingText::plain(Notice::FinalizePrompt.text()).with_keyboard(keyboard),
            )
            .await?;
        self.strip_keyboard(user_id, session.prompt_message_id());
        if let Some(challenge) = session.challenge.as_mut() {
            challenge.prompt_message_id = Some(sent.message_id);
        }
        self.save_session(&session).await?;
        Ok(ExternalOutcome::FinalizeIssued)
    }

    /// Checks a finalize token against the user's current session.
    pub async fn finalize(&self, user_id: i64, token: &str) -> Result<CompletionOutcome> {
        let Some(session) = self.active_session(user_id).await? else {
            if self.is_verified(user_id).await? {
                return self.complete(user_id).await;
            }
            return Err(RelayError::Validation("no active verification session".into()));
        };
        self.signer
            .verify(token, user_id, &session.session_id, now_unix())
            .map_err(|err| RelayError::Validation(err.to_string()))?;
        self.complete(user_id).await
    }

    /// Grants verification. Safe to repeat: later calls only re-send the
    /// confirmation and clear leftover challenge UI.
    pub async fn complete(&self, user_id: i64) -> Result<CompletionOutcome> {
        let already = self.is_verified(user_id).await?;
        let session = self.load_session(user_id).await?;

        let mut ops = vec![
            KvOp::put(keys::verified(user_id), "1", self.config.verified_ttl),
            KvOp::put(keys::grace(user_id), "1", Some(self.config.grace_ttl)),
            KvOp::delete(keys::session(user_id)),
            KvOp::delete(keys::session_starts(user_id)),
            KvOp::delete(keys::notice_cooldown(user_id)),
            KvOp::delete(keys::pending_notice(user_id)),
        ];
        if let Some(challenge_id) = session.as_ref().and_then(|s| s.challenge_id()) {
            ops.push(KvOp::delete(keys::challenge(challenge_id)));
        }
        self.storage.batch(ops).await?;
        self.strip_keyboard(user_id, session.as_ref().and_then(|s| s.prompt_message_id()));

        let outcome = if already {
            CompletionOutcome::AlreadyVerified
        } else {
            tracing::info!(user_id, "user verified");
            CompletionOutcome::NewlyVerified
        };
        let notice = match outcome {
            CompletionOutcome::NewlyVerified => Notice::Verified,
            CompletionOutcome::AlreadyVerified => Notice::AlreadyVerified,
        };
        self.notify(user_id, notice).await;
        Ok(outcome)
    }

    /// Forgets everything verification-related, as if the user had never
    /// written before. The pending queue is kept.
    pub async fn reset(&self, user_id: i64) -> Result<()> {
        let session = self.load_session(user_id).await?;
        let mut ops = vec![
            KvOp::delete(keys::verified(user_id)),
            KvOp::delete(keys::grace(user_id)),
            KvOp::delete(keys::session(user_id)),
            KvOp::delete(keys::session_starts(user_id)),
            KvOp::delete(keys::notice_cooldown(user_id)),
            KvOp::delete(keys::pending_notice(user_id)),
            KvOp::delete(keys::pending_failures(user_id)),
        ];
        if let Some(challenge_id) = session.as_ref().and_then(|s| s.challenge_id()) {
            ops.push(KvOp::delete(keys::challenge(challenge_id)));
        }
        self.storage.batch(ops).await?;
        self.strip_keyboard(user_id, session.as_ref().and_then(|s| s.prompt_message_id()));
        tracing::info!(user_id, "verification state reset");
        Ok(())
    }

    pub async fn load_session(&self, user_id: i64) -> Result<Option<VerificationSession>> {
        Ok(self.storage.get_json(&keys::session(user_id)).await?)
    }

    async fn save_session(&self, session: &VerificationSession) -> Result<()> {
        let remaining = (session.created_at + self.session_ttl_secs() - now_unix()).max(0) as u64;
        self.storage
            .put_json(
                &keys::session(session.user_id),
                session,
                Some(std::time::Duration::from_secs(remaining).max(MIN_TTL)),
            )
            .await?;
        Ok(())
    }

    async fn expire(&self, session: &VerificationSession) -> Result<()> {
        tracing::info!(user_id = session.user_id, session_id = %session.session_id, "verification session expired");
        let mut ops = vec![KvOp::delete(keys::session(session.user_id))];
        if let Some(challenge_id) = session.challenge_id() {
            ops.push(KvOp::delete(keys::challenge(challenge_id)));
        }
        self.storage.batch(ops).await?;
        self.strip_keyboard(session.user_id, session.prompt_message_id());
        Ok(())
    }

    /// Replaces the session's challenge and sends it. Returns the new id.
    async fn issue(&self, session: &mut VerificationSession, reason: IssueReason) -> Result<String> {
        let provider = self.provider(session.provider).clone();
        if let Some(previous) = session.challenge.take() {
            if let Err(err) = provider.discard(&previous.challenge_id).await {
                tracing::debug!(user_id = session.user_id, error = ?err, "could not discard old challenge");
            }
            self.strip_keyboard(session.user_id, previous.prompt_message_id);
        }

        let issued = provider.issue_challenge(session).await?;
        let text = match (reason, issued.prompt()) {
            (IssueReason::Incorrect, Some(prompt)) => Notice::IncorrectAnswer {
                prompt: prompt.to_string(),
            }
            .text(),
            (IssueReason::Fresh, _) => issued.notice.text(),
            _ => format!("{}\n\n{}", Notice::ChallengeRenewed.text(), issued.notice.text()),
        };
        let sent = self
            .transport
            .send_text(
                session.user_id,
                OutgoingText::plain(text).with_keyboard(issued.keyboard.clone()),
            )
            .await?;

        let now = now_unix();
        session.challenge = Some(ChallengeState {
            challenge_id: issued.challenge_id.clone(),
            issued_at: now,
            prompt_message_id: Some(sent.message_id),
        });
        self.save_session(session).await?;
        self.start_cooldown(session.user_id, now).await?;
        Ok(issued.challenge_id)
    }

    /// Sliding window over recent session starts.
    async fn admit_new_session(&self, user_id: i64, now: i64) -> Result<bool> {
        let key = keys::session_starts(user_id);
        let window = self.config.new_session_window.as_secs() as i64;
        let mut starts: Vec<i64> = self.storage.get_json(&key).await?.unwrap_or_default();
        starts.retain(|started| now - *started < window);
        if starts.len() >= self.config.max_new_sessions {
            return Ok(false);
        }
        starts.push(now);
        self.storage
            .put_json(&key, &starts, Some(self.config.new_session_window))
            .await?;
        Ok(true)
    }

    /// The cooldown is shorter than the store's TTL floor, so the deadline
    /// is kept in the value and the key's own TTL only garbage-collects it.
    async fn cooldown_active(&self, user_id: i64, now: i64) -> Result<bool> {
        let raw = self.storage.get(&keys::notice_cooldown(user_id)).await?;
        Ok(raw
            .and_then(|raw| raw.parse::<i64>().ok())
            .is_some_and(|deadline| now < deadline))
    }

    async fn start_cooldown(&self, user_id: i64, now: i64) -> Result<()> {
        let deadline = now + self.config.notice_cooldown.as_secs() as i64;
        self.storage
            .put(
                &keys::notice_cooldown(user_id),
                &deadline.to_string(),
                Some(self.config.notice_cooldown.max(MIN_TTL)),
            )
            .await?;
        Ok(())
    }

    async fn notify(&self, user_id: i64, notice: Notice) {
        if let Err(err) = self
            .transport
            .send_text(user_id, OutgoingText::plain(notice.text()))
            .await
        {
            tracing::warn!(user_id, error = %err, "failed to send verification notice");
        }
    }

    fn strip_keyboard(&self, user_id: i64, message_id: Option<i64>) {
        let Some(message_id) = message_id else {
            return;
        };
        let transport = self.transport.clone();
        spawn_background("strip-challenge-keyboard", async move {
            transport.edit_keyboard(user_id, message_id, None).await
        });
    }

    fn session_ttl_secs(&self) -> i64 {
        self.config.session_ttl.as_secs() as i64
    }

    fn challenge_ttl_secs(&self) -> i64 {
        self.config.challenge_ttl.as_secs() as i64
    }
}
