//! Hosted web CAPTCHA provider. The page itself lives elsewhere; this side
//! hands out the link and checks the proof it posts back.

use super::provider::{AttemptOutcome, ChallengeProvider, ExternalProof, IssuedChallenge};
use super::session::VerificationSession;
use super::ProviderKind;
use crate::error::{RelayError, Result};
use crate::notices::Notice;
use crate::store::{keys, Storage};
use crate::transport::{InlineButton, InlineKeyboard};
use crate::utils::now_unix;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Checks a proof token with the CAPTCHA vendor.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, token: &str, remote_ip: Option<&str>) -> anyhow::Result<bool>;
}

/// Siteverify-style endpoint (Turnstile, hCaptcha, reCAPTCHA all share the
/// form: `secret`, `response`, optional `remoteip` → `{success}`).
#[derive(Clone)]
pub struct SiteVerifyClient {
    client: reqwest::Client,
    verify_url: String,
    secret: String,
}

#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

impl SiteVerifyClient {
    pub fn new(verify_url: impl Into<String>, secret: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build captcha http client")?;
        Ok(Self {
            client,
            verify_url: verify_url.into(),
            secret: secret.into(),
        })
    }
}

#[async_trait]
impl CaptchaVerifier for SiteVerifyClient {
    async fn verify(&self, token: &str, remote_ip: Option<&str>) -> anyhow::Result<bool> {
        let mut form = vec![("secret", self.secret.as_str()), ("response", token)];
        if let Some(ip) = remote_ip {
            form.push(("remoteip", ip));
        }
        let response = self
            .client
            .post(&self.verify_url)
            .form(&form)
            .send()
            .await
            .context("captcha verification request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("captcha verification returned {}", response.status());
        }
        let body: SiteVerifyResponse = response
            .json()
            .await
            .context("failed to decode captcha verification response")?;
        if !body.success {
            tracing::debug!(codes = ?body.error_codes, "captcha proof rejected");
        }
        Ok(body.success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebChallenge {
    pub user_id: i64,
    pub session_id: String,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct WebCaptchaProvider {
    storage: Storage,
    verifier: Option<Arc<dyn CaptchaVerifier>>,
    public_url: Option<String>,
    challenge_ttl: Duration,
}

impl WebCaptchaProvider {
    pub fn new(
        storage: Storage,
        verifier: Option<Arc<dyn CaptchaVerifier>>,
        public_url: Option<String>,
        challenge_ttl: Duration,
    ) -> Self {
        Self {
            storage,
            verifier,
            public_url,
            challenge_ttl,
        }
    }

    fn page_url(&self, session: &VerificationSession) -> Result<String> {
        let base = self.public_url.as_deref().ok_or_else(|| {
            RelayError::Configuration("verification page url is not configured".into())
        })?;
        Ok(format!(
            "{base}/verify?session={}&user={}",
            session.session_id, session.user_id
        ))
    }
}

#[async_trait]
impl ChallengeProvider for WebCaptchaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::WebCaptcha
    }

    async fn issue_challenge(&self, session: &VerificationSession) -> Result<IssuedChallenge> {
        if self.verifier.is_none() {
            return Err(RelayError::Configuration(
                "captcha secret is not configured".into(),
            ));
        }
        let url = self.page_url(session)?;
        let challenge_id = uuid::Uuid::new_v4().simple().to_string();
        let record = WebChallenge {
            user_id: session.user_id,
            session_id: session.session_id.clone(),
            created_at: now_unix(),
        };
        self.storage
            .put_json(&keys::challenge(&challenge_id), &record, Some(self.challenge_ttl))
            .await?;
        Ok(IssuedChallenge {
            challenge_id,
            notice: Notice::WebChallengePrompt,
            keyboard: InlineKeyboard::column(vec![
                InlineButton::link("Open verification page", url),
                InlineButton::callback("New link", "r"),
            ]),
        })
    }

    async fn validate_attempt(
        &self,
        _session: &VerificationSession,
        _challenge_id: &str,
        _answer: &str,
    ) -> Result<AttemptOutcome> {
        Ok(AttemptOutcome::Stale)
    }

    async fn on_external_callback(
        &self,
        session: &VerificationSession,
        proof: &ExternalProof,
    ) -> Result<AttemptOutcome> {
        let Some(challenge_id) = session.challenge_id() else {
            return Ok(AttemptOutcome::Stale);
        };
        let key = keys::challenge(challenge_id);
        let Some(record) = self.storage.get_json::<WebChallenge>(&key).await? else {
            return Ok(AttemptOutcome::Stale);
        };
        if record.user_id != session.user_id || record.session_id != session.session_id {
            return Ok(AttemptOutcome::Stale);
        }
        if now_unix() >= record.created_at + self.challenge_ttl.as_secs() as i64 {
            self.storage.delete(&key).await?;
            return Ok(AttemptOutcome::Stale);
        }
        let verifier = self.verifier.as_ref().ok_or_else(|| {
            RelayError::Configuration("captcha secret is not configured".into())
        })?;
        self.storage.delete(&key).await?;
        // an unanswered or broken siteverify counts as a refused proof
        let passed = match verifier
            .verify(&proof.token, proof.remote_ip.as_deref())
            .await
        {
            Ok(passed) => passed,
            Err(err) => {
                tracing::warn!(user_id = session.user_id, error = %err, "captcha verification failed");
                false
            }
        };
        Ok(if passed {
            AttemptOutcome::Passed
        } else {
            AttemptOutcome::Failed
        })
    }

    async fn discard(&self, challenge_id: &str) -> Result<()> {
        self.storage.delete(&keys::challenge(challenge_id)).await?;
        Ok(())
    }
}
