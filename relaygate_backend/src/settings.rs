//! Global toggles shared by every running instance.

use crate::error::{RelayError, Result, StoreResult};
use crate::spam::SpamRules;
use crate::store::{keys, ReadOptions, Storage};
use crate::verification::ProviderKind;
use serde::Serialize;
use std::time::Duration;

pub const BOT_ENABLED: &str = "bot_enabled";
pub const VERIFY_PROVIDER: &str = "verify_provider";
pub const SPAM_ENABLED: &str = "spam_enabled";
pub const SPAM_RULES: &str = "spam_rules";

const READ_HINT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct SettingsSnapshot {
    pub bot_enabled: bool,
    pub verify_provider: ProviderKind,
    pub spam_enabled: bool,
    pub spam_rules: SpamRules,
}

#[derive(Clone)]
pub struct Settings {
    storage: Storage,
    default_provider: ProviderKind,
}

impl Settings {
    pub fn new(storage: Storage, default_provider: ProviderKind) -> Self {
        Self {
            storage,
            default_provider,
        }
    }

    pub async fn bot_enabled(&self) -> StoreResult<bool> {
        self.read_flag(BOT_ENABLED, true).await
    }

    pub async fn spam_enabled(&self) -> StoreResult<bool> {
        self.read_flag(SPAM_ENABLED, true).await
    }

    /// Provider for sessions started from now on. Sessions already in
    /// flight keep the provider they were created with.
    pub async fn verify_provider(&self) -> StoreResult<ProviderKind> {
        let raw = self
            .storage
            .get_with(&keys::setting(VERIFY_PROVIDER), ReadOptions::cached(READ_HINT))
            .await?;
        Ok(raw
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(self.default_provider))
    }

    /// Current rules, or the defaults when the stored document is missing or
    /// unreadable.
    pub async fn spam_rules(&self) -> StoreResult<SpamRules> {
        let rules = self
            .storage
            .get_json_with::<SpamRules>(&keys::setting(SPAM_RULES), ReadOptions::cached(READ_HINT))
            .await?;
        Ok(rules.unwrap_or_default())
    }

    pub async fn set_bot_enabled(&self, enabled: bool) -> StoreResult<()> {
        self.write(BOT_ENABLED, &enabled.to_string()).await
    }

    pub async fn set_spam_enabled(&self, enabled: bool) -> StoreResult<()> {
        self.write(SPAM_ENABLED, &enabled.to_string()).await
    }

    pub async fn set_verify_provider(&self, provider: ProviderKind) -> StoreResult<()> {
        self.write(VERIFY_PROVIDER, provider.as_str()).await
    }

    /// Stores `rules` as the next version of the document.
    pub async fn set_spam_rules(&self, mut rules: SpamRules) -> StoreResult<SpamRules> {
        let current = self.spam_rules().await?;
        rules.version = current.version.max(rules.version) + 1;
        self.storage
            .put_json(&keys::setting(SPAM_RULES), &rules, None)
            .await?;
        Ok(rules)
    }

    /// Sets a toggle from its textual form.
    pub async fn set_raw(&self, name: &str, value: &str) -> Result<()> {
        match name {
            BOT_ENABLED => self.set_bot_enabled(parse_bool(value)?).await?,
            SPAM_ENABLED => self.set_spam_enabled(parse_bool(value)?).await?,
            VERIFY_PROVIDER => {
                let provider = value
                    .parse::<ProviderKind>()
                    .map_err(|err| RelayError::Validation(err.to_string()))?;
                self.set_verify_provider(provider).await?
            }
            SPAM_RULES => {
                let rules: SpamRules = serde_json::from_str(value)
                    .map_err(|err| RelayError::Validation(format!("invalid spam rules: {err}")))?;
                self.set_spam_rules(rules).await?;
            }
            other => {
                return Err(RelayError::Validation(format!("unknown setting {other:?}")));
            }
        }
        Ok(())
    }

    pub async fn snapshot(&self) -> StoreResult<SettingsSnapshot> {
        Ok(SettingsSnapshot {
            bot_enabled: self.bot_enabled().await?,
            verify_provider: self.verify_provider().await?,
            spam_enabled: self.spam_enabled().await?,
            spam_rules: self.spam_rules().await?,
        })
    }

    async fn read_flag(&self, name: &str, default: bool) -> StoreResult<bool> {
        let raw = self
            .storage
            .get_with(&keys::setting(name), ReadOptions::cached(READ_HINT))
            .await?;
        Ok(raw.and_then(|raw| parse_bool(&raw).ok()).unwrap_or(default))
    }

    async fn write(&self, name: &str, value: &str) -> StoreResult<()> {
        tracing::info!(setting = name, value, "updating setting");
        self.storage.put(&keys::setting(name), value, None).await
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => Err(RelayError::Validation(format!("expected a boolean, got {other:?}"))),
    }
}
