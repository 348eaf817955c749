use crate::verification::ProviderKind;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub paths: RelayPaths,
    pub api: ApiConfig,
    pub transport: TransportConfig,
    pub verification: VerificationConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub classifier: ClassifierConfig,
    pub tuning: RelayTuning,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        let paths = match env::var("RELAYGATE_DATA_DIR") {
            Ok(raw) if !raw.trim().is_empty() => RelayPaths::from_base_dir(raw.trim())?,
            _ => RelayPaths::discover()?,
        };
        let transport = TransportConfig::from_env()?;
        let verification = VerificationConfig::from_env(&transport.bot_token);
        Ok(Self {
            paths,
            api: ApiConfig::from_env(),
            transport,
            verification,
            queue: QueueConfig::from_env(),
            store: StoreConfig::from_env(),
            classifier: ClassifierConfig::from_env(),
            tuning: RelayTuning::from_env(),
        })
    }

    /// Configuration used by tests and embedders that wire their own
    /// transport: every tunable at its default.
    pub fn new(paths: RelayPaths, transport: TransportConfig) -> Self {
        let verification = VerificationConfig::with_secret(derive_secret(&transport.bot_token));
        Self {
            paths,
            api: ApiConfig::default(),
            transport,
            verification,
            queue: QueueConfig::default(),
            store: StoreConfig::default(),
            classifier: ClassifierConfig::default(),
            tuning: RelayTuning::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
    /// Shared secret the transport echoes in `X-Telegram-Bot-Api-Secret-Token`.
    pub webhook_secret: Option<String>,
    /// Bearer token for `/admin/*`. Admin routes are refused when unset.
    pub admin_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            webhook_secret: None,
            admin_token: None,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let port = env::var("RELAYGATE_API_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(8080);
        Self {
            port,
            webhook_secret: non_empty_var("RELAYGATE_WEBHOOK_SECRET"),
            admin_token: non_empty_var("RELAYGATE_ADMIN_TOKEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub bot_token: String,
    pub api_base: String,
    /// Destination group holding one thread per user. Missing means every
    /// relay attempt answers with the maintenance notice.
    pub group_chat_id: Option<i64>,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl TransportConfig {
    pub fn new(bot_token: impl Into<String>, group_chat_id: Option<i64>) -> Self {
        Self {
            bot_token: bot_token.into(),
            api_base: "https://api.telegram.org".to_string(),
            group_chat_id,
            request_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let bot_token = non_empty_var("RELAYGATE_BOT_TOKEN")
            .ok_or_else(|| anyhow!("RELAYGATE_BOT_TOKEN must be set"))?;
        let group_chat_id = match non_empty_var("RELAYGATE_GROUP_CHAT_ID") {
            Some(raw) => Some(
                raw.parse::<i64>()
                    .with_context(|| format!("invalid RELAYGATE_GROUP_CHAT_ID value: {raw}"))?,
            ),
            None => None,
        };
        let mut config = Self::new(bot_token, group_chat_id);
        if let Some(base) = non_empty_var("RELAYGATE_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(secs) = parsed_var::<u64>("RELAYGATE_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(attempts) = parsed_var::<u32>("RELAYGATE_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts.max(1);
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a provider-suggested wait we are willing to honor.
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(3),
            max_rate_limit_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerificationConfig {
    pub default_provider: ProviderKind,
    /// Lifetime of a verification session.
    pub session_ttl: Duration,
    /// Lifetime of a single challenge.
    pub challenge_ttl: Duration,
    /// `None` keeps the verified mark forever.
    pub verified_ttl: Option<Duration>,
    pub grace_ttl: Duration,
    pub max_new_sessions: usize,
    pub new_session_window: Duration,
    pub notice_cooldown: Duration,
    pub finalize_secret: Vec<u8>,
    pub finalize_ttl: Duration,
    /// Base URL of the hosted verification page for the web provider.
    pub public_url: Option<String>,
    pub captcha_secret: Option<String>,
    pub captcha_verify_url: String,
}

impl VerificationConfig {
    pub fn with_secret(finalize_secret: Vec<u8>) -> Self {
        Self {
            default_provider: ProviderKind::Quiz,
            session_ttl: Duration::from_secs(30 * 60),
            challenge_ttl: Duration::from_secs(5 * 60),
            verified_ttl: None,
            grace_ttl: Duration::from_secs(5 * 60),
            max_new_sessions: 3,
            new_session_window: Duration::from_secs(5 * 60),
            notice_cooldown: Duration::from_secs(30),
            finalize_secret,
            finalize_ttl: Duration::from_secs(10 * 60),
            public_url: None,
            captcha_secret: None,
            captcha_verify_url: "https://challenges.cloudflare.com/turnstile/v0/siteverify"
                .to_string(),
        }
    }

    pub fn from_env(bot_token: &str) -> Self {
        let secret = non_empty_var("RELAYGATE_FINALIZE_SECRET")
            .map(String::into_bytes)
            .unwrap_or_else(|| derive_secret(bot_token));
        let mut config = Self::with_secret(secret);
        if let Some(raw) = non_empty_var("RELAYGATE_DEFAULT_PROVIDER") {
            match raw.parse::<ProviderKind>() {
                Ok(kind) => config.default_provider = kind,
                Err(err) => tracing::warn!(value = %raw, error = %err, "ignoring RELAYGATE_DEFAULT_PROVIDER"),
            }
        }
        if let Some(secs) = parsed_var::<u64>("RELAYGATE_SESSION_TTL_SECS") {
            config.session_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed_var::<u64>("RELAYGATE_CHALLENGE_TTL_SECS") {
            config.challenge_ttl = Duration::from_secs(secs);
        }
        // 0 keeps verification permanent
        if let Some(secs) = parsed_var::<u64>("RELAYGATE_VERIFIED_TTL_SECS") {
            config.verified_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(limit) = parsed_var::<usize>("RELAYGATE_MAX_NEW_SESSIONS") {
            config.max_new_sessions = limit.max(1);
        }
        config.public_url = non_empty_var("RELAYGATE_PUBLIC_URL")
            .map(|raw| raw.trim_end_matches('/').to_string());
        config.captcha_secret = non_empty_var("RELAYGATE_CAPTCHA_SECRET");
        if let Some(url) = non_empty_var("RELAYGATE_CAPTCHA_VERIFY_URL") {
            config.captcha_verify_url = url;
        }
        config
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 10 }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        let capacity = parsed_var::<usize>("RELAYGATE_PENDING_CAPACITY")
            .filter(|cap| *cap > 0)
            .unwrap_or(10);
        Self { capacity }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Writes allowed per UTC day before the store reports quota exhaustion.
    pub daily_write_quota: Option<u64>,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            daily_write_quota: parsed_var::<u64>("RELAYGATE_STORE_DAILY_QUOTA"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassifierConfig {
    /// OpenAI-compatible endpoint, e.g. `http://localhost:11434/v1`.
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
}

impl ClassifierConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: non_empty_var("RELAYGATE_LLM_API_URL")
                .map(|raw| raw.trim_end_matches('/').to_string()),
            api_key: non_empty_var("RELAYGATE_LLM_API_KEY"),
            model: non_empty_var("RELAYGATE_LLM_MODEL").unwrap_or_else(|| "llama3.2".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayTuning {
    pub media_group_debounce: Duration,
    pub health_cache_entries: usize,
    pub health_cache_ttl: Duration,
    /// TTL of the store-backed "thread is healthy" marker.
    pub health_positive_ttl: Duration,
    pub reverse_scan_limit: usize,
    pub reverse_scan_concurrency: usize,
}

impl Default for RelayTuning {
    fn default() -> Self {
        Self {
            media_group_debounce: Duration::from_millis(1200),
            health_cache_entries: 512,
            health_cache_ttl: Duration::from_secs(10 * 60),
            health_positive_ttl: Duration::from_secs(6 * 60 * 60),
            reverse_scan_limit: 1000,
            reverse_scan_concurrency: 8,
        }
    }
}

impl RelayTuning {
    pub fn from_env() -> Self {
        let mut tuning = Self::default();
        if let Some(ms) = parsed_var::<u64>("RELAYGATE_MEDIA_GROUP_DEBOUNCE_MS") {
            tuning.media_group_debounce = Duration::from_millis(ms);
        }
        if let Some(entries) = parsed_var::<usize>("RELAYGATE_HEALTH_CACHE_ENTRIES") {
            tuning.health_cache_entries = entries.max(1);
        }
        tuning
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayPaths {
    pub base: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub logs_dir: PathBuf,
}

impl RelayPaths {
    pub fn discover() -> Result<Self> {
        let exe_path = std::env::current_exe()
            .map_err(|err| anyhow!("failed to resolve current executable: {err}"))?;
        let base = exe_path
            .parent()
            .ok_or_else(|| anyhow!("executable path missing parent"))?
            .to_path_buf();
        Self::from_base_dir(base)
    }

    pub fn from_base_dir<P: AsRef<Path>>(base: P) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        let data_dir = base.join("data");
        let db_path = data_dir.join("relaygate.db");
        let logs_dir = base.join("logs");
        Ok(Self {
            base,
            data_dir,
            db_path,
            logs_dir,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().and_then(|raw| {
        if raw.trim().is_empty() {
            None
        } else {
            Some(raw)
        }
    })
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

/// Finalize tokens fall back to a key derived from the bot token so a
/// single-secret deployment still signs with something private.
fn derive_secret(bot_token: &str) -> Vec<u8> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(b"relaygate-finalize-v1:");
    hasher.update(bot_token.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_the_base_dir() {
        let paths = RelayPaths::from_base_dir("/srv/relay").unwrap();
        assert_eq!(paths.db_path, PathBuf::from("/srv/relay/data/relaygate.db"));
    }

    #[test]
    fn derived_secret_depends_on_token() {
        assert_ne!(derive_secret("a"), derive_secret("b"));
        assert_eq!(derive_secret("a").len(), 32);
    }
}
