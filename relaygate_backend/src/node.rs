use crate::admin::AdminService;
use crate::api::{self, AppState};
use crate::bootstrap;
use crate::config::RelayConfig;
use crate::database::Database;
use crate::directory::ThreadDirectory;
use crate::health::HealthMonitor;
use crate::queue::PendingQueue;
use crate::relay::RelayService;
use crate::settings::Settings;
use crate::spam::{LlmClassifier, SpamFilter, TextClassifier};
use crate::store::Storage;
use crate::transport::{HttpTransport, Transport};
use crate::verification::{CaptchaVerifier, SiteVerifyClient, VerificationService};
use anyhow::Result;
use std::sync::Arc;

/// Every long-lived service, wired once and shared by the HTTP server and
/// the admin subcommands.
#[derive(Clone)]
pub struct RelayServices {
    pub storage: Storage,
    pub settings: Settings,
    pub relay: RelayService,
    pub admin: AdminService,
}

impl RelayServices {
    /// Wires the services over an already-migrated database and any
    /// transport implementation.
    pub fn assemble(
        config: &RelayConfig,
        database: Database,
        transport: Arc<dyn Transport>,
        captcha: Option<Arc<dyn CaptchaVerifier>>,
        classifier: Option<Arc<dyn TextClassifier>>,
    ) -> Self {
        let storage = Storage::sqlite(database, &config.store);
        let settings = Settings::new(storage.clone(), config.verification.default_provider);
        let queue = PendingQueue::new(storage.clone(), &config.queue);
        let health = HealthMonitor::new(storage.clone(), transport.clone(), &config.tuning);
        let directory = ThreadDirectory::new(
            storage.clone(),
            transport.clone(),
            health,
            config.transport.group_chat_id,
            &config.tuning,
        );
        let verification = VerificationService::new(
            storage.clone(),
            transport.clone(),
            settings.clone(),
            queue.clone(),
            config.verification.clone(),
            captcha,
        );
        let relay = RelayService::new(
            storage.clone(),
            transport,
            settings.clone(),
            directory.clone(),
            verification.clone(),
            queue.clone(),
            SpamFilter::new(classifier),
            config.tuning.media_group_debounce,
        );
        let admin = AdminService::new(storage.clone(), settings.clone(), directory, verification, queue);
        Self {
            storage,
            settings,
            relay,
            admin,
        }
    }
}

pub struct RelayNode {
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    services: RelayServices,
}

impl RelayNode {
    /// Bootstraps persistent state and builds the HTTP-backed transport and
    /// external verifiers from configuration.
    pub async fn start(config: RelayConfig) -> Result<Self> {
        let bootstrap = bootstrap::initialize(&config).await?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.transport)?);
        let captcha: Option<Arc<dyn CaptchaVerifier>> = match &config.verification.captcha_secret {
            Some(secret) => Some(Arc::new(SiteVerifyClient::new(
                config.verification.captcha_verify_url.clone(),
                secret.clone(),
            )?)),
            None => None,
        };
        let classifier: Option<Arc<dyn TextClassifier>> = LlmClassifier::from_config(&config.classifier)?
            .map(|client| Arc::new(client) as Arc<dyn TextClassifier>);

        let services = RelayServices::assemble(
            &config,
            bootstrap.database,
            transport.clone(),
            captcha.clone(),
            classifier.clone(),
        );

        tracing::info!(
            directories_created = ?bootstrap.directories_created,
            database_initialized = bootstrap.database_initialized,
            purged_entries = bootstrap.purged_entries,
            writes_today = bootstrap.writes_today,
            group_configured = config.transport.group_chat_id.is_some(),
            captcha_configured = captcha.is_some(),
            classifier_configured = classifier.is_some(),
            "relay node initialized"
        );

        Ok(Self {
            config,
            transport,
            services,
        })
    }

    pub fn services(&self) -> &RelayServices {
        &self.services
    }

    /// Warns when the bot cannot manage threads in the destination group.
    /// Never fatal: the group may simply be unreachable at startup.
    pub async fn preflight(&self) {
        let Some(group_chat_id) = self.config.transport.group_chat_id else {
            tracing::warn!("no destination group configured; users will see the maintenance notice");
            return;
        };
        let Some(bot_id) = bot_id_from_token(&self.config.transport.bot_token) else {
            tracing::debug!("bot token has no numeric id prefix; skipping permission check");
            return;
        };
        match self.transport.member_status(group_chat_id, bot_id).await {
            Ok(status) if status.is_admin() => {
                tracing::info!(group_chat_id, "bot has admin rights in the destination group");
            }
            Ok(status) => {
                tracing::warn!(group_chat_id, ?status, "bot is not an admin; thread creation will fail");
            }
            Err(err) => {
                tracing::warn!(group_chat_id, error = %err, "could not check bot permissions");
            }
        }
    }

    /// Runs the REST API server until shutdown.
    pub async fn run_http_server(&self) -> Result<()> {
        self.preflight().await;
        api::serve_http(AppState {
            config: self.config.api.clone(),
            relay: self.services.relay.clone(),
            admin: self.services.admin.clone(),
        })
        .await
    }
}

fn bot_id_from_token(token: &str) -> Option<i64> {
    token.split_once(':')?.0.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_id_is_the_token_prefix() {
        assert_eq!(bot_id_from_token("123456:ABC-def"), Some(123456));
        assert_eq!(bot_id_from_token("not-a-token"), None);
        assert_eq!(bot_id_from_token("abc:def"), None);
    }
}
