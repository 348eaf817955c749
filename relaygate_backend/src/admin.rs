//! Operator actions shared by the REST admin routes and the CLI.

use crate::directory::{ThreadDirectory, UserRecord};
use crate::error::Result;
use crate::queue::PendingQueue;
use crate::settings::{Settings, SettingsSnapshot};
use crate::store::{keys, Storage};
use crate::utils::now_utc_iso;
use crate::verification::{VerificationService, VerificationState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminMark {
    pub since: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserStatus {
    pub user_id: i64,
    pub banned: bool,
    pub trusted: bool,
    pub verification: VerificationState,
    pub session_id: Option<String>,
    pub record: Option<UserRecord>,
    pub pending: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub settings: SettingsSnapshot,
    pub quota_breaker_tripped: bool,
    pub quota_breaker_remaining_secs: Option<u64>,
}

#[derive(Clone)]
pub struct AdminService {
    storage: Storage,
    settings: Settings,
    directory: ThreadDirectory,
    verification: VerificationService,
    queue: PendingQueue,
}

impl AdminService {
    pub fn new(
        storage: Storage,
        settings: Settings,
        directory: ThreadDirectory,
        verification: VerificationService,
        queue: PendingQueue,
    ) -> Self {
        Self {
            storage,
            settings,
            directory,
            verification,
            queue,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn ban(&self, user_id: i64) -> Result<()> {
        self.put_mark(&keys::ban(user_id)).await?;
        if let Err(err) = self.storage.delete(&keys::trust(user_id)).await {
            tracing::warn!(user_id, error = ?err, "ban recorded but trust mark could not be cleared");
        }
        tracing::info!(user_id, "user banned");
        Ok(())
    }

    pub async fn unban(&self, user_id: i64) -> Result<()> {
        self.storage.delete(&keys::ban(user_id)).await?;
        tracing::info!(user_id, "user unbanned");
        Ok(())
    }

    pub async fn trust(&self, user_id: i64) -> Result<()> {
        self.put_mark(&keys::trust(user_id)).await?;
        if let Err(err) = self.storage.delete(&keys::ban(user_id)).await {
            tracing::warn!(user_id, error = ?err, "trust recorded but ban mark could not be cleared");
        }
        tracing::info!(user_id, "user trusted");
        Ok(())
    }

    pub async fn untrust(&self, user_id: i64) -> Result<()> {
        self.storage.delete(&keys::trust(user_id)).await?;
        tracing::info!(user_id, "user untrusted");
        Ok(())
    }

    /// Forgets the user's thread, verification and queue. Ban and trust
    /// marks stay.
    pub async fn wipe_user(&self, user_id: i64) -> Result<Option<UserRecord>> {
        let removed = self.directory.remove(user_id).await?;
        self.verification.reset(user_id).await?;
        self.queue.clear(user_id).await?;
        tracing::info!(user_id, thread_id = removed.as_ref().map(|r| r.thread_id), "user data wiped");
        Ok(removed)
    }

    pub async fn wipe_all(&self) -> Result<usize> {
        Ok(self.storage.wipe_all().await?)
    }

    pub async fn status(&self, user_id: i64) -> Result<UserStatus> {
        let session = self.verification.active_session(user_id).await?;
        Ok(UserStatus {
            user_id,
            banned: self.storage.exists(&keys::ban(user_id)).await?,
            trusted: self.storage.exists(&keys::trust(user_id)).await?,
            verification: self.verification.state(user_id).await?,
            session_id: session.map(|session| session.session_id),
            record: self.directory.get(user_id).await?,
            pending: self.queue.snapshot(user_id).await?,
        })
    }

    pub async fn set(&self, name: &str, value: &str) -> Result<SettingsSnapshot> {
        self.settings.set_raw(name, value).await?;
        Ok(self.settings.snapshot().await?)
    }

    pub async fn overview(&self) -> Result<Overview> {
        let remaining = self.storage.breaker().remaining();
        Ok(Overview {
            settings: self.settings.snapshot().await?,
            quota_breaker_tripped: remaining.is_some(),
            quota_breaker_remaining_secs: remaining.map(|left| left.as_secs()),
        })
    }

    pub async fn reset_quota_breaker(&self) -> Result<()> {
        self.storage.clear_quota_breaker().await?;
        tracing::info!("quota breaker cleared by operator");
        Ok(())
    }

    async fn put_mark(&self, key: &str) -> Result<()> {
        self.storage
            .put_json(key, &AdminMark { since: now_utc_iso() }, None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, RelayTuning, StoreConfig, VerificationConfig};
    use crate::database::Database;
    use crate::health::HealthMonitor;
    use crate::transport::testing::NullTransport;
    use crate::verification::ProviderKind;
    use std::sync::Arc;

    fn admin() -> (AdminService, Storage) {
        let storage = Storage::sqlite(Database::open_in_memory().unwrap(), &StoreConfig::default());
        let transport: Arc<dyn crate::transport::Transport> = Arc::new(NullTransport::default());
        let tuning = RelayTuning::default();
        let settings = Settings::new(storage.clone(), ProviderKind::Quiz);
        let queue = PendingQueue::new(storage.clone(), &QueueConfig::default());
        let health = HealthMonitor::new(storage.clone(), transport.clone(), &tuning);
        let directory = ThreadDirectory::new(storage.clone(), transport.clone(), health, Some(-100), &tuning);
        let verification = VerificationService::new(
            storage.clone(),
            transport,
            settings.clone(),
            queue.clone(),
            VerificationConfig::with_secret(b"secret".to_vec()),
            None,
        );
        (
            AdminService::new(storage.clone(), settings, directory, verification, queue),
            storage,
        )
    }

    #[tokio::test]
    async fn ban_and_trust_are_mutually_exclusive() {
        let (admin, storage) = admin();
        admin.trust(5).await.unwrap();
        admin.ban(5).await.unwrap();
        assert!(storage.exists(&keys::ban(5)).await.unwrap());
        assert!(!storage.exists(&keys::trust(5)).await.unwrap());

        admin.trust(5).await.unwrap();
        assert!(!storage.exists(&keys::ban(5)).await.unwrap());
        assert!(admin.status(5).await.unwrap().trusted);
    }

    #[tokio::test]
    async fn wipe_user_keeps_moderation_marks() {
        let (admin, storage) = admin();
        admin.ban(9).await.unwrap();
        storage.put(&keys::verified(9), "1", None).await.unwrap();
        admin.queue.enqueue(9, 1).await.unwrap();

        admin.wipe_user(9).await.unwrap();

        let status = admin.status(9).await.unwrap();
        assert!(status.banned);
        assert_eq!(status.verification, VerificationState::Unverified);
        assert!(status.pending.is_empty());
    }

    #[tokio::test]
    async fn set_rejects_unknown_names() {
        let (admin, _) = admin();
        assert!(admin.set("nonsense", "1").await.is_err());
        let snapshot = admin.set("bot_enabled", "off").await.unwrap();
        assert!(!snapshot.bot_enabled);
    }
}
