//! User ⇄ thread directory.
//!
//! `user:<id>` holds the [`UserRecord`]; `thread:<id>` is the reverse index.
//! Both are always written in the same batch.

use crate::config::RelayTuning;
use crate::error::{RelayError, Result};
use crate::health::{HealthMonitor, ProbeOutcome};
use crate::notices::Notice;
use crate::store::{keys, KvOp, ReadOptions, Storage};
use crate::transport::{OutgoingText, Transport};
use crate::utils::truncate_chars;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const TITLE_NAME_CHARS: usize = 64;
const INDEX_READ_HINT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: i64,
    pub thread_id: i64,
    pub title: String,
}

/// Who a thread is being created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: i64,
    pub display_name: String,
}

impl UserProfile {
    pub fn thread_title(&self) -> String {
        let name = self.display_name.trim();
        if name.is_empty() {
            self.user_id.to_string()
        } else {
            format!("{} | {}", truncate_chars(name, TITLE_NAME_CHARS), self.user_id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadLookup {
    /// Existing record whose thread looks usable.
    Ready(UserRecord),
    Created(UserRecord),
    /// Record exists but its thread is gone or redirected.
    Lost {
        stale: UserRecord,
        outcome: ProbeOutcome,
    },
}

type SharedCreation = Shared<BoxFuture<'static, std::result::Result<UserRecord, Arc<RelayError>>>>;

#[derive(Clone)]
pub struct ThreadDirectory {
    storage: Storage,
    transport: Arc<dyn Transport>,
    health: HealthMonitor,
    group_chat_id: Option<i64>,
    in_flight: Arc<Mutex<HashMap<i64, SharedCreation>>>,
    scan_limit: usize,
    scan_concurrency: usize,
}

impl ThreadDirectory {
    pub fn new(
        storage: Storage,
        transport: Arc<dyn Transport>,
        health: HealthMonitor,
        group_chat_id: Option<i64>,
        tuning: &RelayTuning,
    ) -> Self {
        Self {
            storage,
            transport,
            health,
            group_chat_id,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            scan_limit: tuning.reverse_scan_limit,
            scan_concurrency: tuning.reverse_scan_concurrency.max(1),
        }
    }

    pub fn group_chat_id(&self) -> Result<i64> {
        self.group_chat_id
            .ok_or_else(|| RelayError::Configuration("destination group is not configured".into()))
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub async fn get(&self, user_id: i64) -> Result<Option<UserRecord>> {
        Ok(self.storage.get_json(&keys::user(user_id)).await?)
    }

    /// Existing healthy record, a freshly created one, or a report that the
    /// stored thread is lost. Recovery of a lost thread is the caller's call.
    pub async fn get_or_create(&self, profile: &UserProfile) -> Result<ThreadLookup> {
        let chat_id = self.group_chat_id()?;
        match self.get(profile.user_id).await? {
            Some(record) => {
                let outcome = self.health.check(chat_id, record.thread_id).await;
                if outcome.is_lost() {
                    tracing::warn!(
                        user_id = profile.user_id,
                        thread_id = record.thread_id,
                        ?outcome,
                        "stored thread is unusable"
                    );
                    Ok(ThreadLookup::Lost {
                        stale: record,
                        outcome,
                    })
                } else {
                    Ok(ThreadLookup::Ready(record))
                }
            }
            None => Ok(ThreadLookup::Created(self.create(profile, None).await?)),
        }
    }

    /// Replaces `stale` with a new thread and repoints both indices.
    pub async fn recreate(&self, profile: &UserProfile, stale: UserRecord) -> Result<UserRecord> {
        self.create(profile, Some(stale)).await
    }

    /// Concurrent calls for the same user share one creation.
    async fn create(&self, profile: &UserProfile, replacing: Option<UserRecord>) -> Result<UserRecord> {
        let user_id = profile.user_id;
        let creation = {
            let mut in_flight = self.lock_in_flight();
            match in_flight.get(&user_id) {
                Some(existing) if existing.peek().is_none() => existing.clone(),
                _ => {
                    let this = self.clone();
                    let profile = profile.clone();
                    let creation = async move {
                        this.create_uncoalesced(&profile, replacing.as_ref())
                            .await
                            .map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(user_id, creation.clone());
                    creation
                }
            }
        };

        let result = creation.clone().await;
        {
            let mut in_flight = self.lock_in_flight();
            if in_flight
                .get(&user_id)
                .is_some_and(|current| current.ptr_eq(&creation))
            {
                in_flight.remove(&user_id);
            }
        }
        result.map_err(unshare)
    }

    async fn create_uncoalesced(
        &self,
        profile: &UserProfile,
        replacing: Option<&UserRecord>,
    ) -> Result<UserRecord> {
        let chat_id = self.group_chat_id()?;
        let user_id = profile.user_id;

        // Another instance may have finished first.
        if let Some(current) = self.get(user_id).await? {
            let superseded = replacing.map_or(true, |stale| stale.thread_id != current.thread_id);
            if superseded {
                return Ok(current);
            }
        }

        let title = profile.thread_title();
        let topic = self.transport.create_thread(chat_id, &title).await?;
        let record = UserRecord {
            user_id,
            thread_id: topic.message_thread_id,
            title,
        };

        let mut ops = vec![
            KvOp::put(
                keys::user(user_id),
                serde_json::to_string(&record).map_err(anyhow::Error::from)?,
                None,
            ),
            KvOp::put(keys::thread_index(record.thread_id), user_id.to_string(), None),
        ];
        if let Some(stale) = replacing {
            ops.push(KvOp::delete(keys::thread_index(stale.thread_id)));
            ops.push(KvOp::delete(keys::thread_ok(stale.thread_id)));
            ops.push(KvOp::delete(keys::pending_failures(user_id)));
        }
        if let Err(err) = self.storage.batch(ops).await {
            if let Err(cleanup) = self.transport.delete_thread(chat_id, record.thread_id).await {
                tracing::warn!(thread_id = record.thread_id, error = %cleanup, "could not remove orphaned thread");
            }
            return Err(err.into());
        }
        self.health.mark_healthy(record.thread_id).await;

        tracing::info!(
            user_id,
            thread_id = record.thread_id,
            replaced = replacing.map(|stale| stale.thread_id),
            "thread ready"
        );

        let header = Notice::ThreadHeader {
            user_id,
            display_name: profile.display_name.clone(),
        };
        if let Err(err) = self
            .transport
            .send_text(chat_id, OutgoingText::html(header.thread_note()).in_thread(record.thread_id))
            .await
        {
            tracing::debug!(user_id, error = %err, "could not post thread header");
        }

        if let Some(stale) = replacing {
            self.health.forget(stale.thread_id).await;
            let transport = self.transport.clone();
            let stale_thread = stale.thread_id;
            crate::utils::spawn_background("delete-stale-thread", async move {
                match transport.delete_thread(chat_id, stale_thread).await {
                    Err(err) if !err.is_thread_missing() => Err(err),
                    _ => Ok(()),
                }
            });
        }

        Ok(record)
    }

    /// Owner of `thread_id`. Falls back to a bounded scan when the index
    /// entry is missing and repairs it on success.
    pub async fn resolve_user(&self, thread_id: i64) -> Result<Option<i64>> {
        let indexed = self
            .storage
            .get_with(&keys::thread_index(thread_id), ReadOptions::cached(INDEX_READ_HINT))
            .await?;
        if let Some(user_id) = indexed.and_then(|raw| raw.trim().parse::<i64>().ok()) {
            return Ok(Some(user_id));
        }

        let user_keys = self.storage.list(keys::USER_PREFIX, self.scan_limit).await?;
        let storage = self.storage.clone();
        let mut lookups = stream::iter(user_keys)
            .map(|key| {
                let storage = storage.clone();
                async move { storage.get_json::<UserRecord>(&key).await }
            })
            .buffer_unordered(self.scan_concurrency);

        while let Some(found) = lookups.next().await {
            match found {
                Ok(Some(record)) if record.thread_id == thread_id => {
                    tracing::info!(thread_id, user_id = record.user_id, "rebuilt thread index entry");
                    if let Err(err) = self
                        .storage
                        .put(&keys::thread_index(thread_id), &record.user_id.to_string(), None)
                        .await
                    {
                        tracing::warn!(thread_id, error = ?err, "could not repair thread index");
                    }
                    return Ok(Some(record.user_id));
                }
                Ok(_) => {}
                Err(err) => tracing::debug!(thread_id, error = ?err, "skipping unreadable user record"),
            }
        }
        Ok(None)
    }

    /// Removes the record and its index entries; returns what was removed.
    pub async fn remove(&self, user_id: i64) -> Result<Option<UserRecord>> {
        let Some(record) = self.get(user_id).await? else {
            return Ok(None);
        };
        self.storage
            .batch(vec![
                KvOp::delete(keys::user(user_id)),
                KvOp::delete(keys::thread_index(record.thread_id)),
                KvOp::delete(keys::thread_ok(record.thread_id)),
            ])
            .await?;
        self.health.forget(record.thread_id).await;
        Ok(Some(record))
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<i64, SharedCreation>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Recovers an owned error from a shared creation result.
fn unshare(err: Arc<RelayError>) -> RelayError {
    match Arc::try_unwrap(err) {
        Ok(err) => err,
        Err(shared) => match shared.as_ref() {
            RelayError::Configuration(msg) => RelayError::Configuration(msg.clone()),
            RelayError::QuotaExceeded => RelayError::QuotaExceeded,
            RelayError::Transport(err) => RelayError::Transport(err.clone()),
            RelayError::StateConsistency(msg) => RelayError::StateConsistency(msg.clone()),
            RelayError::Validation(msg) => RelayError::Validation(msg.clone()),
            RelayError::Internal(err) => RelayError::Internal(anyhow::anyhow!("{err:#}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_titles_carry_the_user_id() {
        let profile = UserProfile {
            user_id: 42,
            display_name: "Ada Lovelace".into(),
        };
        assert_eq!(profile.thread_title(), "Ada Lovelace | 42");

        let anonymous = UserProfile {
            user_id: 7,
            display_name: "   ".into(),
        };
        assert_eq!(anonymous.thread_title(), "7");
    }

    #[test]
    fn shared_errors_keep_their_class() {
        let shared = Arc::new(RelayError::QuotaExceeded);
        let _other = shared.clone();
        assert!(matches!(unshare(shared), RelayError::QuotaExceeded));
    }
}
