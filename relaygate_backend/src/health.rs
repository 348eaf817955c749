//! Thread health probing and the recovery decision that follows it.

use crate::config::RelayTuning;
use crate::store::{keys, Storage};
use crate::transport::{OutgoingText, ThreadProbe, Transport, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Zero-width space: delivers without visible content.
const PROBE_TEXT: &str = "\u{200B}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok,
    Missing,
    /// The probe landed somewhere other than the expected thread.
    Redirected { actual: Option<i64> },
    /// The probe was refused by content rules; the thread itself is not
    /// known to be broken.
    Rejected,
    Unknown,
}

impl ProbeOutcome {
    pub fn is_lost(self) -> bool {
        matches!(self, ProbeOutcome::Missing | ProbeOutcome::Redirected { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    UseExisting,
    Recreate,
    /// Drop every verification-adjacent record and challenge again.
    ResetVerification,
}

pub fn recovery_action(outcome: ProbeOutcome, verified: bool) -> RecoveryAction {
    match (outcome.is_lost(), verified) {
        (false, _) => RecoveryAction::UseExisting,
        (true, true) => RecoveryAction::Recreate,
        (true, false) => RecoveryAction::ResetVerification,
    }
}

struct CachedProbe {
    expires_at: Instant,
    last_used: Instant,
}

/// Bounded map of threads recently seen healthy. Evicts expired entries
/// first, then the least recently touched one.
struct ProbeCache {
    entries: HashMap<i64, CachedProbe>,
    max_entries: usize,
    ttl: Duration,
}

impl ProbeCache {
    fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    fn hit(&mut self, thread_id: i64) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(&thread_id) {
            Some(entry) if entry.expires_at > now => {
                entry.last_used = now;
                true
            }
            Some(_) => {
                self.entries.remove(&thread_id);
                false
            }
            None => false,
        }
    }

    fn insert(&mut self, thread_id: i64) {
        let now = Instant::now();
        if !self.entries.contains_key(&thread_id) && self.entries.len() >= self.max_entries {
            self.entries.retain(|_, entry| entry.expires_at > now);
            if self.entries.len() >= self.max_entries {
                if let Some(oldest) = self
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(id, _)| *id)
                {
                    self.entries.remove(&oldest);
                }
            }
        }
        self.entries.insert(
            thread_id,
            CachedProbe {
                expires_at: now + self.ttl,
                last_used: now,
            },
        );
    }

    fn remove(&mut self, thread_id: i64) {
        self.entries.remove(&thread_id);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Clone)]
pub struct HealthMonitor {
    storage: Storage,
    transport: Arc<dyn Transport>,
    cache: Arc<Mutex<ProbeCache>>,
    positive_ttl: Duration,
}

impl HealthMonitor {
    pub fn new(storage: Storage, transport: Arc<dyn Transport>, tuning: &RelayTuning) -> Self {
        Self {
            storage,
            transport,
            cache: Arc::new(Mutex::new(ProbeCache::new(
                tuning.health_cache_entries,
                tuning.health_cache_ttl,
            ))),
            positive_ttl: tuning.health_positive_ttl,
        }
    }

    /// Cached positive results short-circuit; anything else costs a live
    /// probe.
    pub async fn check(&self, chat_id: i64, thread_id: i64) -> ProbeOutcome {
        if self.lock_cache().hit(thread_id) {
            return ProbeOutcome::Ok;
        }
        match self.storage.exists(&keys::thread_ok(thread_id)).await {
            Ok(true) => {
                self.lock_cache().insert(thread_id);
                return ProbeOutcome::Ok;
            }
            Ok(false) => {}
            Err(err) => tracing::debug!(thread_id, error = ?err, "health marker read failed"),
        }

        let outcome = self.live_probe(chat_id, thread_id).await;
        tracing::debug!(thread_id, ?outcome, "thread probe finished");
        if outcome == ProbeOutcome::Ok {
            self.mark_healthy(thread_id).await;
        } else if outcome.is_lost() {
            self.forget(thread_id).await;
        }
        outcome
    }

    /// Records a thread as healthy, e.g. right after creating it or after a
    /// successful delivery into it.
    pub async fn mark_healthy(&self, thread_id: i64) {
        self.lock_cache().insert(thread_id);
        if let Err(err) = self
            .storage
            .put(&keys::thread_ok(thread_id), "1", Some(self.positive_ttl))
            .await
        {
            tracing::debug!(thread_id, error = ?err, "could not persist health marker");
        }
    }

    pub async fn forget(&self, thread_id: i64) {
        self.lock_cache().remove(thread_id);
        if let Err(err) = self.storage.delete(&keys::thread_ok(thread_id)).await {
            tracing::debug!(thread_id, error = ?err, "could not clear health marker");
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.lock_cache().len()
    }

    async fn live_probe(&self, chat_id: i64, thread_id: i64) -> ProbeOutcome {
        match self.transport.probe_thread(chat_id, thread_id).await {
            Ok(ThreadProbe::Exists) => ProbeOutcome::Ok,
            Ok(ThreadProbe::Missing) => ProbeOutcome::Missing,
            Err(TransportError::Unsupported(_)) => self.write_probe(chat_id, thread_id).await,
            Err(err) if err.is_thread_missing() => ProbeOutcome::Missing,
            Err(err) => {
                tracing::warn!(thread_id, error = %err, "thread lookup failed");
                ProbeOutcome::Unknown
            }
        }
    }

    async fn write_probe(&self, chat_id: i64, thread_id: i64) -> ProbeOutcome {
        let sent = self
            .transport
            .send_text(chat_id, OutgoingText::plain(PROBE_TEXT).in_thread(thread_id))
            .await;
        match sent {
            Ok(sent) => {
                if let Err(err) = self.transport.delete_message(chat_id, sent.message_id).await {
                    tracing::debug!(thread_id, error = %err, "could not remove probe message");
                }
                match sent.message_thread_id {
                    Some(actual) if actual == thread_id => ProbeOutcome::Ok,
                    actual => ProbeOutcome::Redirected { actual },
                }
            }
            Err(err) if err.is_thread_missing() => ProbeOutcome::Missing,
            Err(err) if err.is_content_rejected() => ProbeOutcome::Rejected,
            Err(err) => {
                tracing::warn!(thread_id, error = %err, "probe message failed");
                ProbeOutcome::Unknown
            }
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, ProbeCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
