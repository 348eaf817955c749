//! Messages held back while their sender is being verified.
//!
//! The queue lives under its own keys so that a verification session can
//! expire or renew without losing what was buffered.

use crate::config::QueueConfig;
use crate::error::Result;
use crate::store::{keys, KvOp, Storage};
use std::collections::BTreeMap;
use std::time::Duration;

const QUEUE_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);
const NOTICE_FLAG_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Consecutive failed deliveries after which an id is given up on.
pub const MAX_DELIVERY_FAILURES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub queued: usize,
    pub duplicate: bool,
    pub evicted: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettleOutcome {
    pub delivered: usize,
    /// Failed this round and kept for another try.
    pub retained: Vec<i64>,
    /// Failed too often; the user has to resend these.
    pub abandoned: Vec<i64>,
}

#[derive(Clone)]
pub struct PendingQueue {
    storage: Storage,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(storage: Storage, config: &QueueConfig) -> Self {
        Self {
            storage,
            capacity: config.capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued ids in ascending order.
    pub async fn snapshot(&self, user_id: i64) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self
            .storage
            .get_json(&keys::pending(user_id))
            .await?
            .unwrap_or_default();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Adds `message_id`, dropping the oldest entries beyond capacity.
    pub async fn enqueue(&self, user_id: i64, message_id: i64) -> Result<EnqueueOutcome> {
        let mut ids = self.snapshot(user_id).await?;
        if ids.contains(&message_id) {
            return Ok(EnqueueOutcome {
                queued: ids.len(),
                duplicate: true,
                evicted: Vec::new(),
            });
        }
        ids.push(message_id);
        ids.sort_unstable();
        let overflow = ids.len().saturating_sub(self.capacity);
        let evicted: Vec<i64> = ids.drain(..overflow).collect();
        if !evicted.is_empty() {
            tracing::info!(user_id, ?evicted, "pending queue full; dropped oldest");
        }
        self.storage
            .put_json(&keys::pending(user_id), &ids, Some(QUEUE_TTL))
            .await?;
        Ok(EnqueueOutcome {
            queued: ids.len(),
            duplicate: false,
            evicted,
        })
    }

    /// True the first time it is called for a given session.
    pub async fn claim_saved_notice(&self, user_id: i64, session_id: &str) -> Result<bool> {
        let key = keys::pending_notice(user_id);
        if self.storage.get(&key).await?.as_deref() == Some(session_id) {
            return Ok(false);
        }
        self.storage
            .put(&key, session_id, Some(NOTICE_FLAG_TTL))
            .await?;
        Ok(true)
    }

    /// Records a flush: delivered ids leave the queue, failed ones stay
    /// unless they have now failed [`MAX_DELIVERY_FAILURES`] times.
    pub async fn settle(&self, user_id: i64, delivered: &[i64], failed: &[i64]) -> Result<SettleOutcome> {
        let mut failures: BTreeMap<i64, u32> = self
            .storage
            .get_json(&keys::pending_failures(user_id))
            .await?
            .unwrap_or_default();
        for id in delivered {
            failures.remove(id);
        }

        let mut outcome = SettleOutcome {
            delivered: delivered.len(),
            ..SettleOutcome::default()
        };
        for id in failed {
            let count = failures.entry(*id).or_insert(0);
            *count += 1;
            if *count >= MAX_DELIVERY_FAILURES {
                failures.remove(id);
                outcome.abandoned.push(*id);
            } else {
                outcome.retained.push(*id);
            }
        }

        // Re-read so ids queued while the flush ran are kept.
        let remaining: Vec<i64> = self
            .snapshot(user_id)
            .await?
            .into_iter()
            .filter(|id| !delivered.contains(id) && !outcome.abandoned.contains(id))
            .collect();
        failures.retain(|id, _| remaining.contains(id));

        let mut ops = Vec::with_capacity(2);
        if remaining.is_empty() {
            ops.push(KvOp::delete(keys::pending(user_id)));
        } else {
            ops.push(KvOp::put(
                keys::pending(user_id),
                serde_json::to_string(&remaining).map_err(anyhow::Error::from)?,
                Some(QUEUE_TTL),
            ));
        }
        if failures.is_empty() {
            ops.push(KvOp::delete(keys::pending_failures(user_id)));
        } else {
            ops.push(KvOp::put(
                keys::pending_failures(user_id),
                serde_json::to_string(&failures).map_err(anyhow::Error::from)?,
                Some(QUEUE_TTL),
            ));
        }
        self.storage.batch(ops).await?;
        Ok(outcome)
    }

    pub async fn clear(&self, user_id: i64) -> Result<()> {
        self.storage
            .delete_many([
                keys::pending(user_id),
                keys::pending_notice(user_id),
                keys::pending_failures(user_id),
            ])
            .await?;
        Ok(())
    }
}
