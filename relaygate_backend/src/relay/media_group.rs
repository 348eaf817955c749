//! Debounced coalescing of album items.
//!
//! Every pushed item bumps the batch generation. A flush timer armed for an
//! older generation finds a newer one and backs off, so exactly one timer per
//! burst takes the batch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// User to their thread.
    ToThread,
    /// Thread back to the user.
    ToUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    direction: Direction,
    /// Sending side's chat; group ids are only unique per chat.
    chat_id: i64,
    group_id: String,
}

#[derive(Debug)]
struct Batch<T> {
    generation: u64,
    target: T,
    message_ids: Vec<i64>,
}

/// `T` is whatever the flush needs to know about the destination.
#[derive(Debug)]
pub struct MediaGroupBuffer<T> {
    batches: Arc<Mutex<HashMap<BatchKey, Batch<T>>>>,
}

impl<T> Clone for MediaGroupBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            batches: self.batches.clone(),
        }
    }
}

impl<T> Default for MediaGroupBuffer<T> {
    fn default() -> Self {
        Self {
            batches: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> MediaGroupBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an item and returns the generation the caller should flush at.
    pub fn push(&self, direction: Direction, chat_id: i64, group_id: &str, message_id: i64, target: T) -> u64 {
        let key = BatchKey {
            direction,
            chat_id,
            group_id: group_id.to_string(),
        };
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        let batch = batches.entry(key).or_insert_with(|| Batch {
            generation: 0,
            target,
            message_ids: Vec::new(),
        });
        batch.generation += 1;
        if !batch.message_ids.contains(&message_id) {
            batch.message_ids.push(message_id);
        }
        batch.generation
    }

    /// Removes and returns the batch only if no item arrived after
    /// `generation`. Ids come back in ascending order.
    pub fn take_if_latest(
        &self,
        direction: Direction,
        chat_id: i64,
        group_id: &str,
        generation: u64,
    ) -> Option<(T, Vec<i64>)> {
        let key = BatchKey {
            direction,
            chat_id,
            group_id: group_id.to_string(),
        };
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        if batches.get(&key)?.generation != generation {
            return None;
        }
        let mut batch = batches.remove(&key)?;
        batch.message_ids.sort_unstable();
        Some((batch.target, batch.message_ids))
    }

    pub fn pending_batches(&self) -> usize {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
