use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const MAX_TRACKED_USERS: usize = 10_000;

/// Process-wide circuit breaker flipped by the first quota rejection from
/// the store. Callers test it before touching the store again.
#[derive(Clone, Default)]
pub struct QuotaBreaker {
    inner: Arc<Mutex<BreakerState>>,
}

#[derive(Default)]
struct BreakerState {
    tripped_until: Option<Instant>,
    /// User id -> the trip window they were already told about.
    notified: HashMap<i64, Instant>,
}

impl QuotaBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self, cooldown: Duration) {
        let mut state = self.lock();
        let until = Instant::now() + cooldown;
        // A second trip inside the same window keeps the first deadline so
        // already-notified users stay quiet.
        if state.tripped_until.is_some_and(|current| current > Instant::now()) {
            return;
        }
        tracing::warn!(cooldown_secs = cooldown.as_secs(), "store quota breaker tripped");
        state.tripped_until = Some(until);
        state.notified.clear();
    }

    pub fn is_tripped(&self) -> bool {
        self.remaining().is_some()
    }

    pub fn remaining(&self) -> Option<Duration> {
        let mut state = self.lock();
        match state.tripped_until {
            Some(until) => {
                let now = Instant::now();
                if until > now {
                    Some(until - now)
                } else {
                    state.tripped_until = None;
                    state.notified.clear();
                    None
                }
            }
            None => None,
        }
    }

    /// True exactly once per user per trip window.
    pub fn should_notify(&self, user_id: i64) -> bool {
        let mut state = self.lock();
        let Some(until) = state.tripped_until else {
            return false;
        };
        if state.notified.get(&user_id) == Some(&until) {
            return false;
        }
        if state.notified.len() >= MAX_TRACKED_USERS {
            state.notified.clear();
        }
        state.notified.insert(user_id, until);
        true
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.tripped_until = None;
        state.notified.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
