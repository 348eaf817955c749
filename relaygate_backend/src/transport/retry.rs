use super::TransportError;
use crate::config::RetryConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
    /// Retry once with formatting stripped.
    Fallback,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_rate_limit_wait: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            max_rate_limit_wait: config.max_rate_limit_wait,
        }
    }

    /// `attempt` is 1-based: the number of calls already made.
    pub fn decide(&self, attempt: u32, error: &TransportError) -> RetryDecision {
        if error.is_formatting_rejected() {
            return RetryDecision::Fallback;
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        match error {
            TransportError::RateLimited { retry_after } => match retry_after {
                Some(wait) if *wait > self.max_rate_limit_wait => RetryDecision::GiveUp,
                Some(wait) => RetryDecision::Retry(*wait),
                None => RetryDecision::Retry(self.backoff(attempt)),
            },
            TransportError::Transient(_) | TransportError::Malformed(_) => {
                RetryDecision::Retry(self.backoff(attempt))
            }
            TransportError::Api { .. } | TransportError::Unsupported(_) => RetryDecision::GiveUp,
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(&RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_rate_limit_wait: Duration::from_secs(5),
        });
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
    }

    #[test]
    fn decisions_follow_error_class() {
        let policy = RetryPolicy::default();
        let transient = TransportError::Transient("502".into());
        assert!(matches!(policy.decide(1, &transient), RetryDecision::Retry(_)));
        assert_eq!(policy.decide(3, &transient), RetryDecision::GiveUp);

        let permanent = TransportError::api(400, "Bad Request: chat not found");
        assert_eq!(policy.decide(1, &permanent), RetryDecision::GiveUp);

        let formatting = TransportError::api(400, "Bad Request: can't parse entities");
        assert_eq!(policy.decide(1, &formatting), RetryDecision::Fallback);
    }

    #[test]
    fn rate_limit_honors_provider_delay_up_to_cap() {
        let policy = RetryPolicy::default();
        let short = TransportError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(
            policy.decide(1, &short),
            RetryDecision::Retry(Duration::from_secs(2))
        );
        let long = TransportError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(policy.decide(1, &long), RetryDecision::GiveUp);
    }
}
