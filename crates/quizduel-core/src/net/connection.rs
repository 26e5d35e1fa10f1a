//! Connection bookkeeping and retry policy
//!
//! Tracks the visible connection state of a session and decides whether a
//! failed attempt is retried and after how long.

use std::time::Duration;

use serde::Serialize;

/// Retry policy for connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts allowed before giving up
    pub max_retries: u32,
    /// Delay unit; attempt `n` waits `base_delay * 2^n`
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the next attempt once `retry_count` attempts have failed
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after the delay
    RetryAfter(Duration),
    /// Stop retrying; the session is in error
    GiveUp,
}

/// Visible connection state of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub is_connected: bool,
    pub is_connecting: bool,
    pub connection_error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl ConnectionState {
    pub fn new(max_retries: u32) -> Self {
        Self {
            is_connected: false,
            is_connecting: false,
            connection_error: None,
            retry_count: 0,
            max_retries,
        }
    }

    /// An attempt has started
    pub fn begin_attempt(&mut self) {
        self.is_connecting = true;
    }

    /// The transport opened
    pub fn on_success(&mut self) {
        self.is_connected = true;
        self.is_connecting = false;
        self.connection_error = None;
        self.retry_count = 0;
    }

    /// An attempt failed or an open transport dropped
    ///
    /// Counts the failure and applies `policy`. Non-retryable errors give up
    /// without consuming a retry.
    pub fn on_failure(
        &mut self,
        message: impl Into<String>,
        retryable: bool,
        policy: &RetryPolicy,
    ) -> RetryDecision {
        self.is_connected = false;
        self.is_connecting = false;
        self.connection_error = Some(message.into());

        if !retryable {
            return RetryDecision::GiveUp;
        }

        self.retry_count = (self.retry_count + 1).min(self.max_retries);
        if self.retry_count < self.max_retries {
            RetryDecision::RetryAfter(policy.backoff(self.retry_count))
        } else {
            RetryDecision::GiveUp
        }
    }

    /// The transport was closed on purpose
    pub fn on_disconnect(&mut self) {
        self.is_connected = false;
        self.is_connecting = false;
    }

    /// Whether automatic retries have been used up
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff(3), Duration::from_millis(8000));
        assert_eq!(policy.backoff(4), Duration::from_millis(10_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(10_000));
    }

    #[test]
    fn test_three_failures_give_up() {
        let policy = RetryPolicy::default();
        let mut state = ConnectionState::new(policy.max_retries);

        assert_eq!(
            state.on_failure("refused", true, &policy),
            RetryDecision::RetryAfter(Duration::from_millis(2000))
        );
        assert_eq!(
            state.on_failure("refused", true, &policy),
            RetryDecision::RetryAfter(Duration::from_millis(4000))
        );
        assert_eq!(
            state.on_failure("refused", true, &policy),
            RetryDecision::GiveUp
        );
        assert_eq!(state.retry_count, 3);
        assert!(state.is_exhausted());
        assert_eq!(state.connection_error.as_deref(), Some("refused"));
    }

    #[test]
    fn test_success_resets_retry_count() {
        let policy = RetryPolicy::default();
        let mut state = ConnectionState::new(policy.max_retries);

        state.begin_attempt();
        state.on_failure("timeout", true, &policy);
        assert_eq!(state.retry_count, 1);
        assert!(!state.is_connecting);

        state.begin_attempt();
        state.on_success();
        assert!(state.is_connected);
        assert_eq!(state.retry_count, 0);
        assert!(state.connection_error.is_none());
    }

    #[test]
    fn test_non_retryable_failure_keeps_count() {
        let policy = RetryPolicy::default();
        let mut state = ConnectionState::new(policy.max_retries);

        assert_eq!(
            state.on_failure("no token", false, &policy),
            RetryDecision::GiveUp
        );
        assert_eq!(state.retry_count, 0);
    }
}
