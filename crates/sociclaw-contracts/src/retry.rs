use std::collections::BTreeSet;

pub const DEFAULT_RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_SECONDS: f64 = 0.5;

const MIN_BACKOFF_BASE_SECONDS: f64 = 0.05;
const JITTER_FRACTION: f64 = 0.2;
const JITTER_CAP_SECONDS: f64 = 0.25;

/// Request-level retry budget.
///
/// `max_retries` counts additional attempts after the first request, so a
/// policy always performs `1 + max_retries` attempts at most. Policies are
/// immutable once built; callers derive a new one instead of mutating.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff_base_seconds: f64,
    retryable_statuses: BTreeSet<u16>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base_seconds: f64) -> Self {
        let backoff_base_seconds = if backoff_base_seconds.is_finite() {
            backoff_base_seconds.max(MIN_BACKOFF_BASE_SECONDS)
        } else {
            DEFAULT_BACKOFF_BASE_SECONDS
        };
        Self {
            max_retries,
            backoff_base_seconds,
            retryable_statuses: DEFAULT_RETRY_STATUSES.into_iter().collect(),
        }
    }

    /// Single attempt, no retries.
    pub fn no_retries() -> Self {
        Self::new(0, DEFAULT_BACKOFF_BASE_SECONDS)
    }

    pub fn with_retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn backoff_base_seconds(&self) -> f64 {
        self.backoff_base_seconds
    }

    pub fn retryable_statuses(&self) -> &BTreeSet<u16> {
        &self.retryable_statuses
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Deterministic part of the delay slept after failed attempt `attempt` (0-based).
    pub fn base_delay_seconds(&self, attempt: u32) -> f64 {
        self.backoff_base_seconds * 2f64.powi(attempt.min(30) as i32)
    }

    /// Upper bound of the uniform jitter added on top of [`Self::base_delay_seconds`].
    pub fn jitter_cap_seconds(&self, attempt: u32) -> f64 {
        (self.base_delay_seconds(attempt) * JITTER_FRACTION).min(JITTER_CAP_SECONDS)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BACKOFF_BASE_SECONDS)
    }
}
