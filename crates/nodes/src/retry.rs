//! Retry policy for external task invocation.
//!
//! A stateful classifier and backoff calculator. Node executors that call out
//! to collaborators (see `agent_task`) drive their calls through a policy built
//! from the run's [`RetryConfig`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How a failure message is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Transient,
    Permanent,
    /// Matched neither list; retried (fail-open).
    Unknown,
}

/// Tuning knobs for a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// Substrings (case-insensitive) marking an error as never retryable.
    pub permanent_patterns: Vec<String>,
    /// Substrings (case-insensitive) marking an error as transient.
    pub retryable_patterns: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| (*s).to_owned()).collect();
        Self {
            max_attempts: 3,
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
            permanent_patterns: owned(&[
                "401",
                "403",
                "unauthorized",
                "forbidden",
                "invalid api key",
                "authentication failed",
                "permission denied",
                "not found",
                "invalid request",
                "configuration error",
            ]),
            retryable_patterns: owned(&[
                "timeout",
                "timed out",
                "etimedout",
                "econnreset",
                "econnrefused",
                "socket hang up",
                "network",
                "rate limit",
                "429",
                "502",
                "503",
                "504",
                "temporarily unavailable",
                "overloaded",
            ]),
        }
    }
}

/// Workflow-type-specific overrides; `None` keeps the default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryOverrides {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter: Option<bool>,
    pub permanent_patterns: Option<Vec<String>>,
    pub retryable_patterns: Option<Vec<String>>,
}

impl RetryConfig {
    /// Defaults with `overrides` applied on top.
    pub fn with_overrides(overrides: &RetryOverrides) -> Self {
        let d = Self::default();
        Self {
            max_attempts: overrides.max_attempts.unwrap_or(d.max_attempts),
            base_delay_ms: overrides.base_delay_ms.unwrap_or(d.base_delay_ms),
            max_delay_ms: overrides.max_delay_ms.unwrap_or(d.max_delay_ms),
            backoff_multiplier: overrides.backoff_multiplier.unwrap_or(d.backoff_multiplier),
            jitter: overrides.jitter.unwrap_or(d.jitter),
            permanent_patterns: overrides.permanent_patterns.clone().unwrap_or(d.permanent_patterns),
            retryable_patterns: overrides.retryable_patterns.clone().unwrap_or(d.retryable_patterns),
        }
    }
}

/// Outcome of [`RetryPolicy::record_failure`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub should_retry: bool,
    /// Delay before the next attempt; zero when not retrying.
    pub delay_ms: u64,
    pub reason: String,
    pub error_type: ErrorType,
    /// Attempt number that just failed (1-based).
    pub attempt: u32,
}

/// Stateful failure classifier and backoff calculator.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempts: u32,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempts: 0 }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Permanent patterns are checked first so an explicit permanent marker
    /// wins over an overlapping transient one.
    pub fn classify_error(&self, message: &str) -> ErrorType {
        let lower = message.to_lowercase();
        let hit = |patterns: &[String]| patterns.iter().any(|p| lower.contains(&p.to_lowercase()));
        if hit(&self.config.permanent_patterns) {
            ErrorType::Permanent
        } else if hit(&self.config.retryable_patterns) {
            ErrorType::Transient
        } else {
            ErrorType::Unknown
        }
    }

    /// Backoff for the given 1-based attempt, before jitter.
    pub fn base_delay_for(&self, attempt: u32) -> u64 {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.config.base_delay_ms as f64 * self.config.backoff_multiplier.powi(exp);
        raw.min(self.config.max_delay_ms as f64).round() as u64
    }

    fn delay_for(&self, attempt: u32) -> u64 {
        let base = self.base_delay_for(attempt) as f64;
        if !self.config.jitter {
            return base.round() as u64;
        }
        // ±25%
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        (base * factor).round() as u64
    }

    pub fn record_failure(&mut self, message: &str) -> RetryDecision {
        self.attempts += 1;
        let attempt = self.attempts;
        let error_type = self.classify_error(message);

        if attempt >= self.config.max_attempts {
            return RetryDecision {
                should_retry: false,
                delay_ms: 0,
                reason: "Max attempts exceeded".into(),
                error_type,
                attempt,
            };
        }

        match error_type {
            ErrorType::Permanent => RetryDecision {
                should_retry: false,
                delay_ms: 0,
                reason: "Permanent error".into(),
                error_type,
                attempt,
            },
            ErrorType::Transient | ErrorType::Unknown => RetryDecision {
                should_retry: true,
                delay_ms: self.delay_for(attempt),
                reason: format!("{error_type:?} error, retrying"),
                error_type,
                attempt,
            },
        }
    }

    pub fn record_success(&mut self) {
        self.attempts = 0;
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Drive `op` until it succeeds or the policy gives up, sleeping between
    /// attempts. Returns the last error when giving up.
    pub async fn run<T, F, Fut>(&mut self, label: &str, mut op: F) -> Result<T, String>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        loop {
            match op(self.attempts + 1).await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(message) => {
                    let decision = self.record_failure(&message);
                    if !decision.should_retry {
                        return Err(message);
                    }
                    warn!(
                        label,
                        attempt = decision.attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = decision.delay_ms,
                        error = %message,
                        "retrying after failure"
                    );
                    tokio::time::sleep(Duration::from_millis(decision.delay_ms)).await;
                }
            }
        }
    }
}
