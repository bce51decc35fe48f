// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic for transient failures.
//!
//! Different presets are available for different call sites; the remote
//! point-read policy is deliberately a parameter (see
//! [`RetryConfig::remote_read_with`]) rather than a hard-coded constant.
//!
//! # Example
//!
//! ```
//! use table_mirror::RetryConfig;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Remote point reads: two attempts, fixed pause
//! let read = RetryConfig::remote_read();
//! assert_eq!(read.max_retries, Some(2));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial store connection and schema creation.
    /// Detects configuration errors quickly instead of hanging.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Quick retry for individual store queries.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Remote point reads: 2 attempts with a fixed half-second pause.
    /// Exhaustion resolves to "not found" at the call site, never an error.
    #[must_use]
    pub fn remote_read() -> Self {
        Self::remote_read_with(2, 500)
    }

    /// Remote point-read policy with explicit attempts and pause, for
    /// callers tuning via [`MirrorConfig`](crate::MirrorConfig).
    #[must_use]
    pub fn remote_read_with(attempts: usize, delay_ms: u64) -> Self {
        let delay = Duration::from_millis(delay_ms);
        Self {
            max_retries: Some(attempts.max(1)),
            initial_delay: delay,
            max_delay: delay,
            factor: 1.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                }

                warn!(
                    "Operation '{}' failed (attempt {}{}): {}. Retrying in {:?}...",
                    operation_name,
                    attempts,
                    config
                        .max_retries
                        .map(|m| format!("/{}", m))
                        .unwrap_or_default(),
                    err,
                    delay
                );

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}
