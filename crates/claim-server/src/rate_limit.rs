//! Sliding-window rate limiting keyed by client IP and email identifier.

use crate::config::{RateLimitRule, SecurityConfig};
use crate::error::{ClaimError, ClaimResult};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Rate limit bucket that rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitBucket {
    Ip,
    Email,
    Code,
}

impl std::fmt::Display for LimitBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitBucket::Ip => write!(f, "ip"),
            LimitBucket::Email => write!(f, "email"),
            LimitBucket::Code => write!(f, "code"),
        }
    }
}

/// Counter store consulted before every code request and verification.
///
/// `consume` must be atomic per `(bucket, key)`: the check and the increment happen under
/// one lock, so concurrent callers can never both take the last slot.
pub trait RateLimiter: Send + Sync {
    /// Record one request, or fail with the time until a slot frees up.
    fn consume(&self, bucket: LimitBucket, key: &str) -> ClaimResult<()>;

    /// Forget every window.
    fn reset(&self);

    /// Drop windows with no requests inside their rule's window. Returns how many were dropped.
    fn purge_idle(&self) -> usize;

    /// Number of keys currently tracked.
    fn tracked_keys(&self) -> usize;
}

/// In-process limiter keeping a timestamp log per key
#[derive(Debug)]
pub struct MemoryRateLimiter {
    windows: DashMap<(LimitBucket, String), VecDeque<Instant>>,
    ip_rule: RateLimitRule,
    email_rule: RateLimitRule,
    code_rule: RateLimitRule,
}

impl MemoryRateLimiter {
    pub fn new(ip_rule: RateLimitRule, email_rule: RateLimitRule, code_rule: RateLimitRule) -> Self {
        Self {
            windows: DashMap::new(),
            ip_rule,
            email_rule,
            code_rule,
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(config.ip_limit, config.email_limit, config.code_limit)
    }

    fn rule(&self, bucket: LimitBucket) -> RateLimitRule {
        match bucket {
            LimitBucket::Ip => self.ip_rule,
            LimitBucket::Email => self.email_rule,
            LimitBucket::Code => self.code_rule,
        }
    }
}

fn evict_expired(log: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(&oldest) = log.front() {
        if now.duration_since(oldest) >= window {
            log.pop_front();
        } else {
            break;
        }
    }
}

impl RateLimiter for MemoryRateLimiter {
    fn consume(&self, bucket: LimitBucket, key: &str) -> ClaimResult<()> {
        let rule = self.rule(bucket);
        let window = rule.window();
        let now = Instant::now();

        // The entry guard holds the shard lock until the end of this function
        let mut log = self.windows.entry((bucket, key.to_string())).or_default();
        evict_expired(&mut log, window, now);

        if log.len() >= rule.max_requests as usize {
            let oldest = log.front().copied().unwrap_or(now);
            let retry_after = window.saturating_sub(now.duration_since(oldest));
            debug!("{} limit hit ({} in {:?})", bucket, log.len(), window);
            return Err(ClaimError::RateLimited {
                bucket,
                retry_after,
            });
        }

        log.push_back(now);
        Ok(())
    }

    fn reset(&self) {
        let cleared = self.windows.len();
        self.windows.clear();
        info!("Rate limits reset ({} windows cleared)", cleared);
    }

    fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|(bucket, _), log| {
            evict_expired(log, self.rule(*bucket).window(), now);
            !log.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
