use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{errors::Error, Result};

// ============== Shared-secret Authorization ==============

/// Header carrying the admin shared secret. `http::HeaderMap` lookups are
/// case-insensitive, so `X-API-Key` and `x-api-key` both resolve here.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Compare two secrets without short-circuiting on the first differing byte.
///
/// Both sides are hashed first so the comparison length does not leak the
/// configured secret's length either.
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    let a = Sha256::digest(provided.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Validate an admin request's shared secret.
///
/// A missing configured secret is a configuration error (surfaced to the caller
/// as such); a missing or wrong provided secret is a security rejection.
pub fn check_shared_secret(provided: Option<&str>, expected: Option<&str>) -> Result<()> {
    let Some(expected) = expected.filter(|s| !s.is_empty()) else {
        return Err(Error::Config("ADMIN_API_KEY is not configured".to_string()));
    };
    let Some(provided) = provided.filter(|s| !s.is_empty()) else {
        return Err(Error::Security("missing API key".to_string()));
    };
    if !secrets_match(provided, expected) {
        return Err(Error::Security("invalid API key".to_string()));
    }
    Ok(())
}

// ============== Rate Limiter (Fixed Window) ==============

pub const LIMIT_WEBHOOK: &str = "webhook";
pub const LIMIT_CHAT: &str = "chat";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LimitRule {
    pub window: Duration,
    pub max_requests: u32,
}

impl LimitRule {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            window,
            max_requests,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub limit_type: String,
    pub identifier: String,
}

impl RateLimitKey {
    pub fn new(limit_type: &str, identifier: &str) -> Self {
        Self {
            limit_type: limit_type.to_string(),
            identifier: identifier.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Counter {
    count: u32,
    expires_at: Instant,
}

/// Per-key fixed-window request counter.
///
/// A window opens on the first request for a key and the entry expires
/// `rule.window` later; the next request after expiry starts a fresh window.
/// Traffic straddling a boundary can therefore reach up to 2x the nominal rate.
///
/// Counters live in a sharded map: updates to one key are serialized by the
/// shard lock, and unrelated keys do not contend.
#[derive(Debug)]
pub struct RateLimiter {
    rules: HashMap<String, LimitRule>,
    counters: DashMap<RateLimitKey, Counter>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub count: u32,
    pub max: u32,
    pub resets_in: Option<Duration>,
}

impl RateLimiter {
    pub fn new(rules: impl IntoIterator<Item = (String, LimitRule)>) -> Self {
        Self {
            rules: rules.into_iter().collect(),
            counters: DashMap::new(),
        }
    }

    /// `webhook`: 30/min per source IP, `chat`: 10/min per chat.
    pub fn with_defaults() -> Self {
        Self::new([
            (
                LIMIT_WEBHOOK.to_string(),
                LimitRule::new(30, Duration::from_secs(60)),
            ),
            (
                LIMIT_CHAT.to_string(),
                LimitRule::new(10, Duration::from_secs(60)),
            ),
        ])
    }

    pub fn rule(&self, limit_type: &str) -> Option<LimitRule> {
        self.rules.get(limit_type).copied()
    }

    pub fn check_limit(&self, limit_type: &str, identifier: &str) -> bool {
        self.check_limit_at(limit_type, identifier, Instant::now())
    }

    /// Count one request against `(limit_type, identifier)` at `now`.
    ///
    /// Unknown limit types fail open.
    pub fn check_limit_at(&self, limit_type: &str, identifier: &str, now: Instant) -> bool {
        let Some(rule) = self.rules.get(limit_type).copied() else {
            warn!(limit_type, "unknown rate limit type, allowing request");
            return true;
        };

        let mut counter = self
            .counters
            .entry(RateLimitKey::new(limit_type, identifier))
            .or_insert_with(|| Counter {
                count: 0,
                expires_at: now + rule.window,
            });

        if now >= counter.expires_at {
            *counter = Counter {
                count: 0,
                expires_at: now + rule.window,
            };
        }

        if counter.count >= rule.max_requests {
            warn!(limit_type, identifier, "rate limit exceeded");
            return false;
        }

        counter.count += 1;
        true
    }

    pub fn status_at(&self, limit_type: &str, identifier: &str, now: Instant) -> RateLimitStatus {
        let max = self.rule(limit_type).map(|r| r.max_requests).unwrap_or(0);
        let live = self
            .counters
            .get(&RateLimitKey::new(limit_type, identifier))
            .map(|c| *c)
            .filter(|c| now < c.expires_at);

        match live {
            Some(c) => RateLimitStatus {
                count: c.count,
                max,
                resets_in: Some(c.expires_at.saturating_duration_since(now)),
            },
            None => RateLimitStatus {
                count: 0,
                max,
                resets_in: None,
            },
        }
    }

    /// Drop expired counters. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, c| now < c.expires_at);
        before.saturating_sub(self.counters.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.counters.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_defaults()
    }
}
