//! Rate limiting
//!
//! Two-tier limits: a global daily ceiling across all callers and per-caller
//! ceilings (distinct for miners and validators), plus short-window limits on
//! the hot read endpoints. The global ceiling is checked first; a violation
//! of either tier rejects the request with the rate-limit taxonomy, never an
//! authentication error.
//!
//! The counter store is an injected component instance, not process-wide
//! state. The bundled in-memory backend is also the documented degradation
//! path when an external counter store is unreachable: limits then hold per
//! process only (fail-open for availability).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::LimitsConfig;
use crate::error::ApiError;

/// Counter store surface used for rate limiting
#[async_trait]
pub trait Counter: Send + Sync {
    async fn get(&self, key: &str) -> u64;

    /// Increment and return the new value; the entry expires after `ttl`
    async fn increment(&self, key: &str, ttl: Duration) -> u64;
}

/// In-process counter backed by a concurrent map with per-entry expiry
#[derive(Default)]
pub struct MemoryCounter {
    entries: DashMap<String, (u64, Instant)>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries; called opportunistically on writes
    fn cleanup(&self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

#[async_trait]
impl Counter for MemoryCounter {
    async fn get(&self, key: &str) -> u64 {
        match self.entries.get(key) {
            Some(entry) if entry.value().1 > Instant::now() => entry.value().0,
            _ => 0,
        }
    }

    async fn increment(&self, key: &str, ttl: Duration) -> u64 {
        if self.entries.len() > 10_000 {
            self.cleanup();
        }
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert((0, now + ttl));
        let (count, expires_at) = entry.value_mut();
        if *expires_at <= now {
            *count = 0;
            *expires_at = now + ttl;
        }
        *count += 1;
        *count
    }
}

/// Short rate-limit windows for the hot read endpoints
#[derive(Debug, Clone, Copy)]
pub enum Window {
    Minute,
    Hour,
}

impl Window {
    fn key_suffix(&self, now: DateTime<Utc>) -> String {
        match self {
            Window::Minute => now.format("%Y-%m-%d-%H:%M").to_string(),
            Window::Hour => now.format("%Y-%m-%d-%H").to_string(),
        }
    }

    fn ttl(&self) -> Duration {
        match self {
            Window::Minute => Duration::from_secs(120),
            Window::Hour => Duration::from_secs(7_200),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
        }
    }
}

const DAY_TTL: Duration = Duration::from_secs(86_400 * 2);

pub struct RateLimiter {
    counter: Arc<dyn Counter>,
    config: LimitsConfig,
}

impl RateLimiter {
    pub fn new(counter: Arc<dyn Counter>, config: LimitsConfig) -> Self {
        Self { counter, config }
    }

    pub fn config(&self) -> &LimitsConfig {
        &self.config
    }

    /// Daily two-tier check: global ceiling first, then the caller's own
    /// ceiling. Both counters advance only when the request is admitted.
    pub async fn check_daily(
        &self,
        caller: &str,
        daily_limit: u64,
        now: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        let today = now.format("%Y-%m-%d").to_string();

        let global_key = format!("GLOBAL:{}", today);
        if self.counter.get(&global_key).await >= self.config.total_daily {
            warn!("Global daily request limit reached");
            return Err(ApiError::RateLimited(
                "Global request limit reached.".to_string(),
            ));
        }

        let caller_key = format!("{}:{}", caller, today);
        if self.counter.get(&caller_key).await >= daily_limit {
            warn!("Daily limit of {} exceeded for {}", daily_limit, caller);
            return Err(ApiError::RateLimited(format!(
                "Daily limit of {} exceeded.",
                daily_limit
            )));
        }

        self.counter.increment(&caller_key, DAY_TTL).await;
        self.counter.increment(&global_key, DAY_TTL).await;
        Ok(())
    }

    /// Short-window per-caller limit for one endpoint scope
    pub async fn check_window(
        &self,
        caller: &str,
        scope: &str,
        limit: u64,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        let key = format!("{}:{}:{}", caller, scope, window.key_suffix(now));
        if self.counter.get(&key).await >= limit {
            warn!(
                "Rate limit of {}/{} exceeded for {} on {}",
                limit,
                window.describe(),
                caller,
                scope
            );
            return Err(ApiError::RateLimited(format!(
                "Rate limit of {} per {} exceeded.",
                limit,
                window.describe()
            )));
        }
        self.counter.increment(&key, window.ttl()).await;
        Ok(())
    }
}
