//! Rate limiting — sliding window algorithm.
//!
//! Sub-bucketed sliding windows avoid the boundary bursts of fixed windows:
//! each window tracks a handful of sub-buckets and ages out the oldest ones
//! as time moves forward, so the reported count is always a true trailing
//! window rather than a reset-on-tick counter.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

const MINUTE: i64 = 60;
const HOUR: i64 = 3_600;
const DAY: i64 = 86_400;

/// Rate limit configuration for a user or endpoint. A limit of 0 disables
/// that window.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
    pub bucket_count: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1_000,
            requests_per_day: 10_000,
            bucket_count: 10,
        }
    }
}

impl From<&crate::types::RateLimitDefaults> for RateLimitConfig {
    fn from(defaults: &crate::types::RateLimitDefaults) -> Self {
        Self {
            requests_per_minute: defaults.requests_per_minute,
            requests_per_hour: defaults.requests_per_hour,
            requests_per_day: defaults.requests_per_day,
            bucket_count: defaults.bucket_count,
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitResult {
    Allowed { remaining: u32 },
    Exceeded {
        window: &'static str,
        current: u32,
        limit: u32,
        retry_after_seconds: f64,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

/// Usage snapshot for a single window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowUsage {
    pub current: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_in_seconds: i64,
}

/// Sub-bucketed sliding window counter.
#[derive(Debug, Clone)]
struct SlidingWindow {
    window_seconds: i64,
    bucket_count: u32,
    buckets: BTreeMap<i64, u32>,
    total_count: u32,
}

impl SlidingWindow {
    fn new(window_seconds: i64, bucket_count: u32) -> Self {
        Self {
            window_seconds,
            bucket_count,
            buckets: BTreeMap::new(),
            total_count: 0,
        }
    }

    fn bucket_size(&self) -> f64 {
        self.window_seconds as f64 / self.bucket_count as f64
    }

    fn bucket_for(&self, timestamp: f64) -> i64 {
        (timestamp / self.bucket_size()) as i64
    }

    fn evict_before(&mut self, min_bucket: i64) {
        let stale: Vec<i64> = self.buckets.range(..min_bucket).map(|(b, _)| *b).collect();
        for b in stale {
            if let Some(count) = self.buckets.remove(&b) {
                self.total_count = self.total_count.saturating_sub(count);
            }
        }
    }

    fn record(&mut self, timestamp: f64) -> u32 {
        let bucket = self.bucket_for(timestamp);
        self.evict_before(bucket - self.bucket_count as i64);
        *self.buckets.entry(bucket).or_insert(0) += 1;
        self.total_count += 1;
        self.get_count(timestamp)
    }

    fn get_count(&self, timestamp: f64) -> u32 {
        let current_bucket = self.bucket_for(timestamp);
        let min_bucket = current_bucket - self.bucket_count as i64;
        self.buckets.range(min_bucket..).map(|(_, c)| *c).sum()
    }

    fn time_until_slot_available(&self, timestamp: f64, limit: u32) -> f64 {
        if self.get_count(timestamp) < limit {
            return 0.0;
        }
        let current_bucket = self.bucket_for(timestamp);
        let min_bucket = current_bucket - self.bucket_count as i64;
        let excess = self.get_count(timestamp) - limit + 1;

        let mut expired = 0u32;
        for (bucket, count) in self.buckets.range(min_bucket..) {
            expired += count;
            if expired >= excess {
                let bucket_end = (*bucket + 1) as f64 * self.bucket_size();
                return (bucket_end - timestamp + self.window_seconds as f64).max(0.0);
            }
        }
        self.window_seconds as f64
    }

    fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Rate limiter — sliding-window limits keyed by (user, endpoint, window).
///
/// NOT a separate actor: owned by `Kernel` and called via `&mut self`.
/// Endpoint-specific config overrides user config, which overrides the
/// default. Windows evaluate in fixed order: minute, then hour, then day.
#[derive(Debug)]
pub struct RateLimiter {
    default_config: RateLimitConfig,
    user_configs: HashMap<String, RateLimitConfig>,
    endpoint_configs: HashMap<String, RateLimitConfig>,
    windows: HashMap<(String, String, &'static str), SlidingWindow>,
}

impl RateLimiter {
    pub fn new(default_config: Option<RateLimitConfig>) -> Self {
        Self {
            default_config: default_config.unwrap_or_default(),
            user_configs: HashMap::new(),
            endpoint_configs: HashMap::new(),
            windows: HashMap::new(),
        }
    }

    pub fn set_default_config(&mut self, config: RateLimitConfig) {
        self.default_config = config;
    }

    pub fn set_user_limits(&mut self, user_id: &str, config: RateLimitConfig) {
        self.user_configs.insert(user_id.to_string(), config);
    }

    pub fn set_endpoint_limits(&mut self, endpoint: &str, config: RateLimitConfig) {
        self.endpoint_configs.insert(endpoint.to_string(), config);
    }

    /// Effective config: endpoint override, then user override, then default.
    pub fn get_config(&self, user_id: &str, endpoint: &str) -> RateLimitConfig {
        if let Some(cfg) = self.endpoint_configs.get(endpoint) {
            return cfg.clone();
        }
        if let Some(cfg) = self.user_configs.get(user_id) {
            return cfg.clone();
        }
        self.default_config.clone()
    }

    /// Evaluate minute, hour, then day windows in order. With `record=true`
    /// (the normal path), an allowed request is recorded in every active
    /// window; `record=false` performs a dry-run check only.
    pub fn check_rate_limit(&mut self, user_id: &str, endpoint: &str, record: bool) -> RateLimitResult {
        let now = now_secs();
        let config = self.get_config(user_id, endpoint);
        let checks: [(&'static str, i64, u32); 3] = [
            ("minute", MINUTE, config.requests_per_minute),
            ("hour", HOUR, config.requests_per_hour),
            ("day", DAY, config.requests_per_day),
        ];

        for (window_name, window_seconds, limit) in checks {
            if limit == 0 {
                continue;
            }
            let window = self.window_for(user_id, endpoint, window_name, window_seconds, config.bucket_count);
            let current = window.get_count(now);
            if current >= limit {
                let retry_after = window.time_until_slot_available(now, limit);
                tracing::warn!(
                    user_id,
                    endpoint,
                    window = window_name,
                    current,
                    limit,
                    retry_after,
                    "rate_limit_exceeded"
                );
                return RateLimitResult::Exceeded {
                    window: window_name,
                    current,
                    limit,
                    retry_after_seconds: retry_after,
                };
            }
        }

        if record {
            for (window_name, window_seconds, limit) in checks {
                if limit == 0 {
                    continue;
                }
                self.window_for(user_id, endpoint, window_name, window_seconds, config.bucket_count)
                    .record(now);
            }
        }

        let minute_key = (user_id.to_string(), endpoint.to_string(), "minute");
        let remaining = match self.windows.get(&minute_key) {
            Some(w) => config.requests_per_minute.saturating_sub(w.get_count(now)),
            None => config.requests_per_minute,
        };
        RateLimitResult::Allowed { remaining }
    }

    fn window_for(
        &mut self,
        user_id: &str,
        endpoint: &str,
        window_name: &'static str,
        window_seconds: i64,
        bucket_count: u32,
    ) -> &mut SlidingWindow {
        self.windows
            .entry((user_id.to_string(), endpoint.to_string(), window_name))
            .or_insert_with(|| SlidingWindow::new(window_seconds, bucket_count))
    }

    pub fn get_usage(&self, user_id: &str, endpoint: &str) -> HashMap<&'static str, WindowUsage> {
        let now = now_secs();
        let config = self.get_config(user_id, endpoint);
        let checks: [(&'static str, i64, u32); 3] = [
            ("minute", MINUTE, config.requests_per_minute),
            ("hour", HOUR, config.requests_per_hour),
            ("day", DAY, config.requests_per_day),
        ];

        checks
            .into_iter()
            .map(|(window_name, window_seconds, limit)| {
                let current = self
                    .windows
                    .get(&(user_id.to_string(), endpoint.to_string(), window_name))
                    .map(|w| w.get_count(now))
                    .unwrap_or(0);
                (
                    window_name,
                    WindowUsage {
                        current,
                        limit,
                        remaining: limit.saturating_sub(current),
                        reset_in_seconds: window_seconds,
                    },
                )
            })
            .collect()
    }

    /// Clear every window for a user across all endpoints. Returns the
    /// number of windows cleared.
    pub fn reset_user(&mut self, user_id: &str) -> usize {
        let before = self.windows.len();
        self.windows.retain(|(u, _, _), _| u != user_id);
        let cleared = before - self.windows.len();
        tracing::info!(user_id, windows_cleared = cleared, "rate_limit_reset");
        cleared
    }

    /// Drop windows with no buckets left, to bound memory growth.
    pub fn cleanup_expired(&mut self) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_empty());
        before - self.windows.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(None)
    }
}

fn now_secs() -> f64 {
    let now: DateTime<Utc> = Utc::now();
    now.timestamp_millis() as f64 / 1000.0
}
