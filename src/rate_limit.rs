//! Sliding-window admission control with burst penalties and scan detection.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::audit::{self, AuditEventType, AuditSink};

/// Scope of the subject-wide record. NUL never appears in a request path.
const GLOBAL_SCOPE: &str = "\u{0}global";
const PATTERN_SCOPE: &str = "\u{0}pattern";

#[derive(Clone)]
pub struct RateLimiterConfig {
    pub salt: String,
    /// Penalty after the burst limit is hit.
    pub block_duration: Duration,
    pub scan_endpoint_threshold: usize,
    pub scan_request_threshold: usize,
    pub scan_horizon: Duration,
    pub scan_block_duration: Duration,
    pub pattern_reset_interval: StdDuration,
    /// Records untouched for this long are dropped by `sweep_idle`.
    pub idle_after: Duration,
}

impl std::fmt::Debug for RateLimiterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterConfig")
            .field("block_duration", &self.block_duration)
            .field("scan_endpoint_threshold", &self.scan_endpoint_threshold)
            .field("scan_request_threshold", &self.scan_request_threshold)
            .field("scan_horizon", &self.scan_horizon)
            .field("scan_block_duration", &self.scan_block_duration)
            .field("pattern_reset_interval", &self.pattern_reset_interval)
            .field("idle_after", &self.idle_after)
            .finish_non_exhaustive()
    }
}

impl RateLimiterConfig {
    pub fn new(salt: impl Into<String>) -> Self {
        Self {
            salt: salt.into(),
            block_duration: Duration::minutes(5),
            scan_endpoint_threshold: 10,
            scan_request_threshold: 50,
            scan_horizon: Duration::minutes(5),
            scan_block_duration: Duration::hours(1),
            pattern_reset_interval: StdDuration::from_secs(5 * 60),
            idle_after: Duration::hours(1),
        }
    }
}

/// Per-call limits.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitOptions {
    pub limit: usize,
    pub window: Duration,
    pub burst_limit: usize,
    pub burst_window: Duration,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            limit: 60,
            window: Duration::seconds(60),
            burst_limit: 100,
            burst_window: Duration::seconds(10),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Blocked,
    RateLimit,
    BurstLimitExceeded,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Blocked => "blocked",
            DenyReason::RateLimit => "rate_limit",
            DenyReason::BurstLimitExceeded => "burst_limit_exceeded",
        }
    }
}

/// key: rate-limit-admission
/// Outcome of one check. Denials are values, never errors.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    pub retry_after: Option<StdDuration>,
    pub remaining: Option<usize>,
    /// Requests counted in the window; set on `rate_limit` denials.
    pub current_count: Option<usize>,
    pub limit: usize,
}

impl Admission {
    fn allow(remaining: usize, limit: usize) -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after: None,
            remaining: Some(remaining),
            current_count: None,
            limit,
        }
    }

    fn deny(reason: DenyReason, retry_after: Duration, limit: usize) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after: Some(retry_after.to_std().unwrap_or(StdDuration::ZERO)),
            remaining: Some(0),
            current_count: None,
            limit,
        }
    }
}

/// key: rate-limit-record
#[derive(Clone, Debug, Default)]
pub struct RateLimitRecord {
    pub request_timestamps: VecDeque<DateTime<Utc>>,
    pub burst_timestamps: VecDeque<DateTime<Utc>>,
    pub blocked: bool,
    pub blocked_until: Option<DateTime<Utc>>,
    /// End of the longest window any admitted request was counted against.
    pub retain_until: Option<DateTime<Utc>>,
}

impl RateLimitRecord {
    /// Remaining penalty, clearing the block once it has lapsed.
    fn active_block(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.blocked {
            return None;
        }
        match self.blocked_until {
            Some(until) if until > now => Some(until - now),
            _ => {
                self.blocked = false;
                self.blocked_until = None;
                None
            }
        }
    }

    fn block(&mut self, until: DateTime<Utc>) {
        self.blocked = true;
        self.blocked_until = Some(until);
    }

    fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.request_timestamps
            .back()
            .into_iter()
            .chain(self.burst_timestamps.back())
            .max()
            .copied()
    }
}

#[derive(Clone, Debug, Default)]
pub struct UsagePattern {
    pub timestamps: VecDeque<DateTime<Utc>>,
    pub distinct_endpoints: HashSet<String>,
}

enum Escalation {
    Burst { until: DateTime<Utc> },
    Scan { endpoints: usize, requests: usize },
}

/// key: rate-limiter
/// Records are keyed by a salted hash of subject and endpoint. Each check
/// holds the record's map entry across prune, count and append so
/// concurrent requests for the same key cannot both slip under the limit.
pub struct RateLimiter {
    records: DashMap<String, RateLimitRecord>,
    patterns: DashMap<String, UsagePattern>,
    config: RateLimiterConfig,
    audit: Option<Arc<dyn AuditSink>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            records: DashMap::new(),
            patterns: DashMap::new(),
            config,
            audit: None,
        }
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub async fn check_limit(
        &self,
        subject: &str,
        endpoint: &str,
        options: &RateLimitOptions,
    ) -> Admission {
        self.check_limit_at(subject, endpoint, options, Utc::now())
            .await
    }

    pub async fn check_limit_at(
        &self,
        subject: &str,
        endpoint: &str,
        options: &RateLimitOptions,
        now: DateTime<Utc>,
    ) -> Admission {
        let (admission, escalation) = self.evaluate(subject, endpoint, options, now);
        match escalation {
            Some(Escalation::Burst { until }) => {
                warn!(%endpoint, %until, "burst limit exceeded; subject blocked");
                audit::report(
                    self.audit.as_ref(),
                    AuditEventType::RateLimitBlock,
                    json!({
                        "endpoint": endpoint,
                        "reason": DenyReason::BurstLimitExceeded.as_str(),
                        "blocked_until": until,
                    }),
                    Some(subject),
                )
                .await;
            }
            Some(Escalation::Scan {
                endpoints,
                requests,
            }) => {
                warn!(endpoints, requests, "scanning pattern detected; subject blocked globally");
                audit::report(
                    self.audit.as_ref(),
                    AuditEventType::SecurityAlert,
                    json!({
                        "type": "suspicious_pattern",
                        "distinct_endpoints": endpoints,
                        "requests": requests,
                        "blocked_for_secs": self.config.scan_block_duration.num_seconds(),
                    }),
                    Some(subject),
                )
                .await;
            }
            None => {}
        }
        admission
    }

    /// Requests currently counted against `window` for this subject and
    /// endpoint. Read-only.
    pub fn current_count_at(
        &self,
        subject: &str,
        endpoint: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> usize {
        self.records
            .get(&self.key_for(subject, endpoint))
            .map(|record| {
                record
                    .request_timestamps
                    .iter()
                    .filter(|ts| now - **ts < window)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_blocked_at(&self, subject: &str, now: DateTime<Utc>) -> bool {
        self.records
            .get(&self.key_for(subject, GLOBAL_SCOPE))
            .map_or(false, |record| {
                record.blocked && record.blocked_until.map_or(false, |until| until > now)
            })
    }

    /// Drops the usage-pattern table.
    pub fn reset_patterns(&self) {
        let tracked = self.patterns.len();
        self.patterns.clear();
        debug!(tracked, "usage patterns reset");
    }

    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Utc::now())
    }

    /// Removes records with no active block, no timestamp still inside the
    /// window it was counted against, and no activity within `idle_after`.
    pub fn sweep_idle_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        let idle_after = self.config.idle_after;
        self.records.retain(|_, record| {
            if record.active_block(now).is_some() {
                return true;
            }
            if record.retain_until.map_or(false, |until| until > now) {
                return true;
            }
            record
                .last_seen()
                .map_or(false, |seen| now - seen < idle_after)
        });
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            info!(removed, "idle rate-limit records swept");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn evaluate(
        &self,
        subject: &str,
        endpoint: &str,
        options: &RateLimitOptions,
        now: DateTime<Utc>,
    ) -> (Admission, Option<Escalation>) {
        let global_key = self.key_for(subject, GLOBAL_SCOPE);
        if let Some(mut global) = self.records.get_mut(&global_key) {
            if let Some(retry) = global.active_block(now) {
                return (
                    Admission::deny(DenyReason::Blocked, retry, options.limit),
                    None,
                );
            }
        }

        // Only one map guard may be alive at a time: two guards on the same
        // shard deadlock.
        let admission = {
            let mut record = self
                .records
                .entry(self.key_for(subject, endpoint))
                .or_default();

            if let Some(retry) = record.active_block(now) {
                return (
                    Admission::deny(DenyReason::Blocked, retry, options.limit),
                    None,
                );
            }

            prune(&mut record.request_timestamps, options.window, now);
            prune(&mut record.burst_timestamps, options.burst_window, now);

            if record.request_timestamps.len() >= options.limit {
                let retry = record
                    .request_timestamps
                    .front()
                    .map_or(options.window, |oldest| options.window - (now - *oldest));
                debug!(%endpoint, "rate limit reached");
                let mut denied = Admission::deny(DenyReason::RateLimit, retry, options.limit);
                denied.current_count = Some(record.request_timestamps.len());
                return (denied, None);
            }

            if record.burst_timestamps.len() >= options.burst_limit {
                let until = now + self.config.block_duration;
                record.block(until);
                return (
                    Admission::deny(
                        DenyReason::BurstLimitExceeded,
                        self.config.block_duration,
                        options.limit,
                    ),
                    Some(Escalation::Burst { until }),
                );
            }

            record.request_timestamps.push_back(now);
            record.burst_timestamps.push_back(now);
            let horizon = now + options.window.max(options.burst_window);
            record.retain_until = record.retain_until.max(Some(horizon));
            Admission::allow(
                options.limit - record.request_timestamps.len(),
                options.limit,
            )
        };

        let escalation = self.track_pattern(subject, endpoint, now);
        if escalation.is_some() {
            self.records
                .entry(global_key)
                .or_default()
                .block(now + self.config.scan_block_duration);
        }
        (admission, escalation)
    }

    fn track_pattern(
        &self,
        subject: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Option<Escalation> {
        let pattern_key = self.key_for(subject, PATTERN_SCOPE);
        let mut pattern = self.patterns.entry(pattern_key).or_default();
        prune(&mut pattern.timestamps, self.config.scan_horizon, now);
        if pattern.timestamps.is_empty() {
            pattern.distinct_endpoints.clear();
        }
        pattern.timestamps.push_back(now);
        pattern.distinct_endpoints.insert(endpoint.to_string());

        let endpoints = pattern.distinct_endpoints.len();
        let requests = pattern.timestamps.len();
        if endpoints > self.config.scan_endpoint_threshold
            && requests > self.config.scan_request_threshold
        {
            pattern.timestamps.clear();
            pattern.distinct_endpoints.clear();
            return Some(Escalation::Scan {
                endpoints,
                requests,
            });
        }
        None
    }

    fn key_for(&self, subject: &str, scope: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{subject}:{scope}:{}", self.config.salt));
        hex::encode(hasher.finalize())
    }
}

/// Keeps only timestamps with `now - t < window`.
fn prune(timestamps: &mut VecDeque<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) {
    while let Some(front) = timestamps.front() {
        if now - *front >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}
