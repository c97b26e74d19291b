// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-source-IP authentication rate limiting.
//!
//! Tracks failed authentication attempts per IP address and temporarily locks
//! out addresses that exceed the configured threshold inside the tracking
//! window. State lives only in process memory and is owned by whoever
//! constructs the limiter; clones share the same map.
//!
//! # Example
//!
//! ```
//! use treeshare::shared::rate_limit::{AuthRateLimitConfig, AuthRateLimiter};
//! use std::net::IpAddr;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = AuthRateLimiter::new(AuthRateLimitConfig::default());
//!     let ip: IpAddr = "192.168.1.100".parse().unwrap();
//!
//!     if limiter.is_blocked(&ip).await {
//!         return;
//!     }
//!
//!     // After a failed attempt
//!     let allowed = limiter.check_auth_rate_limit(ip).await;
//!     assert!(allowed);
//!
//!     // After a successful attempt
//!     limiter.reset_auth_rate_limit(&ip).await;
//! }
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Configuration for authentication rate limiting.
#[derive(Debug, Clone)]
pub struct AuthRateLimitConfig {
    /// Failures tolerated inside one window; the next one is refused.
    pub max_attempts: u32,
    /// Time window for counting failures.
    pub window: Duration,
    /// How long an address stays locked once the threshold is exceeded.
    pub lockout: Duration,
    /// Addresses that are never locked out.
    pub whitelist: Vec<IpAddr>,
}

impl Default for AuthRateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(300),
            lockout: Duration::from_secs(300),
            whitelist: vec![],
        }
    }
}

impl AuthRateLimitConfig {
    /// Create a new configuration.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Failures allowed before lockout
    /// * `window_secs` - Time window in seconds for counting failures
    /// * `lockout_secs` - Lockout duration in seconds
    pub fn new(max_attempts: u32, window_secs: u64, lockout_secs: u64) -> Self {
        Self {
            max_attempts,
            window: Duration::from_secs(window_secs),
            lockout: Duration::from_secs(lockout_secs),
            whitelist: vec![],
        }
    }

    /// Set the whitelist.
    pub fn with_whitelist(mut self, whitelist: Vec<IpAddr>) -> Self {
        self.whitelist = whitelist;
        self
    }
}

/// Failure record for one source address.
#[derive(Debug)]
struct AttemptRecord {
    count: u32,
    window_start: Instant,
    last_failure: Instant,
    locked_until: Option<Instant>,
}

impl AttemptRecord {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            last_failure: now,
            locked_until: None,
        }
    }

    fn is_locked(&self, now: Instant) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

/// Authentication rate limiter keyed by source IP.
///
/// Every record sits behind one mutex, held only for the counter update.
#[derive(Debug, Clone)]
pub struct AuthRateLimiter {
    records: Arc<Mutex<HashMap<IpAddr, AttemptRecord>>>,
    config: AuthRateLimitConfig,
}

impl AuthRateLimiter {
    /// Create a new limiter with the given configuration.
    pub fn new(config: AuthRateLimitConfig) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Record one failed attempt for `ip` and report whether that attempt was
    /// still within the allowance.
    ///
    /// Returns `false` once the threshold is exceeded inside the window (and
    /// for as long as the resulting lockout lasts). Whitelisted addresses
    /// always return `true`.
    pub async fn check_auth_rate_limit(&self, ip: IpAddr) -> bool {
        if self.is_whitelisted(&ip) {
            return true;
        }

        let now = Instant::now();
        let mut records = self.records.lock().await;
        let record = records.entry(ip).or_insert_with(|| AttemptRecord::new(now));

        if record.is_locked(now) {
            record.last_failure = now;
            return false;
        }

        // A lapsed lockout or window starts counting from scratch
        if record.locked_until.is_some()
            || now.duration_since(record.window_start) > self.config.window
        {
            record.count = 0;
            record.window_start = now;
            record.locked_until = None;
        }

        record.count += 1;
        record.last_failure = now;

        if record.count >= self.config.max_attempts && record.locked_until.is_none() {
            record.locked_until = Some(now + self.config.lockout);
            tracing::warn!(
                ip = %ip,
                failures = record.count,
                lockout_secs = self.config.lockout.as_secs(),
                "Locking out address after repeated authentication failures"
            );
        }

        record.count <= self.config.max_attempts
    }

    /// Check, without recording anything, whether `ip` must be refused
    /// before its credentials are even looked at.
    pub async fn is_blocked(&self, ip: &IpAddr) -> bool {
        if self.is_whitelisted(ip) {
            return false;
        }

        let now = Instant::now();
        let records = self.records.lock().await;
        records.get(ip).is_some_and(|record| {
            record.is_locked(now)
                || (record.locked_until.is_none()
                    && now.duration_since(record.window_start) <= self.config.window
                    && record.count >= self.config.max_attempts)
        })
    }

    /// Clear the record for `ip`. Called after a successful authentication.
    pub async fn reset_auth_rate_limit(&self, ip: &IpAddr) {
        if self.records.lock().await.remove(ip).is_some() {
            tracing::debug!(ip = %ip, "Cleared authentication failure record");
        }
    }

    /// Attempts left before `ip` is locked out.
    pub async fn remaining_attempts(&self, ip: &IpAddr) -> u32 {
        let now = Instant::now();
        let records = self.records.lock().await;
        match records.get(ip) {
            Some(record) if record.is_locked(now) => 0,
            Some(record)
                if record.locked_until.is_none()
                    && now.duration_since(record.window_start) <= self.config.window =>
            {
                self.config.max_attempts.saturating_sub(record.count)
            }
            _ => self.config.max_attempts,
        }
    }

    /// Drop records whose window and lockout have both lapsed.
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| {
            record.is_locked(now) || now.duration_since(record.last_failure) < self.config.window
        });
        let removed = before - records.len();
        if removed > 0 {
            tracing::debug!(
                removed,
                remaining = records.len(),
                "Cleaned up expired authentication records"
            );
        }
    }

    /// Number of addresses with a live record.
    pub async fn tracked_count(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Get the configuration.
    pub fn config(&self) -> &AuthRateLimitConfig {
        &self.config
    }

    /// Check if an IP is whitelisted.
    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.config.whitelist.contains(ip)
    }
}

impl Default for AuthRateLimiter {
    fn default() -> Self {
        Self::new(AuthRateLimitConfig::default())
    }
}
