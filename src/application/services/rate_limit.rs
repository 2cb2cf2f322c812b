//! Sliding-Window Rate Limiter
//!
//! Process-local sliding log limiter keyed by arbitrary strings
//! ("msg:alice:Lobby", "quota:alice", ...). Each key owns a deque of event
//! timestamps; a check prunes timestamps older than the window, then either
//! records the new event or reports how long until the oldest one ages out.
//!
//! Per-key atomicity comes from the map's entry guard, so two gateway tasks
//! racing on the same key cannot both claim the last slot.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Whole seconds until a retry can succeed (0 when allowed).
    pub retry_after_seconds: i64,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_seconds: 0,
        }
    }

    fn deny(retry_after_seconds: i64) -> Self {
        Self {
            allowed: false,
            retry_after_seconds: retry_after_seconds.max(1),
        }
    }
}

/// Sliding-window limiter over an in-process timestamp log.
#[derive(Default)]
pub struct SlidingWindowLimiter {
    buckets: DashMap<String, VecDeque<DateTime<Utc>>>,
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and record one event under `key`, allowing at most `limit`
    /// events per `window_seconds`. A non-positive limit or window disables
    /// limiting for the call.
    pub fn check(&self, key: &str, limit: i64, window_seconds: i64) -> RateDecision {
        self.check_at(key, limit, window_seconds, Utc::now())
    }

    pub fn check_at(
        &self,
        key: &str,
        limit: i64,
        window_seconds: i64,
        now: DateTime<Utc>,
    ) -> RateDecision {
        if limit <= 0 || window_seconds <= 0 {
            return RateDecision::allow();
        }

        let window = Duration::seconds(window_seconds);
        let mut entry = self.buckets.entry(key.to_string()).or_default();

        while let Some(&oldest) = entry.front() {
            if now - oldest >= window {
                entry.pop_front();
            } else {
                break;
            }
        }

        if (entry.len() as i64) < limit {
            entry.push_back(now);
            return RateDecision::allow();
        }

        // Deque is non-empty here: limit >= 1 and nothing was admitted.
        let oldest = entry.front().copied().unwrap_or(now);
        let retry_after = window_seconds - (now - oldest).num_seconds();
        RateDecision::deny(retry_after)
    }

    /// Peek without recording. Used for advisory checks that must not
    /// consume a slot.
    pub fn would_allow_at(
        &self,
        key: &str,
        limit: i64,
        window_seconds: i64,
        now: DateTime<Utc>,
    ) -> bool {
        if limit <= 0 || window_seconds <= 0 {
            return true;
        }
        let window = Duration::seconds(window_seconds);
        match self.buckets.get(key) {
            Some(entry) => {
                let live = entry.iter().filter(|&&t| now - t < window).count();
                (live as i64) < limit
            }
            None => true,
        }
    }

    /// Drop all state for a key (user logged out, room torn down).
    pub fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    /// Drop every bucket whose newest event is older than its caller-known
    /// longest window. Called from the periodic sweeper.
    pub fn sweep(&self, max_window_seconds: i64, now: DateTime<Utc>) {
        let horizon = Duration::seconds(max_window_seconds.max(1));
        self.buckets
            .retain(|_, events| events.back().map(|&t| now - t < horizon).unwrap_or(false));
    }
}
