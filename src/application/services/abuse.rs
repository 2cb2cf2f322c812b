//! Abuse Engine
//!
//! Strike accumulation with automatic mutes, per-room slowmode, and the
//! plaintext message heuristics (URL/mention flooding, near-duplicate spam).
//! Every denial anywhere in the message path feeds a strike back in here;
//! enough strikes inside the window and the engine issues a timed mute
//! through the sanctions port.
//!
//! All state is process-local. The only durable side effect is the mute row
//! written via `Sanctions::apply_auto_mute`.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::application::services::rate_limit::RateDecision;
use crate::config::LimitSettings;
use crate::domain::{knob_or, PermissionChecker, RuntimeSettings, SanctionKind, Sanctions};
use crate::infrastructure::metrics;
use crate::shared::error::AppError;

/// Holders of this permission are exempt from rate limiting and auto-mute.
pub const EXEMPT_PERMISSION: &str = "moderation.exempt";

/// Slowmode entries older than this are swept regardless of room settings.
const SLOWMODE_SWEEP_HORIZON_SECS: i64 = 3600;

/// Heuristic rejection of a room message. Each variant carries the
/// machine-readable reason string sent back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageViolation {
    TooManyUrls,
    TooManyMentions,
    DuplicateMessage,
}

impl MessageViolation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TooManyUrls => "too_many_urls",
            Self::TooManyMentions => "too_many_mentions",
            Self::DuplicateMessage => "duplicate_message",
        }
    }
}

#[derive(Default)]
struct StrikeRecord {
    times: VecDeque<DateTime<Utc>>,
    last_auto_mute: Option<DateTime<Utc>>,
}

pub struct AbuseEngine {
    strikes: DashMap<String, StrikeRecord>,
    /// (user, room) -> timestamp of the last accepted message.
    slowmode: DashMap<(String, String), DateTime<Utc>>,
    /// (user, room) -> rolling history of normalized-message digests.
    dup_history: DashMap<(String, String), VecDeque<(DateTime<Utc>, [u8; 32])>>,
    sanctions: Arc<dyn Sanctions>,
    permissions: Arc<dyn PermissionChecker>,
    runtime: Arc<dyn RuntimeSettings>,
    /// Static defaults; every threshold is re-resolved against the
    /// runtime-settings port on each check so admin changes apply live.
    limits: LimitSettings,
}

impl AbuseEngine {
    pub fn new(
        sanctions: Arc<dyn Sanctions>,
        permissions: Arc<dyn PermissionChecker>,
        runtime: Arc<dyn RuntimeSettings>,
        limits: LimitSettings,
    ) -> Self {
        Self {
            strikes: DashMap::new(),
            slowmode: DashMap::new(),
            dup_history: DashMap::new(),
            sanctions,
            permissions,
            runtime,
            limits,
        }
    }

    /// Record one strike against a user. Returns true iff this strike
    /// tripped an automatic mute.
    pub async fn record_strike(&self, username: &str, reason: &str) -> Result<bool, AppError> {
        self.record_strike_at(username, reason, Utc::now()).await
    }

    pub async fn record_strike_at(
        &self,
        username: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        if self.permissions.has_permission(username, EXEMPT_PERMISSION).await? {
            return Ok(false);
        }

        let window_seconds = knob_or(
            &*self.runtime,
            "strike_window_seconds",
            self.limits.strike_window_seconds,
        )
        .await;
        let threshold = knob_or(
            &*self.runtime,
            "strikes_before_mute",
            self.limits.strikes_before_mute,
        )
        .await;
        let window = Duration::seconds(window_seconds);

        // Prune, record, and claim the mute cooldown in one entry guard so
        // two concurrent strikes cannot both decide to mute.
        let should_mute = {
            let mut record = self.strikes.entry(username.to_string()).or_default();
            while let Some(&oldest) = record.times.front() {
                if now - oldest > window {
                    record.times.pop_front();
                } else {
                    break;
                }
            }
            record.times.push_back(now);

            let cooled_down = record
                .last_auto_mute
                .map(|t| now - t > window)
                .unwrap_or(true);

            if (record.times.len() as i64) >= threshold && cooled_down {
                record.last_auto_mute = Some(now);
                true
            } else {
                false
            }
        };

        tracing::debug!(username = username, reason = reason, "Strike recorded");

        if !should_mute {
            return Ok(false);
        }

        // An existing mute (moderator-issued or a racing process) is not
        // stacked; the claimed cooldown still suppresses re-triggering.
        if self.sanctions.is_sanctioned(username, SanctionKind::Mute).await? {
            return Ok(false);
        }

        let minutes = knob_or(
            &*self.runtime,
            "auto_mute_minutes",
            self.limits.auto_mute_minutes,
        )
        .await;
        self.sanctions.apply_auto_mute(username, minutes).await?;
        metrics::AUTO_MUTES_TOTAL.inc();

        tracing::warn!(
            username = username,
            reason = reason,
            minutes = minutes,
            "Auto-mute issued"
        );

        Ok(true)
    }

    /// Staff exemption from rate limiting, shared with the gateway's
    /// message path.
    pub async fn is_exempt(&self, username: &str) -> Result<bool, AppError> {
        self.permissions.has_permission(username, EXEMPT_PERMISSION).await
    }

    /// Enforce a room's slowmode interval. On admission the last-sent
    /// timestamp advances; a denial leaves it untouched and reports the
    /// remaining wait.
    pub fn check_slowmode(&self, username: &str, room: &str, interval_seconds: i64) -> RateDecision {
        self.check_slowmode_at(username, room, interval_seconds, Utc::now())
    }

    pub fn check_slowmode_at(
        &self,
        username: &str,
        room: &str,
        interval_seconds: i64,
        now: DateTime<Utc>,
    ) -> RateDecision {
        if interval_seconds <= 0 {
            return RateDecision {
                allowed: true,
                retry_after_seconds: 0,
            };
        }

        match self.slowmode.entry((username.to_string(), room.to_string())) {
            Entry::Occupied(mut occupied) => {
                let elapsed = now - *occupied.get();
                if elapsed < Duration::seconds(interval_seconds) {
                    let remaining = interval_seconds - elapsed.num_seconds();
                    RateDecision {
                        allowed: false,
                        retry_after_seconds: remaining.max(1),
                    }
                } else {
                    occupied.insert(now);
                    RateDecision {
                        allowed: true,
                        retry_after_seconds: 0,
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                RateDecision {
                    allowed: true,
                    retry_after_seconds: 0,
                }
            }
        }
    }

    /// Apply the plaintext heuristics to a room message. Returns the first
    /// violation found, or None if the message is clean. Only unencrypted
    /// payloads are ever screened; callers skip this for E2E content.
    pub async fn screen_message(
        &self,
        username: &str,
        room: &str,
        text: &str,
    ) -> Option<MessageViolation> {
        self.screen_message_at(username, room, text, Utc::now()).await
    }

    pub async fn screen_message_at(
        &self,
        username: &str,
        room: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Option<MessageViolation> {
        let max_urls = knob_or(
            &*self.runtime,
            "max_urls_per_message",
            self.limits.max_urls_per_message,
        )
        .await;
        if count_urls(text) > max_urls {
            return Some(MessageViolation::TooManyUrls);
        }

        let max_mentions = knob_or(
            &*self.runtime,
            "max_mentions_per_message",
            self.limits.max_mentions_per_message,
        )
        .await;
        if count_mentions(text) > max_mentions {
            return Some(MessageViolation::TooManyMentions);
        }

        let dup_max = knob_or(&*self.runtime, "dup_msg_max", self.limits.dup_msg_max).await;
        let dup_window = knob_or(
            &*self.runtime,
            "dup_msg_window_seconds",
            self.limits.dup_msg_window_seconds,
        )
        .await;
        let dup_min_len =
            knob_or(&*self.runtime, "dup_msg_min_len", self.limits.dup_msg_min_len).await;
        if self.is_duplicate_at(username, room, text, dup_max, dup_window, dup_min_len, now) {
            return Some(MessageViolation::DuplicateMessage);
        }
        None
    }

    /// Near-duplicate detection over a short rolling digest history. Short
    /// messages are never flagged ("ok", "lol" and friends).
    #[allow(clippy::too_many_arguments)]
    fn is_duplicate_at(
        &self,
        username: &str,
        room: &str,
        text: &str,
        dup_max: i64,
        window_seconds: i64,
        min_len: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let normalized = normalize_message(text);
        if (normalized.chars().count() as i64) < min_len {
            return false;
        }

        let digest: [u8; 32] = Sha256::digest(normalized.as_bytes()).into();
        let window = Duration::seconds(window_seconds);

        let mut history = self
            .dup_history
            .entry((username.to_string(), room.to_string()))
            .or_default();

        while let Some(&(oldest, _)) = history.front() {
            if now - oldest > window {
                history.pop_front();
            } else {
                break;
            }
        }

        let repeats = history.iter().filter(|(_, h)| *h == digest).count() as i64;
        history.push_back((now, digest));

        repeats >= dup_max
    }

    /// Drop state nothing can act on anymore. Called from the periodic
    /// sweeper alongside the limiter's own sweep. Horizons track the live
    /// knobs so a widened window does not lose strikes to pruning.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        let strike_window = Duration::seconds(
            knob_or(
                &*self.runtime,
                "strike_window_seconds",
                self.limits.strike_window_seconds,
            )
            .await,
        );
        self.strikes.retain(|_, record| {
            let live_strikes = record.times.back().map(|&t| now - t <= strike_window);
            let live_cooldown = record.last_auto_mute.map(|t| now - t <= strike_window);
            live_strikes.unwrap_or(false) || live_cooldown.unwrap_or(false)
        });

        let dup_window = Duration::seconds(
            knob_or(
                &*self.runtime,
                "dup_msg_window_seconds",
                self.limits.dup_msg_window_seconds,
            )
            .await,
        );
        self.dup_history.retain(|_, history| {
            history.back().map(|&(t, _)| now - t <= dup_window).unwrap_or(false)
        });

        let slowmode_horizon = Duration::seconds(SLOWMODE_SWEEP_HORIZON_SECS);
        self.slowmode.retain(|_, &mut t| now - t <= slowmode_horizon);
    }
}

/// Lowercase and collapse runs of whitespace to single spaces.
fn normalize_message(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn count_urls(text: &str) -> i64 {
    text.split_whitespace()
        .filter(|token| {
            let t = token.to_lowercase();
            t.starts_with("http://")
                || t.starts_with("https://")
                || t.starts_with("www.")
                || t.starts_with("magnet:?")
        })
        .count() as i64
}

fn count_mentions(text: &str) -> i64 {
    text.split_whitespace()
        .filter(|token| token.starts_with('@') && token.len() > 1)
        .count() as i64
}
