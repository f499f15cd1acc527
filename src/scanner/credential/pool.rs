use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::limiter::RateLimiter;
use crate::error::{AppError, AppResult};
use crate::models::RateLimitConfig;

/// Quota GitHub grants an authenticated credential per reset window.
const DEFAULT_REMAINING: i64 = 5000;

/// Runtime state for one bearer credential. Lives inside a `DashMap` entry;
/// the entry's shard lock makes in-place mutation race-free, the map-level
/// lock only guards the map shape.
pub struct CredentialState {
    pub remaining: i64,
    pub reset_at: i64,
    pub cooldown_until: i64,
    pub last_used_at: i64,
    pub requests: u64,
    pub successes: u64,
    pub success_rate: f64,
    limiter: Arc<RateLimiter>,
}

/// Snapshot of one credential's state with the bearer string masked, safe to
/// hand to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStateView {
    pub credential: String,
    pub remaining: i64,
    pub reset_at: i64,
    pub cooldown_until: i64,
    pub last_used_at: i64,
    pub requests: u64,
    pub success_rate: f64,
    pub rate_per_minute: f64,
}

pub struct CredentialPool {
    // Insertion order is kept separately so selection scans deterministically.
    credentials: Vec<String>,
    states: DashMap<String, CredentialState>,
    config: RateLimitConfig,
}

impl CredentialPool {
    pub fn new(credentials: Vec<String>, config: RateLimitConfig) -> Self {
        let states = DashMap::new();
        for credential in &credentials {
            states.insert(
                credential.clone(),
                CredentialState {
                    remaining: DEFAULT_REMAINING,
                    reset_at: 0,
                    cooldown_until: 0,
                    last_used_at: 0,
                    requests: 0,
                    successes: 0,
                    success_rate: 0.0,
                    limiter: Arc::new(RateLimiter::new(
                        config.requests_per_minute as f64,
                        config.burst_size,
                    )),
                },
            );
        }
        Self {
            credentials,
            states,
            config,
        }
    }

    /// Returns the highest-scoring available credential.
    ///
    /// A credential in cooldown is never returned. A credential whose reset
    /// time has passed gets its quota refilled in place. An unused credential
    /// short-circuits the scan. Ties break toward the least recently used.
    pub fn pick(&self) -> AppResult<String> {
        let now = Utc::now().timestamp();
        let mut best: Option<(String, f64, i64)> = None;

        for credential in &self.credentials {
            let Some(mut entry) = self.states.get_mut(credential) else {
                continue;
            };

            if entry.cooldown_until > now {
                continue;
            }
            if entry.remaining <= 0 && now > entry.reset_at {
                entry.remaining = DEFAULT_REMAINING;
            }
            if entry.remaining <= 0 {
                continue;
            }
            if entry.requests == 0 {
                return Ok(credential.clone());
            }

            let score = score(&entry, now);
            let better = match &best {
                None => true,
                Some((_, best_score, best_last_used)) => {
                    score > *best_score
                        || (score == *best_score && entry.last_used_at < *best_last_used)
                }
            };
            if better {
                best = Some((credential.clone(), score, entry.last_used_at));
            }
        }

        best.map(|(credential, _, _)| credential)
            .ok_or(AppError::NoCredentialsAvailable)
    }

    /// Blocks on the credential's limiter until a request slot opens.
    pub async fn wait(&self, credential: &str, cancel: &CancellationToken) -> AppResult<()> {
        // Clone the limiter handle out of the map first; holding a shard
        // guard across an await would block every writer on that shard.
        let limiter = self
            .states
            .get(credential)
            .map(|entry| Arc::clone(&entry.limiter))
            .ok_or(AppError::NoCredentialsAvailable)?;
        limiter.acquire(cancel).await
    }

    /// Folds one response into the credential's state: headers, counters,
    /// derived success rate, and (when enabled) the adaptive limiter rate.
    pub fn report(&self, credential: &str, headers: &HeaderMap, ok: bool) {
        let Some(mut entry) = self.states.get_mut(credential) else {
            return;
        };

        entry.last_used_at = Utc::now().timestamp();
        entry.requests += 1;
        if ok {
            entry.successes += 1;
        }
        entry.success_rate = entry.successes as f64 / entry.requests as f64;

        if let Some(remaining) = header_i64(headers, "X-RateLimit-Remaining") {
            entry.remaining = remaining.max(0);
        }
        if let Some(reset) = header_i64(headers, "X-RateLimit-Reset") {
            entry.reset_at = reset;
        }

        if self.config.adaptive_enabled && entry.requests >= 20 {
            let current = entry.limiter.rate_per_minute();
            if entry.success_rate < self.config.success_threshold {
                let effective = entry
                    .limiter
                    .set_rate_per_minute(current / self.config.backoff_multiplier);
                debug!(
                    "Credential {}: reduced rate to {:.1}/min (success rate {:.2})",
                    mask(credential),
                    effective,
                    entry.success_rate
                );
            } else if entry.success_rate > 0.95 {
                let effective = entry.limiter.set_rate_per_minute(current * 1.2);
                debug!(
                    "Credential {}: increased rate to {:.1}/min (success rate {:.2})",
                    mask(credential),
                    effective,
                    entry.success_rate
                );
            }
        }

        debug!(
            "Credential {}: remaining={}, success_rate={:.2}",
            mask(credential),
            entry.remaining,
            entry.success_rate
        );
    }

    /// Puts the credential into cooldown after a 403/429. The cooldown lasts
    /// until the later of `now + cooldown_duration` and the reset header.
    /// Returns the cooldown length in seconds.
    pub fn trip(&self, credential: &str, status: u16, headers: &HeaderMap) -> u64 {
        if status != 403 && status != 429 {
            return 0;
        }
        let Some(mut entry) = self.states.get_mut(credential) else {
            return 0;
        };

        let now = Utc::now().timestamp();
        let fallback = now + self.config.cooldown_duration as i64;
        let reset_at = header_i64(headers, "X-RateLimit-Reset").unwrap_or(0);
        entry.cooldown_until = fallback.max(reset_at);
        entry.remaining = 0;
        if reset_at > 0 {
            entry.reset_at = reset_at;
        }

        let cooldown_secs = (entry.cooldown_until - now).max(0) as u64;
        warn!(
            "Credential {} rate limited (status {}), cooldown for {}s",
            mask(credential),
            status,
            cooldown_secs
        );
        cooldown_secs
    }

    /// Masked per-credential state for the dashboard.
    pub fn states(&self) -> Vec<CredentialStateView> {
        self.credentials
            .iter()
            .filter_map(|credential| {
                self.states.get(credential).map(|entry| CredentialStateView {
                    credential: mask(credential),
                    remaining: entry.remaining,
                    reset_at: entry.reset_at,
                    cooldown_until: entry.cooldown_until,
                    last_used_at: entry.last_used_at,
                    requests: entry.requests,
                    success_rate: entry.success_rate,
                    rate_per_minute: entry.limiter.rate_per_minute(),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

fn score(state: &CredentialState, now: i64) -> f64 {
    let base = state.remaining as f64 / DEFAULT_REMAINING as f64;
    let success_weight = if state.requests > 10 {
        state.success_rate
    } else {
        1.0
    };
    let minutes_idle = (now - state.last_used_at).max(0) as f64 / 60.0;
    base * success_weight * (1.0 + minutes_idle / 60.0)
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
}

/// `ghp_abcdefgh***wxyz`: enough to tell credentials apart, never the
/// full bearer string.
pub fn mask(credential: &str) -> String {
    if credential.len() <= 12 {
        return "***".to_string();
    }
    format!(
        "{}***{}",
        &credential[..8],
        &credential[credential.len() - 4..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn pool(tokens: &[&str]) -> CredentialPool {
        CredentialPool::new(
            tokens.iter().map(|t| t.to_string()).collect(),
            RateLimitConfig::default(),
        )
    }

    fn headers(remaining: i64, reset_at: i64) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(
            "X-RateLimit-Remaining",
            HeaderValue::from_str(&remaining.to_string()).unwrap(),
        );
        map.insert(
            "X-RateLimit-Reset",
            HeaderValue::from_str(&reset_at.to_string()).unwrap(),
        );
        map
    }

    #[test]
    fn unused_credential_is_returned_immediately() {
        let pool = pool(&["ghp_alpha_0000000001", "ghp_beta_00000000002"]);
        let picked = pool.pick().expect("credential");
        assert_eq!(picked, "ghp_alpha_0000000001");
    }

    #[test]
    fn tripped_credential_is_excluded_until_cooldown() {
        let pool = pool(&["ghp_alpha_0000000001"]);
        let reset = Utc::now().timestamp() + 600;
        pool.trip("ghp_alpha_0000000001", 429, &headers(0, reset));
        assert!(matches!(
            pool.pick(),
            Err(AppError::NoCredentialsAvailable)
        ));
    }

    #[test]
    fn trip_cooldown_takes_the_later_of_reset_and_fallback() {
        let pool = pool(&["ghp_alpha_0000000001"]);
        let now = Utc::now().timestamp();

        // Reset far in the future wins over the 300s fallback.
        let secs = pool.trip("ghp_alpha_0000000001", 429, &headers(0, now + 3600));
        assert!(secs > 3000, "cooldown was {}s", secs);

        // Reset in the past falls back to the configured cooldown.
        let pool = pool_with(&["ghp_beta_00000000002"]);
        let secs = pool.trip("ghp_beta_00000000002", 403, &headers(0, now - 100));
        assert!((295..=300).contains(&secs), "cooldown was {}s", secs);
    }

    fn pool_with(tokens: &[&str]) -> CredentialPool {
        pool(tokens)
    }

    #[test]
    fn non_rate_limit_status_does_not_trip() {
        let pool = pool(&["ghp_alpha_0000000001"]);
        assert_eq!(pool.trip("ghp_alpha_0000000001", 500, &HeaderMap::new()), 0);
        assert!(pool.pick().is_ok());
    }

    #[test]
    fn report_updates_remaining_and_success_rate() {
        let pool = pool(&["ghp_alpha_0000000001"]);
        let reset = Utc::now().timestamp() + 900;
        pool.report("ghp_alpha_0000000001", &headers(4200, reset), true);
        pool.report("ghp_alpha_0000000001", &headers(4199, reset), false);

        let states = pool.states();
        assert_eq!(states[0].remaining, 4199);
        assert_eq!(states[0].requests, 2);
        assert!((states[0].success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn pick_prefers_more_remaining_quota() {
        let pool = pool(&["ghp_alpha_0000000001", "ghp_beta_00000000002"]);
        let reset = Utc::now().timestamp() + 900;
        // Both credentials seen; alpha nearly exhausted.
        for _ in 0..12 {
            pool.report("ghp_alpha_0000000001", &headers(100, reset), true);
            pool.report("ghp_beta_00000000002", &headers(4800, reset), true);
        }
        assert_eq!(pool.pick().expect("credential"), "ghp_beta_00000000002");
    }

    #[test]
    fn exhausted_quota_refills_after_reset_time() {
        let pool = pool(&["ghp_alpha_0000000001"]);
        let past_reset = Utc::now().timestamp() - 60;
        pool.report("ghp_alpha_0000000001", &headers(0, past_reset), true);
        // remaining == 0 but the reset time passed, so pick refills.
        let picked = pool.pick().expect("credential after refill");
        assert_eq!(picked, "ghp_alpha_0000000001");
        assert_eq!(pool.states()[0].remaining, DEFAULT_REMAINING);
    }

    #[test]
    fn picked_credential_always_satisfies_availability_invariant() {
        let pool = pool(&["ghp_alpha_0000000001", "ghp_beta_00000000002"]);
        let now = Utc::now().timestamp();
        pool.trip("ghp_alpha_0000000001", 429, &headers(0, now + 600));
        pool.report("ghp_beta_00000000002", &headers(3000, now + 600), true);

        let picked = pool.pick().expect("credential");
        let view = pool
            .states()
            .into_iter()
            .find(|v| v.credential == mask(&picked))
            .expect("state");
        assert!(view.cooldown_until <= now);
        assert!(view.remaining > 0);
    }

    #[test]
    fn adaptive_mode_lowers_rate_on_poor_success() {
        let pool = pool(&["ghp_alpha_0000000001"]);
        let reset = Utc::now().timestamp() + 900;
        // 25 requests, mostly failures: success rate well below 0.8.
        for i in 0..25 {
            pool.report("ghp_alpha_0000000001", &headers(4000, reset), i % 5 == 0);
        }
        let states = pool.states();
        assert!(
            states[0].rate_per_minute < RateLimitConfig::default().requests_per_minute as f64,
            "rate was {:.1}/min",
            states[0].rate_per_minute
        );
        assert!(states[0].rate_per_minute >= super::super::limiter::MIN_RATE_PER_MINUTE);
    }

    #[test]
    fn mask_hides_the_middle_of_the_token() {
        assert_eq!(mask("ghp_abcdefgh123456wxyz"), "ghp_abcd***wxyz");
        assert_eq!(mask("short"), "***");
    }
}
