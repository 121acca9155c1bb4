//! Tiered request rate limiting.
//!
//! Every endpoint class gets two budgets, a short window and an hourly
//! cap. Counters live in Redis when it answers, driven through
//! `redis-cli` like the rest of the panel's Redis access, and fall back
//! to flock-guarded JSON files so limiting survives a Redis outage.
//! Clients that keep hammering a limit earn an escalating penalty block.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use lp_core::config::RateLimitConfig;
use lp_core::process::{CommandSpec, ProcessRunner};

/// One request budget: at most `max_requests` per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateTier {
    pub max_requests: u64,
    pub window_secs: i64,
}

const fn tier(max_requests: u64, window_secs: i64) -> RateTier {
    RateTier {
        max_requests,
        window_secs,
    }
}

/// Budgets per endpoint class. Classes not listed use [`DEFAULT_TIERS`].
const ENDPOINT_TIERS: &[(&str, [RateTier; 2])] = &[
    ("auth", [tier(5, 300), tier(10, 3600)]),
    ("login", [tier(3, 300), tier(10, 3600)]),
    ("vhost", [tier(30, 60), tier(200, 3600)]),
    ("database", [tier(20, 60), tier(150, 3600)]),
    ("php_extensions", [tier(10, 60), tier(50, 3600)]),
    ("firewall", [tier(15, 60), tier(100, 3600)]),
    ("redis", [tier(40, 60), tier(500, 3600)]),
    ("system", [tier(100, 60), tier(2000, 3600)]),
    ("settings", [tier(20, 60), tier(200, 3600)]),
];

pub const DEFAULT_TIERS: [RateTier; 2] = [tier(60, 60), tier(1000, 3600)];

/// Budgets for an endpoint class.
pub fn tiers_for(class: &str) -> &'static [RateTier; 2] {
    ENDPOINT_TIERS
        .iter()
        .find(|(name, _)| *name == class)
        .map(|(_, tiers)| tiers)
        .unwrap_or(&DEFAULT_TIERS)
}

fn counter_key(class: &str, identifier: &str, window_secs: i64) -> String {
    format!("rate_limit:{class}:{identifier}:{window_secs}")
}

// ---------------------------------------------------------------------------
// Counter stores
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("Counter backend unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Windowed counter storage.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the post-increment count. The key
    /// expires `window_secs` after its first increment.
    async fn increment(&self, key: &str, window_secs: i64) -> Result<u64, CounterError>;

    /// Current count without incrementing; 0 when absent or expired.
    async fn current(&self, key: &str) -> Result<u64, CounterError>;

    /// Seconds until `key` expires, `None` when absent.
    async fn ttl(&self, key: &str) -> Result<Option<i64>, CounterError>;
}

/// Counter store driving `redis-cli` through the process runner.
pub struct RedisCliStore {
    runner: Arc<dyn ProcessRunner>,
    host: String,
    port: u16,
}

impl RedisCliStore {
    pub fn new(runner: Arc<dyn ProcessRunner>, host: impl Into<String>, port: u16) -> Self {
        Self {
            runner,
            host: host.into(),
            port,
        }
    }

    async fn command(&self, args: &[&str]) -> Result<String, CounterError> {
        let mut spec = CommandSpec::new("redis-cli")
            .arg("-h")
            .arg(&self.host)
            .arg("-p")
            .arg(self.port.to_string());
        for arg in args {
            spec = spec.arg(*arg);
        }
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| CounterError::Unavailable(e.to_string()))?;
        if !output.success() {
            return Err(CounterError::Unavailable(output.output.trim().to_string()));
        }
        Ok(output.output.trim().to_string())
    }

    /// Liveness probe; a dead Redis flips the limiter to file counters.
    pub async fn ping(&self) -> bool {
        matches!(self.command(&["PING"]).await.as_deref(), Ok("PONG"))
    }
}

#[async_trait]
impl CounterStore for RedisCliStore {
    async fn increment(&self, key: &str, window_secs: i64) -> Result<u64, CounterError> {
        let count: u64 = self
            .command(&["INCR", key])
            .await?
            .parse()
            .map_err(|_| CounterError::Unavailable("unexpected INCR reply".to_string()))?;
        // First increment created the key; give it its window.
        if count == 1 {
            self.command(&["EXPIRE", key, &window_secs.to_string()])
                .await?;
        }
        Ok(count)
    }

    async fn current(&self, key: &str) -> Result<u64, CounterError> {
        let reply = self.command(&["GET", key]).await?;
        if reply.is_empty() || reply == "(nil)" {
            return Ok(0);
        }
        reply
            .parse()
            .map_err(|_| CounterError::Unavailable("unexpected GET reply".to_string()))
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>, CounterError> {
        let ttl: i64 = self
            .command(&["TTL", key])
            .await?
            .parse()
            .map_err(|_| CounterError::Unavailable("unexpected TTL reply".to_string()))?;
        Ok((ttl >= 0).then_some(ttl))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CounterRecord {
    count: u64,
    expires: i64,
}

/// Fallback store: one JSON file per key under the panel data dir,
/// exclusive-flocked for the read-modify-write.
pub struct FileCounterStore {
    dir: PathBuf,
}

impl FileCounterStore {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Counter keys contain client addresses; anything outside
    /// `[A-Za-z0-9._-]` becomes `_` before it reaches the filesystem.
    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    fn with_locked<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut std::fs::File) -> std::io::Result<T>,
    ) -> Result<T, CounterError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.path_for(key))?;
        let mut locked = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| CounterError::Unavailable(format!("flock failed: {errno}")))?;
        f(&mut locked).map_err(CounterError::Io)
    }

    fn read_record(file: &mut std::fs::File) -> std::io::Result<Option<CounterRecord>> {
        let mut contents = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut contents)?;
        if contents.trim().is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_str(&contents).ok())
    }

    fn write_record(file: &mut std::fs::File, record: &CounterRecord) -> std::io::Result<()> {
        let body = serde_json::to_string(record).map_err(std::io::Error::other)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(body.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Unlink expired or unreadable counter files. Returns how many were
    /// removed. Called from the maintenance loop.
    pub fn sweep(&self) -> std::io::Result<usize> {
        let now = Utc::now().timestamp();
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let expired = std::fs::read_to_string(&path)
                .ok()
                .and_then(|contents| serde_json::from_str::<CounterRecord>(&contents).ok())
                .is_none_or(|record| record.expires <= now);
            if expired && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// Counter files are a few dozen bytes; the reads and writes run inline
// like the audit file appends do.
#[async_trait]
impl CounterStore for FileCounterStore {
    async fn increment(&self, key: &str, window_secs: i64) -> Result<u64, CounterError> {
        let now = Utc::now().timestamp();
        self.with_locked(key, |file| {
            let record = match Self::read_record(file)? {
                Some(r) if r.expires > now => CounterRecord {
                    count: r.count + 1,
                    expires: r.expires,
                },
                _ => CounterRecord {
                    count: 1,
                    expires: now + window_secs,
                },
            };
            Self::write_record(file, &record)?;
            Ok(record.count)
        })
    }

    async fn current(&self, key: &str) -> Result<u64, CounterError> {
        let now = Utc::now().timestamp();
        self.with_locked(key, |file| {
            Ok(match Self::read_record(file)? {
                Some(r) if r.expires > now => r.count,
                _ => 0,
            })
        })
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>, CounterError> {
        let now = Utc::now().timestamp();
        self.with_locked(key, |file| {
            Ok(match Self::read_record(file)? {
                Some(r) if r.expires > now => Some(r.expires - now),
                _ => None,
            })
        })
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Outcome of a limit check; the HTTP layer turns this into
/// `X-RateLimit-*` headers.
#[derive(Debug, Clone, Serialize)]
pub struct RateStatus {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the governing window resets or a penalty lifts.
    pub reset_secs: i64,
}

impl RateStatus {
    fn allowed(limit: u64, remaining: u64, reset_secs: i64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_secs,
        }
    }

    fn denied(limit: u64, reset_secs: i64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_secs,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PenaltyState {
    breaches: u32,
    blocked_until: i64,
}

/// Penalty exponent is capped so repeat offenders cannot overflow the
/// block arithmetic.
const MAX_PENALTY_EXPONENT: u32 = 10;

pub struct RateLimiter {
    config: RateLimitConfig,
    /// Redis-backed counters; `None` when the panel runs without Redis.
    primary: Option<Arc<dyn CounterStore>>,
    fallback: FileCounterStore,
    penalties: Mutex<HashMap<String, PenaltyState>>,
}

impl RateLimiter {
    pub fn new(
        config: RateLimitConfig,
        primary: Option<Arc<dyn CounterStore>>,
        fallback: FileCounterStore,
    ) -> Self {
        Self {
            config,
            primary,
            fallback,
            penalties: Mutex::new(HashMap::new()),
        }
    }

    /// Count this request against `class` for `identifier` and say
    /// whether it may proceed.
    pub async fn check(&self, class: &str, identifier: &str) -> RateStatus {
        let tiers = tiers_for(class);

        if self.config.whitelist.iter().any(|ip| ip == identifier) {
            return RateStatus::allowed(
                tiers[0].max_requests,
                tiers[0].max_requests,
                tiers[0].window_secs,
            );
        }
        if self.config.blacklist.iter().any(|ip| ip == identifier) {
            debug!(identifier, "Rejected blacklisted client");
            return RateStatus::denied(0, tiers[1].window_secs);
        }

        let now = Utc::now().timestamp();
        let penalty_key = format!("{class}:{identifier}");
        {
            let penalties = self.penalties.lock().await;
            if let Some(state) = penalties.get(&penalty_key) {
                if state.blocked_until > now {
                    return RateStatus::denied(tiers[0].max_requests, state.blocked_until - now);
                }
            }
        }

        // Count against every tier, then report the tightest one.
        let mut tightest: Option<RateStatus> = None;
        for tier in tiers {
            let key = counter_key(class, identifier, tier.window_secs);
            let (count, reset_secs) = self.bump(&key, tier.window_secs).await;

            if count > tier.max_requests {
                let blocked_secs = self.record_breach(&penalty_key, now).await;
                warn!(
                    class,
                    identifier,
                    window_secs = tier.window_secs,
                    "Rate limit exceeded"
                );
                return RateStatus::denied(tier.max_requests, blocked_secs.unwrap_or(reset_secs));
            }

            let remaining = tier.max_requests - count;
            let tighter = tightest
                .as_ref()
                .is_none_or(|status| remaining < status.remaining);
            if tighter {
                tightest = Some(RateStatus::allowed(
                    tier.max_requests,
                    remaining,
                    reset_secs,
                ));
            }
        }

        tightest.unwrap_or(RateStatus::allowed(
            tiers[0].max_requests,
            tiers[0].max_requests,
            tiers[0].window_secs,
        ))
    }

    /// Current standing without consuming a request.
    pub async fn remaining(&self, class: &str, identifier: &str) -> RateStatus {
        let tiers = tiers_for(class);
        let mut tightest: Option<RateStatus> = None;
        for tier in tiers {
            let key = counter_key(class, identifier, tier.window_secs);
            let count = self.peek(&key).await;
            let remaining = tier.max_requests.saturating_sub(count);
            let reset_secs = self.peek_ttl(&key).await.unwrap_or(tier.window_secs);
            let tighter = tightest
                .as_ref()
                .is_none_or(|status| remaining < status.remaining);
            if tighter {
                tightest = Some(RateStatus {
                    allowed: count <= tier.max_requests,
                    limit: tier.max_requests,
                    remaining,
                    reset_secs,
                });
            }
        }
        tightest.unwrap_or(RateStatus::allowed(
            tiers[0].max_requests,
            tiers[0].max_requests,
            tiers[0].window_secs,
        ))
    }

    /// Remove expired penalty entries and expired fallback counter files.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now().timestamp();
        let mut penalties = self.penalties.lock().await;
        penalties.retain(|_, state| state.blocked_until > now);
        drop(penalties);

        match self.fallback.sweep() {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Rate limit counter sweep failed");
                0
            }
        }
    }

    /// Increment through the primary store, falling back to files, and
    /// failing open if both are down.
    async fn bump(&self, key: &str, window_secs: i64) -> (u64, i64) {
        if let Some(ref primary) = self.primary {
            match primary.increment(key, window_secs).await {
                Ok(count) => {
                    let reset = primary.ttl(key).await.ok().flatten().unwrap_or(window_secs);
                    return (count, reset);
                }
                Err(e) => {
                    warn!(error = %e, "Redis counter failed, using file fallback");
                }
            }
        }
        match self.fallback.increment(key, window_secs).await {
            Ok(count) => {
                let reset = self
                    .fallback
                    .ttl(key)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(window_secs);
                (count, reset)
            }
            Err(e) => {
                // Both stores down. A broken limiter must not lock the
                // panel's own operator out.
                warn!(error = %e, "File counter failed, allowing request");
                (0, window_secs)
            }
        }
    }

    async fn peek(&self, key: &str) -> u64 {
        if let Some(ref primary) = self.primary {
            if let Ok(count) = primary.current(key).await {
                return count;
            }
        }
        self.fallback.current(key).await.unwrap_or(0)
    }

    async fn peek_ttl(&self, key: &str) -> Option<i64> {
        if let Some(ref primary) = self.primary {
            if let Ok(ttl) = primary.ttl(key).await {
                return ttl;
            }
        }
        self.fallback.ttl(key).await.ok().flatten()
    }

    /// Record a limit breach; once breaches pass the threshold, block
    /// the client for `penalty_secs` doubled per further breach.
    /// Returns the remaining block in seconds if one is now active.
    async fn record_breach(&self, penalty_key: &str, now: i64) -> Option<i64> {
        let mut penalties = self.penalties.lock().await;
        let state = penalties
            .entry(penalty_key.to_string())
            .or_insert(PenaltyState {
                breaches: 0,
                blocked_until: 0,
            });
        state.breaches += 1;

        if state.breaches < self.config.penalty_threshold {
            return None;
        }

        let excess = (state.breaches - self.config.penalty_threshold).min(MAX_PENALTY_EXPONENT);
        let factor = i64::from(self.config.penalty_multiplier).pow(excess);
        let duration = self.config.penalty_secs.saturating_mul(factor);
        state.blocked_until = now + duration;
        warn!(
            penalty_key,
            breaches = state.breaches,
            blocked_secs = duration,
            "Penalty block applied"
        );
        Some(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lp_core::process::FakeRunner;
    use tempfile::TempDir;

    #[test]
    fn test_tiers_for_known_and_unknown_classes() {
        assert_eq!(tiers_for("login")[0], tier(3, 300));
        assert_eq!(tiers_for("login")[1], tier(10, 3600));
        assert_eq!(tiers_for("system")[0], tier(100, 60));
        assert_eq!(tiers_for("something_else"), &DEFAULT_TIERS);
    }

    #[test]
    fn test_counter_key_format() {
        assert_eq!(
            counter_key("vhost", "203.0.113.9", 60),
            "rate_limit:vhost:203.0.113.9:60"
        );
    }

    #[test]
    fn test_file_store_sanitizes_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileCounterStore::new(dir.path()).unwrap();
        let path = store.path_for("rate_limit:auth:2001:db8::1:300");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "rate_limit_auth_2001_db8__1_300.json");
    }

    #[tokio::test]
    async fn test_file_store_counts_and_expires() {
        let dir = TempDir::new().unwrap();
        let store = FileCounterStore::new(dir.path()).unwrap();

        assert_eq!(store.increment("k", 60).await.unwrap(), 1);
        assert_eq!(store.increment("k", 60).await.unwrap(), 2);
        assert_eq!(store.current("k").await.unwrap(), 2);
        let ttl = store.ttl("k").await.unwrap().unwrap();
        assert!(ttl > 0 && ttl <= 60);

        // Rewind the expiry into the past; the next increment restarts.
        let path = store.path_for("k");
        std::fs::write(&path, r#"{"count":9,"expires":1}"#).unwrap();
        assert_eq!(store.current("k").await.unwrap(), 0);
        assert_eq!(store.increment("k", 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_file_store_sweep_removes_expired() {
        let dir = TempDir::new().unwrap();
        let store = FileCounterStore::new(dir.path()).unwrap();

        store.increment("live", 3600).await.unwrap();
        std::fs::write(store.path_for("dead"), r#"{"count":3,"expires":1}"#).unwrap();
        std::fs::write(store.path_for("garbage"), "not json").unwrap();

        assert_eq!(store.sweep().unwrap(), 2);
        assert!(store.path_for("live").exists());
        assert!(!store.path_for("dead").exists());
    }

    #[tokio::test]
    async fn test_redis_store_increments_and_sets_expiry_once() {
        let runner = Arc::new(FakeRunner::new());
        runner.succeed_with("redis-cli", "1\n");
        let store = RedisCliStore::new(runner.clone(), "127.0.0.1", 6379);

        assert_eq!(store.increment("rate_limit:x:1:60", 60).await.unwrap(), 1);

        let calls = runner.calls_for("redis-cli");
        assert_eq!(calls.len(), 2);
        assert!(calls[0].args.contains(&"INCR".to_string()));
        assert!(calls[1].args.contains(&"EXPIRE".to_string()));
        assert!(calls[1].args.contains(&"60".to_string()));
    }

    #[tokio::test]
    async fn test_redis_store_ping() {
        let runner = Arc::new(FakeRunner::new());
        runner.succeed_with("redis-cli", "PONG\n");
        let store = RedisCliStore::new(runner, "127.0.0.1", 6379);
        assert!(store.ping().await);

        let down = Arc::new(FakeRunner::new());
        down.fail_with("redis-cli", 1, "Could not connect");
        let store = RedisCliStore::new(down, "127.0.0.1", 6379);
        assert!(!store.ping().await);
    }

    fn file_only_limiter(dir: &TempDir, config: RateLimitConfig) -> RateLimiter {
        let fallback = FileCounterStore::new(dir.path()).unwrap();
        RateLimiter::new(config, None, fallback)
    }

    #[tokio::test]
    async fn test_check_denies_after_tier_limit() {
        let dir = TempDir::new().unwrap();
        let config = RateLimitConfig {
            whitelist: Vec::new(),
            ..RateLimitConfig::default()
        };
        let limiter = file_only_limiter(&dir, config);

        // The login tier allows 3 per 300s.
        for expected_remaining in [2, 1, 0] {
            let status = limiter.check("login", "203.0.113.9").await;
            assert!(status.allowed);
            assert_eq!(status.limit, 3);
            assert_eq!(status.remaining, expected_remaining);
        }
        let status = limiter.check("login", "203.0.113.9").await;
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);

        // A different client is unaffected.
        assert!(limiter.check("login", "198.51.100.7").await.allowed);
    }

    #[tokio::test]
    async fn test_whitelist_bypasses_and_blacklist_blocks() {
        let dir = TempDir::new().unwrap();
        let config = RateLimitConfig {
            whitelist: vec!["127.0.0.1".to_string()],
            blacklist: vec!["203.0.113.66".to_string()],
            ..RateLimitConfig::default()
        };
        let limiter = file_only_limiter(&dir, config);

        for _ in 0..10 {
            assert!(limiter.check("login", "127.0.0.1").await.allowed);
        }
        assert!(!limiter.check("system", "203.0.113.66").await.allowed);
    }

    #[tokio::test]
    async fn test_penalty_block_escalates() {
        let dir = TempDir::new().unwrap();
        let config = RateLimitConfig {
            whitelist: Vec::new(),
            penalty_threshold: 1,
            penalty_secs: 600,
            penalty_multiplier: 2,
            ..RateLimitConfig::default()
        };
        let limiter = file_only_limiter(&dir, config);

        // Exhaust the 3-request login budget, then breach once.
        for _ in 0..3 {
            limiter.check("login", "203.0.113.9").await;
        }
        let breach = limiter.check("login", "203.0.113.9").await;
        assert!(!breach.allowed);
        assert_eq!(breach.reset_secs, 600);

        // Still blocked by the penalty, not just the counter.
        let blocked = limiter.check("login", "203.0.113.9").await;
        assert!(!blocked.allowed);
        assert!(blocked.reset_secs > 0);
    }

    #[tokio::test]
    async fn test_remaining_does_not_consume() {
        let dir = TempDir::new().unwrap();
        let config = RateLimitConfig {
            whitelist: Vec::new(),
            ..RateLimitConfig::default()
        };
        let limiter = file_only_limiter(&dir, config);

        limiter.check("vhost", "203.0.113.9").await;
        let first = limiter.remaining("vhost", "203.0.113.9").await;
        let second = limiter.remaining("vhost", "203.0.113.9").await;
        assert_eq!(first.remaining, second.remaining);
        assert_eq!(first.limit, 30);
        assert_eq!(first.remaining, 29);
    }
}
