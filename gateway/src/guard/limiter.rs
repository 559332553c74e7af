use super::decision::{DenyReason, Verdict};
use super::rule::TokenBucketRule;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Per-key token bucket for one `TokenBucket` rule instance.
///
/// Each key owns its own `tokio::sync::Mutex`, so the refill + consume of one
/// key is atomic while different keys never wait on each other. The map is
/// sharded (`DashMap`); there is no lock spanning all keys.
///
/// A bucket starts full (`capacity`) and refills continuously at
/// `refill_rate / interval` tokens per second, clamped at `capacity`. A denied
/// consume leaves the bucket untouched: the refill clock is not reset and
/// fractional tokens keep accumulating.
///
/// **GC**: buckets idle for `idle_ttl` are evicted by [`evict_stale`]. An
/// idle bucket is full again after `full_refill_secs`, so the TTL is never set
/// below that and eviction never hands a caller tokens it would not have had.
/// `max_entries` caps the map: a new key arriving at the cap runs one eviction
/// pass down to the low-water mark (90% of the cap), so the full scan is paid
/// once per batch of new keys, not per request. Only one caller evicts at a
/// time; others insert without waiting, which may overshoot the cap by the
/// number of concurrent inserts.
///
/// [`evict_stale`]: TokenBucketLimiter::evict_stale
pub struct TokenBucketLimiter {
    rule: TokenBucketRule,
    buckets: DashMap<String, Arc<Bucket>>,
    settings: LimiterSettings,
    /// Reference point for `last_access` stamps.
    epoch: Instant,
    /// Set while an inline eviction pass runs.
    evicting: AtomicBool,
}

struct Bucket {
    state: Mutex<BucketState>,
    /// Last access in microseconds since `epoch` (for GC). Updated outside the lock.
    last_access: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct LimiterSettings {
    pub max_entries: usize,
    pub idle_ttl: Duration,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            idle_ttl: Duration::from_secs(DEFAULT_IDLE_TTL_SECS),
        }
    }
}

/// Outcome of one consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Consumed {
    pub verdict: Verdict,
    pub remaining: f64,
    /// Set on denial: time until one whole token is available (min 1s).
    pub retry_after: Option<Duration>,
}

const DEFAULT_MAX_ENTRIES: usize = 100_000;
const DEFAULT_IDLE_TTL_SECS: u64 = 300;

impl TokenBucketLimiter {
    pub fn new(rule: TokenBucketRule) -> Self {
        Self::with_settings(rule, LimiterSettings::default())
    }

    pub fn with_settings(rule: TokenBucketRule, settings: LimiterSettings) -> Self {
        let min_ttl = Duration::from_secs_f64(rule.full_refill_secs().ceil());
        let settings = LimiterSettings {
            max_entries: settings.max_entries.max(1),
            idle_ttl: settings.idle_ttl.max(min_ttl),
        };
        Self {
            rule,
            buckets: DashMap::new(),
            settings,
            epoch: Instant::now(),
            evicting: AtomicBool::new(false),
        }
    }

    pub fn rule(&self) -> &TokenBucketRule {
        &self.rule
    }

    pub fn settings(&self) -> LimiterSettings {
        self.settings
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub async fn consume(&self, key: &str) -> Consumed {
        self.consume_at(key, Instant::now()).await
    }

    /// Consume one token for `key` as of `now`.
    pub async fn consume_at(&self, key: &str, now: Instant) -> Consumed {
        let bucket = self.bucket(key, now);
        bucket.last_access.store(self.stamp(now), Ordering::Relaxed);

        // No await between reading and writing the state: dropping this
        // future while it waits for the lock charges nothing.
        let mut state = bucket.state.lock().await;
        let capacity = self.rule.capacity as f64;
        let rate = self.rule.rate_per_sec();

        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        let available = (state.tokens + elapsed * rate).min(capacity);

        if available >= 1.0 {
            state.tokens = available - 1.0;
            state.last_refill = state.last_refill.max(now);
            Consumed {
                verdict: Verdict::Allow,
                remaining: state.tokens,
                retry_after: None,
            }
        } else {
            Consumed {
                verdict: Verdict::Deny(DenyReason::RateLimited),
                remaining: available,
                retry_after: Some(retry_after(available, rate)),
            }
        }
    }

    /// Snapshot of a key's bucket, if one exists.
    pub async fn state(&self, key: &str) -> Option<BucketState> {
        let bucket = self.buckets.get(key)?.value().clone();
        let state = *bucket.state.lock().await;
        Some(state)
    }

    fn bucket(&self, key: &str, now: Instant) -> Arc<Bucket> {
        // Fast path: key already exists, no allocation.
        if let Some(entry) = self.buckets.get(key) {
            return entry.value().clone();
        }

        if self.buckets.len() >= self.settings.max_entries
            && self
                .evicting
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            let evicted = self.evict_at(now, self.low_water());
            self.evicting.store(false, Ordering::Release);
            metrics::counter!("guard_limiter_evictions_total").increment(evicted as u64);
        }

        let capacity = self.rule.capacity as f64;
        let stamp = self.stamp(now);
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Bucket {
                    state: Mutex::new(BucketState {
                        tokens: capacity,
                        last_refill: now,
                    }),
                    last_access: AtomicU64::new(stamp),
                })
            })
            .clone()
    }

    fn stamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    /// Spawn a background tokio task that periodically evicts stale buckets.
    /// `policy` labels the bucket gauge. The task ends when the limiter is dropped.
    pub fn start_gc(self: &Arc<Self>, every: Duration, policy: String) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let evicted = limiter.evict_stale();
                if evicted > 0 {
                    metrics::counter!("guard_limiter_evictions_total").increment(evicted as u64);
                    tracing::debug!(policy = %policy, evicted, "limiter gc");
                }
                metrics::gauge!("guard_limiter_buckets", "policy" => policy.clone())
                    .set(limiter.len() as f64);
            }
        });
    }

    /// Evict idle buckets, then force the map under the cap. Returns the
    /// number of evicted entries.
    pub fn evict_stale(&self) -> usize {
        self.evict_stale_at(Instant::now())
    }

    pub fn evict_stale_at(&self, now: Instant) -> usize {
        self.evict_at(now, self.settings.max_entries)
    }

    /// Entry count an inline eviction pass brings the map down to.
    fn low_water(&self) -> usize {
        let cap = self.settings.max_entries;
        cap - (cap / 10).max(1)
    }

    /// Drop idle buckets, then least recently used ones until at most
    /// `target` remain.
    fn evict_at(&self, now: Instant, target: usize) -> usize {
        let before = self.buckets.len();
        let now_us = self.stamp(now);
        let ttl_us = self.settings.idle_ttl.as_micros() as u64;

        self.buckets.retain(|_, v| {
            now_us.saturating_sub(v.last_access.load(Ordering::Relaxed)) < ttl_us
        });

        if self.buckets.len() > target {
            self.force_evict(target);
        }

        before.saturating_sub(self.buckets.len())
    }

    fn force_evict(&self, target: usize) {
        let overflow = self.buckets.len().saturating_sub(target);
        if overflow == 0 {
            return;
        }
        let mut entries: Vec<(u64, String)> = self
            .buckets
            .iter()
            .map(|r| (r.value().last_access.load(Ordering::Relaxed), r.key().clone()))
            .collect();
        // Oldest `overflow` stamps end up in front; no full sort needed.
        if overflow < entries.len() {
            entries.select_nth_unstable_by_key(overflow, |(stamp, _)| *stamp);
        }
        for (_, key) in entries.into_iter().take(overflow) {
            self.buckets.remove(&key);
        }
    }
}

fn retry_after(available: f64, rate: f64) -> Duration {
    if rate <= 0.0 {
        return Duration::from_secs(1);
    }
    let wait = ((1.0 - available) / rate).ceil();
    Duration::from_secs(wait.max(1.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(refill_rate: u32, interval: u64, capacity: u32) -> TokenBucketLimiter {
        TokenBucketLimiter::new(TokenBucketRule::new(refill_rate, interval, capacity))
    }

    #[tokio::test]
    async fn test_new_key_starts_full() {
        let l = limiter(60, 60, 60);
        let c = l.consume("10.0.0.1").await;
        assert_eq!(c.verdict, Verdict::Allow);
        assert_eq!(c.remaining, 59.0);
    }

    #[tokio::test]
    async fn test_sixty_first_instant_consume_is_denied() {
        let l = limiter(60, 60, 60);
        let now = Instant::now();
        for i in 0..60 {
            let c = l.consume_at("k", now).await;
            assert_eq!(c.verdict, Verdict::Allow, "consume {} should pass", i);
        }
        let c = l.consume_at("k", now).await;
        assert_eq!(c.verdict, Verdict::Deny(DenyReason::RateLimited));
        assert_eq!(c.retry_after, Some(Duration::from_secs(1)));

        let later = now + Duration::from_secs(1);
        assert_eq!(l.consume_at("k", later).await.verdict, Verdict::Allow);
    }

    #[tokio::test]
    async fn test_denied_consume_does_not_reset_refill_clock() {
        let retried = limiter(1, 10, 1);
        let clean = limiter(1, 10, 1);
        let t0 = Instant::now();

        assert_eq!(retried.consume_at("k", t0).await.verdict, Verdict::Allow);
        assert_eq!(clean.consume_at("k", t0).await.verdict, Verdict::Allow);

        // Hit the empty bucket repeatedly while it refills.
        for s in 1..10 {
            let c = retried.consume_at("k", t0 + Duration::from_secs(s)).await;
            assert!(c.verdict.is_deny());
        }

        let t = t0 + Duration::from_secs(10);
        let a = retried.consume_at("k", t).await;
        let b = clean.consume_at("k", t).await;
        assert_eq!(a.verdict, Verdict::Allow);
        assert_eq!(b.verdict, Verdict::Allow);
        assert_eq!(a.remaining, b.remaining);

        let sa = retried.state("k").await.unwrap();
        let sb = clean.state("k").await.unwrap();
        assert_eq!(sa.tokens, sb.tokens);
        assert_eq!(sa.last_refill, sb.last_refill);
    }

    #[tokio::test]
    async fn test_denied_consume_leaves_state_untouched() {
        let l = limiter(1, 60, 1);
        let t0 = Instant::now();
        l.consume_at("k", t0).await;
        let before = l.state("k").await.unwrap();

        let c = l.consume_at("k", t0 + Duration::from_secs(30)).await;
        assert!(c.verdict.is_deny());
        assert!((c.remaining - 0.5).abs() < 1e-9);

        let after = l.state("k").await.unwrap();
        assert_eq!(before.tokens, after.tokens);
        assert_eq!(before.last_refill, after.last_refill);
    }

    #[tokio::test]
    async fn test_tokens_never_exceed_capacity() {
        let l = limiter(5, 1, 3);
        let t0 = Instant::now();
        l.consume_at("k", t0).await;
        let c = l.consume_at("k", t0 + Duration::from_secs(3600)).await;
        assert_eq!(c.verdict, Verdict::Allow);
        assert_eq!(c.remaining, 2.0);

        let mut t = t0 + Duration::from_secs(3600);
        for _ in 0..50 {
            t += Duration::from_millis(37);
            let c = l.consume_at("k", t).await;
            assert!(c.remaining >= 0.0);
            assert!(c.remaining <= 3.0);
        }
    }

    #[tokio::test]
    async fn test_different_keys_independent() {
        let l = limiter(2, 60, 2);
        let now = Instant::now();
        assert!(!l.consume_at("a", now).await.verdict.is_deny());
        assert!(!l.consume_at("a", now).await.verdict.is_deny());
        assert!(l.consume_at("a", now).await.verdict.is_deny());

        let b = l.consume_at("b", now).await;
        assert_eq!(b.verdict, Verdict::Allow);
        assert_eq!(b.remaining, 1.0);
    }

    #[tokio::test]
    async fn test_out_of_order_timestamps_do_not_underflow() {
        let l = limiter(1, 1, 2);
        let t0 = Instant::now();
        l.consume_at("k", t0 + Duration::from_secs(5)).await;
        let c = l.consume_at("k", t0).await;
        assert_eq!(c.verdict, Verdict::Allow);
        assert_eq!(c.remaining, 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumes_never_overdraw() {
        let l = Arc::new(limiter(1, 3600, 20));
        let now = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..100 {
            let l = l.clone();
            handles.push(tokio::spawn(async move { l.consume_at("shared", now).await }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap().verdict == Verdict::Allow {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 20);
    }

    #[tokio::test]
    async fn test_idle_ttl_never_below_full_refill() {
        let l = TokenBucketLimiter::with_settings(
            TokenBucketRule::new(1, 60, 10),
            LimiterSettings {
                max_entries: 10,
                idle_ttl: Duration::from_secs(5),
            },
        );
        assert_eq!(l.settings().idle_ttl, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_evicts_idle_buckets() {
        let l = TokenBucketLimiter::with_settings(
            TokenBucketRule::new(10, 1, 10),
            LimiterSettings {
                max_entries: 100,
                idle_ttl: Duration::from_secs(60),
            },
        );
        let t0 = Instant::now();
        l.consume_at("old", t0).await;
        l.consume_at("fresh", t0 + Duration::from_secs(100)).await;

        let evicted = l.evict_stale_at(t0 + Duration::from_secs(120));
        assert_eq!(evicted, 1);
        assert!(l.state("old").await.is_none());
        assert!(l.state("fresh").await.is_some());
    }

    #[tokio::test]
    async fn test_map_bounded_under_key_churn() {
        let l = TokenBucketLimiter::with_settings(
            TokenBucketRule::new(10, 1, 10),
            LimiterSettings {
                max_entries: 50,
                idle_ttl: Duration::from_secs(3600),
            },
        );
        let t0 = Instant::now();
        for i in 0..1_000u64 {
            let key = format!("198.51.100.{}", i);
            l.consume_at(&key, t0 + Duration::from_micros(i)).await;
            assert!(l.len() <= 50, "len {} exceeded cap", l.len());
        }
        // Most recent keys survive.
        assert!(l.state("198.51.100.999").await.is_some());
    }

    #[tokio::test]
    async fn test_eviction_at_cap_runs_in_batches() {
        let l = TokenBucketLimiter::with_settings(
            TokenBucketRule::new(10, 1, 10),
            LimiterSettings {
                max_entries: 100,
                idle_ttl: Duration::from_secs(3600),
            },
        );
        let t0 = Instant::now();
        for i in 0..100u64 {
            l.consume_at(&format!("k{}", i), t0 + Duration::from_micros(i)).await;
        }
        assert_eq!(l.len(), 100);

        // First key past the cap drops the ten oldest, then inserts.
        l.consume_at("k100", t0 + Duration::from_micros(100)).await;
        assert_eq!(l.len(), 91);
        assert!(l.state("k9").await.is_none());
        assert!(l.state("k10").await.is_some());

        let mut passes = 1;
        let mut last_len = l.len();
        for i in 101..1_100u64 {
            l.consume_at(&format!("k{}", i), t0 + Duration::from_micros(i)).await;
            if l.len() < last_len {
                passes += 1;
            }
            last_len = l.len();
            assert!(l.len() <= 100);
        }
        // 1000 new keys at the cap, ten freed per pass.
        assert!(passes <= 100, "{} eviction passes", passes);
        assert!(l.state("k1099").await.is_some());
    }

    #[test]
    fn test_low_water_mark() {
        let with_cap = |max_entries| {
            TokenBucketLimiter::with_settings(
                TokenBucketRule::new(1, 1, 1),
                LimiterSettings {
                    max_entries,
                    idle_ttl: Duration::from_secs(60),
                },
            )
            .low_water()
        };
        assert_eq!(with_cap(100_000), 90_000);
        assert_eq!(with_cap(5), 4);
        assert_eq!(with_cap(1), 0);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after(0.0, 1.0), Duration::from_secs(1));
        assert_eq!(retry_after(0.25, 0.1), Duration::from_secs(8));
        assert_eq!(retry_after(0.99, 100.0), Duration::from_secs(1));
    }
}
