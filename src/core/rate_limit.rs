//! Per-client token-bucket rate limiting.
//!
//! Buckets are keyed by `(client_ip, rate, burst)` so a route-level
//! override and the global limit never share a budget. The store is a
//! plain map behind a shared/exclusive lock: the hot path takes the
//! shared lock for the limit lookup and bucket fetch, and only first
//! sight of a key upgrades to the exclusive lock. The token bucket is
//! internally synchronized and consulted after the store lock is
//! released. No lock is held across an await anywhere in this module.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

use ipnet::IpNet;

use crate::{
    config::{RateLimitConfig, RouteConfig},
    core::routing::matches_prefix,
};

/// How long a bucket may sit idle before the sweeper evicts it.
const IDLE_EVICTION: Duration = Duration::from_secs(180);
/// Sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// `last_seen` is refreshed at most this often to keep eviction honest
/// with minimal write traffic.
const TOUCH_GRANULARITY_SECS: u64 = 60;

/// Admission decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Reject {
        retry_after_secs: u64,
        route_label: String,
    },
}

/// A standard token bucket: refills continuously at `rate` tokens/sec up
/// to `burst`, spends one token per request.
struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst: f64::from(burst),
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }

    fn allow(&self) -> bool {
        let mut state = self.state.lock().expect("token bucket poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// One client's bucket plus its eviction bookkeeping.
struct ClientBucket {
    bucket: TokenBucket,
    /// Seconds since limiter start; coarse on purpose.
    last_seen_secs: AtomicU64,
}

impl ClientBucket {
    fn new(rate: f64, burst: u32, now_secs: u64) -> Self {
        Self {
            bucket: TokenBucket::new(rate, burst),
            last_seen_secs: AtomicU64::new(now_secs),
        }
    }

    fn touch(&self, now_secs: u64) {
        let last = self.last_seen_secs.load(Ordering::Relaxed);
        if now_secs.saturating_sub(last) >= TOUCH_GRANULARITY_SECS {
            self.last_seen_secs.store(now_secs, Ordering::Relaxed);
        }
    }
}

/// Bucket identity. Value-compared; the rate rides along as raw bits so
/// the key stays `Eq + Hash` without string formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BucketKey {
    ip: IpAddr,
    rate_bits: u64,
    burst: u32,
}

struct LimiterState {
    rate: f64,
    burst: u32,
    routes: Vec<RouteConfig>,
    buckets: HashMap<BucketKey, Arc<ClientBucket>>,
}

impl LimiterState {
    /// One pass over the route table: the effective limit (longest
    /// matching `rate_override`, else global) and the matched prefix for
    /// the rejection metric label.
    fn limits_for_path(&self, path: &str) -> (f64, u32, String) {
        let mut best_override: Option<&RateLimitConfig> = None;
        let mut best_override_len = 0;
        let mut best_label: Option<&str> = None;
        let mut best_label_len = 0;

        for route in &self.routes {
            if !matches_prefix(path, &route.path_prefix) {
                continue;
            }
            let len = route.path_prefix.len();
            if len > best_label_len {
                best_label_len = len;
                best_label = Some(&route.path_prefix);
            }
            if let Some(rate) = &route.rate_override {
                if len > best_override_len {
                    best_override_len = len;
                    best_override = Some(rate);
                }
            }
        }

        let label = best_label.unwrap_or("global").to_string();
        match best_override {
            Some(rate) => (rate.requests_per_second, rate.burst_size, label),
            None => (self.rate, self.burst, label),
        }
    }
}

/// Per-client rate limiter with trusted-proxy client-IP resolution.
pub struct RateLimiter {
    started: Instant,
    trusted: Vec<IpNet>,
    state: RwLock<LimiterState>,
}

impl RateLimiter {
    pub fn new(
        cfg: &RateLimitConfig,
        routes: &[RouteConfig],
        trusted_proxies: &[String],
    ) -> Self {
        let trusted = trusted_proxies
            .iter()
            .filter_map(|cidr| match cidr.parse::<IpNet>() {
                Ok(net) => Some(net),
                Err(e) => {
                    tracing::warn!(cidr = %cidr, error = %e, "invalid trusted proxy CIDR, skipping");
                    None
                }
            })
            .collect();

        Self {
            started: Instant::now(),
            trusted,
            state: RwLock::new(LimiterState {
                rate: cfg.requests_per_second,
                burst: cfg.burst_size,
                routes: routes.to_vec(),
                buckets: HashMap::new(),
            }),
        }
    }

    /// Resolve the client IP to attribute the request to. `X-Forwarded-For`
    /// is consulted only when the direct peer is a trusted proxy: walk the
    /// list right-to-left and take the first hop that is not itself
    /// trusted. If every hop is trusted, fall through to the peer.
    pub fn resolve_client_ip(&self, peer: IpAddr, xff: Option<&str>) -> IpAddr {
        if self.trusted.is_empty() || !self.is_trusted(peer) {
            return peer;
        }
        if let Some(xff) = xff {
            for part in xff.rsplit(',') {
                if let Ok(ip) = part.trim().parse::<IpAddr>() {
                    if !self.is_trusted(ip) {
                        return ip;
                    }
                }
            }
        }
        peer
    }

    fn is_trusted(&self, ip: IpAddr) -> bool {
        self.trusted.iter().any(|net| net.contains(&ip))
    }

    /// Admit or reject one request.
    pub fn allow(&self, peer: IpAddr, xff: Option<&str>, path: &str) -> Decision {
        let ip = self.resolve_client_ip(peer, xff);
        let now_secs = self.started.elapsed().as_secs();

        // Fast path: shared lock covers the limit lookup and the bucket
        // fetch for already-seen clients.
        let (rate, burst, label, existing) = {
            let state = self.state.read().expect("limiter state poisoned");
            let (rate, burst, label) = state.limits_for_path(path);
            let key = BucketKey {
                ip,
                rate_bits: rate.to_bits(),
                burst,
            };
            (rate, burst, label, state.buckets.get(&key).cloned())
        };

        let bucket = match existing {
            Some(bucket) => bucket,
            None => {
                let mut state = self.state.write().expect("limiter state poisoned");
                state
                    .buckets
                    .entry(BucketKey {
                        ip,
                        rate_bits: rate.to_bits(),
                        burst,
                    })
                    .or_insert_with(|| Arc::new(ClientBucket::new(rate, burst, now_secs)))
                    .clone()
            }
        };

        bucket.touch(now_secs);

        if bucket.bucket.allow() {
            Decision::Allow
        } else {
            tracing::warn!(client_ip = %ip, path = %path, "rate limit exceeded");
            Decision::Reject {
                retry_after_secs: ((1.0 / rate).ceil() as u64).max(1),
                route_label: label,
            }
        }
    }

    /// Apply new limits on hot reload. Takes the exclusive lock, replaces
    /// rate/burst/routes, and clears the bucket map so the new limits take
    /// effect on the next request.
    pub fn update(&self, cfg: &RateLimitConfig, routes: &[RouteConfig]) {
        let mut state = self.state.write().expect("limiter state poisoned");
        state.rate = cfg.requests_per_second;
        state.burst = cfg.burst_size;
        state.routes = routes.to_vec();
        state.buckets.clear();
    }

    /// Remove buckets idle longer than `max_idle`.
    pub fn sweep(&self, max_idle: Duration) {
        let now_secs = self.started.elapsed().as_secs();
        let cutoff = max_idle.as_secs();
        let mut state = self.state.write().expect("limiter state poisoned");
        state.buckets.retain(|_, bucket| {
            now_secs.saturating_sub(bucket.last_seen_secs.load(Ordering::Relaxed)) <= cutoff
        });
    }

    /// Background sweeper evicting stale buckets every minute.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                limiter.sweep(IDLE_EVICTION);
            }
        })
    }

    /// Snapshot for the admin API.
    pub fn stats(&self) -> LimiterStats {
        let state = self.state.read().expect("limiter state poisoned");
        LimiterStats {
            active_clients: state.buckets.len(),
            requests_per_second: state.rate,
            burst_size: state.burst,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LimiterStats {
    pub active_clients: usize,
    pub requests_per_second: f64,
    pub burst_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn limiter(rps: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(
            &RateLimitConfig {
                requests_per_second: rps,
                burst_size: burst,
            },
            &[],
            &[],
        )
    }

    #[test]
    fn burst_then_reject_with_retry_after() {
        let limiter = limiter(1.0, 2);
        let ip = peer("203.0.113.1");

        assert_eq!(limiter.allow(ip, None, "/x"), Decision::Allow);
        assert_eq!(limiter.allow(ip, None, "/x"), Decision::Allow);
        match limiter.allow(ip, None, "/x") {
            Decision::Reject {
                retry_after_secs,
                route_label,
            } => {
                assert_eq!(retry_after_secs, 1);
                assert_eq!(route_label, "global");
            }
            Decision::Allow => panic!("third request should be rejected"),
        }
    }

    #[test]
    fn fractional_rate_rounds_retry_after_up() {
        let limiter = limiter(0.5, 1);
        let ip = peer("203.0.113.1");
        assert_eq!(limiter.allow(ip, None, "/x"), Decision::Allow);
        match limiter.allow(ip, None, "/x") {
            Decision::Reject {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 2),
            Decision::Allow => panic!("should be rejected"),
        }
    }

    #[test]
    fn xff_ignored_when_peer_not_trusted() {
        let limiter = limiter(1.0, 2);
        let ip = peer("203.0.113.1");

        // Different XFF values must share one bucket: the default trust
        // list is empty so the header is ignored outright.
        assert_eq!(limiter.allow(ip, Some("1.1.1.1"), "/x"), Decision::Allow);
        assert_eq!(limiter.allow(ip, Some("2.2.2.2"), "/x"), Decision::Allow);
        assert!(matches!(
            limiter.allow(ip, Some("3.3.3.3"), "/x"),
            Decision::Reject { .. }
        ));
    }

    #[test]
    fn xff_walked_right_to_left_when_trusted() {
        let limiter = RateLimiter::new(
            &RateLimitConfig::default(),
            &[],
            &["10.0.0.0/8".to_string()],
        );
        let resolved =
            limiter.resolve_client_ip(peer("10.1.2.3"), Some("203.0.113.9, 10.1.2.4"));
        assert_eq!(resolved, peer("203.0.113.9"));
    }

    #[test]
    fn all_trusted_hops_fall_through_to_peer() {
        let limiter = RateLimiter::new(
            &RateLimitConfig::default(),
            &[],
            &["10.0.0.0/8".to_string()],
        );
        let resolved = limiter.resolve_client_ip(peer("10.1.2.3"), Some("10.9.9.9, 10.1.2.4"));
        assert_eq!(resolved, peer("10.1.2.3"));
    }

    #[test]
    fn untrusted_peer_keeps_peer_ip() {
        let limiter = RateLimiter::new(
            &RateLimitConfig::default(),
            &[],
            &["10.0.0.0/8".to_string()],
        );
        let resolved = limiter.resolve_client_ip(peer("203.0.113.1"), Some("8.8.8.8"));
        assert_eq!(resolved, peer("203.0.113.1"));
    }

    #[test]
    fn route_override_uses_longest_match_and_label() {
        let routes = vec![
            RouteConfig {
                path_prefix: "/api".to_string(),
                backend: "http://a".to_string(),
                ..Default::default()
            },
            RouteConfig {
                path_prefix: "/api/limited".to_string(),
                backend: "http://b".to_string(),
                rate_override: Some(RateLimitConfig {
                    requests_per_second: 1.0,
                    burst_size: 1,
                }),
                ..Default::default()
            },
        ];
        let limiter = RateLimiter::new(&RateLimitConfig::default(), &routes, &[]);
        let ip = peer("203.0.113.1");

        assert_eq!(limiter.allow(ip, None, "/api/limited/x"), Decision::Allow);
        match limiter.allow(ip, None, "/api/limited/x") {
            Decision::Reject { route_label, .. } => assert_eq!(route_label, "/api/limited"),
            Decision::Allow => panic!("override burst of 1 should reject the second request"),
        }

        // The sibling path runs under the generous global limit.
        assert_eq!(limiter.allow(ip, None, "/api/other"), Decision::Allow);
    }

    #[test]
    fn distinct_limits_use_distinct_buckets() {
        let routes = vec![RouteConfig {
            path_prefix: "/tight".to_string(),
            backend: "http://a".to_string(),
            rate_override: Some(RateLimitConfig {
                requests_per_second: 1.0,
                burst_size: 1,
            }),
            ..Default::default()
        }];
        let limiter = RateLimiter::new(
            &RateLimitConfig {
                requests_per_second: 100.0,
                burst_size: 50,
            },
            &routes,
            &[],
        );
        let ip = peer("203.0.113.1");

        assert_eq!(limiter.allow(ip, None, "/tight"), Decision::Allow);
        assert!(matches!(
            limiter.allow(ip, None, "/tight"),
            Decision::Reject { .. }
        ));
        // Exhausting the override bucket must not touch the global one.
        assert_eq!(limiter.allow(ip, None, "/other"), Decision::Allow);
    }

    #[test]
    fn update_replaces_limits_and_clears_buckets() {
        let limiter = limiter(1.0, 1);
        let ip = peer("203.0.113.1");

        assert_eq!(limiter.allow(ip, None, "/x"), Decision::Allow);
        assert!(matches!(
            limiter.allow(ip, None, "/x"),
            Decision::Reject { .. }
        ));

        limiter.update(
            &RateLimitConfig {
                requests_per_second: 200.0,
                burst_size: 50,
            },
            &[],
        );

        assert_eq!(limiter.stats().requests_per_second, 200.0);
        assert_eq!(limiter.stats().active_clients, 0);
        assert_eq!(limiter.allow(ip, None, "/x"), Decision::Allow);
    }

    #[test]
    fn sweep_evicts_idle_buckets() {
        let limiter = limiter(10.0, 10);
        let ip = peer("203.0.113.1");
        assert_eq!(limiter.allow(ip, None, "/x"), Decision::Allow);
        assert_eq!(limiter.stats().active_clients, 1);

        // A fresh bucket survives the sweep.
        limiter.sweep(IDLE_EVICTION);
        assert_eq!(limiter.stats().active_clients, 1);

        // Zero tolerance evicts everything not touched this second.
        {
            let state = limiter.state.read().unwrap();
            for bucket in state.buckets.values() {
                bucket.last_seen_secs.store(0, Ordering::Relaxed);
            }
        }
        std::thread::sleep(Duration::from_millis(1100));
        limiter.sweep(Duration::from_secs(0));
        assert_eq!(limiter.stats().active_clients, 0);
    }

    #[test]
    fn touch_is_coarse() {
        let bucket = ClientBucket::new(1.0, 1, 100);
        // Within the granularity window the timestamp must not move.
        bucket.touch(130);
        assert_eq!(bucket.last_seen_secs.load(Ordering::Relaxed), 100);
        bucket.touch(160);
        assert_eq!(bucket.last_seen_secs.load(Ordering::Relaxed), 160);
    }
}
