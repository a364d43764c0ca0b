use dashmap::DashMap;
use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Websocket upgrade attempts per window.
    pub connect_limit: u32,
    /// Login/registration calls per window.
    pub credentials_limit: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            connect_limit: 30,
            credentials_limit: 10,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateClass {
    Connect,
    Credentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limited, retry after {retry_after_secs}s")]
pub struct RateLimited {
    pub retry_after_secs: u64,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: u32,
    last_refill: Instant,
    last_seen: Instant,
    limit: u32,
    window: Duration,
}

impl TokenBucket {
    fn new(limit: u32, window: Duration) -> Self {
        let now = Instant::now();
        Self {
            tokens: limit,
            last_refill: now,
            last_seen: now,
            limit,
            window,
        }
    }

    fn check(&mut self) -> bool {
        let now = Instant::now();
        self.last_seen = now;
        let elapsed = now.duration_since(self.last_refill);

        if elapsed >= self.window {
            self.tokens = self.limit;
            self.last_refill = now;
        } else {
            let refill = (self.limit as f64 * elapsed.as_secs_f64() / self.window.as_secs_f64()) as u32;
            // Only move the refill mark when a token was actually credited,
            // otherwise frequent callers would never accumulate one.
            if refill > 0 {
                self.tokens = (self.tokens + refill).min(self.limit);
                self.last_refill = now;
            }
        }

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    fn retry_after(&self) -> u64 {
        let elapsed = Instant::now().duration_since(self.last_refill);
        let per_token = self.window.as_secs_f64() / f64::from(self.limit.max(1));
        let wait = (per_token - elapsed.as_secs_f64()).ceil();
        (wait as u64).max(1)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<(IpAddr, RateClass), Mutex<TokenBucket>>>,
    config: RateLimitConfig,
    allowlist: Arc<DashMap<IpAddr, ()>>,
    blocklist: Arc<DashMap<IpAddr, ()>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            config,
            allowlist: Arc::new(DashMap::new()),
            blocklist: Arc::new(DashMap::new()),
        }
    }

    fn limit_for(&self, class: RateClass) -> u32 {
        match class {
            RateClass::Connect => self.config.connect_limit,
            RateClass::Credentials => self.config.credentials_limit,
        }
    }

    pub async fn check(&self, ip: IpAddr, class: RateClass) -> Result<(), RateLimited> {
        if self.blocklist.contains_key(&ip) {
            return Err(RateLimited {
                retry_after_secs: self.config.window_secs,
            });
        }

        if self.allowlist.contains_key(&ip) {
            return Ok(());
        }

        let window = Duration::from_secs(self.config.window_secs);
        let limit = self.limit_for(class);
        let bucket = self
            .buckets
            .entry((ip, class))
            .or_insert_with(|| Mutex::new(TokenBucket::new(limit, window)));

        let mut bucket = bucket.lock().await;
        if bucket.check() {
            Ok(())
        } else {
            Err(RateLimited {
                retry_after_secs: bucket.retry_after(),
            })
        }
    }

    /// Load allow/block entries, skipping anything that is not an IP address.
    pub fn apply_lists(&self, allowlist: &[String], blocklist: &[String]) {
        for ip in allowlist {
            match ip.parse() {
                Ok(ip) => self.add_to_allowlist(ip),
                Err(_) => tracing::warn!(entry = %ip, "ignoring invalid allowlist entry"),
            }
        }
        for ip in blocklist {
            match ip.parse() {
                Ok(ip) => self.add_to_blocklist(ip),
                Err(_) => tracing::warn!(entry = %ip, "ignoring invalid blocklist entry"),
            }
        }
    }

    pub fn add_to_allowlist(&self, ip: IpAddr) {
        self.allowlist.insert(ip, ());
    }

    pub fn add_to_blocklist(&self, ip: IpAddr) {
        self.blocklist.insert(ip, ());
    }

    pub fn remove_from_blocklist(&self, ip: IpAddr) {
        self.blocklist.remove(&ip);
    }

    /// Drop buckets nobody has hit for `idle`. A bucket idle for a full
    /// window is back at its limit, so forgetting it changes no verdict.
    /// Returns how many were removed.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.get_mut().last_seen.elapsed() < idle);
        before.saturating_sub(self.buckets.len())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }
}
