//! Per-client admission control for write requests.
//!
//! Each client + route class gets a token bucket holding up to `burst` tokens
//! and refilling at `rps` tokens per second. A request that finds no token is
//! rejected at once with `429`; nothing waits for tokens. `GET` and `HEAD`
//! are never metered.
//!
//! Buckets live in a [`VisitorRegistry`]; its [`Reaper`] forgets clients that
//! have been idle longer than the TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::header::{HeaderValue, RETRY_AFTER};
use http::{Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RateLimitConfig;
use crate::handler::BoxFuture;
use crate::middleware::client_ip::client_ip;
use crate::middleware::reaper::Reaper;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

// ── TokenBucket ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(rps: f64, burst: u32, now: Instant) -> Self {
        let capacity = f64::from(burst);
        Self { capacity, rate: rps.max(0.0), tokens: capacity, last_refill: now }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Refills for the time elapsed since the last call, then takes one token
    /// if there is one.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one whole token is available. `None` if it never will be,
    /// or if the wait does not fit in a `Duration`.
    pub fn time_until_next_token(&self) -> Option<Duration> {
        if self.tokens >= 1.0 {
            return Some(Duration::ZERO);
        }
        if self.rate <= 0.0 || self.capacity < 1.0 {
            return None;
        }
        Duration::try_from_secs_f64((1.0 - self.tokens) / self.rate).ok()
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

// ── VisitorRegistry ───────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct Visitor {
    bucket: TokenBucket,
    last_seen: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// `retry_after` is `None` when the bucket can never refill (`rps = 0`)
    /// or the wait is too long to express.
    Limited { retry_after: Option<Duration> },
}

/// Concurrent map from visitor key to token bucket.
///
/// Sharded locking: a check locks one shard for the duration of a refill and
/// a decrement, never across an `.await`.
pub struct VisitorRegistry {
    visitors: DashMap<String, Visitor>,
    rps: f64,
    burst: u32,
    ttl: Duration,
}

impl VisitorRegistry {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            visitors: DashMap::new(),
            rps: config.rps,
            burst: config.burst,
            ttl: config.ttl,
        }
    }

    /// Looks up (or creates) the visitor for `key`, marks it seen, and tries
    /// to take a token.
    pub fn check(&self, key: &str, now: Instant) -> Admission {
        let mut visitor = match self.visitors.get_mut(key) {
            Some(v) => v,
            None => self.visitors.entry(key.to_owned()).or_insert_with(|| Visitor {
                bucket: TokenBucket::new(self.rps, self.burst, now),
                last_seen: now,
            }),
        };
        if now > visitor.last_seen {
            visitor.last_seen = now;
        }
        if visitor.bucket.try_acquire(now) {
            Admission::Allowed
        } else {
            Admission::Limited { retry_after: visitor.bucket.time_until_next_token() }
        }
    }

    /// Removes visitors idle for longer than the TTL. Returns how many went.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.visitors.len();
        self.visitors.retain(|_, v| now.saturating_duration_since(v.last_seen) <= self.ttl);
        before.saturating_sub(self.visitors.len())
    }

    pub fn len(&self) -> usize {
        self.visitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visitors.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.visitors.contains_key(key)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

// ── Route classes ─────────────────────────────────────────────────────────────

/// Coarsens request paths into rate-limit classes, so that a burst of asset
/// fetches cannot drain the budget of the login endpoint, and per-file paths
/// do not each get a fresh budget.
#[derive(Clone, Debug)]
pub struct RouteClasses {
    /// `(path prefix, class)`, first match wins.
    prefixes: Vec<(String, String)>,
}

impl RouteClasses {
    pub fn new() -> Self {
        Self { prefixes: Vec::new() }
    }

    pub fn prefix(mut self, prefix: &str, class: &str) -> Self {
        self.prefixes.push((prefix.to_owned(), class.to_owned()));
        self
    }

    pub fn classify<'a>(&'a self, path: &'a str) -> &'a str {
        self.prefixes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map_or(path, |(_, class)| class.as_str())
    }
}

impl Default for RouteClasses {
    fn default() -> Self {
        Self::new()
            .prefix("/assets/", "/assets/*")
            .prefix("/app/login", "/app/login")
    }
}

// ── Middleware ────────────────────────────────────────────────────────────────

/// The rate-limit chain layer. Obtain one from [`RateLimiter::layer`].
#[derive(Clone)]
pub struct RateLimit {
    registry: Arc<VisitorRegistry>,
    classes: Arc<RouteClasses>,
}

impl RateLimit {
    fn key(&self, req: &Request) -> String {
        let ip = client_ip(req.headers(), req.remote_addr());
        format!("{ip}|{}", self.classes.classify(req.path()))
    }
}

fn is_metered(method: &Method) -> bool {
    method != Method::GET && method != Method::HEAD
}

impl Middleware for RateLimit {
    fn handle(&self, req: Request, next: Next) -> BoxFuture {
        if !is_metered(req.method()) {
            return next.run(req);
        }

        let key = self.key(&req);
        match self.registry.check(&key, Instant::now()) {
            Admission::Allowed => next.run(req),
            Admission::Limited { retry_after } => {
                info!(key = %key, req.method = %req.method(), "rate limit exceeded");
                Box::pin(async move { too_many_requests(retry_after) })
            }
        }
    }
}

fn too_many_requests(retry_after: Option<Duration>) -> Response {
    let mut res = Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .text("Too many requests");
    if let Some(wait) = retry_after {
        let secs = wait.as_secs().saturating_add(u64::from(wait.subsec_nanos() > 0));
        res.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs.max(1)));
    }
    res
}

// ── RateLimiter ───────────────────────────────────────────────────────────────

/// Owns the visitor registry and the reaper that keeps it bounded.
///
/// ```rust,no_run
/// # async fn run() {
/// use liner::config::RateLimitConfig;
/// use liner::middleware::RateLimiter;
/// use liner::Router;
///
/// let mut limiter = RateLimiter::new(RateLimitConfig::default());
/// limiter.start_reaper();
/// let app = Router::new().layer(limiter.layer());
/// // ... serve app ...
/// limiter.shutdown().await;
/// # }
/// ```
pub struct RateLimiter {
    registry: Arc<VisitorRegistry>,
    classes: Arc<RouteClasses>,
    reap_interval: Duration,
    reaper: Option<Reaper>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            registry: Arc::new(VisitorRegistry::new(&config)),
            classes: Arc::new(RouteClasses::default()),
            reap_interval: config.reap_interval,
            reaper: None,
        }
    }

    pub fn with_route_classes(mut self, classes: RouteClasses) -> Self {
        self.classes = Arc::new(classes);
        self
    }

    pub fn registry(&self) -> &Arc<VisitorRegistry> {
        &self.registry
    }

    /// A chain layer sharing this limiter's registry.
    pub fn layer(&self) -> RateLimit {
        RateLimit { registry: Arc::clone(&self.registry), classes: Arc::clone(&self.classes) }
    }

    /// Starts the background reaper. Idempotent. Needs a tokio runtime.
    pub fn start_reaper(&mut self) {
        if self.reaper.is_none() {
            self.reaper = Some(Reaper::spawn(
                Arc::clone(&self.registry),
                self.reap_interval,
                CancellationToken::new(),
            ));
        }
    }

    /// Stops the reaper, if running, and waits for it to exit.
    pub async fn shutdown(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.stop().await;
        }
    }
}
