//! Access-log policy: which requests get a record, at what level, with which
//! fields.
//!
//! Decision procedure for a finished request, in order:
//!
//! 1. Fast (< 1 s), non-failing (< 400) asset requests are dropped when
//!    `asset_skip_fast` is on, except every Nth one if `asset_sample_n > 0`.
//! 2. Fast 2xx non-asset requests are kept with probability
//!    `1 / two_xx_sample_n` when that rate is set.
//! 3. Everything else is kept.
//!
//! Kept records are Error for 5xx, Warn for 4xx or slow requests, Info otherwise.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use http::header::{CONTENT_LENGTH, HeaderName, REFERER, USER_AGENT};
use rand::Rng;
use tracing::level_filters::LevelFilter;

use crate::config::LogConfig;
use crate::middleware::client_ip::client_ip;
use crate::middleware::recorder::ResponseRecord;
use crate::middleware::request_id::RequestId;
use crate::request::Request;

/// Requests at or above this duration are "slow": never sampled away, at least Warn.
pub const SLOW_THRESHOLD: Duration = Duration::from_secs(1);

const TRUNCATION_MARKER: &str = "…";
const REDACTED: &str = "<redacted>";
const MAX_HEADER_VALUES: usize = 3;
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "proxy-authorization",
    "x-api-key",
    "api-key",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warn => LevelFilter::WARN,
            Self::Error => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

/// Source of the 1-in-N draws behind 2xx sampling.
pub trait Sampler: Send + Sync {
    /// True with probability `1 / n`. `n` is never 0.
    fn one_in(&self, n: u32) -> bool;
}

/// [`Sampler`] backed by the thread-local RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRngSampler;

impl Sampler for ThreadRngSampler {
    fn one_in(&self, n: u32) -> bool {
        rand::thread_rng().gen_range(0..n) == 0
    }
}

/// Request fields captured once, on entry.
#[derive(Clone, Debug)]
pub struct RequestMeta {
    pub id: RequestId,
    pub method: String,
    pub path: String,
    pub query: String,
    pub client_ip: String,
    pub user_agent: String,
    pub referrer: String,
    pub content_length: String,
    pub started_at: SystemTime,
}

impl RequestMeta {
    pub fn capture(req: &Request, id: RequestId, max_len: usize) -> Self {
        let header = |name: HeaderName| {
            req.headers().get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
        };
        Self {
            id,
            method: req.method().to_string(),
            path: req.path().to_owned(),
            query: req.query().to_owned(),
            client_ip: client_ip(req.headers(), req.remote_addr()),
            user_agent: truncate(header(USER_AGENT), max_len).into_owned(),
            referrer: truncate(header(REFERER), max_len).into_owned(),
            content_length: header(CONTENT_LENGTH).to_owned(),
            started_at: SystemTime::now(),
        }
    }

    /// Entry time as milliseconds since the Unix epoch.
    pub fn unix_millis(&self) -> u64 {
        self.started_at
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// One access-log record, ready to emit.
#[derive(Debug)]
pub struct LogEvent<'a> {
    pub level: LogLevel,
    pub meta: &'a RequestMeta,
    pub record: ResponseRecord,
    pub duration_ms: u64,
    pub cancelled: bool,
}

macro_rules! event_at {
    ($level:expr, $($rest:tt)+) => {
        match $level {
            LogLevel::Debug => tracing::debug!($($rest)+),
            LogLevel::Info => tracing::info!($($rest)+),
            LogLevel::Warn => tracing::warn!($($rest)+),
            LogLevel::Error => tracing::error!($($rest)+),
        }
    };
}

impl LogEvent<'_> {
    pub fn emit(&self) {
        let m = self.meta;
        event_at!(
            self.level,
            req.id = %m.id,
            req.method = %m.method,
            req.path = %m.path,
            req.query = %m.query,
            req.ip = %m.client_ip,
            req.ua = %m.user_agent,
            req.referer = %m.referrer,
            req.content_length = %m.content_length,
            res.status = self.record.status.as_u16(),
            res.bytes = self.record.bytes,
            duration_ms = self.duration_ms,
            cancelled = self.cancelled,
            "request finished"
        );
    }
}

/// The access-log policy. Construct once and share; the asset counter is
/// per-policy, not process-global.
pub struct LogPolicy {
    config: LogConfig,
    sampler: Arc<dyn Sampler>,
    asset_counter: AtomicU64,
}

impl LogPolicy {
    pub fn new(config: LogConfig) -> Self {
        Self::with_sampler(config, Arc::new(ThreadRngSampler))
    }

    pub fn with_sampler(mut config: LogConfig, sampler: Arc<dyn Sampler>) -> Self {
        for ext in &mut config.asset_exts {
            ext.make_ascii_lowercase();
        }
        Self { config, sampler, asset_counter: AtomicU64::new(0) }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn is_asset(&self, path: &str) -> bool {
        match extension(path) {
            Some(ext) => self.config.asset_exts.iter().any(|e| e.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }

    /// Decides whether a finished request is logged, and at which level.
    pub fn decide(&self, path: &str, status: u16, elapsed: Duration) -> Option<LogLevel> {
        let fast = elapsed < SLOW_THRESHOLD;
        let asset = self.is_asset(path);

        if asset && status < 400 && fast && self.config.asset_skip_fast {
            let n = self.config.asset_sample_n;
            if n == 0 || !every_nth(n, &self.asset_counter) {
                return None;
            }
        } else if !asset && (200..300).contains(&status) && fast && self.config.two_xx_sample_n > 0 {
            if !self.sampler.one_in(self.config.two_xx_sample_n) {
                return None;
            }
        }

        Some(level_for(status, elapsed))
    }

    /// Applies [`decide`](Self::decide) and builds the record to emit, if any.
    pub fn evaluate<'a>(
        &self,
        meta: &'a RequestMeta,
        record: ResponseRecord,
        elapsed: Duration,
    ) -> Option<LogEvent<'a>> {
        let level = self.decide(&meta.path, record.status.as_u16(), elapsed)?;
        Some(LogEvent { level, meta, record, duration_ms: duration_ms(elapsed), cancelled: false })
    }
}

pub fn level_for(status: u16, elapsed: Duration) -> LogLevel {
    if status >= 500 {
        LogLevel::Error
    } else if status >= 400 || elapsed >= SLOW_THRESHOLD {
        LogLevel::Warn
    } else {
        LogLevel::Info
    }
}

/// Whole milliseconds, rounded half away from zero.
pub fn duration_ms(elapsed: Duration) -> u64 {
    (elapsed.as_secs_f64() * 1000.0).round() as u64
}

/// Cuts `s` to at most `max` bytes on a char boundary, ending in `…` when
/// anything was removed. `max == 0` disables truncation.
pub fn truncate(s: &str, max: usize) -> std::borrow::Cow<'_, str> {
    if max == 0 || s.len() <= max {
        return s.into();
    }
    if max <= TRUNCATION_MARKER.len() {
        return s[..floor_char_boundary(s, max)].into();
    }
    let cut = floor_char_boundary(s, max - TRUNCATION_MARKER.len());
    format!("{}{TRUNCATION_MARKER}", &s[..cut]).into()
}

/// Header map safe to log: credentials replaced, long value lists capped.
pub fn sanitize_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for name in headers.keys() {
        let key = name.as_str();
        let values = if SENSITIVE_HEADERS.contains(&key) {
            vec![REDACTED.to_owned()]
        } else {
            let all: Vec<_> = headers.get_all(name).iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            let mut kept: Vec<_> = all.iter().take(MAX_HEADER_VALUES).cloned().collect();
            if all.len() > MAX_HEADER_VALUES {
                kept.push("...(truncated)".to_owned());
            }
            kept
        };
        out.insert(key.to_owned(), values);
    }
    out
}

fn extension(path: &str) -> Option<&str> {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.rfind('.').map(|i| &file[i..]).filter(|ext| ext.len() > 1)
}

fn every_nth(n: u64, counter: &AtomicU64) -> bool {
    if n <= 1 {
        return true;
    }
    (counter.fetch_add(1, Ordering::Relaxed) + 1) % n == 0
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, StatusCode};
    use std::sync::atomic::AtomicUsize;

    /// Answers from a fixed script, then `false` forever.
    struct Scripted {
        answers: Vec<bool>,
        calls: AtomicUsize,
    }

    impl Sampler for Scripted {
        fn one_in(&self, _n: u32) -> bool {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers.get(i).copied().unwrap_or(false)
        }
    }

    fn policy(config: LogConfig) -> LogPolicy {
        LogPolicy::new(config)
    }

    const FAST: Duration = Duration::from_millis(3);

    #[test]
    fn asset_detection_is_case_insensitive() {
        let p = policy(LogConfig::default());
        assert!(p.is_asset("/assets/app.CSS"));
        assert!(p.is_asset("/favicon.ico"));
        assert!(!p.is_asset("/app/routes"));
        assert!(!p.is_asset("/app/v1.2/routes"));
        assert!(!p.is_asset("/assets/file."));
    }

    #[test]
    fn fast_assets_are_skipped_by_default() {
        let p = policy(LogConfig::default());
        assert_eq!(p.decide("/assets/app.js", 200, FAST), None);
        assert_eq!(p.decide("/assets/app.js", 304, FAST), None);
    }

    #[test]
    fn failing_or_slow_assets_are_logged() {
        let p = policy(LogConfig::default());
        assert_eq!(p.decide("/assets/app.js", 404, FAST), Some(LogLevel::Warn));
        assert_eq!(p.decide("/assets/app.js", 200, SLOW_THRESHOLD), Some(LogLevel::Warn));
    }

    #[test]
    fn asset_sampling_logs_every_nth_by_position() {
        let p = policy(LogConfig { asset_sample_n: 5, ..LogConfig::default() });
        let logged: Vec<usize> = (1..=20)
            .filter(|_| p.decide("/assets/logo.png", 200, FAST).is_some())
            .collect();
        assert_eq!(logged, [5, 10, 15, 20]);
    }

    #[test]
    fn asset_sampling_is_exact_across_threads() {
        let p = policy(LogConfig { asset_sample_n: 5, ..LogConfig::default() });
        let logged = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..250 {
                        if p.decide("/assets/logo.png", 200, FAST).is_some() {
                            logged.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(logged.into_inner(), 8 * 250 / 5);
    }

    #[test]
    fn assets_are_logged_when_skipping_is_off() {
        let p = policy(LogConfig { asset_skip_fast: false, ..LogConfig::default() });
        assert_eq!(p.decide("/assets/app.js", 200, FAST), Some(LogLevel::Info));
    }

    #[test]
    fn two_xx_sampling_draws_per_request() {
        let sampler = Arc::new(Scripted { answers: vec![false, true, false], calls: AtomicUsize::new(0) });
        let config = LogConfig { two_xx_sample_n: 3, ..LogConfig::default() };
        let p = LogPolicy::with_sampler(config, sampler.clone());

        assert_eq!(p.decide("/app/routes", 200, FAST), None);
        assert_eq!(p.decide("/app/routes", 201, FAST), Some(LogLevel::Info));
        assert_eq!(p.decide("/app/routes", 204, FAST), None);
        assert_eq!(sampler.calls.load(Ordering::SeqCst), 3);

        // Never sampled: errors, redirects, slow requests.
        assert_eq!(p.decide("/app/routes", 500, FAST), Some(LogLevel::Error));
        assert_eq!(p.decide("/app/routes", 302, FAST), Some(LogLevel::Info));
        assert_eq!(p.decide("/app/routes", 200, SLOW_THRESHOLD), Some(LogLevel::Warn));
        assert_eq!(sampler.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn thread_rng_one_in_one_always_fires() {
        assert!((0..100).all(|_| ThreadRngSampler.one_in(1)));
    }

    #[test]
    fn levels() {
        assert_eq!(level_for(200, FAST), LogLevel::Info);
        assert_eq!(level_for(302, FAST), LogLevel::Info);
        assert_eq!(level_for(429, FAST), LogLevel::Warn);
        assert_eq!(level_for(200, Duration::from_secs(2)), LogLevel::Warn);
        assert_eq!(level_for(503, FAST), LogLevel::Error);
        assert_eq!(level_for(503, Duration::from_secs(2)), LogLevel::Error);
    }

    #[test]
    fn duration_rounds_to_nearest_millisecond() {
        assert_eq!(duration_ms(Duration::from_micros(400)), 0);
        assert_eq!(duration_ms(Duration::from_micros(1500)), 2);
        assert_eq!(duration_ms(Duration::from_millis(1234)), 1234);
    }

    #[test]
    fn truncate_marks_and_respects_char_boundaries() {
        assert_eq!(truncate("short", 120), "short");
        assert_eq!(truncate("abcdefghij", 0), "abcdefghij");
        assert_eq!(truncate("abcdefghij", 6), "abc…");
        assert_eq!(truncate("abcdefghij", 2), "ab");
        let cut = truncate("ééééé", 6);
        assert!(cut.len() <= 6);
        assert_eq!(cut, "é…");
    }

    #[test]
    fn sensitive_headers_are_redacted_and_lists_capped() {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_static("Bearer secret"));
        h.insert("cookie", HeaderValue::from_static("char=9001"));
        h.insert("x-api-key", HeaderValue::from_static("k"));
        for v in ["a", "b", "c", "d"] {
            h.append("accept", HeaderValue::from_static(v));
        }
        let clean = sanitize_headers(&h);

        assert_eq!(clean["authorization"], ["<redacted>"]);
        assert_eq!(clean["cookie"], ["<redacted>"]);
        assert_eq!(clean["x-api-key"], ["<redacted>"]);
        assert_eq!(clean["accept"], ["a", "b", "c", "...(truncated)"]);
        assert!(!format!("{clean:?}").contains("secret"));
    }

    #[test]
    fn evaluate_fills_the_event() {
        let req: Request = http::Request::get("/app/routes?page=2")
            .header("user-agent", "x".repeat(300))
            .body(bytes::Bytes::new())
            .unwrap()
            .into();
        let meta = RequestMeta::capture(&req, RequestId::generate(), 120);
        assert_eq!(meta.query, "page=2");
        assert!(meta.user_agent.len() <= 120);
        assert!(meta.user_agent.ends_with('…'));

        let p = policy(LogConfig::default());
        let record = ResponseRecord { status: StatusCode::NOT_FOUND, bytes: 9, wrote_header: true };
        let event = p.evaluate(&meta, record, Duration::from_millis(12)).unwrap();
        assert_eq!(event.level, LogLevel::Warn);
        assert_eq!(event.duration_ms, 12);
        assert_eq!(event.record.bytes, 9);
    }

    #[test]
    fn level_names_parse() {
        assert_eq!("DEBUG".parse(), Ok(LogLevel::Debug));
        assert_eq!("warning".parse(), Ok(LogLevel::Warn));
        assert_eq!("verbose".parse::<LogLevel>(), Err(()));
    }
}
