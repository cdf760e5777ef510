//! Process configuration.
//!
//! Read once at startup from the environment and immutable afterwards. Every
//! value is optional: a missing variable keeps its default, and a malformed one
//! logs a warning and keeps its default rather than aborting startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::middleware::access_log::LogLevel;

/// Extensions treated as static assets by the access log.
pub const DEFAULT_ASSET_EXTS: &[&str] = &[
    ".css", ".js", ".map", ".png", ".jpg", ".jpeg", ".webp", ".ico", ".svg", ".gif", ".woff",
    ".woff2", ".ttf",
];

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub log: LogConfig,
    pub rate_limit: RateLimitConfig,
}

/// Access-log policy and log sink settings.
#[derive(Clone, Debug)]
pub struct LogConfig {
    pub file: PathBuf,
    pub level: LogLevel,
    /// Lower-case, dot-prefixed extensions.
    pub asset_exts: Vec<String>,
    /// Drop fast, successful asset requests from the access log.
    pub asset_skip_fast: bool,
    /// When skipping assets, still log every Nth one. 0 disables.
    pub asset_sample_n: u64,
    /// Log unremarkable 2xx API requests with probability 1/N. 0 disables.
    pub two_xx_sample_n: u32,
    /// Cap for user-agent and referrer fields, in bytes.
    pub max_ua_ref_len: usize,
    /// Include the sanitised request headers in the debug start record.
    pub log_headers: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("app.log"),
            level: LogLevel::Info,
            asset_exts: DEFAULT_ASSET_EXTS.iter().map(|e| (*e).to_owned()).collect(),
            asset_skip_fast: true,
            asset_sample_n: 0,
            two_xx_sample_n: 0,
            max_ua_ref_len: 120,
            log_headers: false,
        }
    }
}

/// Per-client token bucket settings.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Tokens refilled per second.
    pub rps: f64,
    /// Bucket capacity; also the initial token count.
    pub burst: u32,
    /// Idle time after which a visitor is forgotten.
    pub ttl: Duration,
    /// How often the reaper sweeps idle visitors.
    pub reap_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rps: 5.0,
            burst: 10,
            ttl: Duration::from_secs(10 * 60),
            reap_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { port: 8080, log: LogConfig::default(), rate_limit: RateLimitConfig::default() }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from any key → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let env = Env { lookup: &lookup };

        env.parse("APP_PORT", &mut cfg.port, |_| true);

        let log = &mut cfg.log;
        if let Some(file) = env.get("LOG_FILE") {
            log.file = PathBuf::from(file);
        }
        env.parse("LOG_LEVEL", &mut log.level, |_| true);
        env.parse_with("LOG_ASSET_SKIP_FAST", &mut log.asset_skip_fast, parse_bool);
        env.parse("LOG_ASSET_SAMPLE_N", &mut log.asset_sample_n, |_| true);
        env.parse("LOG_2XX_SAMPLE_N", &mut log.two_xx_sample_n, |_| true);
        env.parse("LOG_UA_REF_MAXLEN", &mut log.max_ua_ref_len, |n| *n > 0);
        env.parse_with("LOG_HEADERS", &mut log.log_headers, parse_bool);
        if let Some(exts) = env.get("LOG_ASSET_EXTS") {
            log.asset_exts = parse_exts(&exts);
        }

        let rl = &mut cfg.rate_limit;
        env.parse("RATE_LIMIT_RPS", &mut rl.rps, |r| r.is_finite() && *r >= 0.0);
        env.parse("RATE_LIMIT_BURST", &mut rl.burst, |_| true);
        let mut secs = rl.ttl.as_secs();
        env.parse("RATE_LIMIT_TTL_SECS", &mut secs, |s| *s > 0);
        rl.ttl = Duration::from_secs(secs);
        let mut secs = rl.reap_interval.as_secs();
        env.parse("RATE_LIMIT_REAP_SECS", &mut secs, |s| *s > 0);
        rl.reap_interval = Duration::from_secs(secs);

        cfg
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, slot: &mut T, valid: impl Fn(&T) -> bool) {
        self.parse_with(key, slot, |raw| raw.parse().ok().filter(|v| valid(v)));
    }

    fn parse_with<T>(&self, key: &str, slot: &mut T, parse: impl Fn(&str) -> Option<T>) {
        let Some(raw) = self.get(key) else { return };
        match parse(raw.trim()) {
            Some(value) => *slot = value,
            None => warn!(key, value = %raw, "ignoring invalid configuration value, keeping default"),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn parse_exts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|e| e.trim().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .map(|e| if e.starts_with('.') { e } else { format!(".{e}") })
        .collect()
}
