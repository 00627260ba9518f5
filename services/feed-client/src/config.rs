//! Configuration for the feed client
//!
//! `ClientConfig` carries the connection endpoint, credential and timing
//! knobs of one client instance. `AppConfig` adds what the binary needs to
//! drive the streams (symbols, quote window, proposal parameters, record
//! directory) and is loaded from `FEED_*` environment variables.

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use types::ids::Symbol;
use types::market::DurationUnit;

use crate::protocol::ProposalParams;

/// Default public endpoint (app id appended by `ClientConfig::for_app`).
pub const DEFAULT_ENDPOINT: &str = "wss://ws.derivws.com/websockets/v3";

/// Public demo application id.
pub const DEFAULT_APP_ID: u32 = 1089;

/// Fixed delay between connect attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Idle time after which the sender injects a keepalive ping.
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(20);

/// Delay inserted before the next transmission after a rate-limit reply.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(1);

/// Bound on a one-shot candle fetch.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection and timing configuration for one client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full WebSocket URL including the `app_id` query parameter.
    pub endpoint: String,
    /// API token; `None` or blank connects anonymously.
    pub token: Option<String>,
    pub reconnect_interval: Duration,
    pub keepalive_idle: Duration,
    pub rate_limit_backoff: Duration,
    pub fetch_timeout: Duration,
    /// Capacity of the live price broadcast channel.
    pub price_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::for_app(DEFAULT_APP_ID)
    }
}

impl ClientConfig {
    /// Default endpoint for the given application id.
    pub fn for_app(app_id: u32) -> Self {
        Self {
            endpoint: format!("{}?app_id={}", DEFAULT_ENDPOINT, app_id),
            token: None,
            reconnect_interval: RECONNECT_INTERVAL,
            keepalive_idle: KEEPALIVE_IDLE,
            rate_limit_backoff: RATE_LIMIT_BACKOFF,
            fetch_timeout: FETCH_TIMEOUT,
            price_channel_capacity: 1024,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_keepalive_idle(mut self, idle: Duration) -> Self {
        self.keepalive_idle = idle;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// The configured credential, ignoring blank values.
    pub fn credential(&self) -> Option<&str> {
        self.token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Process-level configuration for the `feed-client` binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub client: ClientConfig,
    pub symbols: Vec<Symbol>,
    /// Minutes of history backfilled per symbol before subscribing to ticks.
    pub quote_window_minutes: u32,
    /// Proposal stream parameters; `None` skips the proposal stream.
    pub proposal: Option<ProposalParams>,
    /// Root directory for daily tick record files; `None` disables recording.
    pub record_dir: Option<PathBuf>,
    /// Interval between snapshot log lines.
    pub report_interval: Duration,
}

impl AppConfig {
    /// Load from `FEED_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let app_id = env_u32("FEED_APP_ID", DEFAULT_APP_ID);
        let mut client = ClientConfig::for_app(app_id);
        if let Ok(endpoint) = env::var("FEED_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                client.endpoint = endpoint.trim().to_string();
            }
        }
        client.token = env::var("FEED_TOKEN").ok().filter(|t| !t.trim().is_empty());

        let symbols = parse_symbols_csv(&env_string("FEED_SYMBOLS", "R_50,R_100"));
        let quote_window_minutes = env_u32("FEED_QUOTE_WINDOW", 60);

        let proposal = if env_bool("FEED_PROPOSALS", true) {
            Some(ProposalParams {
                amount: env_f64("FEED_PROPOSAL_AMOUNT", 10.0),
                duration: env_u32("FEED_PROPOSAL_DURATION", 5),
                duration_unit: DurationUnit::parse(&env_string("FEED_PROPOSAL_UNIT", "m"))
                    .unwrap_or(DurationUnit::Minutes),
                currency: env_string("FEED_CURRENCY", "USD"),
            })
        } else {
            None
        };

        let record_dir = env::var("FEED_RECORD_DIR")
            .ok()
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from);

        Self {
            client,
            symbols,
            quote_window_minutes,
            proposal,
            record_dir,
            report_interval: Duration::from_secs(env_u64("FEED_REPORT_SECS", 30)),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

// Values that do not fit fall back to the default.
fn env_u32(key: &str, default: u32) -> u32 {
    u32::try_from(env_u64(key, u64::from(default))).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

/// Split a comma-separated symbol list, dropping blanks and duplicates.
///
/// Venue symbols are case-sensitive, so names are kept as written.
pub fn parse_symbols_csv(raw: &str) -> Vec<Symbol> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for part in raw.split(',') {
        if let Some(symbol) = Symbol::try_new(part) {
            if seen.insert(symbol.clone()) {
                out.push(symbol);
            }
        }
    }
    out
}
