// =============================================================================
// Engine configuration: environment-driven settings with logged resolution
// =============================================================================
//
// Every tunable is read once at startup from the environment (after a
// best-effort `.env` load in main). Invalid values fall back to the default
// with a warning rather than aborting startup.
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::types::DataSourceKind;

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/backfill_cache")
}

fn default_history_dir() -> PathBuf {
    PathBuf::from("data/history")
}

fn default_tick() -> Decimal {
    Decimal::new(1, 1) // 0.1
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CHUNK_MINUTES: i64 = 10;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_RATE_LIMIT_THRESHOLD: u32 = 3;
const DEFAULT_COOLDOWN_SECONDS: u64 = 60;
const DEFAULT_PUBLIC_DELAY_MS: u64 = 75;
const DEFAULT_CACHE_RETENTION_DAYS: u32 = 14;
const DEFAULT_PAGE_LIMIT: usize = 1000;
const DEFAULT_MAX_ITERATIONS_PER_CHUNK: u32 = 500;

/// Chunk-pool width per client mode. The authenticated tier gets the wider
/// pool; test mode is always serial.
const CONCURRENCY_AUTHENTICATED: usize = 8;
const CONCURRENCY_PUBLIC: usize = 4;

// =============================================================================
// Env parsing helpers
// =============================================================================

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key) {
        None => default,
        Some(raw) => match parse_bool(&raw) {
            Some(b) => b,
            None => {
                warn!(key, value = %raw, default, "unparseable boolean, using default");
                default
            }
        },
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T
where
    T: std::fmt::Display + Copy,
{
    match env_string(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, %default, "unparseable value, using default");
                default
            }
        },
    }
}

// =============================================================================
// Settings groups
// =============================================================================

/// Connection settings for the exchange REST client.
#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    pub symbol: String,
    pub api_key: Option<String>,
    pub secret: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
}

/// Tunables for the historical fetcher and its circuit breaker.
#[derive(Debug, Clone)]
pub struct BackfillSettings {
    pub chunk_minutes: i64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub rate_limit_threshold: u32,
    pub cooldown_seconds: u64,
    pub public_delay_ms: u64,
    /// Explicit pool-width override; the mode default applies when unset.
    pub max_concurrent_chunks: Option<usize>,
    pub page_limit: usize,
    pub max_iterations_per_chunk: u32,
    pub test_mode: bool,
}

impl BackfillSettings {
    /// Worker-pool width for the current client mode.
    pub fn concurrency_for(&self, authenticated: bool) -> usize {
        if self.test_mode {
            return 1;
        }
        self.max_concurrent_chunks.unwrap_or(if authenticated {
            CONCURRENCY_AUTHENTICATED
        } else {
            CONCURRENCY_PUBLIC
        })
    }

    /// Inter-request base delay for the current client mode; the breaker's
    /// throttle multiplier is applied on top of this.
    pub fn base_delay(&self, authenticated: bool) -> Duration {
        if authenticated {
            Duration::ZERO
        } else {
            Duration::from_millis(self.public_delay_ms)
        }
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

/// Top-level engine configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub symbol: String,
    pub data_source: DataSourceKind,
    pub backfill_enabled: bool,
    pub disable_live_data: bool,
    pub cache_enabled: bool,
    pub cache_dir: PathBuf,
    pub cache_retention_days: u32,
    pub history_dir: PathBuf,
    /// Fallback tick when the exchange filter cannot be resolved.
    pub fallback_tick: Decimal,
    pub bind_addr: String,
    pub exchange: ExchangeSettings,
    pub backfill: BackfillSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            data_source: DataSourceKind::LiveStream,
            backfill_enabled: true,
            disable_live_data: false,
            cache_enabled: true,
            cache_dir: default_cache_dir(),
            cache_retention_days: DEFAULT_CACHE_RETENTION_DAYS,
            history_dir: default_history_dir(),
            fallback_tick: default_tick(),
            bind_addr: default_bind_addr(),
            exchange: ExchangeSettings {
                symbol: default_symbol(),
                api_key: None,
                secret: None,
                base_url: default_base_url(),
                timeout_secs: DEFAULT_TIMEOUT_SECS,
            },
            backfill: BackfillSettings {
                chunk_minutes: DEFAULT_CHUNK_MINUTES,
                max_retries: DEFAULT_MAX_RETRIES,
                retry_base_ms: DEFAULT_RETRY_BASE_MS,
                rate_limit_threshold: DEFAULT_RATE_LIMIT_THRESHOLD,
                cooldown_seconds: DEFAULT_COOLDOWN_SECONDS,
                public_delay_ms: DEFAULT_PUBLIC_DELAY_MS,
                max_concurrent_chunks: None,
                page_limit: DEFAULT_PAGE_LIMIT,
                max_iterations_per_chunk: DEFAULT_MAX_ITERATIONS_PER_CHUNK,
                test_mode: false,
            },
        }
    }
}

impl EngineConfig {
    /// Resolve the full configuration from the environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let symbol = env_string("SYMBOL")
            .map(|s| s.to_uppercase())
            .unwrap_or(defaults.symbol);

        let data_source = match env_string("DATA_SOURCE") {
            None => defaults.data_source,
            Some(raw) => match DataSourceKind::parse(&raw) {
                Some(k) => k,
                None => {
                    warn!(value = %raw, "unknown DATA_SOURCE, using live_stream");
                    DataSourceKind::LiveStream
                }
            },
        };

        let fallback_tick = match env_string("PROFILE_TICK_SIZE") {
            None => defaults.fallback_tick,
            Some(raw) => match raw.trim().parse::<Decimal>() {
                Ok(t) if t > Decimal::ZERO => t,
                _ => {
                    warn!(value = %raw, "invalid PROFILE_TICK_SIZE, using 0.1");
                    defaults.fallback_tick
                }
            },
        };

        let exchange = ExchangeSettings {
            symbol: symbol.clone(),
            api_key: env_string("BINANCE_API_KEY"),
            secret: env_string("BINANCE_API_SECRET"),
            base_url: env_string("BINANCE_REST_BASE_URL").unwrap_or(defaults.exchange.base_url),
            timeout_secs: env_parse("BINANCE_API_TIMEOUT", DEFAULT_TIMEOUT_SECS),
        };

        let backfill = BackfillSettings {
            chunk_minutes: env_parse("BACKFILL_CHUNK_MINUTES", DEFAULT_CHUNK_MINUTES).max(1),
            max_retries: env_parse("BACKFILL_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            retry_base_ms: env_parse("BACKFILL_RETRY_BASE", DEFAULT_RETRY_BASE_MS),
            rate_limit_threshold: env_parse(
                "BACKFILL_RATE_LIMIT_THRESHOLD",
                DEFAULT_RATE_LIMIT_THRESHOLD,
            ),
            cooldown_seconds: env_parse("BACKFILL_COOLDOWN_SECONDS", DEFAULT_COOLDOWN_SECONDS),
            public_delay_ms: env_parse("BACKFILL_PUBLIC_DELAY_MS", DEFAULT_PUBLIC_DELAY_MS),
            max_concurrent_chunks: env_string("BACKFILL_MAX_CONCURRENT_CHUNKS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n: &usize| n >= 1),
            page_limit: DEFAULT_PAGE_LIMIT,
            max_iterations_per_chunk: DEFAULT_MAX_ITERATIONS_PER_CHUNK,
            test_mode: env_bool("CONTEXT_BACKFILL_TEST_MODE", false),
        };

        let config = Self {
            symbol,
            data_source,
            backfill_enabled: env_bool("CONTEXT_BACKFILL_ENABLED", true),
            disable_live_data: env_bool("CONTEXT_DISABLE_LIVE_DATA", false),
            cache_enabled: env_bool("BACKFILL_CACHE_ENABLED", true),
            cache_dir: env_string("BACKFILL_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            cache_retention_days: env_parse(
                "BACKFILL_CACHE_RETENTION_DAYS",
                DEFAULT_CACHE_RETENTION_DAYS,
            ),
            history_dir: env_string("HISTORY_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.history_dir),
            fallback_tick,
            bind_addr: env_string("BIND_ADDR").unwrap_or(defaults.bind_addr),
            exchange,
            backfill,
        };

        info!(
            symbol = %config.symbol,
            data_source = %config.data_source,
            backfill_enabled = config.backfill_enabled,
            disable_live_data = config.disable_live_data,
            cache_enabled = config.cache_enabled,
            cache_dir = %config.cache_dir.display(),
            fallback_tick = %config.fallback_tick,
            authenticated = config.exchange.api_key.is_some(),
            test_mode = config.backfill.test_mode,
            "engine configuration resolved"
        );

        config
    }
}
