//! Service configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use stargen_core::RateTable;

/// Job poller settings.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Wait between status checks (default: 5s).
    pub interval: Duration,

    /// Status checks before a job is declared timed out (default: 120).
    pub max_attempts: u32,

    /// In-flight status checks across all jobs; 0 disables the limit (default: 64).
    pub max_concurrent: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
            max_attempts: 120,
            max_concurrent: 64,
        }
    }
}

/// Stuck-generation sweep settings.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Wait between sweeps; zero runs only the startup sweep (default: 30 min).
    pub interval: Duration,

    /// Age after which a `queued` or `generating` record with no live
    /// monitor is failed and refunded (default: 2 h).
    pub stale_after: Duration,

    /// Records handled per sweep (default: 100).
    pub batch_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            stale_after: Duration::from_secs(120 * 60),
            batch_size: 100,
        }
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// PostgreSQL URL. Without it the service keeps state in memory.
    pub database_url: Option<String>,

    /// Service API key for service-to-service auth.
    pub service_api_key: Option<String>,

    /// Model catalog file replacing the built-in catalog.
    pub catalog_path: Option<PathBuf>,

    /// KIE API base URL (default: `<https://api.kie.ai>`).
    pub kie_api_url: String,

    /// KIE API key.
    pub kie_api_key: Option<String>,

    /// Webhook URL passed to KIE with every task.
    pub kie_callback_url: Option<String>,

    /// Shared secret KIE callbacks must present, as a bearer token or a
    /// `secret` query parameter. Unset accepts every callback.
    pub kie_callback_secret: Option<String>,

    /// Serve every provider with the scripted stand-in instead of the network.
    pub mock_providers: bool,

    /// OpenAI-compatible API base URL (default: `<https://api.openai.com/v1>`).
    pub openai_api_url: String,

    /// OpenAI API key.
    pub openai_api_key: Option<String>,

    /// Job poller settings.
    pub poller: PollerConfig,

    /// Stuck-generation sweep settings.
    pub sweep: SweepConfig,

    /// Compare-and-swap attempts per balance change (default: 10).
    pub ledger_max_cas_attempts: u32,

    /// Insert attempts while stripping unknown columns (default: 8).
    pub persist_max_attempts: u32,

    /// Balance given to a user seen for the first time (default: 0).
    pub starting_balance: i64,

    /// Currency-per-star rates for display prices.
    pub rates: RateTable,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            database_url: env_opt("DATABASE_URL"),
            service_api_key: env_opt("SERVICE_API_KEY"),
            catalog_path: env_opt("CATALOG_PATH").map(PathBuf::from),
            kie_api_url: std::env::var("KIE_API_URL").unwrap_or(defaults.kie_api_url),
            kie_api_key: env_opt("KIE_API_KEY"),
            kie_callback_url: env_opt("KIE_CALLBACK_URL"),
            kie_callback_secret: env_opt("KIE_CALLBACK_SECRET"),
            mock_providers: env_flag("KIE_MOCK_MODE"),
            openai_api_url: std::env::var("OPENAI_API_URL").unwrap_or(defaults.openai_api_url),
            openai_api_key: env_opt("OPENAI_API_KEY"),
            poller: PollerConfig {
                interval: Duration::from_millis(env_or("POLL_INTERVAL_MS", 5000)),
                max_attempts: env_or("POLL_MAX_ATTEMPTS", defaults.poller.max_attempts),
                max_concurrent: env_or("POLL_MAX_CONCURRENT", defaults.poller.max_concurrent),
            },
            sweep: SweepConfig {
                interval: Duration::from_secs(env_or("SWEEP_INTERVAL_SECONDS", 30 * 60)),
                stale_after: Duration::from_secs(
                    env_or::<u64>("STALE_GENERATION_MINUTES", 120) * 60,
                ),
                batch_size: env_or("SWEEP_BATCH_SIZE", defaults.sweep.batch_size),
            },
            ledger_max_cas_attempts: env_or(
                "LEDGER_MAX_CAS_ATTEMPTS",
                defaults.ledger_max_cas_attempts,
            ),
            persist_max_attempts: env_or("PERSIST_MAX_ATTEMPTS", defaults.persist_max_attempts),
            starting_balance: env_or("STARTING_BALANCE", defaults.starting_balance),
            rates: defaults.rates,
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_or("MAX_BODY_BYTES", defaults.max_body_bytes),
            request_timeout_seconds: env_or(
                "REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_seconds,
            ),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            database_url: None,
            service_api_key: None,
            catalog_path: None,
            kie_api_url: stargen_providers::kie::DEFAULT_BASE_URL.into(),
            kie_api_key: None,
            kie_callback_url: None,
            kie_callback_secret: None,
            mock_providers: false,
            openai_api_url: stargen_providers::openai::DEFAULT_BASE_URL.into(),
            openai_api_key: None,
            poller: PollerConfig::default(),
            sweep: SweepConfig::default(),
            ledger_max_cas_attempts: 10,
            persist_max_attempts: 8,
            starting_balance: 0,
            rates: RateTable::default(),
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
        }
    }
}
