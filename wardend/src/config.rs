//! Daemon configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::error::{DaemonError, DaemonResult};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use warden_domain::RiskCaps;
use warden_engine::EngineConfig;
use warden_exec::{RetryPolicy, TrackerConfig};

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiConfig,

    /// Account equity and risk budget
    pub risk: RiskConfig,

    /// Reconciliation loop
    pub reconcile: ReconcileConfig,

    /// Order tracking and broker retry
    pub orders: OrderConfig,

    /// Broker connection
    pub broker: BrokerConfig,

    /// Audit database (only used with the `postgres` feature)
    pub database_url: Option<String>,

    /// Environment (test, development, production)
    pub environment: Environment,
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

/// Equity and risk budget fractions.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Account equity used for sizing and percent limits
    pub equity: Decimal,
    /// Per-trade, daily and weekly fractions (0.01 = 1%)
    pub caps: RiskCaps,
}

/// Reconciliation tunables.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Delay between scheduled ticks
    pub tick_interval: Duration,
    /// Maximum holding time before a TTL close
    pub holding_ttl: Duration,
    /// Lifetime of a profit-take request
    pub profit_take_grace: Duration,
    /// Open-position ceiling
    pub max_open_positions: usize,
    /// Time an unfilled entry may sit before it is re-placed
    pub entry_grace: Duration,
    /// Entry placements before a position is flagged for review
    pub max_entry_attempts: u32,
}

/// Order tracking and retry tunables.
#[derive(Debug, Clone)]
pub struct OrderConfig {
    /// Status polls per order
    pub max_polls: u32,
    /// Delay between polls
    pub poll_interval: Duration,
    /// Overall fill budget per order
    pub fill_deadline: Duration,
    /// Broker call attempts
    pub retry_attempts: u32,
    /// First backoff delay
    pub retry_initial: Duration,
    /// Backoff ceiling
    pub retry_max: Duration,
    /// Deadline across all attempts of one call
    pub retry_deadline: Duration,
}

/// Broker connection settings.
#[derive(Clone)]
pub struct BrokerConfig {
    /// Trading API base URL
    pub base_url: String,
    /// Market data API base URL
    pub data_url: String,
    /// API key id
    pub api_key: Option<String>,
    /// API secret
    pub api_secret: Option<String>,
}

impl BrokerConfig {
    /// Both credentials present
    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some()
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("base_url", &self.base_url)
            .field("data_url", &self.data_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("api_secret", &self.api_secret.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment (uses stubs)
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();

        Ok(Self {
            api: Self::load_api_config()?,
            risk: Self::load_risk_config(&defaults.risk)?,
            reconcile: Self::load_reconcile_config(&defaults.reconcile)?,
            orders: Self::load_order_config(&defaults.orders)?,
            broker: Self::load_broker_config(&defaults.broker),
            database_url: env::var("WARDEN_DATABASE_URL").ok(),
            environment: Self::load_environment()?,
        })
    }

    /// Create test configuration.
    pub fn test() -> Self {
        let defaults = Self::default();
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
            },
            orders: OrderConfig {
                max_polls: 5,
                poll_interval: Duration::from_millis(10),
                fill_deadline: Duration::from_secs(2),
                retry_attempts: 3,
                retry_initial: Duration::from_millis(5),
                retry_max: Duration::from_millis(20),
                retry_deadline: Duration::from_secs(1),
            },
            reconcile: ReconcileConfig { tick_interval: Duration::from_millis(100), ..defaults.reconcile },
            environment: Environment::Test,
            ..defaults
        }
    }

    /// Decision engine settings
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            holding_ttl: to_chrono(self.reconcile.holding_ttl),
            profit_take_grace: to_chrono(self.reconcile.profit_take_grace),
            max_open_positions: self.reconcile.max_open_positions,
        }
    }

    /// Retry policy for broker and narrative calls
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.orders.retry_attempts,
            self.orders.retry_initial,
            self.orders.retry_max,
        )
        .with_deadline(self.orders.retry_deadline)
    }

    /// Order tracker settings
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            broker_retry: self.retry_policy(),
            poll_interval: self.orders.poll_interval,
            max_polls: self.orders.max_polls,
            fill_deadline: self.orders.fill_deadline,
        }
    }

    fn load_environment() -> DaemonResult<Environment> {
        let env_str = env::var("WARDEN_ENV").unwrap_or_else(|_| "development".to_string());

        match env_str.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(DaemonError::Config(format!(
                "Invalid WARDEN_ENV: {}. Expected: test, development, production",
                other
            ))),
        }
    }

    fn load_api_config() -> DaemonResult<ApiConfig> {
        let host = env::var("WARDEN_API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port_str = env::var("WARDEN_API_PORT").unwrap_or_else(|_| "8080".to_string());

        let port = port_str
            .parse::<u16>()
            .map_err(|_| DaemonError::Config(format!("Invalid WARDEN_API_PORT: {}", port_str)))?;

        Ok(ApiConfig { host, port })
    }

    fn load_risk_config(defaults: &RiskConfig) -> DaemonResult<RiskConfig> {
        let equity = Self::load_decimal_env("WARDEN_EQUITY", defaults.equity)?;
        if equity <= Decimal::ZERO {
            return Err(DaemonError::Config(format!("WARDEN_EQUITY must be positive: {}", equity)));
        }

        let caps = RiskCaps {
            per_trade_pct: Self::load_fraction_env("WARDEN_RISK_PER_TRADE", defaults.caps.per_trade_pct)?,
            daily_pct: Self::load_fraction_env("WARDEN_RISK_PER_DAY", defaults.caps.daily_pct)?,
            weekly_pct: Self::load_fraction_env("WARDEN_RISK_PER_WEEK", defaults.caps.weekly_pct)?,
        };

        Ok(RiskConfig { equity, caps })
    }

    fn load_reconcile_config(defaults: &ReconcileConfig) -> DaemonResult<ReconcileConfig> {
        Ok(ReconcileConfig {
            tick_interval: Duration::from_secs(Self::load_u64_env(
                "WARDEN_TICK_INTERVAL_SECS",
                defaults.tick_interval.as_secs(),
            )?),
            holding_ttl: Duration::from_secs(
                Self::load_u64_env("WARDEN_HOLDING_TTL_HOURS", defaults.holding_ttl.as_secs() / 3600)? * 3600,
            ),
            profit_take_grace: Duration::from_secs(Self::load_u64_env(
                "WARDEN_PROFIT_TAKE_GRACE_SECS",
                defaults.profit_take_grace.as_secs(),
            )?),
            max_open_positions: Self::load_u64_env(
                "WARDEN_MAX_OPEN_POSITIONS",
                defaults.max_open_positions as u64,
            )? as usize,
            entry_grace: Duration::from_secs(Self::load_u64_env(
                "WARDEN_ENTRY_GRACE_SECS",
                defaults.entry_grace.as_secs(),
            )?),
            max_entry_attempts: Self::load_u64_env(
                "WARDEN_ENTRY_MAX_ATTEMPTS",
                u64::from(defaults.max_entry_attempts),
            )? as u32,
        })
    }

    fn load_order_config(defaults: &OrderConfig) -> DaemonResult<OrderConfig> {
        Ok(OrderConfig {
            max_polls: Self::load_u64_env("WARDEN_ORDER_MAX_POLLS", u64::from(defaults.max_polls))? as u32,
            poll_interval: Duration::from_millis(Self::load_u64_env(
                "WARDEN_ORDER_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            fill_deadline: Duration::from_secs(Self::load_u64_env(
                "WARDEN_ORDER_FILL_DEADLINE_SECS",
                defaults.fill_deadline.as_secs(),
            )?),
            retry_attempts: Self::load_u64_env(
                "WARDEN_RETRY_MAX_ATTEMPTS",
                u64::from(defaults.retry_attempts),
            )?
            .max(1) as u32,
            retry_initial: Duration::from_millis(Self::load_u64_env(
                "WARDEN_RETRY_INITIAL_MS",
                defaults.retry_initial.as_millis() as u64,
            )?),
            retry_max: Duration::from_millis(Self::load_u64_env(
                "WARDEN_RETRY_MAX_MS",
                defaults.retry_max.as_millis() as u64,
            )?),
            retry_deadline: Duration::from_secs(Self::load_u64_env(
                "WARDEN_RETRY_DEADLINE_SECS",
                defaults.retry_deadline.as_secs(),
            )?),
        })
    }

    fn load_broker_config(defaults: &BrokerConfig) -> BrokerConfig {
        BrokerConfig {
            base_url: env::var("WARDEN_BROKER_BASE_URL").unwrap_or_else(|_| defaults.base_url.clone()),
            data_url: env::var("WARDEN_BROKER_DATA_URL").unwrap_or_else(|_| defaults.data_url.clone()),
            api_key: env::var("WARDEN_BROKER_API_KEY").ok().filter(|v| !v.is_empty()),
            api_secret: env::var("WARDEN_BROKER_API_SECRET").ok().filter(|v| !v.is_empty()),
        }
    }

    fn load_decimal_env(key: &str, default: Decimal) -> DaemonResult<Decimal> {
        match env::var(key) {
            Ok(val) => Decimal::from_str(&val)
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            Err(_) => Ok(default),
        }
    }

    fn load_fraction_env(key: &str, default: Decimal) -> DaemonResult<Decimal> {
        let value = Self::load_decimal_env(key, default)?;
        if value <= Decimal::ZERO || value > Decimal::ONE {
            return Err(DaemonError::Config(format!("{} must be in (0, 1]: {}", key, value)));
        }
        Ok(value)
    }

    fn load_u64_env(key: &str, default: u64) -> DaemonResult<u64> {
        match env::var(key) {
            Ok(val) => val
                .parse::<u64>()
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            Err(_) => Ok(default),
        }
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            risk: RiskConfig {
                equity: Decimal::new(100_000, 0),
                caps: RiskCaps::default(),
            },
            reconcile: ReconcileConfig {
                tick_interval: Duration::from_secs(15),
                holding_ttl: Duration::from_secs(24 * 3600),
                profit_take_grace: Duration::from_secs(60),
                max_open_positions: 20,
                entry_grace: Duration::from_secs(120),
                max_entry_attempts: 3,
            },
            orders: OrderConfig {
                max_polls: 30,
                poll_interval: Duration::from_secs(1),
                fill_deadline: Duration::from_secs(60),
                retry_attempts: 4,
                retry_initial: Duration::from_millis(250),
                retry_max: Duration::from_secs(4),
                retry_deadline: Duration::from_secs(15),
            },
            broker: BrokerConfig {
                base_url: warden_connectors::ALPACA_PAPER_URL.to_string(),
                data_url: warden_connectors::ALPACA_DATA_URL.to_string(),
                api_key: None,
                api_secret: None,
            },
            database_url: None,
            environment: Environment::Development,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
