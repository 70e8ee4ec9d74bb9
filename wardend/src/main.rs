//! Warden Daemon
//!
//! Approval service, reconciliation scheduler and API server.
//!
//! # Usage
//!
//! ```bash
//! # Stub broker, in-memory stores
//! cargo run -p wardend
//!
//! # Alpaca paper account, audit trail in PostgreSQL
//! WARDEN_BROKER_API_KEY=... WARDEN_BROKER_API_SECRET=... \
//! WARDEN_DATABASE_URL=postgres://... cargo run -p wardend --features postgres
//! ```
//!
//! # Environment Variables
//!
//! - `WARDEN_ENV`: Environment (test, development, production)
//! - `WARDEN_API_HOST` / `WARDEN_API_PORT`: API bind address (default 0.0.0.0:8080)
//! - `WARDEN_EQUITY`: Account equity used for sizing (default 100000)
//! - `WARDEN_RISK_PER_TRADE` / `_PER_DAY` / `_PER_WEEK`: Risk fractions (0.01 / 0.02 / 0.05)
//! - `WARDEN_TICK_INTERVAL_SECS`: Reconciliation period (default 15)
//! - `WARDEN_BROKER_*`: Broker endpoints and keys; the stub broker is used without keys
//! - `WARDEN_LOG_JSON`: Set to `1` for JSON logs

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use warden_connectors::{AlpacaClient, AlpacaConfig};
use warden_eventlog::{AuditSink, MemoryAuditSink};
use warden_exec::{BrokerPort, StubBroker};
use warden_store::MemoryStore;
use wardend::{Config, Daemon, Environment, Services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("wardend=info".parse()?);
    let json_logs = std::env::var("WARDEN_LOG_JSON").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if json_logs {
        tracing_subscriber::registry().with(fmt::layer().json()).with(filter).init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    let config = Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        api_host = %config.api.host,
        api_port = config.api.port,
        broker = ?config.broker,
        "Warden daemon"
    );

    match (&config.broker.api_key, &config.broker.api_secret) {
        (Some(key), Some(secret)) if config.environment != Environment::Test => {
            let mut alpaca = AlpacaConfig::paper(key.clone(), secret.clone());
            alpaca.base_url = config.broker.base_url.clone();
            alpaca.data_url = config.broker.data_url.clone();
            info!(base_url = %alpaca.base_url, "Using Alpaca broker");
            serve(config, Arc::new(AlpacaClient::new(alpaca))).await
        }
        _ => {
            info!("No broker credentials, using stub broker");
            serve(config, Arc::new(StubBroker::new())).await
        }
    }
}

async fn serve<B: BrokerPort + 'static>(config: Config, broker: Arc<B>) -> anyhow::Result<()> {
    let sink = audit_sink(&config).await?;
    let services = Services::build(&config, broker, Arc::new(MemoryStore::new()), sink, None)?;
    Daemon::new(config, services).run().await?;
    Ok(())
}

#[cfg(feature = "postgres")]
async fn audit_sink(config: &Config) -> anyhow::Result<Arc<dyn AuditSink>> {
    let Some(url) = &config.database_url else {
        info!("WARDEN_DATABASE_URL not set, audit trail kept in memory");
        return Ok(Arc::new(MemoryAuditSink::new()));
    };

    let pool = sqlx::postgres::PgPoolOptions::new().max_connections(5).connect(url).await?;
    let sink = warden_eventlog::PgAuditSink::new(pool);
    sink.ensure_schema().await?;
    info!("Audit trail stored in PostgreSQL");
    Ok(Arc::new(sink))
}

#[cfg(not(feature = "postgres"))]
async fn audit_sink(config: &Config) -> anyhow::Result<Arc<dyn AuditSink>> {
    if config.database_url.is_some() {
        tracing::warn!("WARDEN_DATABASE_URL ignored: built without the postgres feature");
    }
    Ok(Arc::new(MemoryAuditSink::new()))
}
