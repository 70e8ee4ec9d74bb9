//! Daemon: Main runtime orchestrator.
//!
//! # Lifecycle
//!
//! 1. Load configuration
//! 2. Wire services (store, broker, audit ledger, tracker, reconciler)
//! 3. Catch up on orders left open by a previous run
//! 4. Start API server
//! 5. Run the reconciliation scheduler until shutdown
//! 6. Graceful shutdown on SIGINT

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_eventlog::MemoryAuditSink;
use warden_exec::{BrokerPort, StubBroker};
use warden_store::{MemoryStore, Store};

use crate::api::{create_router, ApiState};
use crate::config::Config;
use crate::error::{DaemonError, DaemonResult};
use crate::services::Services;

pub struct Daemon<B: BrokerPort + 'static, S: Store + 'static> {
    config: Config,
    services: Arc<Services<B, S>>,
    shutdown: CancellationToken,
}

impl Daemon<StubBroker, MemoryStore> {
    /// Create a daemon with the stub broker and in-memory stores.
    pub fn new_stub(config: Config) -> DaemonResult<Self> {
        let services = Services::build(
            &config,
            Arc::new(StubBroker::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryAuditSink::new()),
            None,
        )?;
        Ok(Self::new(config, services))
    }
}

impl<B: BrokerPort + 'static, S: Store + 'static> Daemon<B, S> {
    pub fn new(config: Config, services: Services<B, S>) -> Self {
        Self { config, services: Arc::new(services), shutdown: CancellationToken::new() }
    }

    pub fn services(&self) -> &Arc<Services<B, S>> {
        &self.services
    }

    /// Token that stops the scheduler when canceled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the daemon.
    ///
    /// This method blocks until shutdown is requested (SIGINT) or the
    /// shutdown token is canceled.
    pub async fn run(self) -> DaemonResult<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            "Starting warden daemon"
        );

        self.restore().await?;

        let api_addr = self.start_api_server().await?;
        info!(%api_addr, "API server started");

        let scheduler = self.spawn_scheduler();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
            _ = self.shutdown.cancelled() => info!("Shutdown requested"),
        }

        self.shutdown.cancel();
        if let Err(e) = scheduler.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }

        let open = self.services.store.positions().find_open().await?.len();
        info!(open_positions = open, "Shutdown complete");
        Ok(())
    }

    /// Report what was left open and bring order state up to date.
    async fn restore(&self) -> DaemonResult<()> {
        let open = self.services.store.positions().find_open().await?;
        if open.is_empty() {
            info!("No open positions to restore");
        } else {
            info!(count = open.len(), "Restored open positions from store");
        }

        match self.services.tracker.sync_open_orders().await {
            Ok(changed) => info!(changed, "Open orders synced with broker"),
            Err(e) => warn!(error = %e, "Initial order sync failed, next tick will retry"),
        }
        Ok(())
    }

    /// Start the API server.
    pub async fn start_api_server(&self) -> DaemonResult<SocketAddr> {
        let state = Arc::new(ApiState { services: self.services.clone() });
        let router = create_router(state);
        let addr = format!("{}:{}", self.config.api.host, self.config.api.port);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DaemonError::Config(format!("Failed to bind to {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DaemonError::Config(format!("Failed to get local address: {}", e)))?;

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                error!(error = %e, "API server error");
            }
        });

        Ok(local_addr)
    }

    /// Tick the reconciler every `tick_interval` until shutdown.
    pub fn spawn_scheduler(&self) -> JoinHandle<()> {
        let services = self.services.clone();
        let token = self.shutdown.clone();
        let period = self.config.reconcile.tick_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(?period, "Reconciliation scheduler started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        // Failures are logged and counted by the reconciler
                        if let Err(e) = services.reconciler.tick().await {
                            debug!(error = %e, "Scheduled tick failed");
                        }
                    }
                }
            }
            info!("Reconciliation scheduler stopped");
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_daemon_stub_creation() {
        let daemon = Daemon::new_stub(Config::test()).unwrap();

        let open = daemon.services().store.positions().find_open().await.unwrap();
        assert!(open.is_empty());
        daemon.restore().await.unwrap();
    }

    #[tokio::test]
    async fn test_daemon_api_server_start() {
        let daemon = Daemon::new_stub(Config::test()).unwrap();

        let addr = daemon.start_api_server().await.unwrap();
        assert!(addr.port() > 0);

        let client = reqwest::Client::new();
        let response = client.get(format!("http://{}/health", addr)).send().await.unwrap();
        assert!(response.status().is_success());

        daemon.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_scheduler_ticks_until_canceled() {
        let daemon = Daemon::new_stub(Config::test()).unwrap();

        let handle = daemon.spawn_scheduler();
        tokio::time::sleep(Duration::from_millis(250)).await;
        daemon.shutdown_token().cancel();
        handle.await.unwrap();

        let ticks = daemon.services().metrics.ticks.get();
        assert!(ticks >= 2, "expected at least two ticks, got {ticks}");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(daemon.services().metrics.ticks.get(), ticks);
    }

    #[tokio::test]
    async fn test_run_stops_on_token() {
        let daemon = Daemon::new_stub(Config::test()).unwrap();
        let token = daemon.shutdown_token();

        let run = tokio::spawn(daemon.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap().unwrap();
    }
}
