//! Service wiring shared by the API, the scheduler and tests.

use std::sync::Arc;

use warden_engine::Engine;
use warden_eventlog::{AuditLedger, AuditSink};
use warden_exec::{BrokerPort, NarrativePort, OrderTracker};
use warden_store::Store;

use crate::approval::{ApprovalConfig, ApprovalService};
use crate::closing::PositionCloser;
use crate::config::Config;
use crate::error::DaemonResult;
use crate::kill_switch::KillSwitch;
use crate::metrics::{MeteredSink, Metrics};
use crate::portfolio::PortfolioService;
use crate::profit_take::ProfitTakeService;
use crate::reconciler::{Reconciler, ReconcilerConfig};

pub struct Services<B: BrokerPort + 'static, S: Store + 'static> {
    pub store: Arc<S>,
    pub broker: Arc<B>,
    pub ledger: AuditLedger,
    pub metrics: Arc<Metrics>,
    pub tracker: Arc<OrderTracker<B, S>>,
    pub closer: Arc<PositionCloser<B, S>>,
    pub approvals: ApprovalService<B, S>,
    pub reconciler: Reconciler<B, S>,
    pub kill_switch: Arc<KillSwitch<B, S>>,
    pub profit_takes: ProfitTakeService<B, S>,
    pub portfolio: PortfolioService<B, S>,
}

impl<B: BrokerPort + 'static, S: Store + 'static> Services<B, S> {
    pub fn build(
        config: &Config,
        broker: Arc<B>,
        store: Arc<S>,
        sink: Arc<dyn AuditSink>,
        narrator: Option<Arc<dyn NarrativePort>>,
    ) -> DaemonResult<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let ledger = AuditLedger::new(Arc::new(MeteredSink::new(sink, metrics.clone())));
        let retry = config.retry_policy();

        let tracker = Arc::new(OrderTracker::new(
            broker.clone(),
            store.clone(),
            ledger.clone(),
            config.tracker_config(),
        ));
        let closer = Arc::new(PositionCloser::new(
            broker.clone(),
            store.clone(),
            ledger.clone(),
            tracker.clone(),
            metrics.clone(),
        ));
        let kill_switch = Arc::new(KillSwitch::new(
            broker.clone(),
            store.clone(),
            ledger.clone(),
            metrics.clone(),
            retry,
        ));

        let approvals = ApprovalService::new(
            store.clone(),
            ledger.clone(),
            tracker.clone(),
            narrator,
            ApprovalConfig {
                equity: config.risk.equity,
                caps: config.risk.caps,
                max_open_positions: config.reconcile.max_open_positions,
                narrative_retry: retry,
            },
        );

        let reconciler = Reconciler::new(
            Engine::new(config.engine_config()),
            broker.clone(),
            store.clone(),
            ledger.clone(),
            tracker.clone(),
            closer.clone(),
            kill_switch.clone(),
            metrics.clone(),
            ReconcilerConfig {
                equity: config.risk.equity,
                entry_grace: crate::config::to_chrono(config.reconcile.entry_grace),
                max_entry_attempts: config.reconcile.max_entry_attempts,
            },
        );

        let profit_takes = ProfitTakeService::new(broker.clone(), store.clone(), ledger.clone(), closer.clone());
        let portfolio = PortfolioService::new(broker.clone(), store.clone(), config.risk.equity);

        Ok(Self {
            store,
            broker,
            ledger,
            metrics,
            tracker,
            closer,
            approvals,
            reconciler,
            kill_switch,
            profit_takes,
            portfolio,
        })
    }
}
