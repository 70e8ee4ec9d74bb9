//! Kill switch: repeated activation converges on the same end state.

use std::sync::Arc;

use rust_decimal_macros::dec;
use warden_domain::{CloseReason, Side};
use warden_eventlog::MemoryAuditSink;
use warden_exec::StubBroker;
use warden_store::{MemoryStore, Store};
use wardend::{Actor, Config, KillSwitchSource, ProposeOpportunity, Services};

async fn open(services: &Services<StubBroker, MemoryStore>, broker: &StubBroker, symbol: &str) {
    broker.set_price(symbol, dec!(50));
    let opportunity = services
        .approvals
        .propose(
            ProposeOpportunity {
                symbol: symbol.to_string(),
                side: Side::Long,
                timeframe: "1D".to_string(),
                entry: dec!(50),
                stop: dec!(48),
                target: dec!(56),
                correlation_group: None,
            },
            &Actor::user(None),
        )
        .await
        .unwrap();
    services.approvals.approve(opportunity.id, dec!(10), None, &Actor::user(None)).await.unwrap();
}

#[tokio::test]
async fn test_kill_switch_twice_is_idempotent() {
    let broker = Arc::new(StubBroker::new());
    let store = Arc::new(MemoryStore::new());
    let services =
        Services::build(&Config::test(), broker.clone(), store.clone(), Arc::new(MemoryAuditSink::new()), None)
            .unwrap();

    open(&services, &broker, "AAPL").await;
    open(&services, &broker, "MSFT").await;
    assert_eq!(broker.net_position("AAPL"), dec!(10));

    let first = services.kill_switch.trigger(KillSwitchSource::Manual, &Actor::user(Some("ops".into()))).await.unwrap();
    assert_eq!(first.positions_closed, 2);
    assert!(first.broker_errors.is_empty());
    assert_eq!(broker.net_position("AAPL"), dec!(0));

    let after_first = store.positions().find_all().await.unwrap();
    assert!(after_first.iter().all(|p| p.close_reason == Some(CloseReason::KillSwitch)));

    let second = services.kill_switch.trigger(KillSwitchSource::Manual, &Actor::user(Some("ops".into()))).await.unwrap();
    assert_eq!(second.positions_closed, 0);

    let after_second = store.positions().find_all().await.unwrap();
    assert_eq!(after_first, after_second);

    let kills = services
        .ledger
        .entries()
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.action == "KILL_SWITCH")
        .count();
    assert_eq!(kills, 2);

    // The next tick has nothing left to evaluate
    let tick = services.reconciler.tick().await.unwrap();
    assert_eq!(tick.evaluated, 0);
    assert!(!tick.kill_switch_triggered);
}
