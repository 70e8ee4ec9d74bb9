//! Operator decisions on profit-take requests.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use warden_domain::{Position, ProfitTakeId, ProfitTakeRequest, ProfitTakeStatus};
use warden_eventlog::{AuditLedger, AuditRecord};
use warden_exec::BrokerPort;
use warden_store::Store;

use crate::actor::Actor;
use crate::closing::PositionCloser;
use crate::error::{DaemonError, DaemonResult};

pub struct ProfitTakeService<B: BrokerPort, S: Store> {
    broker: Arc<B>,
    store: Arc<S>,
    ledger: AuditLedger,
    closer: Arc<PositionCloser<B, S>>,
}

impl<B: BrokerPort, S: Store> ProfitTakeService<B, S> {
    pub fn new(broker: Arc<B>, store: Arc<S>, ledger: AuditLedger, closer: Arc<PositionCloser<B, S>>) -> Self {
        Self { broker, store, ledger, closer }
    }

    /// Approve a pending request and close the position with TARGET.
    ///
    /// The exit price is the latest broker price, or the price that
    /// triggered the request when the broker has none. The request is marked
    /// APPROVED only once the close is persisted; if the position was closed
    /// some other way first, the request expires instead.
    pub async fn approve(&self, request_id: ProfitTakeId, actor: &Actor) -> DaemonResult<Position> {
        let request = self.pending(request_id).await?;

        let position = self
            .store
            .positions()
            .find_by_id(request.position_id)
            .await?
            .ok_or_else(|| DaemonError::not_found("position", request.position_id))?;

        let exit_price = match self.broker.latest_price(&position.symbol).await {
            Ok(Some(price)) => price,
            Ok(None) => request.price,
            Err(e) => {
                warn!(position_id = %position.id, error = %e, "Price lookup failed, using requested price");
                request.price
            }
        };

        let details = json!({ "profit_take_id": request.id, "requested_price": request.price });
        let closed = match self.closer.close_for_profit_take(position.id, request.id, exit_price, details, actor).await {
            Ok(closed) => closed,
            Err(e) => {
                if let Some(current) = self.store.positions().find_by_id(position.id).await? {
                    if !current.is_open() {
                        self.closer.expire_pending_request(&current, actor, None).await;
                    }
                }
                return Err(e);
            }
        };

        match self.store.profit_takes().transition(request.id, ProfitTakeStatus::Approved, Utc::now()).await {
            Ok(request) => {
                self.ledger
                    .record(actor.stamp(AuditRecord::new(
                        "PROFIT_TAKE_APPROVED",
                        "profit_take",
                        request.id,
                        json!({
                            "position_id": request.position_id,
                            "price": request.price,
                            "exit_price": exit_price,
                        }),
                    )))
                    .await?;
            }
            Err(e) => warn!(request_id = %request.id, error = %e, "Profit take decided while its position closed"),
        }

        info!(request_id = %request.id, position_id = %closed.id, %exit_price, "Profit take approved");
        Ok(closed)
    }

    /// Deny a pending request; the position stays open and trailing resumes.
    pub async fn deny(&self, request_id: ProfitTakeId, actor: &Actor) -> DaemonResult<ProfitTakeRequest> {
        let request = self.pending(request_id).await?;

        let request = self.store.profit_takes().transition(request.id, ProfitTakeStatus::Denied, Utc::now()).await?;
        self.ledger
            .record(actor.stamp(AuditRecord::new(
                "PROFIT_TAKE_DENIED",
                "profit_take",
                request.id,
                json!({ "position_id": request.position_id, "price": request.price }),
            )))
            .await?;

        info!(request_id = %request.id, position_id = %request.position_id, "Profit take denied");
        Ok(request)
    }

    async fn pending(&self, request_id: ProfitTakeId) -> DaemonResult<ProfitTakeRequest> {
        let request = self
            .store
            .profit_takes()
            .find_by_id(request_id)
            .await?
            .ok_or_else(|| DaemonError::not_found("profit_take", request_id))?;

        if request.status != ProfitTakeStatus::Pending {
            return Err(DaemonError::Validation(format!(
                "profit take {} is already {:?}",
                request_id, request.status
            )));
        }
        if request.is_expired(Utc::now()) {
            return Err(DaemonError::Validation(format!("profit take {} has expired", request_id)));
        }
        Ok(request)
    }
}
