//! Remote command router
//!
//! Operator commands from dashboards and supervisory triggers are wrapped
//! as OCPP CALL frames and queued on the target's session. Nothing is queued
//! or retried for a charge point that is not connected.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, RoutingFailure};
use crate::events::{Direction, Event, OPERATOR_ORIGIN};
use crate::ocpp::{Action, Call, RemoteStartTransactionRequest, RemoteStopTransactionRequest};
use crate::session::SessionRegistry;
use crate::sinks::{Broadcaster, TriggerAction};

/// Connector used for supervisory remote starts
const TRIGGER_CONNECTOR_ID: i32 = 1;

#[derive(Clone)]
pub struct CommandRouter {
    registry: SessionRegistry,
    broadcaster: Arc<Broadcaster>,
}

impl CommandRouter {
    pub fn new(registry: SessionRegistry, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            registry,
            broadcaster,
        }
    }

    /// Send `command` to `target`. Returns the CALL's message id.
    pub async fn route(
        &self,
        command: &str,
        target: &str,
        params: Value,
    ) -> Result<String, GatewayError> {
        let failed = |reason: RoutingFailure| {
            let e = GatewayError::Routing {
                command: command.to_string(),
                target: target.to_string(),
                reason,
            };
            warn!("{}", e);
            e
        };

        let handle = self
            .registry
            .lookup(target)
            .ok_or_else(|| failed(RoutingFailure::NotConnected))?;

        let payload = if params.is_null() { json!({}) } else { params };
        let call = Call {
            message_id: Uuid::new_v4().to_string(),
            action: Action::from(command),
            payload,
        };

        handle.send(call.to_text()).map_err(failed)?;

        info!("{}: sent {} ({})", target, call.action, call.message_id);
        self.broadcaster.publish(Event::Log {
            direction: Direction::Request,
            charge_point_id: OPERATOR_ORIGIN.to_string(),
            message: json!([
                2,
                call.message_id.clone(),
                format!("(To {}) {}", target, command),
                call.payload
            ]),
        });

        Ok(call.message_id)
    }

    /// Carry out a supervisory trigger
    ///
    /// RemoteStop is only sent while a transaction is active; otherwise the
    /// trigger is a no-op and `Ok(None)` is returned.
    pub async fn dispatch_trigger(&self, action: TriggerAction) -> Result<Option<String>, GatewayError> {
        match action {
            TriggerAction::RemoteStart {
                charge_point_id,
                id_tag,
            } => {
                let request = RemoteStartTransactionRequest {
                    id_tag,
                    connector_id: Some(TRIGGER_CONNECTOR_ID),
                };
                let params = serde_json::to_value(request).unwrap_or_else(|_| json!({}));
                self.route(Action::RemoteStartTransaction.as_str(), &charge_point_id, params)
                    .await
                    .map(Some)
            }
            TriggerAction::RemoteStop { charge_point_id } => {
                let Some(handle) = self.registry.lookup(&charge_point_id) else {
                    let e = GatewayError::Routing {
                        command: Action::RemoteStopTransaction.to_string(),
                        target: charge_point_id,
                        reason: RoutingFailure::NotConnected,
                    };
                    warn!("{}", e);
                    return Err(e);
                };

                let Some(transaction_id) = handle.active_transaction() else {
                    info!("{}: RemoteStop trigger ignored, no active transaction", charge_point_id);
                    return Ok(None);
                };

                let params = serde_json::to_value(RemoteStopTransactionRequest { transaction_id })
                    .unwrap_or_else(|_| json!({}));
                self.route(Action::RemoteStopTransaction.as_str(), &charge_point_id, params)
                    .await
                    .map(Some)
            }
        }
    }
}
