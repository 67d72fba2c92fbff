//! Gateway events and dashboard wire frames
//!
//! Events are the only thing sinks ever see. They serialize directly to the
//! dashboard JSON protocol (`{type, id, ...}`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{LifecycleStatus, StateRecord};

/// Origin label used for operator-issued commands in the log stream
pub const OPERATOR_ORIGIN: &str = "CSMS_Dashboard";

/// Direction of a mirrored protocol frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

/// State change emitted by a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "connect")]
    Connected { id: String, state: StateRecord },

    #[serde(rename = "boot")]
    Booted { id: String, state: StateRecord },

    #[serde(rename = "status")]
    StatusChanged { id: String, status: LifecycleStatus },

    #[serde(rename = "transactionStart", rename_all = "camelCase")]
    TransactionStarted {
        id: String,
        transaction_id: i64,
        id_tag: Option<String>,
        meter_start: Option<i64>,
    },

    /// The dashboard treats any stop as "no active transaction"; the stopped
    /// id travels along for storage.
    #[serde(rename = "transactionStop", rename_all = "camelCase")]
    TransactionStopped {
        id: String,
        stopped_transaction_id: Option<i64>,
        meter_stop: Option<i64>,
    },

    #[serde(rename = "meterValue")]
    MeterSample { id: String, value: f64 },

    #[serde(rename = "speedUpdate")]
    RateProfileChanged { id: String, speed: Option<String> },

    #[serde(rename = "disconnect")]
    Disconnected { id: String },

    #[serde(rename = "log", rename_all = "camelCase")]
    Log {
        direction: Direction,
        charge_point_id: String,
        message: Value,
    },
}

impl Event {
    /// Charge point this event concerns
    pub fn charge_point_id(&self) -> &str {
        match self {
            Event::Connected { id, .. }
            | Event::Booted { id, .. }
            | Event::StatusChanged { id, .. }
            | Event::TransactionStarted { id, .. }
            | Event::TransactionStopped { id, .. }
            | Event::MeterSample { id, .. }
            | Event::RateProfileChanged { id, .. }
            | Event::Disconnected { id } => id,
            Event::Log {
                charge_point_id, ..
            } => charge_point_id,
        }
    }

    /// Serialize to a dashboard text frame
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Initial frame sent to every dashboard
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename = "fullStatus", rename_all = "camelCase")]
pub struct FullStatus {
    pub charge_points: Vec<StateRecord>,
}

/// Messages accepted from dashboard and SCADA clients
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DashboardRequest {
    #[serde(rename_all = "camelCase")]
    RemoteCommand {
        command: String,
        charge_point_id: String,
        #[serde(default)]
        params: Value,
    },

    #[serde(rename_all = "camelCase")]
    WriteTag {
        charge_point_id: String,
        tag: String,
        value: Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        let event = Event::MeterSample {
            id: "CP1".into(),
            value: 1500.0,
        };
        let value: Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "meterValue", "id": "CP1", "value": 1500.0}));

        let event = Event::TransactionStarted {
            id: "CP1".into(),
            transaction_id: 7,
            id_tag: Some("048E0B84".into()),
            meter_start: Some(0),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "transactionStart");
        assert_eq!(value["transactionId"], 7);

        let event = Event::Log {
            direction: Direction::Response,
            charge_point_id: "CP1".into(),
            message: json!([3, "m1", {}]),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"type": "log", "direction": "response", "chargePointId": "CP1", "message": [3, "m1", {}]})
        );
    }

    #[test]
    fn test_full_status_frame() {
        let frame = FullStatus {
            charge_points: vec![],
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value, json!({"type": "fullStatus", "chargePoints": []}));
    }

    #[test]
    fn test_dashboard_request_parsing() {
        let req: DashboardRequest = serde_json::from_str(
            r#"{"type": "remoteCommand", "command": "Reset", "chargePointId": "CP1"}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            DashboardRequest::RemoteCommand {
                command: "Reset".into(),
                charge_point_id: "CP1".into(),
                params: Value::Null,
            }
        );

        let req: DashboardRequest = serde_json::from_str(
            r#"{"type": "writeTag", "chargePointId": "CP1", "tag": "RemoteStart_Trigger", "value": true}"#,
        )
        .unwrap();
        assert!(matches!(req, DashboardRequest::WriteTag { .. }));

        assert!(serde_json::from_str::<DashboardRequest>(r#"{"type": "selfDestruct"}"#).is_err());
    }
}
