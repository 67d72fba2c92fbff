//! Side-effect inspection of relayed frames
//!
//! The decoder owns protocol semantics. The gateway only peeks at a few
//! frames to keep the state record current and to emit events:
//!
//! | Direction | Frame | Effect |
//! |-----------|-------|--------|
//! | device → decoder | BootNotification | vendor/model, `Available` |
//! | device → decoder | StatusNotification | lifecycle status |
//! | device → decoder | StartTransaction | remembered until the result |
//! | decoder → device | result of StartTransaction | active transaction |
//! | device → decoder | StopTransaction | transaction cleared, meter 0 |
//! | device → decoder | MeterValues | energy |
//! | device → decoder | DataTransfer `ChargingSpeed` | rate profile |

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::events::{Direction, Event};
use crate::ocpp::{
    Action, BootNotificationRequest, Call, DataTransferRequest, MeterValuesRequest, OcppMessage,
    StartTransactionRequest, StartTransactionResponse, StatusNotificationRequest,
    StopTransactionRequest, VENDOR_CHARGING_SPEED,
};
use crate::session::StateRecord;

/// Outcome of inspecting a device frame
#[derive(Debug, Default)]
pub struct DeviceFrame {
    /// Single-line text for the decoder, if the frame is relayed
    pub forward: Option<String>,
    pub events: Vec<Event>,
}

/// Outcome of inspecting a decoder line
#[derive(Debug, Default)]
pub struct DecoderFrame {
    /// Text for the device, if the line is relayed
    pub reply: Option<String>,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone)]
struct PendingStart {
    id_tag: String,
    meter_start: i64,
}

/// Per-session frame inspector
pub struct Inspector {
    charge_point_id: String,
    pending_starts: HashMap<String, PendingStart>,
}

impl Inspector {
    pub fn new(charge_point_id: impl Into<String>) -> Self {
        Self {
            charge_point_id: charge_point_id.into(),
            pending_starts: HashMap::new(),
        }
    }

    /// Inspect a frame received from the device
    pub fn on_device_text(&mut self, state: &mut StateRecord, text: &str) -> DeviceFrame {
        state.touch();

        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: dropping non-JSON frame: {}", self.charge_point_id, e);
                return DeviceFrame::default();
            }
        };

        // The decoder reads one message per line
        let forward = if text.contains(['\n', '\r']) {
            value.to_string()
        } else {
            text.to_string()
        };

        let mut events = vec![Event::Log {
            direction: Direction::Request,
            charge_point_id: self.charge_point_id.clone(),
            message: value.clone(),
        }];

        match OcppMessage::from_value(&value) {
            Ok(OcppMessage::Call(call)) => self.on_device_call(state, &call, &mut events),
            Ok(_) => {}
            Err(e) => debug!("{}: relaying unrecognized frame: {}", self.charge_point_id, e),
        }

        DeviceFrame {
            forward: Some(forward),
            events,
        }
    }

    fn on_device_call(&mut self, state: &mut StateRecord, call: &Call, events: &mut Vec<Event>) {
        let id = self.charge_point_id.clone();

        match call.action {
            Action::BootNotification => match call.parse_payload::<BootNotificationRequest>() {
                Ok(req) => {
                    state.apply_boot(&req.charge_point_vendor, &req.charge_point_model);
                    info!(
                        "{}: booted ({} {})",
                        id, req.charge_point_vendor, req.charge_point_model
                    );
                    events.push(Event::Booted {
                        id,
                        state: state.clone(),
                    });
                }
                Err(e) => self.malformed(call, e),
            },

            Action::StatusNotification => match call.parse_payload::<StatusNotificationRequest>() {
                Ok(req) => {
                    if state.set_status(req.status.into()) {
                        events.push(Event::StatusChanged {
                            id,
                            status: state.status,
                        });
                    }
                }
                Err(e) => self.malformed(call, e),
            },

            Action::StartTransaction => match call.parse_payload::<StartTransactionRequest>() {
                Ok(req) => {
                    self.pending_starts.insert(
                        call.message_id.clone(),
                        PendingStart {
                            id_tag: req.id_tag,
                            meter_start: req.meter_start,
                        },
                    );
                }
                Err(e) => self.malformed(call, e),
            },

            Action::StopTransaction => {
                let req = call
                    .parse_payload::<StopTransactionRequest>()
                    .map_err(|e| self.malformed(call, e))
                    .ok();
                let active = state.stop_transaction();
                let stopped = req.as_ref().map(|r| r.transaction_id).or(active);
                info!("{}: transaction {:?} stopped", id, stopped);

                events.push(Event::TransactionStopped {
                    id: id.clone(),
                    stopped_transaction_id: stopped,
                    meter_stop: req.map(|r| r.meter_stop),
                });
                events.push(Event::MeterSample {
                    id: id.clone(),
                    value: 0.0,
                });
                events.push(Event::RateProfileChanged { id, speed: None });
            }

            Action::MeterValues => match call.parse_payload::<MeterValuesRequest>() {
                Ok(req) => match req.latest_energy_wh() {
                    Some(wh) => {
                        state.record_energy(wh);
                        events.push(Event::MeterSample { id, value: wh });
                    }
                    None => debug!("{}: MeterValues without a numeric sample", id),
                },
                Err(e) => self.malformed(call, e),
            },

            Action::DataTransfer => match call.parse_payload::<DataTransferRequest>() {
                Ok(req) if req.vendor_id == VENDOR_CHARGING_SPEED => {
                    let speed = match req.data {
                        Some(Value::String(s)) => Some(s),
                        Some(Value::Null) | None => None,
                        Some(other) => Some(other.to_string()),
                    };
                    state.select_charge_speed(speed.clone());
                    events.push(Event::RateProfileChanged { id, speed });
                }
                Ok(_) => {}
                Err(e) => self.malformed(call, e),
            },

            _ => {}
        }
    }

    /// Inspect a line produced by the decoder
    pub fn on_decoder_line(&mut self, state: &mut StateRecord, line: &str) -> DecoderFrame {
        let line = line.trim();
        if line.is_empty() {
            return DecoderFrame::default();
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "{}: dropping malformed decoder line ({}): {}",
                    self.charge_point_id, e, line
                );
                return DecoderFrame::default();
            }
        };

        let mut events = vec![Event::Log {
            direction: Direction::Response,
            charge_point_id: self.charge_point_id.clone(),
            message: value.clone(),
        }];

        match OcppMessage::from_value(&value) {
            Ok(OcppMessage::CallResult(result)) => {
                let pending = self.pending_starts.remove(&result.message_id);
                let confirmed = result
                    .parse_payload::<StartTransactionResponse>()
                    .ok()
                    .map(|r| r.transaction_id);

                match (pending, confirmed) {
                    (Some(start), Some(transaction_id)) => {
                        state.start_transaction(transaction_id);
                        info!(
                            "{}: transaction {} started for {}",
                            self.charge_point_id, transaction_id, start.id_tag
                        );
                        events.push(Event::TransactionStarted {
                            id: self.charge_point_id.clone(),
                            transaction_id,
                            id_tag: Some(start.id_tag),
                            meter_start: Some(start.meter_start),
                        });
                    }
                    (Some(_), None) => warn!(
                        "{}: StartTransaction result {} carries no transactionId",
                        self.charge_point_id, result.message_id
                    ),
                    // Result for a request the gateway did not see
                    (None, Some(transaction_id)) if state.transaction_id != Some(transaction_id) => {
                        state.start_transaction(transaction_id);
                        events.push(Event::TransactionStarted {
                            id: self.charge_point_id.clone(),
                            transaction_id,
                            id_tag: None,
                            meter_start: None,
                        });
                    }
                    _ => {}
                }
            }
            Ok(OcppMessage::CallError(error)) => {
                if self.pending_starts.remove(&error.message_id).is_some() {
                    warn!(
                        "{}: StartTransaction {} refused by decoder: {:?} {}",
                        self.charge_point_id,
                        error.message_id,
                        error.error_code,
                        error.error_description
                    );
                }
            }
            Ok(OcppMessage::Call(_)) => {}
            Err(e) => debug!(
                "{}: relaying unrecognized decoder frame: {}",
                self.charge_point_id, e
            ),
        }

        DecoderFrame {
            reply: Some(value.to_string()),
            events,
        }
    }

    fn malformed(&self, call: &Call, error: impl std::fmt::Display) {
        warn!(
            "{}: malformed {} payload: {}",
            self.charge_point_id, call.action, error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LifecycleStatus;

    fn types(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .map(|e| serde_json::to_value(e).unwrap()["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_boot_and_status() {
        let mut inspector = Inspector::new("CP1");
        let mut state = StateRecord::new("CP1");

        let frame = inspector.on_device_text(
            &mut state,
            r#"[2,"b1","BootNotification",{"chargePointVendor":"A","chargePointModel":"B"}]"#,
        );
        assert!(frame.forward.is_some());
        assert_eq!(types(&frame.events), vec!["log", "boot"]);
        assert_eq!(state.vendor, "A");
        assert_eq!(state.status, LifecycleStatus::Available);

        let frame = inspector.on_device_text(
            &mut state,
            r#"[2,"s1","StatusNotification",{"connectorId":1,"errorCode":"NoError","status":"Charging"}]"#,
        );
        assert_eq!(types(&frame.events), vec!["log", "status"]);
        assert_eq!(state.status, LifecycleStatus::Charging);
    }

    #[test]
    fn test_transaction_confirmed_by_decoder() {
        let mut inspector = Inspector::new("CP1");
        let mut state = StateRecord::new("CP1");

        inspector.on_device_text(
            &mut state,
            r#"[2,"t1","StartTransaction",{"connectorId":1,"idTag":"048E0B84","meterStart":0,"timestamp":"2026-01-20T12:00:00Z"}]"#,
        );
        assert_eq!(state.transaction_id, None);

        let frame = inspector.on_decoder_line(
            &mut state,
            r#"[3,"t1",{"transactionId":7,"idTagInfo":{"status":"Accepted"}}]"#,
        );
        assert_eq!(state.transaction_id, Some(7));
        match &frame.events[1] {
            Event::TransactionStarted {
                transaction_id,
                id_tag,
                meter_start,
                ..
            } => {
                assert_eq!(*transaction_id, 7);
                assert_eq!(id_tag.as_deref(), Some("048E0B84"));
                assert_eq!(*meter_start, Some(0));
            }
            other => panic!("unexpected {:?}", other),
        }

        inspector.on_device_text(
            &mut state,
            r#"[2,"m1","MeterValues",{"connectorId":1,"transactionId":7,"meterValue":[{"sampledValue":[{"value":"1500","measurand":"Energy.Active.Import.Register","unit":"Wh"}]}]}]"#,
        );
        assert_eq!(state.energy, 1500.0);

        let frame = inspector.on_device_text(
            &mut state,
            r#"[2,"x1","StopTransaction",{"transactionId":7,"meterStop":1500,"timestamp":"2026-01-20T13:00:00Z"}]"#,
        );
        assert_eq!(state.transaction_id, None);
        assert_eq!(state.energy, 0.0);
        assert_eq!(
            types(&frame.events),
            vec!["log", "transactionStop", "meterValue", "speedUpdate"]
        );
    }

    #[test]
    fn test_refused_start_leaves_no_transaction() {
        let mut inspector = Inspector::new("CP1");
        let mut state = StateRecord::new("CP1");

        inspector.on_device_text(
            &mut state,
            r#"[2,"t1","StartTransaction",{"connectorId":1,"idTag":"X","meterStart":0}]"#,
        );
        let frame = inspector.on_decoder_line(&mut state, r#"[4,"t1","InternalError","boom",{}]"#);
        assert_eq!(types(&frame.events), vec!["log"]);
        assert_eq!(state.transaction_id, None);

        // A late result no longer matches a pending start but still carries an id
        let frame = inspector.on_decoder_line(&mut state, r#"[3,"t1",{"transactionId":9}]"#);
        assert_eq!(state.transaction_id, Some(9));
        assert_eq!(types(&frame.events), vec!["log", "transactionStart"]);
    }

    #[test]
    fn test_charging_speed() {
        let mut inspector = Inspector::new("CP1");
        let mut state = StateRecord::new("CP1");

        let frame = inspector.on_device_text(
            &mut state,
            r#"[2,"d1","DataTransfer",{"vendorId":"ChargingSpeed","data":"fast"}]"#,
        );
        assert_eq!(state.charge_speed.as_deref(), Some("fast"));
        assert_eq!(types(&frame.events), vec!["log", "speedUpdate"]);

        let frame = inspector.on_device_text(
            &mut state,
            r#"[2,"d2","DataTransfer",{"vendorId":"Other","data":"x"}]"#,
        );
        assert_eq!(types(&frame.events), vec!["log"]);
        assert_eq!(state.charge_speed.as_deref(), Some("fast"));
    }

    #[test]
    fn test_malformed_input() {
        let mut inspector = Inspector::new("CP1");
        let mut state = StateRecord::new("CP1");

        let frame = inspector.on_device_text(&mut state, "not json");
        assert!(frame.forward.is_none());
        assert!(frame.events.is_empty());

        // Multi-line JSON is compacted for the decoder
        let frame = inspector.on_device_text(&mut state, "[2,\n\"h1\",\n\"Heartbeat\",\n{}]");
        assert_eq!(frame.forward.as_deref(), Some(r#"[2,"h1","Heartbeat",{}]"#));

        let frame = inspector.on_decoder_line(&mut state, "[3,\"h1\"");
        assert!(frame.reply.is_none());
        assert!(frame.events.is_empty());

        let frame = inspector.on_decoder_line(&mut state, "   ");
        assert!(frame.reply.is_none());

        // Bad payloads are relayed without side effects
        let frame = inspector.on_device_text(&mut state, r#"[2,"s1","StatusNotification",{"status":"Exploded"}]"#);
        assert!(frame.forward.is_some());
        assert_eq!(types(&frame.events), vec!["log"]);
    }
}
