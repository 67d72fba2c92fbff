//! Per-session state record and lifecycle state machine
//!
//! The record mirrors what the device reports. Transitions outside the
//! expected graph are still applied (the device is authoritative) but are
//! logged so operators can spot misbehaving firmware. `Disconnected` is
//! terminal: once reached the record accepts no further status changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ocpp::ChargePointStatus;

/// Lifecycle status of a charge point, distinct from socket connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStatus {
    Connecting,
    Available,
    Preparing,
    Charging,
    SuspendedEVSE,
    SuspendedEV,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
    Disconnected,
}

impl LifecycleStatus {
    /// Whether `next` is an expected successor of `self`
    pub fn can_transition(self, next: LifecycleStatus) -> bool {
        use LifecycleStatus::*;

        if self == Disconnected {
            return false;
        }
        if self == next || matches!(next, Faulted | Disconnected) {
            return true;
        }

        match self {
            Connecting => matches!(next, Available | Unavailable),
            Available => matches!(next, Unavailable | Preparing | Reserved),
            Unavailable => matches!(next, Available),
            Preparing => matches!(next, Available | Charging),
            Charging => matches!(next, SuspendedEVSE | SuspendedEV | Finishing),
            SuspendedEVSE | SuspendedEV => {
                matches!(next, Charging | SuspendedEVSE | SuspendedEV | Finishing)
            }
            Finishing => matches!(next, Available),
            Reserved => matches!(next, Available | Preparing | Unavailable),
            Faulted => matches!(next, Available | Unavailable),
            Disconnected => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleStatus::Connecting => "Connecting",
            LifecycleStatus::Available => "Available",
            LifecycleStatus::Preparing => "Preparing",
            LifecycleStatus::Charging => "Charging",
            LifecycleStatus::SuspendedEVSE => "SuspendedEVSE",
            LifecycleStatus::SuspendedEV => "SuspendedEV",
            LifecycleStatus::Finishing => "Finishing",
            LifecycleStatus::Reserved => "Reserved",
            LifecycleStatus::Unavailable => "Unavailable",
            LifecycleStatus::Faulted => "Faulted",
            LifecycleStatus::Disconnected => "Disconnected",
        }
    }

    /// Parse a persisted status string
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ChargePointStatus> for LifecycleStatus {
    fn from(status: ChargePointStatus) -> Self {
        match status {
            ChargePointStatus::Available => LifecycleStatus::Available,
            ChargePointStatus::Preparing => LifecycleStatus::Preparing,
            ChargePointStatus::Charging => LifecycleStatus::Charging,
            ChargePointStatus::SuspendedEVSE => LifecycleStatus::SuspendedEVSE,
            ChargePointStatus::SuspendedEV => LifecycleStatus::SuspendedEV,
            ChargePointStatus::Finishing => LifecycleStatus::Finishing,
            ChargePointStatus::Reserved => LifecycleStatus::Reserved,
            ChargePointStatus::Unavailable => LifecycleStatus::Unavailable,
            ChargePointStatus::Faulted => LifecycleStatus::Faulted,
        }
    }
}

/// Socket-level connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

/// Projection of a charge point's state, as shown to dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub id: String,
    pub connectivity: Connectivity,
    pub vendor: String,
    pub model: String,
    pub status: LifecycleStatus,
    pub transaction_id: Option<i64>,
    /// Energy delivered in the active transaction, Wh
    pub energy: f64,
    /// Charging speed selected by the driver's app
    pub charge_speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

impl StateRecord {
    /// Fresh record for a newly admitted session
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connectivity: Connectivity::Online,
            vendor: String::new(),
            model: String::new(),
            status: LifecycleStatus::Connecting,
            transaction_id: None,
            energy: 0.0,
            charge_speed: None,
            last_activity: Some(Utc::now()),
        }
    }

    /// Record for a device known to storage but not connected
    pub fn offline(
        id: impl Into<String>,
        vendor: Option<String>,
        model: Option<String>,
        status: Option<LifecycleStatus>,
        last_activity: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: id.into(),
            connectivity: Connectivity::Offline,
            vendor: vendor.unwrap_or_default(),
            model: model.unwrap_or_default(),
            status: status.unwrap_or(LifecycleStatus::Unavailable),
            transaction_id: None,
            energy: 0.0,
            charge_speed: None,
            last_activity,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Some(Utc::now());
    }

    /// BootNotification: vendor/model known, device is Available
    pub fn apply_boot(&mut self, vendor: &str, model: &str) {
        self.vendor = vendor.to_string();
        self.model = model.to_string();
        self.set_status(LifecycleStatus::Available);
    }

    /// Apply a device-reported status. Returns false if the record is
    /// already terminal and the status was ignored.
    pub fn set_status(&mut self, next: LifecycleStatus) -> bool {
        if self.status == LifecycleStatus::Disconnected {
            debug!("{}: ignoring status {} after disconnect", self.id, next);
            return false;
        }
        if !self.status.can_transition(next) {
            warn!(
                "{}: unexpected status transition {} -> {}",
                self.id, self.status, next
            );
        }
        self.status = next;
        true
    }

    /// Transaction confirmed by the decoder; metering restarts at zero
    pub fn start_transaction(&mut self, transaction_id: i64) {
        if let Some(previous) = self.transaction_id {
            warn!(
                "{}: transaction {} replaces unfinished transaction {}",
                self.id, transaction_id, previous
            );
        }
        self.transaction_id = Some(transaction_id);
        self.energy = 0.0;
    }

    /// StopTransaction: clears the active transaction, energy and speed.
    /// Returns the transaction that was active, if any.
    pub fn stop_transaction(&mut self) -> Option<i64> {
        self.energy = 0.0;
        self.charge_speed = None;
        self.transaction_id.take()
    }

    pub fn record_energy(&mut self, watt_hours: f64) {
        self.energy = watt_hours;
    }

    pub fn select_charge_speed(&mut self, speed: Option<String>) {
        self.charge_speed = speed;
    }

    /// Terminal state: socket gone
    pub fn disconnect(&mut self) {
        self.connectivity = Connectivity::Offline;
        self.status = LifecycleStatus::Disconnected;
        self.transaction_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charging_cycle_is_on_graph() {
        use LifecycleStatus::*;
        let path = [
            Connecting,
            Available,
            Preparing,
            Charging,
            SuspendedEV,
            Charging,
            SuspendedEVSE,
            Finishing,
            Available,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_faulted_and_disconnected_reachable_from_anywhere() {
        use LifecycleStatus::*;
        for from in [Connecting, Available, Charging, Finishing, Reserved, Unavailable] {
            assert!(from.can_transition(Faulted));
            assert!(from.can_transition(Disconnected));
        }
        assert!(!Disconnected.can_transition(Available));
        assert!(!Available.can_transition(Finishing));
    }

    #[test]
    fn test_record_mirrors_device_but_disconnect_is_terminal() {
        let mut record = StateRecord::new("CP1");
        record.apply_boot("A", "B");
        assert_eq!(record.status, LifecycleStatus::Available);

        // Off-graph, still applied
        assert!(record.set_status(LifecycleStatus::Finishing));
        assert_eq!(record.status, LifecycleStatus::Finishing);

        record.disconnect();
        assert!(!record.set_status(LifecycleStatus::Available));
        assert_eq!(record.status, LifecycleStatus::Disconnected);
        assert_eq!(record.connectivity, Connectivity::Offline);
    }

    #[test]
    fn test_transaction_lifecycle() {
        let mut record = StateRecord::new("CP1");
        record.start_transaction(7);
        record.record_energy(1500.0);
        record.select_charge_speed(Some("fast".into()));
        assert_eq!(record.transaction_id, Some(7));

        assert_eq!(record.stop_transaction(), Some(7));
        assert_eq!(record.transaction_id, None);
        assert_eq!(record.energy, 0.0);
        assert_eq!(record.charge_speed, None);
        assert_eq!(record.stop_transaction(), None);
    }

    #[test]
    fn test_wire_shape() {
        let mut record = StateRecord::new("CP1");
        record.apply_boot("A", "B");
        record.last_activity = None;
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id": "CP1",
                "connectivity": "online",
                "vendor": "A",
                "model": "B",
                "status": "Available",
                "transactionId": null,
                "energy": 0.0,
                "chargeSpeed": null
            })
        );
        assert_eq!(LifecycleStatus::parse("SuspendedEVSE"), Some(LifecycleStatus::SuspendedEVSE));
        assert_eq!(LifecycleStatus::parse("bogus"), None);
    }
}
