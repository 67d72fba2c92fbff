//! Fan-out broadcaster
//!
//! Publishers run their state mutation and the fan-out under a shared read
//! lock; registering a dashboard takes the write lock while it builds the
//! snapshot. A new dashboard therefore sees each change either in its
//! `fullStatus` frame or as a later delta, never both and never neither.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::events::{Event, FullStatus};
use crate::session::StateRecord;
use crate::sinks::EventSink;

/// A connected dashboard or SCADA client
pub struct DashboardSink {
    id: Uuid,
    tx: mpsc::Sender<Arc<str>>,
}

impl DashboardSink {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue an already serialized frame; skipped if the client lags
    pub fn send_frame(&self, frame: Arc<str>) -> Result<(), GatewayError> {
        self.tx.try_send(frame).map_err(|_| GatewayError::SinkDelivery {
            sink: format!("dashboard {}", self.id),
        })
    }
}

impl EventSink for DashboardSink {
    fn name(&self) -> &str {
        "dashboard"
    }

    fn deliver(&self, event: &Event) -> Result<(), GatewayError> {
        match event.to_frame() {
            Ok(frame) => self.send_frame(frame.into()),
            Err(e) => {
                warn!("Failed to serialize {:?}: {}", event, e);
                Ok(())
            }
        }
    }
}

/// Receiving side handed to a dashboard connection
pub struct DashboardSubscription {
    pub id: Uuid,
    /// First frame is always `fullStatus`
    pub frames: mpsc::Receiver<Arc<str>>,
}

#[derive(Default)]
struct Sinks {
    dashboards: HashMap<Uuid, DashboardSink>,
    others: Vec<Arc<dyn EventSink>>,
}

/// Distributes events to every registered sink
pub struct Broadcaster {
    sinks: RwLock<Sinks>,
    dashboard_buffer: usize,
}

impl Broadcaster {
    pub fn new(dashboard_buffer: usize) -> Self {
        Self {
            sinks: RwLock::new(Sinks::default()),
            dashboard_buffer: dashboard_buffer.max(1),
        }
    }

    /// Register a long-lived sink (supervisory, persistence)
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        info!("Registered {} sink", sink.name());
        self.sinks.write().others.push(sink);
    }

    /// Publish a single event
    pub fn publish(&self, event: Event) {
        self.publish_with(|| vec![event]);
    }

    /// Run `change` and publish the events it returns as one step
    ///
    /// `change` is where callers mutate session state, so that a concurrent
    /// dashboard registration observes the mutation and its events together.
    pub fn publish_with<F>(&self, change: F)
    where
        F: FnOnce() -> Vec<Event>,
    {
        let sinks = self.sinks.read();
        for event in change() {
            Self::fan_out(&sinks, &event);
        }
    }

    fn fan_out(sinks: &Sinks, event: &Event) {
        if !sinks.dashboards.is_empty() {
            match event.to_frame() {
                Ok(frame) => {
                    let frame: Arc<str> = frame.into();
                    for dashboard in sinks.dashboards.values() {
                        if let Err(e) = dashboard.send_frame(frame.clone()) {
                            debug!("{}", e);
                        }
                    }
                }
                Err(e) => warn!("Failed to serialize {:?}: {}", event, e),
            }
        }

        for sink in &sinks.others {
            if let Err(e) = sink.deliver(event) {
                debug!("{}", e);
            }
        }
    }

    /// Register a dashboard and queue its snapshot as the first frame
    ///
    /// `persisted` is read from storage beforehand; `live` is evaluated under
    /// the write lock.
    pub fn register_dashboard<F>(&self, persisted: Vec<StateRecord>, live: F) -> DashboardSubscription
    where
        F: FnOnce() -> Vec<StateRecord>,
    {
        let (tx, frames) = mpsc::channel(self.dashboard_buffer + 1);
        let id = Uuid::new_v4();

        let mut sinks = self.sinks.write();
        let snapshot = FullStatus {
            charge_points: merge_snapshot(live(), persisted),
        };
        match serde_json::to_string(&snapshot) {
            Ok(frame) => {
                // Fresh channel with spare capacity
                let _ = tx.try_send(frame.into());
            }
            Err(e) => warn!("Failed to serialize snapshot: {}", e),
        }
        sinks.dashboards.insert(id, DashboardSink { id, tx });
        info!(
            "Dashboard {} registered ({} connected)",
            id,
            sinks.dashboards.len()
        );

        DashboardSubscription { id, frames }
    }

    pub fn remove_dashboard(&self, id: Uuid) {
        let mut sinks = self.sinks.write();
        if sinks.dashboards.remove(&id).is_some() {
            info!(
                "Dashboard {} removed ({} connected)",
                id,
                sinks.dashboards.len()
            );
        }
    }

    pub fn dashboard_count(&self) -> usize {
        self.sinks.read().dashboards.len()
    }
}

/// Live records win; devices only known to storage are shown offline
pub fn merge_snapshot(live: Vec<StateRecord>, persisted: Vec<StateRecord>) -> Vec<StateRecord> {
    let mut merged: BTreeMap<String, StateRecord> = persisted
        .into_iter()
        .map(|record| (record.id.clone(), record))
        .collect();
    for record in live {
        merged.insert(record.id.clone(), record);
    }
    merged.into_values().collect()
}
