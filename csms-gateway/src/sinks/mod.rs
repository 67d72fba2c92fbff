//! Event consumers
//!
//! Every sink receives its own copy of each [`Event`]. A sink that cannot take
//! an event right now returns [`GatewayError::SinkDelivery`] and the event is
//! skipped for that sink only.

pub mod broadcast;
pub mod persistence;
pub mod supervisory;

use crate::error::GatewayError;
use crate::events::Event;

pub use broadcast::{merge_snapshot, Broadcaster, DashboardSink, DashboardSubscription};
pub use persistence::{DeviceRecord, DeviceStore, PersistenceError, PersistenceSink, TransactionRecord};
pub use supervisory::{TagError, TagStore, TagValue, TriggerAction};

/// A consumer of gateway events
///
/// `deliver` is called with the broadcaster's registry lock held, so it must
/// not block or perform I/O.
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    fn deliver(&self, event: &Event) -> Result<(), GatewayError>;
}
