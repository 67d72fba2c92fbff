//! Device sessions
//!
//! A [`SessionHandle`] is the registry's view of one connected charge point:
//! its state record, an outbound frame queue drained by the session task,
//! and the decoder process it owns.

pub mod registry;
pub mod state;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use crate::bridge::DecoderProcess;
use crate::error::RoutingFailure;

pub use registry::{Admission, SessionRegistry};
pub use state::{Connectivity, LifecycleStatus, StateRecord};

/// Live session for one charge point
pub struct SessionHandle {
    charge_point_id: String,
    session_id: Uuid,
    created_at: DateTime<Utc>,
    state: RwLock<StateRecord>,
    outbound: mpsc::Sender<String>,
    shutdown: watch::Sender<bool>,
    decoder: Arc<DecoderProcess>,
}

impl SessionHandle {
    /// Create a handle. The receiver fires when the session must end.
    pub fn new(
        charge_point_id: &str,
        outbound: mpsc::Sender<String>,
        decoder: Arc<DecoderProcess>,
    ) -> (Arc<Self>, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = Arc::new(Self {
            charge_point_id: charge_point_id.to_string(),
            session_id: Uuid::new_v4(),
            created_at: Utc::now(),
            state: RwLock::new(StateRecord::new(charge_point_id)),
            outbound,
            shutdown,
            decoder,
        });
        (handle, shutdown_rx)
    }

    pub fn charge_point_id(&self) -> &str {
        &self.charge_point_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Copy of the current state record
    pub fn state(&self) -> StateRecord {
        self.state.read().clone()
    }

    /// Mutate the state record
    pub fn with_state<R>(&self, f: impl FnOnce(&mut StateRecord) -> R) -> R {
        f(&mut self.state.write())
    }

    pub fn active_transaction(&self) -> Option<i64> {
        self.state.read().transaction_id
    }

    pub fn is_open(&self) -> bool {
        !*self.shutdown.borrow() && !self.outbound.is_closed()
    }

    /// Queue a text frame for the device
    ///
    /// Never waits: a session that is not draining its queue fails the
    /// command with [`RoutingFailure::QueueFull`].
    pub fn send(&self, frame: String) -> Result<(), RoutingFailure> {
        if !self.is_open() {
            return Err(RoutingFailure::TransportClosed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RoutingFailure::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RoutingFailure::TransportClosed,
        })
    }

    /// Ask the session to close its socket and kill its decoder
    pub fn terminate(&self) {
        if !self.shutdown.send_replace(true) {
            debug!(
                "{}: terminating session {}",
                self.charge_point_id, self.session_id
            );
        }
        self.decoder.kill();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("charge_point_id", &self.charge_point_id)
            .field("session_id", &self.session_id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::DecoderConfig;

    /// Handle backed by `cat` standing in for the decoder
    pub fn handle(id: &str) -> (Arc<SessionHandle>, mpsc::Receiver<String>, watch::Receiver<bool>) {
        let config = DecoderConfig {
            program: "cat".into(),
            args: vec![],
            working_dir: None,
        };
        let (decoder, _output) = DecoderProcess::spawn(&config, id).unwrap();
        let (tx, rx) = mpsc::channel(8);
        let (handle, shutdown) = SessionHandle::new(id, tx, decoder);
        (handle, rx, shutdown)
    }
}
