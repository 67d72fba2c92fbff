//! Gateway error taxonomy
//!
//! Session-scoped errors (transport, decoder, routing, race rejection) are
//! handled where they occur and never reach other sessions. Only the
//! startup variants (`PersistenceInit`, `PortInUse`, `Bind`) are fatal.

use std::net::SocketAddr;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::sinks::persistence::PersistenceError;

/// Why a command could not be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingFailure {
    /// No live session for the identifier
    NotConnected,
    /// Session exists but its socket is closing or closed
    TransportClosed,
    /// Session is not draining its outbound queue
    QueueFull,
}

impl std::fmt::Display for RoutingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingFailure::NotConnected => f.write_str("charge point not connected"),
            RoutingFailure::TransportClosed => f.write_str("charge point transport closed"),
            RoutingFailure::QueueFull => f.write_str("charge point outbound queue full"),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error for {charge_point_id}: {source}")]
    Transport {
        charge_point_id: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("decoder process for {charge_point_id} failed: {reason}")]
    DecoderProcess {
        charge_point_id: String,
        reason: String,
    },

    #[error("sink {sink} not ready, event skipped")]
    SinkDelivery { sink: String },

    #[error("cannot route {command} to {target}: {reason}")]
    Routing {
        command: String,
        target: String,
        reason: RoutingFailure,
    },

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("connection for {0} rejected: session creation already in progress")]
    RaceRejection(String),

    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error("websocket handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),

    #[error("persistence unavailable at startup: {0}")]
    PersistenceInit(#[source] PersistenceError),

    #[error("{}", port_in_use_message(.addr))]
    PortInUse { addr: SocketAddr },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

fn port_in_use_message(addr: &SocketAddr) -> String {
    let port = addr.port();
    format!(
        "port {port} is already in use. Stop the process holding it \
         (Linux/macOS: `lsof -i :{port}` then `kill <PID>`; \
         Windows: `netstat -ano | findstr :{port}` then `taskkill /PID <PID> /F`) \
         or start with a different --port"
    )
}

impl GatewayError {
    /// Failures that must stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::PersistenceInit(_)
                | GatewayError::PortInUse { .. }
                | GatewayError::Bind { .. }
        )
    }
}
