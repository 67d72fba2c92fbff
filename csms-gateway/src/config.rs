//! Configuration for the session gateway
//!
//! Covers the listener, the per-session decoder process, persistence and the
//! supervisory address space.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Complete gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the WebSocket listener binds to
    pub listen_addr: SocketAddr,

    /// Decoder process spawned for every device session
    pub decoder: DecoderConfig,

    // Sinks
    pub persistence: PersistenceConfig,
    pub supervisory: SupervisoryConfig,

    /// WebSocket subprotocols echoed back when a client offers them
    pub subprotocols: Vec<String>,

    /// Frames a dashboard may lag behind before events are skipped for it
    pub dashboard_buffer: usize,

    /// Upper bound for draining sessions and persistence on shutdown
    pub shutdown_grace: Duration,

    /// Largest accepted WebSocket message
    pub max_message_size: usize,
}

/// External decoder process
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory; inherits the gateway's when unset
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// SQLite URL, e.g. `sqlite://csms.db` or `sqlite::memory:`
    pub database_url: String,

    /// Writes queued before new events are skipped
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct SupervisoryConfig {
    /// Folder holding one sub-folder per charge point
    pub root_folder: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            decoder: DecoderConfig::default(),
            persistence: PersistenceConfig::default(),
            supervisory: SupervisoryConfig::default(),
            subprotocols: vec!["ocpp1.6".to_string()],
            dashboard_buffer: 256,
            shutdown_grace: Duration::from_secs(1),
            max_message_size: 64 * 1024,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["OCPP_handler.py".to_string()],
            working_dir: None,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://csms.db".to_string(),
            queue_capacity: 1024,
        }
    }
}

impl Default for SupervisoryConfig {
    fn default() -> Self {
        Self {
            root_folder: "ChargePoints".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Set listen address
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set listen port, keeping the bind address
    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_addr.set_port(port);
        self
    }

    /// Set decoder program and arguments
    pub fn with_decoder<I, S>(mut self, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.decoder.program = program.into();
        self.decoder.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set decoder working directory
    pub fn with_decoder_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.decoder.working_dir = Some(dir.into());
        self
    }

    /// Set database URL
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.persistence.database_url = url.into();
        self
    }

    /// Set supervisory root folder
    pub fn with_root_folder(mut self, folder: impl Into<String>) -> Self {
        self.supervisory.root_folder = folder.into();
        self
    }

    /// Set shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set per-dashboard frame buffer
    pub fn with_dashboard_buffer(mut self, frames: usize) -> Self {
        self.dashboard_buffer = frames;
        self
    }
}
