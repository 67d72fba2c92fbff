//! # CSMS Session Gateway
//!
//! OCPP 1.6-J session gateway for a charging station management system.
//!
//! The gateway accepts charge point WebSocket connections, keeps exactly one
//! live session per charge point id, relays every frame to an external
//! decoder process and fans the resulting state changes out to dashboards,
//! a supervisory tag store and SQLite.
//!
//! ## Architecture
//!
//! ```text
//!  Charge points            Dashboards / SCADA
//!       │ ws /<id>                │ ws /dashboard, /scada
//!       ▼                         ▼
//! ┌──────────────────────────────────────────────┐
//! │               csms-gateway                   │
//! │  ┌──────────┐  ┌────────┐  ┌──────────────┐  │
//! │  │ Session  │◄►│ Bridge │◄►│ Decoder proc │  │
//! │  │ Registry │  └───┬────┘  └──────────────┘  │
//! │  └────▲─────┘      │ events                  │
//! │       │       ┌────▼────────┐                │
//! │  ┌────┴────┐  │ Broadcaster │──► dashboards  │
//! │  │ Command │  └────┬────────┘──► tag store   │
//! │  │ Router  │       └──────────► persistence  │
//! │  └─────────┘                                 │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Dashboard protocol
//!
//! | Direction | `type` | Fields |
//! |-----------|--------|--------|
//! | out | `fullStatus` | `chargePoints` |
//! | out | `connect`, `boot` | `id`, `state` |
//! | out | `status` | `id`, `status` |
//! | out | `transactionStart` | `id`, `transactionId`, `idTag`, `meterStart` |
//! | out | `transactionStop` | `id`, `stoppedTransactionId`, `meterStop` |
//! | out | `meterValue` | `id`, `value` (Wh) |
//! | out | `speedUpdate` | `id`, `speed` |
//! | out | `disconnect` | `id` |
//! | out | `log` | `direction`, `chargePointId`, `message` |
//! | in | `remoteCommand` | `command`, `chargePointId`, `params` |
//! | in | `writeTag` (`/scada` only) | `chargePointId`, `tag`, `value` |
//!
//! ## Usage
//!
//! ```no_run
//! use csms_gateway::{Gateway, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::default()
//!         .with_port(9000)
//!         .with_decoder("python", ["OCPP_handler.py"])
//!         .with_database_url("sqlite://csms.db");
//!
//!     let gateway = Gateway::start(config).await?;
//!     gateway
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod ocpp;
pub mod router;
pub mod server;
pub mod session;
pub mod sinks;

pub use config::{DecoderConfig, GatewayConfig, PersistenceConfig, SupervisoryConfig};
pub use error::{GatewayError, RoutingFailure};
pub use events::{DashboardRequest, Direction, Event, FullStatus, OPERATOR_ORIGIN};
pub use gateway::{Gateway, GatewayContext};
pub use router::CommandRouter;
pub use session::{LifecycleStatus, SessionHandle, SessionRegistry, StateRecord};
pub use sinks::{Broadcaster, DeviceStore, EventSink, TagStore};
