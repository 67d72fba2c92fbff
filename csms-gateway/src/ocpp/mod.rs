//! OCPP 1.6-J protocol surface
//!
//! The gateway relays frames rather than implementing the protocol:
//! - `types`: payloads for the handful of actions the gateway inspects
//! - `messages`: JSON-RPC framing (CALL, CALLRESULT, CALLERROR)

pub mod types;
pub mod messages;

pub use types::*;
pub use messages::*;
