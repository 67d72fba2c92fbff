//! OCPP-J message framing
//!
//! OCPP carries RPC frames over WebSocket as JSON arrays:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! The gateway relays frames without decoding most of them, so unknown
//! actions parse into [`Action::Other`] instead of failing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    SecurityError,
    TypeConstraintViolation,
}

/// OCPP action names
///
/// Only the actions the gateway inspects get their own variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    // CP -> CSMS
    BootNotification,
    Heartbeat,
    StatusNotification,
    StartTransaction,
    StopTransaction,
    MeterValues,
    DataTransfer,

    // CSMS -> CP
    RemoteStartTransaction,
    RemoteStopTransaction,

    /// Any action relayed without inspection
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::BootNotification => "BootNotification",
            Action::Heartbeat => "Heartbeat",
            Action::StatusNotification => "StatusNotification",
            Action::StartTransaction => "StartTransaction",
            Action::StopTransaction => "StopTransaction",
            Action::MeterValues => "MeterValues",
            Action::DataTransfer => "DataTransfer",
            Action::RemoteStartTransaction => "RemoteStartTransaction",
            Action::RemoteStopTransaction => "RemoteStopTransaction",
            Action::Other(name) => name,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        match s {
            "BootNotification" => Action::BootNotification,
            "Heartbeat" => Action::Heartbeat,
            "StatusNotification" => Action::StatusNotification,
            "StartTransaction" => Action::StartTransaction,
            "StopTransaction" => Action::StopTransaction,
            "MeterValues" => Action::MeterValues,
            "DataTransfer" => Action::DataTransfer,
            "RemoteStartTransaction" => Action::RemoteStartTransaction,
            "RemoteStopTransaction" => Action::RemoteStopTransaction,
            other => Action::Other(other.to_string()),
        }
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),
}

/// OCPP CALL message (request)
#[derive(Debug, Clone)]
pub struct Call {
    pub message_id: String,
    pub action: Action,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with a fresh correlation id
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Wire form: [2, messageId, action, payload]
    pub fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            self.action.as_str(),
            &self.payload
        ])
    }

    /// Serialize to a single-line text frame
    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }

    /// Parse the payload as a specific request type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from text
    pub fn parse(text: &str) -> Result<Self, OcppError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    /// Interpret an already decoded JSON array as an OCPP frame
    pub fn from_value(value: &Value) -> Result<Self, OcppError> {
        let array = value.as_array().ok_or(OcppError::InvalidFormat)?;

        if array.is_empty() {
            return Err(OcppError::InvalidFormat);
        }

        let msg_type = array[0].as_i64().ok_or(OcppError::InvalidFormat)?;

        match msg_type {
            2 => {
                // CALL: [2, messageId, action, payload]
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat);
                }

                let message_id = message_id(&array[1])?;
                let action = array[2].as_str().ok_or(OcppError::InvalidFormat)?;

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action: Action::from(action),
                    payload: array[3].clone(),
                }))
            }
            3 => {
                // CALLRESULT: [3, messageId, payload]
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat);
                }

                Ok(OcppMessage::CallResult(CallResult {
                    message_id: message_id(&array[1])?,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
                if array.len() < 4 {
                    return Err(OcppError::InvalidFormat);
                }

                let error_code_str = array[2].as_str().ok_or(OcppError::InvalidFormat)?;

                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str.to_string()))
                        .unwrap_or(ErrorCode::GenericError);

                Ok(OcppMessage::CallError(CallError {
                    message_id: message_id(&array[1])?,
                    error_code,
                    error_description: array[3].as_str().unwrap_or("").to_string(),
                    error_details: array.get(4).cloned().unwrap_or(Value::Null),
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }
}

fn message_id(value: &Value) -> Result<String, OcppError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or(OcppError::InvalidFormat)
}
