//! Supervisory tag store
//!
//! In-process address space exposing one folder of tags per charge point
//! for a SCADA adapter. Folders are append-only: a reconnecting device
//! finds its existing tags instead of creating duplicates.
//!
//! ```text
//! ChargePoints/
//! └── CP1/
//!     ├── Status, Energy_Wh, TransactionID, Vendor, Model   (read-only)
//!     └── RemoteStart_Trigger, RemoteStart_IdTag, RemoteStop_Trigger
//! ```
//!
//! Trigger tags are edge-detecting watchers: writing `true` fires exactly one
//! [`TriggerAction`] and the tag resets to `false` immediately.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::events::Event;
use crate::sinks::EventSink;

pub const TAG_STATUS: &str = "Status";
pub const TAG_ENERGY_WH: &str = "Energy_Wh";
pub const TAG_TRANSACTION_ID: &str = "TransactionID";
pub const TAG_VENDOR: &str = "Vendor";
pub const TAG_MODEL: &str = "Model";
pub const TAG_REMOTE_START_TRIGGER: &str = "RemoteStart_Trigger";
pub const TAG_REMOTE_START_ID_TAG: &str = "RemoteStart_IdTag";
pub const TAG_REMOTE_STOP_TRIGGER: &str = "RemoteStop_Trigger";

/// idTag used when the operator leaves `RemoteStart_IdTag` empty
pub const DEFAULT_ID_TAG: &str = "0000";

/// Value held by a tag
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
}

impl TagValue {
    /// Convert a JSON value written by a SCADA client
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(TagValue::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(TagValue::Int)
                .or_else(|| n.as_f64().map(TagValue::Double)),
            Value::String(s) => Some(TagValue::Text(s.clone())),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            TagValue::Bool(_) => "Boolean",
            TagValue::Int(_) => "Int64",
            TagValue::Double(_) => "Double",
            TagValue::Text(_) => "String",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TagError {
    #[error("supervisory tag store is closed")]
    Closed,

    #[error("no tag {tag} for {charge_point_id}")]
    UnknownTag { charge_point_id: String, tag: String },

    #[error("tag {tag} is read-only")]
    ReadOnly { tag: String },

    #[error("tag {tag} expects {expected}, got {actual}")]
    TypeMismatch {
        tag: String,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Outcome of binding a device folder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Created,
    Reused,
}

/// Command requested through a trigger tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerAction {
    RemoteStart {
        charge_point_id: String,
        id_tag: String,
    },
    RemoteStop {
        charge_point_id: String,
    },
}

struct DeviceFolder {
    tags: HashMap<&'static str, TagValue>,
    bound: bool,
}

impl DeviceFolder {
    fn new() -> Self {
        let tags = HashMap::from([
            (TAG_STATUS, TagValue::Text("Connecting".into())),
            (TAG_ENERGY_WH, TagValue::Double(0.0)),
            (TAG_TRANSACTION_ID, TagValue::Int(0)),
            (TAG_VENDOR, TagValue::Text(String::new())),
            (TAG_MODEL, TagValue::Text(String::new())),
            (TAG_REMOTE_START_TRIGGER, TagValue::Bool(false)),
            (TAG_REMOTE_START_ID_TAG, TagValue::Text(DEFAULT_ID_TAG.into())),
            (TAG_REMOTE_STOP_TRIGGER, TagValue::Bool(false)),
        ]);
        Self { tags, bound: true }
    }

    fn set(&mut self, tag: &'static str, value: TagValue) {
        self.tags.insert(tag, value);
    }
}

#[derive(Default)]
struct AddressSpace {
    folders: HashMap<String, DeviceFolder>,
    closed: bool,
}

/// Tag store shared by sessions and SCADA clients
pub struct TagStore {
    root_folder: String,
    space: RwLock<AddressSpace>,
}

impl TagStore {
    pub fn new(root_folder: impl Into<String>) -> Self {
        let root_folder = root_folder.into();
        info!("Supervisory address space ready under {}", root_folder);
        Self {
            root_folder,
            space: RwLock::new(AddressSpace::default()),
        }
    }

    /// Browse path of a tag
    pub fn node_path(&self, charge_point_id: &str, tag: &str) -> String {
        format!("{}/{}/{}", self.root_folder, charge_point_id, tag)
    }

    /// Attach a session to its folder, creating it on first sight
    pub fn bind(&self, charge_point_id: &str) -> Result<Binding, TagError> {
        let mut space = self.space.write();
        if space.closed {
            return Err(TagError::Closed);
        }

        match space.folders.get_mut(charge_point_id) {
            Some(folder) => {
                folder.bound = true;
                debug!("{}: reusing supervisory folder", charge_point_id);
                Ok(Binding::Reused)
            }
            None => {
                space
                    .folders
                    .insert(charge_point_id.to_string(), DeviceFolder::new());
                info!(
                    "{}: created supervisory folder {}",
                    charge_point_id,
                    self.node_path(charge_point_id, "")
                );
                Ok(Binding::Created)
            }
        }
    }

    /// Detach a session; the folder stays and reports `Disconnected`
    pub fn release(&self, charge_point_id: &str) {
        let mut space = self.space.write();
        if let Some(folder) = space.folders.get_mut(charge_point_id) {
            folder.bound = false;
            folder.set(TAG_STATUS, TagValue::Text("Disconnected".into()));
        }
    }

    pub fn is_bound(&self, charge_point_id: &str) -> bool {
        self.space
            .read()
            .folders
            .get(charge_point_id)
            .is_some_and(|f| f.bound)
    }

    pub fn read(&self, charge_point_id: &str, tag: &str) -> Option<TagValue> {
        self.space
            .read()
            .folders
            .get(charge_point_id)
            .and_then(|f| f.tags.get(tag))
            .cloned()
    }

    /// Client write. Returns the command a rising trigger edge requests.
    pub fn write(
        &self,
        charge_point_id: &str,
        tag: &str,
        value: TagValue,
    ) -> Result<Option<TriggerAction>, TagError> {
        let mut space = self.space.write();
        if space.closed {
            return Err(TagError::Closed);
        }

        let folder = space
            .folders
            .get_mut(charge_point_id)
            .ok_or_else(|| TagError::UnknownTag {
                charge_point_id: charge_point_id.to_string(),
                tag: tag.to_string(),
            })?;

        match tag {
            TAG_REMOTE_START_TRIGGER | TAG_REMOTE_STOP_TRIGGER => {
                let TagValue::Bool(requested) = value else {
                    return Err(TagError::TypeMismatch {
                        tag: tag.to_string(),
                        expected: "Boolean",
                        actual: value.kind(),
                    });
                };
                if !requested {
                    return Ok(None);
                }

                // Fire once, then auto-reset
                let action = if tag == TAG_REMOTE_START_TRIGGER {
                    let id_tag = match folder.tags.get(TAG_REMOTE_START_ID_TAG) {
                        Some(TagValue::Text(t)) if !t.is_empty() => t.clone(),
                        _ => DEFAULT_ID_TAG.to_string(),
                    };
                    folder.set(TAG_REMOTE_START_TRIGGER, TagValue::Bool(false));
                    TriggerAction::RemoteStart {
                        charge_point_id: charge_point_id.to_string(),
                        id_tag,
                    }
                } else {
                    folder.set(TAG_REMOTE_STOP_TRIGGER, TagValue::Bool(false));
                    TriggerAction::RemoteStop {
                        charge_point_id: charge_point_id.to_string(),
                    }
                };
                info!("{}: trigger {} fired", charge_point_id, tag);
                Ok(Some(action))
            }
            TAG_REMOTE_START_ID_TAG => match value {
                TagValue::Text(_) => {
                    folder.set(TAG_REMOTE_START_ID_TAG, value);
                    Ok(None)
                }
                other => Err(TagError::TypeMismatch {
                    tag: tag.to_string(),
                    expected: "String",
                    actual: other.kind(),
                }),
            },
            known if folder.tags.contains_key(known) => Err(TagError::ReadOnly {
                tag: tag.to_string(),
            }),
            _ => Err(TagError::UnknownTag {
                charge_point_id: charge_point_id.to_string(),
                tag: tag.to_string(),
            }),
        }
    }

    /// Shut the address space down; later writes fail with `Closed`
    pub fn close(&self) {
        let mut space = self.space.write();
        if !space.closed {
            space.closed = true;
            info!(
                "Supervisory address space closed ({} folders)",
                space.folders.len()
            );
        }
    }

    fn update(&self, charge_point_id: &str, values: &[(&'static str, TagValue)]) {
        let mut space = self.space.write();
        if space.closed {
            return;
        }
        if let Some(folder) = space.folders.get_mut(charge_point_id) {
            for (tag, value) in values {
                folder.set(*tag, value.clone());
            }
        }
    }
}

impl EventSink for TagStore {
    fn name(&self) -> &str {
        "supervisory"
    }

    fn deliver(&self, event: &Event) -> Result<(), GatewayError> {
        match event {
            Event::Connected { id, state } => {
                self.update(id, &[(TAG_STATUS, TagValue::Text(state.status.to_string()))]);
            }
            Event::Booted { id, state } => self.update(
                id,
                &[
                    (TAG_VENDOR, TagValue::Text(state.vendor.clone())),
                    (TAG_MODEL, TagValue::Text(state.model.clone())),
                    (TAG_STATUS, TagValue::Text(state.status.to_string())),
                ],
            ),
            Event::StatusChanged { id, status } => {
                self.update(id, &[(TAG_STATUS, TagValue::Text(status.to_string()))]);
            }
            Event::TransactionStarted {
                id, transaction_id, ..
            } => self.update(
                id,
                &[
                    (TAG_TRANSACTION_ID, TagValue::Int(*transaction_id)),
                    (TAG_ENERGY_WH, TagValue::Double(0.0)),
                ],
            ),
            Event::TransactionStopped { id, .. } => self.update(
                id,
                &[
                    (TAG_TRANSACTION_ID, TagValue::Int(0)),
                    (TAG_ENERGY_WH, TagValue::Double(0.0)),
                ],
            ),
            Event::MeterSample { id, value } => {
                self.update(id, &[(TAG_ENERGY_WH, TagValue::Double(*value))]);
            }
            Event::RateProfileChanged { .. } | Event::Disconnected { .. } | Event::Log { .. } => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StateRecord;

    #[test]
    fn test_bind_is_append_only() {
        let store = TagStore::new("ChargePoints");
        assert_eq!(store.bind("CP1").unwrap(), Binding::Created);
        store
            .write("CP1", TAG_REMOTE_START_ID_TAG, TagValue::Text("ABC".into()))
            .unwrap();

        store.release("CP1");
        assert!(!store.is_bound("CP1"));
        assert_eq!(
            store.read("CP1", TAG_STATUS),
            Some(TagValue::Text("Disconnected".into()))
        );

        assert_eq!(store.bind("CP1").unwrap(), Binding::Reused);
        assert!(store.is_bound("CP1"));
        assert_eq!(
            store.read("CP1", TAG_REMOTE_START_ID_TAG),
            Some(TagValue::Text("ABC".into()))
        );
        assert_eq!(store.node_path("CP1", TAG_STATUS), "ChargePoints/CP1/Status");
    }

    #[test]
    fn test_trigger_fires_once_and_resets() {
        let store = TagStore::new("ChargePoints");
        store.bind("CP1").unwrap();

        let action = store
            .write("CP1", TAG_REMOTE_START_TRIGGER, TagValue::Bool(true))
            .unwrap();
        assert_eq!(
            action,
            Some(TriggerAction::RemoteStart {
                charge_point_id: "CP1".into(),
                id_tag: DEFAULT_ID_TAG.into(),
            })
        );
        assert_eq!(
            store.read("CP1", TAG_REMOTE_START_TRIGGER),
            Some(TagValue::Bool(false))
        );

        // Writing false is not an edge
        assert_eq!(
            store
                .write("CP1", TAG_REMOTE_START_TRIGGER, TagValue::Bool(false))
                .unwrap(),
            None
        );

        let action = store
            .write("CP1", TAG_REMOTE_STOP_TRIGGER, TagValue::Bool(true))
            .unwrap();
        assert_eq!(
            action,
            Some(TriggerAction::RemoteStop {
                charge_point_id: "CP1".into()
            })
        );
    }

    #[test]
    fn test_write_validation() {
        let store = TagStore::new("ChargePoints");
        store.bind("CP1").unwrap();

        assert_eq!(
            store.write("CP1", TAG_ENERGY_WH, TagValue::Double(1.0)),
            Err(TagError::ReadOnly {
                tag: TAG_ENERGY_WH.into()
            })
        );
        assert!(matches!(
            store.write("CP1", TAG_REMOTE_STOP_TRIGGER, TagValue::Int(1)),
            Err(TagError::TypeMismatch { .. })
        ));
        assert!(matches!(
            store.write("CP2", TAG_REMOTE_STOP_TRIGGER, TagValue::Bool(true)),
            Err(TagError::UnknownTag { .. })
        ));

        store.close();
        assert_eq!(
            store.write("CP1", TAG_REMOTE_STOP_TRIGGER, TagValue::Bool(true)),
            Err(TagError::Closed)
        );
        assert_eq!(store.bind("CP3"), Err(TagError::Closed));
    }

    #[test]
    fn test_events_update_tags() {
        let store = TagStore::new("ChargePoints");
        store.bind("CP1").unwrap();

        let mut state = StateRecord::new("CP1");
        state.apply_boot("A", "B");
        store
            .deliver(&Event::Booted {
                id: "CP1".into(),
                state,
            })
            .unwrap();
        store
            .deliver(&Event::TransactionStarted {
                id: "CP1".into(),
                transaction_id: 7,
                id_tag: None,
                meter_start: None,
            })
            .unwrap();
        store
            .deliver(&Event::MeterSample {
                id: "CP1".into(),
                value: 1500.0,
            })
            .unwrap();

        assert_eq!(store.read("CP1", TAG_VENDOR), Some(TagValue::Text("A".into())));
        assert_eq!(store.read("CP1", TAG_TRANSACTION_ID), Some(TagValue::Int(7)));
        assert_eq!(store.read("CP1", TAG_ENERGY_WH), Some(TagValue::Double(1500.0)));

        // Events for devices without a folder are ignored
        store
            .deliver(&Event::MeterSample {
                id: "CP9".into(),
                value: 1.0,
            })
            .unwrap();
        assert_eq!(store.read("CP9", TAG_ENERGY_WH), None);
    }

    #[test]
    fn test_tag_value_from_json() {
        assert_eq!(
            TagValue::from_json(&serde_json::json!(true)),
            Some(TagValue::Bool(true))
        );
        assert_eq!(TagValue::from_json(&serde_json::json!(7)), Some(TagValue::Int(7)));
        assert_eq!(
            TagValue::from_json(&serde_json::json!(1.5)),
            Some(TagValue::Double(1.5))
        );
        assert_eq!(TagValue::from_json(&serde_json::json!(null)), None);
    }
}
