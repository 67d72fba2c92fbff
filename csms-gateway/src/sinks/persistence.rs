//! SQLite persistence for charge points and transactions
//!
//! Two tables are written:
//! - `charge_points(id, vendor, model, last_seen, status)`
//! - `transactions(id, charge_point_id, start_time, stop_time, meter_start, meter_stop, id_tag)`
//!
//! Sessions never await the database. [`PersistenceSink`] turns events into
//! [`StoreOp`]s and queues them for a single worker task; write failures are
//! logged and dropped.

use std::str::FromStr;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::events::{Direction, Event, OPERATOR_ORIGIN};
use crate::session::{LifecycleStatus, StateRecord};
use crate::sinks::EventSink;

#[derive(Debug, Error)]
#[error("database error: {0}")]
pub struct PersistenceError(#[from] sqlx::Error);

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Stored charge point row
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DeviceRecord {
    pub id: String,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub status: Option<String>,
    /// Unix milliseconds
    pub last_seen: Option<i64>,
}

impl DeviceRecord {
    /// Offline projection for dashboard snapshots
    pub fn to_state_record(&self) -> StateRecord {
        StateRecord::offline(
            self.id.clone(),
            self.vendor.clone(),
            self.model.clone(),
            self.status.as_deref().and_then(LifecycleStatus::parse),
            self.last_seen
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        )
    }
}

/// Stored transaction row
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: i64,
    pub charge_point_id: String,
    pub id_tag: Option<String>,
    pub start_time: Option<i64>,
    pub stop_time: Option<i64>,
    pub meter_start: Option<i64>,
    pub meter_stop: Option<i64>,
    /// `meter_stop - meter_start`, Wh, once the transaction is closed
    pub total_energy: Option<i64>,
}

/// SQLite-backed device store
#[derive(Debug, Clone)]
pub struct DeviceStore {
    pool: SqlitePool,
}

impl DeviceStore {
    /// Open (creating if missing) the database and initialize the schema
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every connection to `:memory:` is a separate database
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        info!("Persistence ready at {}", database_url);
        Ok(store)
    }

    async fn init(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS charge_points (
                id        TEXT PRIMARY KEY,
                vendor    TEXT,
                model     TEXT,
                last_seen INTEGER,
                status    TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS transactions (
                id              INTEGER PRIMARY KEY,
                charge_point_id TEXT NOT NULL,
                start_time      INTEGER,
                stop_time       INTEGER,
                meter_start     INTEGER,
                meter_stop      INTEGER,
                id_tag          TEXT,
                FOREIGN KEY (charge_point_id) REFERENCES charge_points(id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or refresh a charge point. `None` keeps the stored value.
    pub async fn upsert_charge_point(
        &self,
        id: &str,
        vendor: Option<&str>,
        model: Option<&str>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"INSERT INTO charge_points (id, vendor, model, last_seen)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 vendor = COALESCE(excluded.vendor, charge_points.vendor),
                 model = COALESCE(excluded.model, charge_points.model),
                 last_seen = excluded.last_seen"#,
        )
        .bind(id)
        .bind(vendor)
        .bind(model)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_heartbeat(&self, id: &str) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE charge_points SET last_seen = ? WHERE id = ?")
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_status(&self, id: &str, status: &str) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"INSERT INTO charge_points (id, status) VALUES (?, ?)
               ON CONFLICT(id) DO UPDATE SET status = excluded.status"#,
        )
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a confirmed transaction. A reused id overwrites the old row.
    pub async fn start_transaction(
        &self,
        charge_point_id: &str,
        transaction_id: i64,
        id_tag: Option<&str>,
        meter_start: Option<i64>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"INSERT INTO transactions (id, charge_point_id, start_time, meter_start, id_tag)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 charge_point_id = excluded.charge_point_id,
                 start_time = excluded.start_time,
                 meter_start = excluded.meter_start,
                 id_tag = excluded.id_tag,
                 stop_time = NULL,
                 meter_stop = NULL"#,
        )
        .bind(transaction_id)
        .bind(charge_point_id)
        .bind(now_ms())
        .bind(meter_start)
        .bind(id_tag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn stop_transaction(
        &self,
        transaction_id: i64,
        meter_stop: Option<i64>,
    ) -> Result<(), PersistenceError> {
        let result = sqlx::query("UPDATE transactions SET stop_time = ?, meter_stop = ? WHERE id = ?")
            .bind(now_ms())
            .bind(meter_stop)
            .bind(transaction_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!("StopTransaction for unknown transaction {}", transaction_id);
        }
        Ok(())
    }

    pub async fn list_charge_points(&self) -> Result<Vec<DeviceRecord>, PersistenceError> {
        let rows = sqlx::query_as::<_, DeviceRecord>(
            "SELECT id, vendor, model, status, last_seen FROM charge_points ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Most recent transactions first
    pub async fn recent_transactions(
        &self,
        limit: u32,
    ) -> Result<Vec<TransactionRecord>, PersistenceError> {
        let rows = sqlx::query_as::<_, TransactionRecord>(
            r#"SELECT id, charge_point_id, id_tag, start_time, stop_time,
                      meter_start, meter_stop,
                      (meter_stop - meter_start) AS total_energy
               FROM transactions
               ORDER BY start_time DESC
               LIMIT ?"#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn apply(&self, op: &StoreOp) -> Result<(), PersistenceError> {
        match op {
            StoreOp::UpsertChargePoint { id, vendor, model } => {
                self.upsert_charge_point(id, vendor.as_deref(), model.as_deref())
                    .await
            }
            StoreOp::Heartbeat { id } => self.record_heartbeat(id).await,
            StoreOp::Status { id, status } => self.update_status(id, status).await,
            StoreOp::StartTransaction {
                id,
                transaction_id,
                id_tag,
                meter_start,
            } => {
                self.start_transaction(id, *transaction_id, id_tag.as_deref(), *meter_start)
                    .await
            }
            StoreOp::StopTransaction {
                transaction_id,
                meter_stop,
            } => self.stop_transaction(*transaction_id, *meter_stop).await,
        }
    }
}

/// A queued database write
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    UpsertChargePoint {
        id: String,
        vendor: Option<String>,
        model: Option<String>,
    },
    Heartbeat {
        id: String,
    },
    Status {
        id: String,
        status: String,
    },
    StartTransaction {
        id: String,
        transaction_id: i64,
        id_tag: Option<String>,
        meter_start: Option<i64>,
    },
    StopTransaction {
        transaction_id: i64,
        meter_stop: Option<i64>,
    },
}

impl StoreOp {
    /// Writes implied by an event, in order
    pub fn from_event(event: &Event) -> Vec<StoreOp> {
        match event {
            Event::Connected { id, state } => vec![
                StoreOp::UpsertChargePoint {
                    id: id.clone(),
                    vendor: None,
                    model: None,
                },
                StoreOp::Status {
                    id: id.clone(),
                    status: state.status.to_string(),
                },
            ],
            Event::Booted { id, state } => vec![
                StoreOp::UpsertChargePoint {
                    id: id.clone(),
                    vendor: Some(state.vendor.clone()),
                    model: Some(state.model.clone()),
                },
                StoreOp::Status {
                    id: id.clone(),
                    status: state.status.to_string(),
                },
            ],
            Event::StatusChanged { id, status } => vec![StoreOp::Status {
                id: id.clone(),
                status: status.to_string(),
            }],
            Event::TransactionStarted {
                id,
                transaction_id,
                id_tag,
                meter_start,
            } => vec![StoreOp::StartTransaction {
                id: id.clone(),
                transaction_id: *transaction_id,
                id_tag: id_tag.clone(),
                meter_start: *meter_start,
            }],
            Event::TransactionStopped {
                stopped_transaction_id: Some(transaction_id),
                meter_stop,
                ..
            } => vec![StoreOp::StopTransaction {
                transaction_id: *transaction_id,
                meter_stop: *meter_stop,
            }],
            Event::Disconnected { id } => vec![StoreOp::Status {
                id: id.clone(),
                status: LifecycleStatus::Unavailable.to_string(),
            }],
            Event::Log {
                direction: Direction::Request,
                charge_point_id,
                ..
            } if charge_point_id != OPERATOR_ORIGIN => vec![StoreOp::Heartbeat {
                id: charge_point_id.clone(),
            }],
            _ => Vec::new(),
        }
    }
}

/// Event sink feeding the store through a bounded queue
pub struct PersistenceSink {
    tx: Mutex<Option<mpsc::Sender<StoreOp>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceSink {
    /// Start the write worker
    pub fn spawn(store: DeviceStore, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreOp>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                if let Err(e) = store.apply(&op).await {
                    warn!("Persistence write {:?} failed: {}", op, e);
                }
            }
            debug!("Persistence worker drained");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Stop accepting events and wait up to `grace` for queued writes
    pub async fn close(&self, grace: Duration) {
        self.tx.lock().take();
        let worker = self.worker.lock().take();

        if let Some(worker) = worker {
            let abort = worker.abort_handle();
            if tokio::time::timeout(grace, worker).await.is_err() {
                warn!("Persistence queue not drained within {:?}, dropping remaining writes", grace);
                abort.abort();
            }
        }
    }
}

impl EventSink for PersistenceSink {
    fn name(&self) -> &str {
        "persistence"
    }

    fn deliver(&self, event: &Event) -> Result<(), GatewayError> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Ok(());
        };

        let ops = StoreOp::from_event(event);
        if ops.is_empty() {
            return Ok(());
        }

        // All writes of one event are queued together or not at all
        let result = match tx.try_reserve_many(ops.len()) {
            Ok(permits) => {
                for (permit, op) in permits.zip(ops) {
                    permit.send(op);
                }
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    mpsc::error::TrySendError::Full(()) => "queue full",
                    mpsc::error::TrySendError::Closed(()) => "worker stopped",
                };
                warn!(
                    "Persistence {} for {}, dropping {:?}",
                    reason,
                    event.charge_point_id(),
                    ops
                );
                Err(GatewayError::SinkDelivery {
                    sink: self.name().to_string(),
                })
            }
        };
        result
    }
}
