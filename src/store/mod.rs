//! Access-control store backed by SQLite.
//!
//! The [`AccessStore`] is the sole gateway to the database. Reads go directly
//! through the pool (concurrent). Every mutation goes through a single-writer
//! actor fed by an [`mpsc`] channel, which both avoids SQLite write contention
//! and serializes the device-resolution claim step: two near-simultaneous
//! first-reports of different chip ids can never claim the same unbound
//! device, because the actor processes one resolution at a time.
//!
//! Unlike a fire-and-forget writer, most operations here carry a [`oneshot`]
//! reply — callers need the resolved device, the binding outcome, or the
//! audit row id before they can publish a decision.

pub mod writer;

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::types::{AccessResult, DoorState, Factor, HardwareChannel, Policy};

use self::writer::WriteOp;

// ---------------------------------------------------------------------------
// Domain rows
// ---------------------------------------------------------------------------

/// A logical door-lock device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Database row id.
    pub id: i64,
    /// Display name (operator-set or generated on provisioning).
    pub name: String,
    /// Reader / lock-controller chip bound to this device, if claimed.
    pub reader_chip_id: Option<String>,
    /// Camera chip bound to this device, if claimed.
    pub camera_chip_id: Option<String>,
    /// Unlock policy.
    pub policy: Policy,
    /// Last reported door position.
    pub door_state: DoorState,
}

/// A proximity card known to the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    /// Database row id.
    pub id: i64,
    /// Opaque card code, globally unique.
    pub code: String,
    /// Friendly label, if one was supplied at enrollment.
    pub label: Option<String>,
}

/// A named subject with an optional face embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Database row id.
    pub id: i64,
    /// Subject name, unique.
    pub name: String,
    /// Face embedding, absent until a face has been enrolled.
    pub embedding: Option<Vec<f32>>,
}

/// One row of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessAttempt {
    /// Database row id.
    pub id: i64,
    /// Device the decision concerned.
    pub device_id: i64,
    /// Factor (or combination) behind the decision.
    pub factor: Factor,
    /// Granted or denied.
    pub result: AccessResult,
    /// Matched identity or card label, when known.
    pub subject: Option<String>,
    /// ISO-8601 creation timestamp (set by SQLite).
    pub created_at: String,
}

/// Outcome of creating a device/card binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingOutcome {
    /// A new binding row was inserted.
    Created,
    /// The pair was already bound; nothing was written.
    Existed,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Write channel is closed (writer actor stopped).
    #[error("store writer channel closed")]
    WriterClosed,

    /// An invalid enum value was read from the database.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which column contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// A stored embedding could not be encoded or decoded.
    #[error("embedding codec error: {0}")]
    Embedding(#[from] serde_json::Error),

    /// A referenced row does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Kind of row that was looked up.
        entity: &'static str,
        /// The id that missed.
        id: i64,
    },
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Writer channel capacity — bounded to provide backpressure.
const WRITER_CHANNEL_CAPACITY: usize = 256;

/// Raw device row as selected from SQLite.
type DeviceRow = (i64, String, Option<String>, Option<String>, String, String);

fn row_to_device(row: DeviceRow) -> Result<Device, StoreError> {
    let (id, name, reader_chip_id, camera_chip_id, policy, door_state) = row;
    Ok(Device {
        id,
        name,
        reader_chip_id,
        camera_chip_id,
        policy: Policy::parse(&policy)?,
        door_state: DoorState::parse(&door_state)?,
    })
}

/// Columns selected for every device query, in [`DeviceRow`] order.
const DEVICE_COLUMNS: &str =
    "id, name, reader_chip_id, camera_chip_id, policy, door_state";

/// Central store managing persistence and write serialization.
pub struct AccessStore {
    /// Connection pool for reads.
    db: SqlitePool,
    /// Channel to the single-writer actor.
    writer_tx: mpsc::Sender<WriteOp>,
    /// Writer actor join handle (held so we can await on shutdown).
    writer_handle: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for AccessStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessStore").finish_non_exhaustive()
    }
}

impl AccessStore {
    /// Open (or create) the database at `path`, apply the schema, and spawn
    /// the writer actor.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema fails
    /// to apply.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open db at {}", path.display()))?;

        Self::bootstrap(pool).await
    }

    /// Open an in-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true)
            .pragma("foreign_keys", "ON");

        // A single connection keeps every handle on the same in-memory db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory db")?;

        Self::bootstrap(pool).await
    }

    async fn bootstrap(pool: SqlitePool) -> anyhow::Result<Self> {
        let schema = include_str!("../../migrations/001_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&pool)
            .await
            .context("failed to apply schema migration")?;

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let writer_pool = pool.clone();
        let writer_handle = tokio::spawn(writer::run_writer(writer_pool, writer_rx));

        info!("access store initialised");

        Ok(Self {
            db: pool,
            writer_tx,
            writer_handle,
        })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, StoreError>>) -> WriteOp,
    ) -> Result<T, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.writer_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        reply_rx.await.map_err(|_| StoreError::WriterClosed)?
    }

    // ------------------------------------------------------------------
    // Writes (serialized through the actor)
    // ------------------------------------------------------------------

    /// Resolve the device a chip id belongs to, claiming or provisioning one
    /// when no device is bound yet.
    ///
    /// Resolution order: existing binding, then the oldest device with no
    /// chip bound on this channel, then a freshly provisioned device. The
    /// whole step runs inside the writer actor, so it is atomic with respect
    /// to every other claim.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriterClosed`] if the writer actor has stopped,
    /// or a database error from the claim itself.
    pub async fn resolve_device(
        &self,
        channel: HardwareChannel,
        chip_id: &str,
    ) -> Result<Device, StoreError> {
        let chip = chip_id.to_owned();
        self.request(|reply| WriteOp::ResolveDevice {
            channel,
            chip_id: chip,
            reply,
        })
        .await
    }

    /// Look up a card by code, creating it if unknown and refreshing its
    /// label when a different non-empty label is supplied.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriterClosed`] if the writer actor has stopped.
    pub async fn upsert_card(
        &self,
        code: &str,
        label: Option<&str>,
    ) -> Result<Card, StoreError> {
        let code = code.to_owned();
        let label = label.map(str::to_owned);
        self.request(|reply| WriteOp::UpsertCard { code, label, reply })
            .await
    }

    /// Bind a card to a device. Re-binding an existing pair is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriterClosed`] if the writer actor has stopped.
    pub async fn bind_card(
        &self,
        device_id: i64,
        card_id: i64,
    ) -> Result<BindingOutcome, StoreError> {
        self.request(|reply| WriteOp::BindCard {
            device_id,
            card_id,
            reply,
        })
        .await
    }

    /// Create or replace the identity named `name` with the given embedding.
    ///
    /// The duplicate-identity guard runs in the coordinator before this is
    /// called; the store itself upserts unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriterClosed`] if the writer actor has stopped.
    pub async fn save_identity(
        &self,
        name: &str,
        embedding: &[f32],
    ) -> Result<Identity, StoreError> {
        let name = name.to_owned();
        let embedding = embedding.to_vec();
        self.request(|reply| WriteOp::SaveIdentity {
            name,
            embedding,
            reply,
        })
        .await
    }

    /// Append one audit row. Rows are never updated or deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriterClosed`] if the writer actor has stopped.
    pub async fn append_attempt(
        &self,
        device_id: i64,
        factor: Factor,
        result: AccessResult,
        subject: Option<&str>,
    ) -> Result<i64, StoreError> {
        let subject = subject.map(str::to_owned);
        self.request(|reply| WriteOp::AppendAttempt {
            device_id,
            factor,
            result,
            subject,
            reply,
        })
        .await
    }

    /// Record a door-sensor reading. Returns `true` when the stored state
    /// actually changed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the device does not exist, or
    /// [`StoreError::WriterClosed`] if the writer actor has stopped.
    pub async fn set_door_state(
        &self,
        device_id: i64,
        state: DoorState,
    ) -> Result<bool, StoreError> {
        self.request(|reply| WriteOp::SetDoorState {
            device_id,
            state,
            reply,
        })
        .await
    }

    /// Change a device's unlock policy.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the device does not exist, or
    /// [`StoreError::WriterClosed`] if the writer actor has stopped.
    pub async fn set_device_policy(
        &self,
        device_id: i64,
        policy: Policy,
    ) -> Result<(), StoreError> {
        self.request(|reply| WriteOp::SetPolicy {
            device_id,
            policy,
            reply,
        })
        .await
    }

    // ------------------------------------------------------------------
    // Reads (straight through the pool)
    // ------------------------------------------------------------------

    /// Fetch a device by id.
    pub async fn device_by_id(&self, id: i64) -> Result<Option<Device>, StoreError> {
        let row: Option<DeviceRow> = sqlx::query_as(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(row_to_device).transpose()
    }

    /// Fetch the device bound to `chip_id` on `channel`, if any.
    pub async fn device_by_chip(
        &self,
        channel: HardwareChannel,
        chip_id: &str,
    ) -> Result<Option<Device>, StoreError> {
        let row: Option<DeviceRow> = sqlx::query_as(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE {} = ?1",
            channel.column()
        ))
        .bind(chip_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(row_to_device).transpose()
    }

    /// Fetch a card by its code.
    pub async fn card_by_code(&self, code: &str) -> Result<Option<Card>, StoreError> {
        let row: Option<(i64, String, Option<String>)> =
            sqlx::query_as("SELECT id, code, label FROM cards WHERE code = ?1")
                .bind(code)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.map(|(id, code, label)| Card { id, code, label }))
    }

    /// Returns `true` when the card is authorized on the device.
    pub async fn binding_exists(
        &self,
        device_id: i64,
        card_id: i64,
    ) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM device_cards WHERE device_id = ?1 AND card_id = ?2",
        )
        .bind(device_id)
        .bind(card_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.is_some())
    }

    /// Fetch every identity, embeddings decoded.
    pub async fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        let rows: Vec<(i64, String, Option<String>)> =
            sqlx::query_as("SELECT id, name, embedding FROM identities ORDER BY id")
                .fetch_all(&self.db)
                .await?;

        rows.into_iter()
            .map(|(id, name, embedding)| {
                let embedding = embedding
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?;
                Ok(Identity {
                    id,
                    name,
                    embedding,
                })
            })
            .collect()
    }

    /// Fetch the most recent audit rows for a device, newest first.
    pub async fn attempts_for_device(
        &self,
        device_id: i64,
        limit: usize,
    ) -> Result<Vec<AccessAttempt>, StoreError> {
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(i64, i64, String, String, Option<String>, String)> = sqlx::query_as(
            "SELECT id, device_id, factor, result, subject, created_at \
             FROM access_log \
             WHERE device_id = ?1 \
             ORDER BY id DESC \
             LIMIT ?2",
        )
        .bind(device_id)
        .bind(limit_i64)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|(id, device_id, factor, result, subject, created_at)| {
                Ok(AccessAttempt {
                    id,
                    device_id,
                    factor: Factor::parse(&factor)?,
                    result: AccessResult::parse(&result)?,
                    subject,
                    created_at,
                })
            })
            .collect()
    }

    /// Returns a reference to the underlying pool (for tests and health checks).
    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Gracefully shut down the writer actor.
    ///
    /// Drops the sender channel and awaits the writer task to drain.
    pub async fn shutdown(self) {
        drop(self.writer_tx);
        let _ = self.writer_handle.await;
        info!("access store shut down");
    }
}
