//! Single-writer actor for serialized SQLite mutations.
//!
//! All database writes flow through this actor via an
//! [`mpsc`](tokio::sync::mpsc) channel. Besides preventing SQLite write
//! contention, the actor is the serialization point the device-resolution
//! claim step relies on: find-unbound and bind happen back to back with no
//! other claim interleaved.

use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace};

use crate::types::{AccessResult, DoorState, Factor, HardwareChannel, Policy};

use super::{row_to_device, BindingOutcome, Card, Device, DeviceRow, Identity, StoreError};

/// Reply half for an operation returning `T`.
type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

/// Operations that can be sent to the write actor.
#[derive(Debug)]
pub enum WriteOp {
    /// Resolve (or claim, or provision) the device for a chip id.
    ResolveDevice {
        /// Channel the chip reported on.
        channel: HardwareChannel,
        /// Reported chip id.
        chip_id: String,
        /// Resolved device.
        reply: Reply<Device>,
    },

    /// Look up or create a card, refreshing its label.
    UpsertCard {
        /// Opaque card code.
        code: String,
        /// Label to apply when non-empty and different.
        label: Option<String>,
        /// Resulting card row.
        reply: Reply<Card>,
    },

    /// Bind a card to a device (idempotent).
    BindCard {
        /// Target device.
        device_id: i64,
        /// Card to authorize.
        card_id: i64,
        /// Whether a row was created or already present.
        reply: Reply<BindingOutcome>,
    },

    /// Create or replace a named identity's embedding.
    SaveIdentity {
        /// Subject name.
        name: String,
        /// Face embedding to store.
        embedding: Vec<f32>,
        /// Resulting identity row.
        reply: Reply<Identity>,
    },

    /// Append one audit row.
    AppendAttempt {
        /// Device the decision concerned.
        device_id: i64,
        /// Factor behind the decision.
        factor: Factor,
        /// Granted or denied.
        result: AccessResult,
        /// Matched subject, when known.
        subject: Option<String>,
        /// Row id of the appended attempt.
        reply: Reply<i64>,
    },

    /// Record a door-sensor reading.
    SetDoorState {
        /// Target device.
        device_id: i64,
        /// Reported position.
        state: DoorState,
        /// `true` when the stored value changed.
        reply: Reply<bool>,
    },

    /// Change a device's unlock policy.
    SetPolicy {
        /// Target device.
        device_id: i64,
        /// New policy.
        policy: Policy,
        /// Completion signal.
        reply: Reply<()>,
    },
}

/// Run the single-writer actor loop.
///
/// Processes [`WriteOp`] messages until the sender half is dropped. Each
/// operation executes serially; the reply is sent once the statement (or
/// statement pair) has committed.
pub async fn run_writer(db: SqlitePool, mut rx: mpsc::Receiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::ResolveDevice {
                channel,
                chip_id,
                reply,
            } => {
                let result = resolve_device(&db, channel, &chip_id).await;
                if let Err(ref err) = result {
                    error!(chip_id, error = %err, "device resolution failed");
                }
                let _ = reply.send(result);
            }

            WriteOp::UpsertCard { code, label, reply } => {
                let result = upsert_card(&db, &code, label.as_deref()).await;
                if let Err(ref err) = result {
                    error!(code, error = %err, "card upsert failed");
                }
                let _ = reply.send(result);
            }

            WriteOp::BindCard {
                device_id,
                card_id,
                reply,
            } => {
                let result = bind_card(&db, device_id, card_id).await;
                if let Err(ref err) = result {
                    error!(device_id, card_id, error = %err, "card binding failed");
                }
                let _ = reply.send(result);
            }

            WriteOp::SaveIdentity {
                name,
                embedding,
                reply,
            } => {
                let result = save_identity(&db, &name, &embedding).await;
                if let Err(ref err) = result {
                    error!(name, error = %err, "identity save failed");
                }
                let _ = reply.send(result);
            }

            WriteOp::AppendAttempt {
                device_id,
                factor,
                result,
                subject,
                reply,
            } => {
                let outcome =
                    append_attempt(&db, device_id, factor, result, subject.as_deref()).await;
                if let Err(ref err) = outcome {
                    error!(device_id, error = %err, "audit append failed");
                }
                let _ = reply.send(outcome);
            }

            WriteOp::SetDoorState {
                device_id,
                state,
                reply,
            } => {
                let result = set_door_state(&db, device_id, state).await;
                if let Err(ref err) = result {
                    error!(device_id, error = %err, "door state update failed");
                }
                let _ = reply.send(result);
            }

            WriteOp::SetPolicy {
                device_id,
                policy,
                reply,
            } => {
                let result = set_policy(&db, device_id, policy).await;
                if let Err(ref err) = result {
                    error!(device_id, error = %err, "policy update failed");
                }
                let _ = reply.send(result);
            }
        }
    }
    trace!("store writer actor stopped");
}

/// Resolution order: bound device, oldest unbound device, fresh provision.
async fn resolve_device(
    db: &SqlitePool,
    channel: HardwareChannel,
    chip_id: &str,
) -> Result<Device, StoreError> {
    let column = channel.column();

    // 1. Already bound to this exact chip.
    let bound: Option<DeviceRow> = sqlx::query_as(&format!(
        "SELECT {} FROM devices WHERE {column} = ?1",
        super::DEVICE_COLUMNS
    ))
    .bind(chip_id)
    .fetch_optional(db)
    .await?;
    if let Some(row) = bound {
        return row_to_device(row);
    }

    // 2. Claim the oldest device with no chip on this channel.
    let unbound: Option<DeviceRow> = sqlx::query_as(&format!(
        "SELECT {} FROM devices WHERE {column} IS NULL ORDER BY id LIMIT 1",
        super::DEVICE_COLUMNS
    ))
    .fetch_optional(db)
    .await?;
    if let Some(row) = unbound {
        let mut device = row_to_device(row)?;
        sqlx::query(&format!(
            "UPDATE devices SET {column} = ?1, updated_at = datetime('now') WHERE id = ?2"
        ))
        .bind(chip_id)
        .bind(device.id)
        .execute(db)
        .await?;
        match channel {
            HardwareChannel::Reader => device.reader_chip_id = Some(chip_id.to_owned()),
            HardwareChannel::Camera => device.camera_chip_id = Some(chip_id.to_owned()),
        }
        trace!(chip_id, device_id = device.id, "claimed unbound device");
        return Ok(device);
    }

    // 3. Provision a brand-new device named after the chip suffix.
    let suffix = chip_id
        .get(chip_id.len().saturating_sub(4)..)
        .unwrap_or(chip_id);
    let name = format!("Device {suffix}");
    let inserted = sqlx::query(&format!(
        "INSERT INTO devices (name, {column}) VALUES (?1, ?2)"
    ))
    .bind(&name)
    .bind(chip_id)
    .execute(db)
    .await?;

    let device = Device {
        id: inserted.last_insert_rowid(),
        name,
        reader_chip_id: matches!(channel, HardwareChannel::Reader).then(|| chip_id.to_owned()),
        camera_chip_id: matches!(channel, HardwareChannel::Camera).then(|| chip_id.to_owned()),
        policy: Policy::Or,
        door_state: DoorState::Closed,
    };
    trace!(chip_id, device_id = device.id, "provisioned new device");
    Ok(device)
}

async fn upsert_card(
    db: &SqlitePool,
    code: &str,
    label: Option<&str>,
) -> Result<Card, StoreError> {
    let existing: Option<(i64, String, Option<String>)> =
        sqlx::query_as("SELECT id, code, label FROM cards WHERE code = ?1")
            .bind(code)
            .fetch_optional(db)
            .await?;

    if let Some((id, code, current_label)) = existing {
        // Refresh the label only when a different non-empty one was supplied.
        if let Some(new_label) = label.filter(|l| !l.is_empty()) {
            if current_label.as_deref() != Some(new_label) {
                sqlx::query("UPDATE cards SET label = ?1 WHERE id = ?2")
                    .bind(new_label)
                    .bind(id)
                    .execute(db)
                    .await?;
                return Ok(Card {
                    id,
                    code,
                    label: Some(new_label.to_owned()),
                });
            }
        }
        return Ok(Card {
            id,
            code,
            label: current_label,
        });
    }

    let label = label.filter(|l| !l.is_empty());
    let inserted = sqlx::query("INSERT INTO cards (code, label) VALUES (?1, ?2)")
        .bind(code)
        .bind(label)
        .execute(db)
        .await?;

    Ok(Card {
        id: inserted.last_insert_rowid(),
        code: code.to_owned(),
        label: label.map(str::to_owned),
    })
}

async fn bind_card(
    db: &SqlitePool,
    device_id: i64,
    card_id: i64,
) -> Result<BindingOutcome, StoreError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO device_cards (device_id, card_id) VALUES (?1, ?2)",
    )
    .bind(device_id)
    .bind(card_id)
    .execute(db)
    .await?;

    if result.rows_affected() == 0 {
        Ok(BindingOutcome::Existed)
    } else {
        trace!(device_id, card_id, "card bound to device");
        Ok(BindingOutcome::Created)
    }
}

async fn save_identity(
    db: &SqlitePool,
    name: &str,
    embedding: &[f32],
) -> Result<Identity, StoreError> {
    let encoded = serde_json::to_string(embedding)?;
    sqlx::query(
        "INSERT INTO identities (name, embedding) VALUES (?1, ?2) \
         ON CONFLICT(name) DO UPDATE SET \
             embedding = excluded.embedding, \
             updated_at = datetime('now')",
    )
    .bind(name)
    .bind(&encoded)
    .execute(db)
    .await?;

    let (id,): (i64,) = sqlx::query_as("SELECT id FROM identities WHERE name = ?1")
        .bind(name)
        .fetch_one(db)
        .await?;

    trace!(name, id, "identity saved");
    Ok(Identity {
        id,
        name: name.to_owned(),
        embedding: Some(embedding.to_vec()),
    })
}

async fn append_attempt(
    db: &SqlitePool,
    device_id: i64,
    factor: Factor,
    result: AccessResult,
    subject: Option<&str>,
) -> Result<i64, StoreError> {
    let inserted = sqlx::query(
        "INSERT INTO access_log (device_id, factor, result, subject) \
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(device_id)
    .bind(factor.as_str())
    .bind(result.as_str())
    .bind(subject)
    .execute(db)
    .await?;

    trace!(
        device_id,
        factor = factor.as_str(),
        result = result.as_str(),
        "access attempt logged"
    );
    Ok(inserted.last_insert_rowid())
}

async fn set_door_state(
    db: &SqlitePool,
    device_id: i64,
    state: DoorState,
) -> Result<bool, StoreError> {
    let current: Option<(String,)> =
        sqlx::query_as("SELECT door_state FROM devices WHERE id = ?1")
            .bind(device_id)
            .fetch_optional(db)
            .await?;

    let Some((current,)) = current else {
        return Err(StoreError::NotFound {
            entity: "device",
            id: device_id,
        });
    };

    if DoorState::parse(&current)? == state {
        return Ok(false);
    }

    sqlx::query(
        "UPDATE devices SET door_state = ?1, updated_at = datetime('now') WHERE id = ?2",
    )
    .bind(state.as_str())
    .bind(device_id)
    .execute(db)
    .await?;

    trace!(device_id, state = state.as_str(), "door state updated");
    Ok(true)
}

async fn set_policy(
    db: &SqlitePool,
    device_id: i64,
    policy: Policy,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE devices SET policy = ?1, updated_at = datetime('now') WHERE id = ?2",
    )
    .bind(policy.as_str())
    .bind(device_id)
    .execute(db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            entity: "device",
            id: device_id,
        });
    }
    Ok(())
}
