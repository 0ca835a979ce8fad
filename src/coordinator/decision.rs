//! Decision publication: audit row, fan-out notification, unlock command.
//!
//! The three effects are deliberately independent — a dead dashboard must
//! not stop the audit trail and vice versa. The one coupling is safety:
//! a grant whose audit append fails does not unlock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::notify::NotificationHub;
use crate::store::{AccessStore, Device};
use crate::types::{AccessResult, Factor, LockCommand, Notification};

/// Publishes resolved access decisions.
#[derive(Debug, Clone)]
pub struct DecisionPublisher {
    store: Arc<AccessStore>,
    hub: NotificationHub,
    commands: mpsc::Sender<LockCommand>,
}

impl DecisionPublisher {
    /// Create a publisher over the store, hub, and device-command channel.
    pub fn new(
        store: Arc<AccessStore>,
        hub: NotificationHub,
        commands: mpsc::Sender<LockCommand>,
    ) -> Self {
        Self {
            store,
            hub,
            commands,
        }
    }

    /// Publish one resolved decision: append the audit row, notify
    /// subscribers, and unlock on a grant.
    ///
    /// Called exactly once per physical event that resolves to a decision;
    /// pending AND-window states and cooldown suppressions never reach here.
    /// Returns `true` when an unlock command was issued.
    pub async fn publish(
        &self,
        device: &Device,
        factor: Factor,
        outcome: AccessResult,
        subject: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        match self
            .store
            .append_attempt(device.id, factor, outcome, subject)
            .await
        {
            Ok(attempt_id) => {
                info!(
                    device_id = device.id,
                    attempt_id,
                    factor = factor.as_str(),
                    outcome = outcome.as_str(),
                    "access decision logged"
                );
            }
            Err(err) => {
                warn!(device_id = device.id, error = %err, "audit append failed");
                self.hub.publish(Notification::StorageFault {
                    operation: "append-attempt".to_owned(),
                    device_id: Some(device.id),
                });
                // Fail closed: an unauditable grant must not open the door.
                return false;
            }
        }

        self.hub.publish(Notification::AccessDecision {
            device_id: device.id,
            factor,
            outcome,
            subject: subject.map(str::to_owned),
            timestamp: now,
        });

        if outcome == AccessResult::Success {
            if let Err(err) = self
                .commands
                .send(LockCommand::Unlock {
                    device_id: device.id,
                })
                .await
            {
                warn!(device_id = device.id, error = %err, "unlock command channel closed");
                return false;
            }
            return true;
        }
        false
    }
}
