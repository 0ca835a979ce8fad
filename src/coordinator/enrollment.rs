//! Per-device enrollment sessions.
//!
//! An armed session binds the next matching credential (card scan or face
//! embedding) to its target device, then disarms — single-shot regardless of
//! outcome. Sessions are keyed by device id so enrolling on one door can
//! never capture a scan meant for another, and each session carries an
//! expiry deadline evaluated lazily at consumption time: a forgotten session
//! cannot swallow an unrelated scan hours later.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// One armed enrollment awaiting its credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedSession {
    /// Friendly label for the credential being enrolled, if any.
    pub label: Option<String>,
    /// When the session was armed.
    pub armed_at: DateTime<Utc>,
}

/// All armed enrollment sessions, keyed by target device.
///
/// Owned by the coordinator task; mutation is single-threaded by construction.
#[derive(Debug)]
pub struct EnrollmentRegistry {
    ttl: Duration,
    sessions: HashMap<i64, ArmedSession>,
}

impl EnrollmentRegistry {
    /// Create a registry whose sessions expire `ttl` after arming.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: HashMap::new(),
        }
    }

    /// Arm (or re-arm) enrollment for a device. Last writer wins: a previous
    /// armed session for the same device is overwritten, not queued.
    pub fn arm(&mut self, device_id: i64, label: Option<String>, now: DateTime<Utc>) {
        let replaced = self
            .sessions
            .insert(
                device_id,
                ArmedSession {
                    label,
                    armed_at: now,
                },
            )
            .is_some();
        debug!(device_id, replaced, "enrollment armed");
    }

    /// Disarm a device's session. Returns `true` when one was armed.
    pub fn cancel(&mut self, device_id: i64) -> bool {
        let was_armed = self.sessions.remove(&device_id).is_some();
        debug!(device_id, was_armed, "enrollment cancelled");
        was_armed
    }

    /// Consume the armed session for a device, if a live one exists.
    ///
    /// The session is removed either way: a live one is returned to the
    /// caller, an expired one is discarded and `None` falls through to
    /// normal authentication.
    pub fn take(&mut self, device_id: i64, now: DateTime<Utc>) -> Option<ArmedSession> {
        let session = self.sessions.remove(&device_id)?;
        if now.signed_duration_since(session.armed_at) > self.ttl {
            debug!(device_id, "armed enrollment expired, discarding");
            return None;
        }
        Some(session)
    }

    /// Whether a device currently has a live armed session.
    pub fn is_armed(&self, device_id: i64, now: DateTime<Utc>) -> bool {
        self.sessions
            .get(&device_id)
            .is_some_and(|s| now.signed_duration_since(s.armed_at) <= self.ttl)
    }

    /// Pending label of a device's live armed session, without consuming it.
    ///
    /// Outer `None` means no live session; inner `None` means the session
    /// was armed without a label.
    pub fn armed_label(&self, device_id: i64, now: DateTime<Utc>) -> Option<Option<String>> {
        let session = self.sessions.get(&device_id)?;
        if now.signed_duration_since(session.armed_at) > self.ttl {
            return None;
        }
        Some(session.label.clone())
    }
}
