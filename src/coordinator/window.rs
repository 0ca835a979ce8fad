//! Combined-factor window tracking for AND-policy devices.
//!
//! Per-device state: which factors have succeeded and when. Staleness is
//! evaluated lazily at the next factor success — a grant only matters when
//! both factors eventually co-occur, so no timer task is needed.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// What a factor success amounted to under the AND policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// Both factors landed inside the window; state consumed.
    Grant,
    /// Only one factor is in; awaiting the other.
    Pending,
    /// Both factors were in but at least one was stale; state reset, both
    /// factors must be re-presented.
    StaleReset,
}

/// Per-device pair of factor timestamps.
#[derive(Debug, Clone, Copy, Default)]
struct CombinedAuthState {
    card_at: Option<DateTime<Utc>>,
    face_at: Option<DateTime<Utc>>,
}

/// Tracks combined-factor windows for every AND-policy device.
///
/// Owned by the coordinator task; all mutation happens on that single task,
/// so no interior locking is needed.
#[derive(Debug)]
pub struct FactorWindows {
    window: Duration,
    states: HashMap<i64, CombinedAuthState>,
}

impl FactorWindows {
    /// Create a tracker with the given combining window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            states: HashMap::new(),
        }
    }

    /// Record a successful card factor for a device.
    pub fn record_card(&mut self, device_id: i64, now: DateTime<Utc>) -> WindowDecision {
        let state = self.states.entry(device_id).or_default();
        state.card_at = Some(now);
        self.evaluate(device_id, now)
    }

    /// Record a successful face factor for a device.
    pub fn record_face(&mut self, device_id: i64, now: DateTime<Utc>) -> WindowDecision {
        let state = self.states.entry(device_id).or_default();
        state.face_at = Some(now);
        self.evaluate(device_id, now)
    }

    /// Returns `true` when a device has exactly one factor waiting.
    pub fn awaiting_partner(&self, device_id: i64) -> bool {
        self.states
            .get(&device_id)
            .is_some_and(|s| s.card_at.is_some() != s.face_at.is_some())
    }

    /// Drop any tracked state for a device.
    pub fn clear(&mut self, device_id: i64) {
        self.states.remove(&device_id);
    }

    fn evaluate(&mut self, device_id: i64, now: DateTime<Utc>) -> WindowDecision {
        let Some(state) = self.states.get(&device_id) else {
            return WindowDecision::Pending;
        };
        let (Some(card_at), Some(face_at)) = (state.card_at, state.face_at) else {
            return WindowDecision::Pending;
        };

        let card_fresh = now.signed_duration_since(card_at) <= self.window;
        let face_fresh = now.signed_duration_since(face_at) <= self.window;

        // Either way the pair is consumed: a grant must not be replayable
        // from stale timestamps, and a stale pair restarts from scratch.
        self.states.remove(&device_id);

        if card_fresh && face_fresh {
            WindowDecision::Grant
        } else {
            WindowDecision::StaleReset
        }
    }
}
