//! Core event and notification shapes exchanged with field devices, the
//! recognizer worker, and dashboard subscribers.
//!
//! Inbound payloads are validated into these types at the gateway boundary;
//! nothing downstream ever touches raw JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

// ---------------------------------------------------------------------------
// Persistent enums (stored as TEXT, see migrations/001_schema.sql)
// ---------------------------------------------------------------------------

/// Unlock policy for a device: any single factor, or both within a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Policy {
    /// First successful factor unlocks.
    Or,
    /// Card and face must both succeed within the combined-factor window.
    And,
}

impl Policy {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Or => "OR",
            Self::And => "AND",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised policy.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "OR" => Ok(Self::Or),
            "AND" => Ok(Self::And),
            other => Err(StoreError::InvalidEnum {
                field: "policy",
                value: other.to_owned(),
            }),
        }
    }
}

/// Physical door position as last reported by the lock controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DoorState {
    /// Door is open.
    Open,
    /// Door is closed.
    Closed,
}

impl DoorState {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised door state.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "OPEN" => Ok(Self::Open),
            "CLOSED" => Ok(Self::Closed),
            other => Err(StoreError::InvalidEnum {
                field: "door_state",
                value: other.to_owned(),
            }),
        }
    }
}

/// Authentication factor recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Factor {
    /// Proximity-card scan.
    #[serde(rename = "RFID")]
    Card,
    /// Face-embedding match.
    #[serde(rename = "FACE")]
    Face,
    /// Both factors inside one AND window.
    #[serde(rename = "COMBINED")]
    Combined,
}

impl Factor {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "RFID",
            Self::Face => "FACE",
            Self::Combined => "COMBINED",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised factor.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "RFID" => Ok(Self::Card),
            "FACE" => Ok(Self::Face),
            "COMBINED" => Ok(Self::Combined),
            other => Err(StoreError::InvalidEnum {
                field: "factor",
                value: other.to_owned(),
            }),
        }
    }
}

/// Outcome of an access decision.
///
/// The wire and storage representation keeps the field devices' historical
/// `SUCCESS` / `FALSE` vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessResult {
    /// Access granted.
    #[serde(rename = "SUCCESS")]
    Success,
    /// Access denied.
    #[serde(rename = "FALSE")]
    Denied,
}

impl AccessResult {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Denied => "FALSE",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised result.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "FALSE" => Ok(Self::Denied),
            other => Err(StoreError::InvalidEnum {
                field: "result",
                value: other.to_owned(),
            }),
        }
    }
}

/// Which hardware channel a chip identifier belongs to.
///
/// A device binds at most one chip per channel; the bindings are independent
/// (a device may have a reader but no camera, or vice versa).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareChannel {
    /// Card reader / lock controller chip.
    Reader,
    /// Camera module chip.
    Camera,
}

impl HardwareChannel {
    /// Column name holding this channel's chip binding.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Reader => "reader_chip_id",
            Self::Camera => "camera_chip_id",
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

/// A validated report from a field device or the recognizer worker.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldEvent {
    /// A card was presented to a reader.
    CardScan {
        /// Opaque card code as read from the tag.
        uid: String,
        /// Reporting reader chip, when the firmware includes it.
        reader_chip_id: Option<String>,
    },
    /// The lock controller reported its door sensor.
    DoorReport {
        /// Reporting lock-controller chip.
        chip_id: String,
        /// Sensor reading.
        state: DoorState,
    },
    /// A camera module announced itself on the network.
    CameraOnline {
        /// Announcing camera chip.
        camera_chip_id: String,
    },
    /// The recognizer produced an embedding for the latest frame.
    ///
    /// `embedding` is `None` when the detector found no face at all.
    FaceResult {
        /// Fixed-length face embedding, absent when no face was detected.
        embedding: Option<Vec<f32>>,
        /// Camera chip the frame came from, when known.
        camera_chip_id: Option<String>,
    },
    /// The recognizer reported enrollment-capture progress.
    CaptureProgress {
        /// Label being enrolled.
        label: String,
        /// Frames collected so far.
        current: u32,
        /// Frames required.
        total: u32,
        /// Whether the latest frame had no detectable face.
        no_face: bool,
    },
}

/// Operator command from the dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Arm a single-shot enrollment for a device.
    StartEnrollment {
        /// Target device id.
        device_id: i64,
        /// Friendly label for the new credential, if any.
        label: Option<String>,
    },
    /// Disarm a pending enrollment for a device.
    CancelEnrollment {
        /// Target device id.
        device_id: i64,
    },
}

/// Everything the coordinator consumes, in arrival order.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A validated field-device or recognizer report.
    Field(FieldEvent),
    /// An operator command.
    Control(ControlCommand),
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Scan-processing mode reported alongside each observed card scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScanMode {
    /// Scan evaluated against bindings.
    Normal,
    /// Scan consumed by an armed enrollment.
    Register,
}

/// Result of consuming an enrollment with a credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum EnrollmentStatus {
    /// A new binding (or identity) was created.
    #[serde(rename = "CREATED")]
    Created,
    /// The binding already existed; nothing was written.
    #[serde(rename = "EXISTED")]
    Existed,
    /// The presented face is a near-duplicate of a known identity.
    #[serde(rename = "FACE_EXISTS")]
    FaceExists {
        /// Name of the already-enrolled identity.
        existing: String,
        /// Similarity score against that identity.
        score: f32,
    },
}

/// Fan-out notification published to every dashboard subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Notification {
    /// A card scan was observed, in either mode.
    ScanObserved {
        /// Card code.
        uid: String,
        /// Whether the scan fed enrollment or authentication.
        mode: ScanMode,
        /// Resolved device, when the report carried a chip id.
        device_id: Option<i64>,
    },
    /// An armed enrollment was consumed.
    EnrollmentResult {
        /// Card code or identity name that was enrolled.
        subject: String,
        /// Device the enrollment targeted.
        device_id: i64,
        /// What happened.
        #[serde(flatten)]
        status: EnrollmentStatus,
    },
    /// An access decision was made and logged.
    AccessDecision {
        /// Device the decision concerns.
        device_id: i64,
        /// Factor (or combination) that produced the decision.
        factor: Factor,
        /// Granted or denied.
        outcome: AccessResult,
        /// Matched identity or card label, when known.
        subject: Option<String>,
        /// Decision time.
        timestamp: DateTime<Utc>,
    },
    /// Result of one recognition pass over a frame.
    RecognitionStatus {
        /// `NoFace`, `Unknown`, or the matched identity's name.
        subject: String,
        /// Best similarity score (0 when no face was present).
        score: f32,
    },
    /// Enrollment-capture progress relayed from the recognizer.
    CaptureProgress {
        /// Label being enrolled.
        label: String,
        /// Frames collected so far.
        current: u32,
        /// Frames required.
        total: u32,
        /// Whether the latest frame had no detectable face.
        no_face: bool,
    },
    /// A device's door sensor changed (or re-reported) its state.
    DoorStatus {
        /// Resolved device.
        device_id: i64,
        /// Reported position.
        state: DoorState,
    },
    /// A persistence write failed; distinct from a denied decision.
    StorageFault {
        /// What the store was asked to do.
        operation: String,
        /// Device the failed write concerned, when known.
        device_id: Option<i64>,
    },
}

/// Command for a device's control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockCommand {
    /// Release the lock. The payload on the wire is the opaque `"OPEN"`
    /// instruction the controllers expect.
    Unlock {
        /// Device to unlock.
        device_id: i64,
    },
    /// Tell the recognizer to start collecting enrollment frames.
    StartCapture {
        /// Label the frames are being collected for.
        label: String,
    },
}
