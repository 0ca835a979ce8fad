//! Gateway message envelopes and boundary validation.
//!
//! Every peer — field devices, the recognizer worker, dashboards — speaks
//! JSON envelopes `{ "topic": ..., "data": ... }` over one WebSocket
//! endpoint. Inbound payloads are validated into typed [`CoreEvent`]s here,
//! at the boundary; a payload that does not match its topic's schema is
//! rejected before anything downstream sees it.

pub mod server;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    ControlCommand, CoreEvent, DoorState, FieldEvent, LockCommand, Notification,
};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Card scans reported by readers.
pub const TOPIC_CARD: &str = "iot/rfid/card";
/// Door sensor reports from lock controllers.
pub const TOPIC_DOOR: &str = "iot/door/status";
/// Unlock commands to lock controllers.
pub const TOPIC_COMMAND: &str = "iot/rfid/command";
/// Camera online announcements.
pub const TOPIC_CAMERA_ONLINE: &str = "iot/camera/online";
/// Embedding results from the recognizer.
pub const TOPIC_EMBEDDING: &str = "ai/embedding";
/// Enrollment-capture progress from the recognizer.
pub const TOPIC_CAPTURE: &str = "ai/capture";
/// Start-capture instruction to the recognizer.
pub const TOPIC_START_CAPTURE: &str = "ai/start-capture";
/// Dashboard command: arm enrollment.
pub const TOPIC_ENROLL_START: &str = "enroll/start";
/// Dashboard command: disarm enrollment.
pub const TOPIC_ENROLL_CANCEL: &str = "enroll/cancel";

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One gateway frame: a topic and its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing topic.
    pub topic: String,
    /// Topic-specific payload.
    #[serde(default)]
    pub data: Value,
}

/// Errors from gateway transport and validation.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Listener socket failure.
    #[error("gateway io error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Payload did not match the topic's schema.
    #[error("invalid payload on {topic}: {source}")]
    InvalidPayload {
        /// Topic the bad payload arrived on.
        topic: String,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// The coordinator's event channel is closed.
    #[error("event channel closed")]
    ChannelClosed,
}

// ---------------------------------------------------------------------------
// Inbound payload schemas
// ---------------------------------------------------------------------------

/// `iot/rfid/card` payload.
#[derive(Debug, Deserialize)]
struct CardScanPayload {
    uid: String,
    #[serde(default)]
    chip_id: Option<String>,
}

/// `iot/door/status` payload.
#[derive(Debug, Deserialize)]
struct DoorPayload {
    chip_id: String,
    door: DoorState,
}

/// `iot/camera/online` payload.
#[derive(Debug, Deserialize)]
struct CameraOnlinePayload {
    chip_cam_id: String,
}

/// `ai/embedding` payload. A missing or null embedding means the detector
/// found no face in the frame.
#[derive(Debug, Deserialize)]
struct EmbeddingPayload {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    chip_cam_id: Option<String>,
}

/// `ai/capture` payload.
#[derive(Debug, Deserialize)]
struct CapturePayload {
    name: String,
    current: u32,
    total: u32,
    #[serde(default)]
    no_face: bool,
}

/// `enroll/start` payload.
#[derive(Debug, Deserialize)]
struct EnrollStartPayload {
    device_id: i64,
    #[serde(default)]
    label: Option<String>,
}

/// `enroll/cancel` payload.
#[derive(Debug, Deserialize)]
struct EnrollCancelPayload {
    device_id: i64,
}

/// Validate an inbound envelope into a [`CoreEvent`].
///
/// Returns `Ok(None)` for topics the core does not consume (a dashboard may
/// see its own publishes echoed, for instance).
///
/// # Errors
///
/// Returns [`GatewayError::InvalidPayload`] when the payload does not match
/// the topic's schema. Callers log and drop — malformed input is never fatal
/// and never produces an audit record.
pub fn parse_envelope(envelope: &Envelope) -> Result<Option<CoreEvent>, GatewayError> {
    let invalid = |source| GatewayError::InvalidPayload {
        topic: envelope.topic.clone(),
        source,
    };

    let event = match envelope.topic.as_str() {
        TOPIC_CARD => {
            let payload: CardScanPayload =
                serde_json::from_value(envelope.data.clone()).map_err(invalid)?;
            CoreEvent::Field(FieldEvent::CardScan {
                uid: payload.uid,
                reader_chip_id: payload.chip_id,
            })
        }
        TOPIC_DOOR => {
            let payload: DoorPayload =
                serde_json::from_value(envelope.data.clone()).map_err(invalid)?;
            CoreEvent::Field(FieldEvent::DoorReport {
                chip_id: payload.chip_id,
                state: payload.door,
            })
        }
        TOPIC_CAMERA_ONLINE => {
            let payload: CameraOnlinePayload =
                serde_json::from_value(envelope.data.clone()).map_err(invalid)?;
            CoreEvent::Field(FieldEvent::CameraOnline {
                camera_chip_id: payload.chip_cam_id,
            })
        }
        TOPIC_EMBEDDING => {
            let payload: EmbeddingPayload =
                serde_json::from_value(envelope.data.clone()).map_err(invalid)?;
            CoreEvent::Field(FieldEvent::FaceResult {
                embedding: payload.embedding,
                camera_chip_id: payload.chip_cam_id,
            })
        }
        TOPIC_CAPTURE => {
            let payload: CapturePayload =
                serde_json::from_value(envelope.data.clone()).map_err(invalid)?;
            CoreEvent::Field(FieldEvent::CaptureProgress {
                label: payload.name,
                current: payload.current,
                total: payload.total,
                no_face: payload.no_face,
            })
        }
        TOPIC_ENROLL_START => {
            let payload: EnrollStartPayload =
                serde_json::from_value(envelope.data.clone()).map_err(invalid)?;
            CoreEvent::Control(ControlCommand::StartEnrollment {
                device_id: payload.device_id,
                label: payload.label,
            })
        }
        TOPIC_ENROLL_CANCEL => {
            let payload: EnrollCancelPayload =
                serde_json::from_value(envelope.data.clone()).map_err(invalid)?;
            CoreEvent::Control(ControlCommand::CancelEnrollment {
                device_id: payload.device_id,
            })
        }
        _ => return Ok(None),
    };

    Ok(Some(event))
}

// ---------------------------------------------------------------------------
// Outbound envelopes
// ---------------------------------------------------------------------------

/// Topic a notification fans out on.
pub fn notification_topic(notification: &Notification) -> &'static str {
    match notification {
        Notification::ScanObserved { .. } => "notify/rfid-scan",
        Notification::EnrollmentResult { .. } => "notify/enrollment",
        Notification::AccessDecision { .. } => "notify/access-log",
        Notification::RecognitionStatus { .. } => "notify/recognition",
        Notification::CaptureProgress { .. } => "notify/capture-progress",
        Notification::DoorStatus { .. } => "notify/door-status",
        Notification::StorageFault { .. } => "notify/storage-fault",
    }
}

/// Wrap a notification for fan-out.
pub fn notification_envelope(notification: &Notification) -> Envelope {
    Envelope {
        topic: notification_topic(notification).to_owned(),
        data: serde_json::to_value(notification).unwrap_or(Value::Null),
    }
}

/// Wrap an outbound device/recognizer command.
pub fn command_envelope(command: &LockCommand) -> Envelope {
    match command {
        LockCommand::Unlock { device_id } => Envelope {
            topic: TOPIC_COMMAND.to_owned(),
            // Controllers act on the opaque "OPEN" instruction and use the
            // device id to ignore commands meant for other doors.
            data: serde_json::json!({ "device_id": device_id, "command": "OPEN" }),
        },
        LockCommand::StartCapture { label } => Envelope {
            topic: TOPIC_START_CAPTURE.to_owned(),
            data: serde_json::json!({ "name": label }),
        },
    }
}
