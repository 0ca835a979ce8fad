//! Access decision coordinator.
//!
//! A single consuming task owns every piece of mutable decision state —
//! armed enrollments, combined-factor windows, recognition cooldowns — and
//! applies events strictly in arrival order. Adapters feed it typed
//! [`CoreEvent`]s over an mpsc channel; it never touches raw payloads.
//!
//! State is mutated first and released with the stack frame; durable effects
//! (store writes, notifications, unlock commands) happen afterwards, so the
//! exclusive owner is never parked on I/O while holding a claim another
//! event needs.

pub mod decision;
pub mod enrollment;
pub mod window;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::matcher::{self, Recognition};
use crate::notify::NotificationHub;
use crate::store::{AccessStore, BindingOutcome, Device, StoreError};
use crate::types::{
    AccessResult, ControlCommand, CoreEvent, DoorState, EnrollmentStatus, Factor, FieldEvent,
    HardwareChannel, LockCommand, Notification, Policy, ScanMode,
};

use self::decision::DecisionPublisher;
use self::enrollment::EnrollmentRegistry;
use self::window::{FactorWindows, WindowDecision};

/// Policy parameters the coordinator runs under.
///
/// All values come from configuration; none are per-device.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    /// Minimum similarity for a positive recognition.
    pub accept_threshold: f32,
    /// Similarity at or above which a new enrollment is a duplicate.
    pub dedup_threshold: f32,
    /// Combining window for AND-policy devices.
    pub window: Duration,
    /// Suppression interval after a face-triggered grant attempt.
    pub cooldown: Duration,
    /// Lifetime of an armed enrollment session.
    pub enroll_ttl: Duration,
}

/// The coordinator task's state and collaborators.
pub struct Coordinator {
    store: Arc<AccessStore>,
    hub: NotificationHub,
    commands: mpsc::Sender<LockCommand>,
    publisher: DecisionPublisher,
    settings: CoordinatorSettings,
    enrollment: EnrollmentRegistry,
    windows: FactorWindows,
    /// Per-device time of the last face-triggered grant attempt.
    face_cooldowns: HashMap<i64, DateTime<Utc>>,
}

impl Coordinator {
    /// Build a coordinator over its collaborators.
    pub fn new(
        store: Arc<AccessStore>,
        hub: NotificationHub,
        commands: mpsc::Sender<LockCommand>,
        settings: CoordinatorSettings,
    ) -> Self {
        let publisher =
            DecisionPublisher::new(Arc::clone(&store), hub.clone(), commands.clone());
        Self {
            store,
            hub,
            commands,
            publisher,
            settings,
            enrollment: EnrollmentRegistry::new(settings.enroll_ttl),
            windows: FactorWindows::new(settings.window),
            face_cooldowns: HashMap::new(),
        }
    }

    /// Consume events until the channel closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<CoreEvent>) {
        info!("coordinator started");
        while let Some(event) = events.recv().await {
            self.handle(event, Utc::now()).await;
        }
        info!("coordinator stopped");
    }

    /// Apply one event at an explicit instant.
    ///
    /// Public so tests can drive the full pipeline with fixed timestamps.
    pub async fn handle(&mut self, event: CoreEvent, now: DateTime<Utc>) {
        match event {
            CoreEvent::Field(FieldEvent::CardScan {
                uid,
                reader_chip_id,
            }) => self.handle_card_scan(&uid, reader_chip_id.as_deref(), now).await,

            CoreEvent::Field(FieldEvent::DoorReport { chip_id, state }) => {
                self.handle_door_report(&chip_id, state).await;
            }

            CoreEvent::Field(FieldEvent::CameraOnline { camera_chip_id }) => {
                self.handle_camera_online(&camera_chip_id).await;
            }

            CoreEvent::Field(FieldEvent::FaceResult {
                embedding,
                camera_chip_id,
            }) => {
                self.handle_face_result(embedding.as_deref(), camera_chip_id.as_deref(), now)
                    .await;
            }

            CoreEvent::Field(FieldEvent::CaptureProgress {
                label,
                current,
                total,
                no_face,
            }) => {
                self.hub.publish(Notification::CaptureProgress {
                    label,
                    current,
                    total,
                    no_face,
                });
            }

            CoreEvent::Control(ControlCommand::StartEnrollment { device_id, label }) => {
                self.handle_start_enrollment(device_id, label, now).await;
            }

            CoreEvent::Control(ControlCommand::CancelEnrollment { device_id }) => {
                self.enrollment.cancel(device_id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Card path
    // ------------------------------------------------------------------

    async fn handle_card_scan(
        &mut self,
        uid: &str,
        reader_chip_id: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let device = match reader_chip_id {
            Some(chip) => match self
                .store
                .resolve_device(HardwareChannel::Reader, chip)
                .await
            {
                Ok(device) => Some(device),
                Err(err) => {
                    warn!(uid, chip, error = %err, "device resolution failed");
                    self.hub.publish(Notification::StorageFault {
                        operation: "resolve-device".to_owned(),
                        device_id: None,
                    });
                    return;
                }
            },
            None => None,
        };

        let armed = device
            .as_ref()
            .is_some_and(|d| self.enrollment.is_armed(d.id, now));
        self.hub.publish(Notification::ScanObserved {
            uid: uid.to_owned(),
            mode: if armed {
                ScanMode::Register
            } else {
                ScanMode::Normal
            },
            device_id: device.as_ref().map(|d| d.id),
        });

        let Some(device) = device else {
            // Without a reader chip there is no device to decide for.
            debug!(uid, "card scan carried no reader chip id");
            return;
        };

        if let Some(session) = self.enrollment.take(device.id, now) {
            self.enroll_card(&device, uid, session.label.as_deref()).await;
        } else {
            self.authenticate_card(&device, uid, now).await;
        }
    }

    /// Consume an armed session with a card scan: upsert the card, bind it.
    async fn enroll_card(&mut self, device: &Device, uid: &str, label: Option<&str>) {
        let result = async {
            let card = self.store.upsert_card(uid, label).await?;
            let outcome = self.store.bind_card(device.id, card.id).await?;
            Ok::<BindingOutcome, StoreError>(outcome)
        }
        .await;

        match result {
            Ok(outcome) => {
                let status = match outcome {
                    BindingOutcome::Created => EnrollmentStatus::Created,
                    BindingOutcome::Existed => EnrollmentStatus::Existed,
                };
                info!(uid, device_id = device.id, ?status, "card enrollment consumed");
                self.hub.publish(Notification::EnrollmentResult {
                    subject: uid.to_owned(),
                    device_id: device.id,
                    status,
                });
            }
            Err(err) => {
                warn!(uid, device_id = device.id, error = %err, "card enrollment failed");
                self.hub.publish(Notification::StorageFault {
                    operation: "enroll-card".to_owned(),
                    device_id: Some(device.id),
                });
            }
        }
    }

    /// Evaluate a normal-mode scan against the device's bindings and policy.
    async fn authenticate_card(&mut self, device: &Device, uid: &str, now: DateTime<Utc>) {
        let authorized = match self.card_authorized(device, uid).await {
            Ok(authorized) => authorized,
            Err(err) => {
                warn!(uid, device_id = device.id, error = %err, "card lookup failed");
                self.hub.publish(Notification::StorageFault {
                    operation: "card-lookup".to_owned(),
                    device_id: Some(device.id),
                });
                return;
            }
        };

        if !authorized {
            self.publisher
                .publish(device, Factor::Card, AccessResult::Denied, Some(uid), now)
                .await;
            return;
        }

        match device.policy {
            Policy::Or => {
                self.publisher
                    .publish(device, Factor::Card, AccessResult::Success, Some(uid), now)
                    .await;
            }
            Policy::And => {
                self.apply_window(device, Factor::Card, uid, now).await;
            }
        }
    }

    async fn card_authorized(&self, device: &Device, uid: &str) -> Result<bool, StoreError> {
        let Some(card) = self.store.card_by_code(uid).await? else {
            return Ok(false);
        };
        self.store.binding_exists(device.id, card.id).await
    }

    // ------------------------------------------------------------------
    // Face path
    // ------------------------------------------------------------------

    async fn handle_face_result(
        &mut self,
        embedding: Option<&[f32]>,
        camera_chip_id: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let device = match camera_chip_id {
            Some(chip) => match self
                .store
                .resolve_device(HardwareChannel::Camera, chip)
                .await
            {
                Ok(device) => Some(device),
                Err(err) => {
                    warn!(chip, error = %err, "camera device resolution failed");
                    self.hub.publish(Notification::StorageFault {
                        operation: "resolve-device".to_owned(),
                        device_id: None,
                    });
                    return;
                }
            },
            None => None,
        };

        let Some(embedding) = embedding else {
            // Nothing to recognize — distinct from "nobody recognized".
            self.hub.publish(Notification::RecognitionStatus {
                subject: matcher::NO_FACE.to_owned(),
                score: 0.0,
            });
            return;
        };

        // A session armed with a label captures the next embedding as an
        // enrollment; label-less sessions only bind cards.
        if let Some(device) = &device {
            if let Some(Some(label)) = self.enrollment.armed_label(device.id, now) {
                let _ = self.enrollment.take(device.id, now);
                self.enroll_face(device, &label, embedding).await;
                return;
            }
        }

        let identities = match self.store.identities().await {
            Ok(identities) => identities,
            Err(err) => {
                warn!(error = %err, "identity load failed");
                self.hub.publish(Notification::StorageFault {
                    operation: "load-identities".to_owned(),
                    device_id: device.as_ref().map(|d| d.id),
                });
                return;
            }
        };

        let recognition = matcher::recognize(
            Some(embedding),
            &identities,
            self.settings.accept_threshold,
        );
        self.hub.publish(Notification::RecognitionStatus {
            subject: recognition.subject().to_owned(),
            score: recognition.score(),
        });

        let Recognition::Match { name, .. } = recognition else {
            return;
        };
        let Some(device) = device else {
            debug!(subject = %name, "face matched but frame carried no camera chip id");
            return;
        };

        // Continuous streams re-match the same face many times a second;
        // only the first attempt per cooldown interval may grant.
        if let Some(last) = self.face_cooldowns.get(&device.id) {
            if now.signed_duration_since(*last) < self.settings.cooldown {
                debug!(device_id = device.id, subject = %name, "face grant suppressed by cooldown");
                return;
            }
        }
        self.face_cooldowns.insert(device.id, now);

        match device.policy {
            Policy::Or => {
                self.publisher
                    .publish(
                        &device,
                        Factor::Face,
                        AccessResult::Success,
                        Some(&name),
                        now,
                    )
                    .await;
            }
            Policy::And => {
                self.apply_window(&device, Factor::Face, &name, now).await;
            }
        }
    }

    /// Consume an armed session with an embedding, running the dedup guard.
    async fn enroll_face(&mut self, device: &Device, label: &str, embedding: &[f32]) {
        let identities = match self.store.identities().await {
            Ok(identities) => identities,
            Err(err) => {
                warn!(label, error = %err, "identity load failed during enrollment");
                self.hub.publish(Notification::StorageFault {
                    operation: "enroll-face".to_owned(),
                    device_id: Some(device.id),
                });
                return;
            }
        };

        if let Some((existing, score)) = matcher::find_duplicate(
            embedding,
            &identities,
            label,
            self.settings.dedup_threshold,
        ) {
            info!(
                label,
                existing = %existing.name,
                score,
                "face enrollment rejected: near-duplicate identity"
            );
            self.hub.publish(Notification::EnrollmentResult {
                subject: label.to_owned(),
                device_id: device.id,
                status: EnrollmentStatus::FaceExists {
                    existing: existing.name.clone(),
                    score,
                },
            });
            return;
        }

        match self.store.save_identity(label, embedding).await {
            Ok(identity) => {
                info!(label, identity_id = identity.id, "face enrolled");
                self.hub.publish(Notification::EnrollmentResult {
                    subject: label.to_owned(),
                    device_id: device.id,
                    status: EnrollmentStatus::Created,
                });
            }
            Err(err) => {
                warn!(label, error = %err, "identity save failed");
                self.hub.publish(Notification::StorageFault {
                    operation: "enroll-face".to_owned(),
                    device_id: Some(device.id),
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared AND-window application
    // ------------------------------------------------------------------

    async fn apply_window(
        &mut self,
        device: &Device,
        factor: Factor,
        subject: &str,
        now: DateTime<Utc>,
    ) {
        let decision = match factor {
            Factor::Card => self.windows.record_card(device.id, now),
            Factor::Face => self.windows.record_face(device.id, now),
            Factor::Combined => return,
        };

        match decision {
            WindowDecision::Grant => {
                self.publisher
                    .publish(
                        device,
                        Factor::Combined,
                        AccessResult::Success,
                        Some(subject),
                        now,
                    )
                    .await;
            }
            WindowDecision::Pending => {
                debug!(device_id = device.id, "factor recorded, awaiting partner");
            }
            WindowDecision::StaleReset => {
                debug!(device_id = device.id, "combined window stale, state reset");
            }
        }
    }

    // ------------------------------------------------------------------
    // Door, camera, and control paths
    // ------------------------------------------------------------------

    async fn handle_door_report(&mut self, chip_id: &str, state: DoorState) {
        let device = match self
            .store
            .resolve_device(HardwareChannel::Reader, chip_id)
            .await
        {
            Ok(device) => device,
            Err(err) => {
                warn!(chip_id, error = %err, "device resolution failed for door report");
                self.hub.publish(Notification::StorageFault {
                    operation: "resolve-device".to_owned(),
                    device_id: None,
                });
                return;
            }
        };

        match self.store.set_door_state(device.id, state).await {
            Ok(changed) => {
                debug!(device_id = device.id, state = state.as_str(), changed, "door reported");
                self.hub.publish(Notification::DoorStatus {
                    device_id: device.id,
                    state,
                });
            }
            Err(err) => {
                warn!(device_id = device.id, error = %err, "door state write failed");
                self.hub.publish(Notification::StorageFault {
                    operation: "set-door-state".to_owned(),
                    device_id: Some(device.id),
                });
            }
        }
    }

    async fn handle_camera_online(&mut self, camera_chip_id: &str) {
        match self
            .store
            .resolve_device(HardwareChannel::Camera, camera_chip_id)
            .await
        {
            Ok(device) => {
                info!(camera_chip_id, device_id = device.id, "camera online");
            }
            Err(err) => {
                warn!(camera_chip_id, error = %err, "camera resolution failed");
                self.hub.publish(Notification::StorageFault {
                    operation: "resolve-device".to_owned(),
                    device_id: None,
                });
            }
        }
    }

    async fn handle_start_enrollment(
        &mut self,
        device_id: i64,
        label: Option<String>,
        now: DateTime<Utc>,
    ) {
        match self.store.device_by_id(device_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(device_id, "enrollment start for unknown device, ignoring");
                return;
            }
            Err(err) => {
                warn!(device_id, error = %err, "device lookup failed");
                self.hub.publish(Notification::StorageFault {
                    operation: "device-lookup".to_owned(),
                    device_id: Some(device_id),
                });
                return;
            }
        }

        self.enrollment.arm(device_id, label.clone(), now);

        // A labelled session may capture a face; tell the recognizer to
        // start collecting frames for it.
        if let Some(label) = label {
            if let Err(err) = self.commands.send(LockCommand::StartCapture { label }).await {
                warn!(device_id, error = %err, "capture command channel closed");
            }
        }
    }
}
