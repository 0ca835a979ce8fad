//! Tests for the single-shot enrollment flow: cards and faces.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::{broadcast, mpsc};

use latchkey::coordinator::{Coordinator, CoordinatorSettings};
use latchkey::notify::NotificationHub;
use latchkey::store::{AccessStore, Device};
use latchkey::types::{
    AccessResult, ControlCommand, CoreEvent, EnrollmentStatus, FieldEvent, HardwareChannel,
    LockCommand, Notification, ScanMode,
};

fn settings() -> CoordinatorSettings {
    CoordinatorSettings {
        accept_threshold: 0.9,
        dedup_threshold: 0.8,
        window: Duration::seconds(10),
        cooldown: Duration::seconds(5),
        enroll_ttl: Duration::seconds(120),
    }
}

async fn setup() -> (
    Coordinator,
    Arc<AccessStore>,
    broadcast::Receiver<Notification>,
    mpsc::Receiver<LockCommand>,
) {
    let store = Arc::new(
        AccessStore::open_in_memory()
            .await
            .expect("store should initialise"),
    );
    let hub = NotificationHub::new();
    let notifications = hub.subscribe();
    let (commands_tx, commands_rx) = mpsc::channel(16);
    let coordinator = Coordinator::new(Arc::clone(&store), hub, commands_tx, settings());
    (coordinator, store, notifications, commands_rx)
}

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000_i64.saturating_add(secs), 0)
        .single()
        .expect("valid timestamp")
}

fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        out.push(notification);
    }
    out
}

fn scan(uid: &str, chip: &str) -> CoreEvent {
    CoreEvent::Field(FieldEvent::CardScan {
        uid: uid.to_owned(),
        reader_chip_id: Some(chip.to_owned()),
    })
}

fn start(device_id: i64, label: Option<&str>) -> CoreEvent {
    CoreEvent::Control(ControlCommand::StartEnrollment {
        device_id,
        label: label.map(str::to_owned),
    })
}

async fn seed_device(store: &AccessStore, chip: &str) -> Device {
    store
        .resolve_device(HardwareChannel::Reader, chip)
        .await
        .expect("resolution should succeed")
}

fn enrollment_statuses(seen: &[Notification]) -> Vec<&EnrollmentStatus> {
    seen.iter()
        .filter_map(|n| match n {
            Notification::EnrollmentResult { status, .. } => Some(status),
            _ => None,
        })
        .collect()
}

// ------------------------------------------------------------------
// Card enrollment
// ------------------------------------------------------------------

#[tokio::test]
async fn armed_scan_creates_binding_single_shot() {
    let (mut coordinator, store, mut notifications, _commands) = setup().await;
    let device = seed_device(&store, "esp-1").await;

    coordinator.handle(start(device.id, None), t(0)).await;
    coordinator.handle(scan("04AA31", "esp-1"), t(1)).await;

    let seen = drain(&mut notifications);
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::ScanObserved {
            mode: ScanMode::Register,
            ..
        }
    )));
    assert_eq!(enrollment_statuses(&seen), vec![&EnrollmentStatus::Created]);

    // The session was consumed: a second scan of the same card now runs
    // normal authentication, and the freshly bound card is granted.
    coordinator.handle(scan("04AA31", "esp-1"), t(2)).await;
    let seen = drain(&mut notifications);
    assert!(enrollment_statuses(&seen).is_empty());
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::AccessDecision {
            outcome: AccessResult::Success,
            ..
        }
    )));
}

#[tokio::test]
async fn rebinding_reports_existed_without_duplicate_row() {
    let (mut coordinator, store, mut notifications, _commands) = setup().await;
    let device = seed_device(&store, "esp-1").await;

    coordinator.handle(start(device.id, None), t(0)).await;
    coordinator.handle(scan("04AA31", "esp-1"), t(1)).await;
    coordinator.handle(start(device.id, None), t(2)).await;
    coordinator.handle(scan("04AA31", "esp-1"), t(3)).await;

    let seen = drain(&mut notifications);
    assert_eq!(
        enrollment_statuses(&seen),
        vec![&EnrollmentStatus::Created, &EnrollmentStatus::Existed]
    );

    let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM device_cards")
        .fetch_one(store.pool())
        .await
        .expect("count should succeed");
    assert_eq!(count, 1);
}

#[tokio::test]
async fn enrollment_is_scoped_to_its_device() {
    let (mut coordinator, store, mut notifications, _commands) = setup().await;
    let front = seed_device(&store, "esp-1").await;
    let back = seed_device(&store, "esp-2").await;

    // Arm the front door, then scan at the back door: the back-door scan
    // must not consume the front-door session.
    coordinator.handle(start(front.id, None), t(0)).await;
    coordinator.handle(scan("04AA31", "esp-2"), t(1)).await;

    let seen = drain(&mut notifications);
    assert!(enrollment_statuses(&seen).is_empty());
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::AccessDecision {
            device_id,
            outcome: AccessResult::Denied,
            ..
        } if *device_id == back.id
    )));

    // The front-door session is still live and consumes its own scan.
    coordinator.handle(scan("04AA31", "esp-1"), t(2)).await;
    let seen = drain(&mut notifications);
    assert_eq!(enrollment_statuses(&seen), vec![&EnrollmentStatus::Created]);
}

#[tokio::test]
async fn cancelled_enrollment_falls_through_to_authentication() {
    let (mut coordinator, store, mut notifications, _commands) = setup().await;
    let device = seed_device(&store, "esp-1").await;

    coordinator.handle(start(device.id, None), t(0)).await;
    coordinator
        .handle(
            CoreEvent::Control(ControlCommand::CancelEnrollment {
                device_id: device.id,
            }),
            t(1),
        )
        .await;
    coordinator.handle(scan("04AA31", "esp-1"), t(2)).await;

    let seen = drain(&mut notifications);
    assert!(enrollment_statuses(&seen).is_empty());
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::AccessDecision {
            outcome: AccessResult::Denied,
            ..
        }
    )));
}

#[tokio::test]
async fn expired_enrollment_does_not_capture_scan() {
    let (mut coordinator, store, mut notifications, _commands) = setup().await;
    let device = seed_device(&store, "esp-1").await;

    coordinator.handle(start(device.id, None), t(0)).await;
    // TTL is 120 s; the next scan arrives later than that.
    coordinator.handle(scan("04AA31", "esp-1"), t(121)).await;

    let seen = drain(&mut notifications);
    assert!(enrollment_statuses(&seen).is_empty());
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::ScanObserved {
            mode: ScanMode::Normal,
            ..
        }
    )));
}

#[tokio::test]
async fn rearm_overwrites_previous_session() {
    let (mut coordinator, store, mut notifications, _commands) = setup().await;
    let device = seed_device(&store, "esp-1").await;

    coordinator.handle(start(device.id, Some("old label")), t(0)).await;
    coordinator.handle(start(device.id, Some("new label")), t(1)).await;
    coordinator.handle(scan("04AA31", "esp-1"), t(2)).await;

    drain(&mut notifications);
    let card = store
        .card_by_code("04AA31")
        .await
        .expect("lookup should succeed")
        .expect("card should exist");
    assert_eq!(card.label.as_deref(), Some("new label"));
}

#[tokio::test]
async fn enrollment_for_unknown_device_is_ignored() {
    let (mut coordinator, store, mut notifications, _commands) = setup().await;
    let device = seed_device(&store, "esp-1").await;

    coordinator.handle(start(999, None), t(0)).await;
    coordinator.handle(scan("04AA31", "esp-1"), t(1)).await;

    // Nothing was armed; the scan authenticated (and was denied).
    let seen = drain(&mut notifications);
    assert!(enrollment_statuses(&seen).is_empty());
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::AccessDecision {
            device_id,
            outcome: AccessResult::Denied,
            ..
        } if *device_id == device.id
    )));
}

// ------------------------------------------------------------------
// Face enrollment
// ------------------------------------------------------------------

fn face_result(embedding: &[f32], cam: &str) -> CoreEvent {
    CoreEvent::Field(FieldEvent::FaceResult {
        embedding: Some(embedding.to_vec()),
        camera_chip_id: Some(cam.to_owned()),
    })
}

#[tokio::test]
async fn labelled_session_captures_face_and_starts_capture() {
    let (mut coordinator, store, mut notifications, mut commands) = setup().await;
    let device = seed_device(&store, "esp-1").await;
    let by_camera = store
        .resolve_device(HardwareChannel::Camera, "cam-1")
        .await
        .expect("camera resolution should succeed");
    assert_eq!(device.id, by_camera.id);

    coordinator.handle(start(device.id, Some("ada")), t(0)).await;

    // Arming with a label tells the recognizer to start collecting frames.
    assert_eq!(
        commands.try_recv().expect("capture command expected"),
        LockCommand::StartCapture {
            label: "ada".to_owned()
        }
    );

    coordinator
        .handle(face_result(&[1.0, 0.0], "cam-1"), t(1))
        .await;

    let seen = drain(&mut notifications);
    assert_eq!(enrollment_statuses(&seen), vec![&EnrollmentStatus::Created]);

    let identities = store.identities().await.expect("load should succeed");
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].name, "ada");
    assert_eq!(identities[0].embedding.as_deref(), Some([1.0_f32, 0.0].as_slice()));
}

#[tokio::test]
async fn near_duplicate_face_is_rejected() {
    let (mut coordinator, store, mut notifications, _commands) = setup().await;
    let device = seed_device(&store, "esp-1").await;
    store
        .resolve_device(HardwareChannel::Camera, "cam-1")
        .await
        .expect("camera resolution should succeed");
    store
        .save_identity("ada", &[1.0, 0.0])
        .await
        .expect("identity should save");

    coordinator.handle(start(device.id, Some("eve")), t(0)).await;
    // This embedding scores ~0.85 against ada — at or above the 0.8 dedup
    // threshold, so enrollment is rejected.
    coordinator
        .handle(face_result(&[0.85, 0.5268], "cam-1"), t(1))
        .await;

    let seen = drain(&mut notifications);
    let statuses = enrollment_statuses(&seen);
    assert_eq!(statuses.len(), 1);
    match statuses[0] {
        EnrollmentStatus::FaceExists { existing, score } => {
            assert_eq!(existing, "ada");
            assert!(*score >= 0.8, "score was {score}");
        }
        other => panic!("expected FACE_EXISTS, got {other:?}"),
    }

    // Nothing was saved for eve.
    let identities = store.identities().await.expect("load should succeed");
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].name, "ada");
}

#[tokio::test]
async fn reenrolling_own_face_passes_dedup() {
    let (mut coordinator, store, mut notifications, _commands) = setup().await;
    let device = seed_device(&store, "esp-1").await;
    store
        .resolve_device(HardwareChannel::Camera, "cam-1")
        .await
        .expect("camera resolution should succeed");
    store
        .save_identity("ada", &[1.0, 0.0])
        .await
        .expect("identity should save");

    coordinator.handle(start(device.id, Some("ada")), t(0)).await;
    coordinator
        .handle(face_result(&[0.99, 0.01], "cam-1"), t(1))
        .await;

    let seen = drain(&mut notifications);
    assert_eq!(enrollment_statuses(&seen), vec![&EnrollmentStatus::Created]);

    let identities = store.identities().await.expect("load should succeed");
    assert_eq!(identities.len(), 1);
    assert_eq!(
        identities[0].embedding.as_deref(),
        Some([0.99_f32, 0.01].as_slice())
    );
}

#[tokio::test]
async fn label_less_session_ignores_faces() {
    let (mut coordinator, store, mut notifications, _commands) = setup().await;
    let device = seed_device(&store, "esp-1").await;
    store
        .resolve_device(HardwareChannel::Camera, "cam-1")
        .await
        .expect("camera resolution should succeed");

    coordinator.handle(start(device.id, None), t(0)).await;
    coordinator
        .handle(face_result(&[1.0, 0.0], "cam-1"), t(1))
        .await;

    // The face ran normal recognition instead of consuming the session.
    let seen = drain(&mut notifications);
    assert!(enrollment_statuses(&seen).is_empty());
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::RecognitionStatus { subject, .. } if subject == "Unknown"
    )));

    // The session still captures the next card scan.
    coordinator.handle(scan("04AA31", "esp-1"), t(2)).await;
    let seen = drain(&mut notifications);
    assert_eq!(enrollment_statuses(&seen), vec![&EnrollmentStatus::Created]);
}
