//! Tests for the recognition path: NoFace, Unknown, matches, cooldown.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::{broadcast, mpsc};

use latchkey::coordinator::{Coordinator, CoordinatorSettings};
use latchkey::notify::NotificationHub;
use latchkey::store::{AccessStore, Device};
use latchkey::types::{
    AccessResult, CoreEvent, DoorState, Factor, FieldEvent, HardwareChannel, LockCommand,
    Notification,
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

fn face_result(embedding: Option<&[f32]>, cam: Option<&str>) -> CoreEvent {
    CoreEvent::Field(FieldEvent::FaceResult {
        embedding: embedding.map(<[f32]>::to_vec),
        camera_chip_id: cam.map(str::to_owned),
    })
}

async fn seed_face_device(store: &AccessStore) -> Device {
    let device = store
        .resolve_device(HardwareChannel::Camera, "cam-1")
        .await
        .expect("camera resolution should succeed");
    store
        .save_identity("ada", &[1.0, 0.0])
        .await
        .expect("identity should save");
    device
}

#[tokio::test]
async fn faceless_frame_reports_no_face() {
    let (mut coordinator, _store, mut notifications, mut commands) = setup().await;

    coordinator.handle(face_result(None, None), t(0)).await;

    let seen = drain(&mut notifications);
    assert_eq!(seen.len(), 1);
    assert!(matches!(
        &seen[0],
        Notification::RecognitionStatus { subject, score }
            if subject == "NoFace" && *score == 0.0
    ));
    assert!(commands.try_recv().is_err());
}

#[tokio::test]
async fn unmatched_face_reports_unknown_without_audit() {
    let (mut coordinator, store, mut notifications, mut commands) = setup().await;
    let device = seed_face_device(&store).await;

    // Orthogonal to ada's embedding: similarity 0, below 0.9.
    coordinator
        .handle(face_result(Some(&[0.0, 1.0]), Some("cam-1")), t(0))
        .await;

    let seen = drain(&mut notifications);
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::RecognitionStatus { subject, .. } if subject == "Unknown"
    )));
    assert!(commands.try_recv().is_err());

    // An unrecognized stream frame is not a decision.
    let attempts = store
        .attempts_for_device(device.id, 10)
        .await
        .expect("load should succeed");
    assert!(attempts.is_empty());
}

#[tokio::test]
async fn matched_face_grants_on_or_device() {
    let (mut coordinator, store, mut notifications, mut commands) = setup().await;
    let device = seed_face_device(&store).await;

    coordinator
        .handle(face_result(Some(&[1.0, 0.0]), Some("cam-1")), t(0))
        .await;

    let seen = drain(&mut notifications);
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::RecognitionStatus { subject, .. } if subject == "ada"
    )));
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::AccessDecision {
            factor: Factor::Face,
            outcome: AccessResult::Success,
            ..
        }
    )));
    assert_eq!(
        commands.try_recv().expect("unlock should be issued"),
        LockCommand::Unlock {
            device_id: device.id
        }
    );

    let attempts = store
        .attempts_for_device(device.id, 10)
        .await
        .expect("load should succeed");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].subject.as_deref(), Some("ada"));
}

#[tokio::test]
async fn cooldown_suppresses_repeat_grants() {
    let (mut coordinator, store, mut notifications, mut commands) = setup().await;
    let device = seed_face_device(&store).await;

    // A continuous stream re-matches the same face every frame.
    coordinator
        .handle(face_result(Some(&[1.0, 0.0]), Some("cam-1")), t(0))
        .await;
    coordinator
        .handle(face_result(Some(&[1.0, 0.0]), Some("cam-1")), t(2))
        .await;
    coordinator
        .handle(face_result(Some(&[1.0, 0.0]), Some("cam-1")), t(4))
        .await;

    // One unlock, one audit row — the rest were inside the 5 s cooldown.
    assert!(commands.try_recv().is_ok());
    assert!(commands.try_recv().is_err());
    let attempts = store
        .attempts_for_device(device.id, 10)
        .await
        .expect("load should succeed");
    assert_eq!(attempts.len(), 1);

    // Recognition status still flowed for every frame.
    let seen = drain(&mut notifications);
    let recognitions = seen
        .iter()
        .filter(|n| matches!(n, Notification::RecognitionStatus { .. }))
        .count();
    assert_eq!(recognitions, 3);

    // After the cooldown elapses the next match grants again.
    coordinator
        .handle(face_result(Some(&[1.0, 0.0]), Some("cam-1")), t(6))
        .await;
    assert!(commands.try_recv().is_ok());
}

#[tokio::test]
async fn matched_face_without_camera_chip_cannot_grant() {
    let (mut coordinator, store, mut notifications, mut commands) = setup().await;
    seed_face_device(&store).await;

    coordinator
        .handle(face_result(Some(&[1.0, 0.0]), None), t(0))
        .await;

    let seen = drain(&mut notifications);
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::RecognitionStatus { subject, .. } if subject == "ada"
    )));
    assert!(commands.try_recv().is_err(), "no device, no unlock");
}

#[tokio::test]
async fn door_report_updates_state_and_notifies() {
    let (mut coordinator, store, mut notifications, _commands) = setup().await;

    coordinator
        .handle(
            CoreEvent::Field(FieldEvent::DoorReport {
                chip_id: "esp-1".to_owned(),
                state: DoorState::Open,
            }),
            t(0),
        )
        .await;

    let device = store
        .device_by_chip(HardwareChannel::Reader, "esp-1")
        .await
        .expect("lookup should succeed")
        .expect("device should have been provisioned");
    assert_eq!(device.door_state, DoorState::Open);

    let seen = drain(&mut notifications);
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::DoorStatus {
            device_id,
            state: DoorState::Open,
        } if *device_id == device.id
    )));
}

#[tokio::test]
async fn capture_progress_is_relayed() {
    let (mut coordinator, _store, mut notifications, _commands) = setup().await;

    coordinator
        .handle(
            CoreEvent::Field(FieldEvent::CaptureProgress {
                label: "ada".to_owned(),
                current: 7,
                total: 20,
                no_face: false,
            }),
            t(0),
        )
        .await;

    let seen = drain(&mut notifications);
    assert_eq!(seen.len(), 1);
    assert!(matches!(
        &seen[0],
        Notification::CaptureProgress {
            label,
            current: 7,
            total: 20,
            no_face: false,
        } if label == "ada"
    ));
}
