//! Integration tests for the command execution supervisor.

mod common;

use common::{Call, RecordingBackend, eventually, start, test_config, wait_terminal};
use stagehand_rs::command::{AckReason, AckStatus, CommandRequest, ZoomAction};
use stagehand_rs::status::{SystemStatus, TransitionError};
use stagehand_rs::supervisor::{ResetError, SubmitError, Supervisor};
use stagehand_rs::queue::QueueError;
use stagehand_rs::telemetry::TelemetryPublisher;
use stagehand_rs::watchdog::Watchdog;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn move_to(x: f64, y: f64, z: f64) -> CommandRequest {
    CommandRequest::MoveNozzle { x, y, z, feedrate: None }
}

async fn homed(backend: &Arc<RecordingBackend>) -> stagehand_rs::SupervisorHandle {
    let handle = start(backend.clone(), &test_config());
    let id = handle.submit(CommandRequest::Home).await.unwrap();
    assert_eq!(wait_terminal(&handle, id).await.status, AckStatus::Ok);
    handle
}

#[tokio::test]
async fn test_unhomed_motion_never_reaches_backend() {
    let backend = RecordingBackend::new();
    let handle = start(backend.clone(), &test_config());

    let requests = [
        move_to(10.0, 10.0, 10.0),
        CommandRequest::MoveNozzleXY { x: 1.0, y: 1.0, feedrate: None },
        CommandRequest::MoveNozzleZ { z: 1.0, feedrate: None },
        CommandRequest::Zoom { action: ZoomAction::In, value: 80.0 },
    ];
    for request in requests {
        let id = handle.submit(request).await.unwrap();
        let ack = wait_terminal(&handle, id).await;
        assert_eq!(ack.status, AckStatus::Error);
        assert_eq!(ack.reason, Some(AckReason::NotHomed));
    }
    assert!(backend.calls().is_empty());
    assert_eq!(handle.system_status(), SystemStatus::Idle);

    let id = handle.submit(CommandRequest::Home).await.unwrap();
    assert_eq!(wait_terminal(&handle, id).await.status, AckStatus::Ok);
    assert_eq!(backend.calls(), vec![Call::Home]);
    assert!(handle.readiness().homed);
}

#[tokio::test]
async fn test_out_of_range_never_reaches_backend() {
    let backend = RecordingBackend::new();
    let handle = homed(&backend).await;

    let id = handle.submit(move_to(10.0, 10.0, 300.0)).await.unwrap();
    let ack = wait_terminal(&handle, id).await;
    assert_eq!(ack.reason, Some(AckReason::OutOfRange));
    assert!(ack.message.contains('z'));

    let id = handle.submit(CommandRequest::Zoom { action: ZoomAction::Out, value: 80.0 }).await.unwrap();
    assert_eq!(wait_terminal(&handle, id).await.reason, Some(AckReason::OutOfRange));

    assert_eq!(backend.calls(), vec![Call::Home]);
    // a rejection leaves the status alone
    assert_eq!(handle.system_status(), SystemStatus::Idle);
}

#[tokio::test]
async fn test_concurrent_producers_fifo_without_overlap() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 5;
    let backend = RecordingBackend::new();
    backend.move_delay_ms.store(10, Ordering::SeqCst);
    let handle = homed(&backend).await;
    let mut acks = handle.subscribe_acks();

    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        let handle = handle.clone();
        producers.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for i in 0..PER_PRODUCER {
                let x = (p * PER_PRODUCER + i) as f64;
                ids.push(handle.submit(move_to(x, 1.0, 1.0)).await.unwrap());
            }
            ids
        }));
    }
    let mut per_producer = Vec::new();
    for producer in producers {
        per_producer.push(producer.await.unwrap());
    }

    let mut completed = Vec::new();
    while completed.len() < PRODUCERS * PER_PRODUCER {
        let ack = tokio::time::timeout(Duration::from_secs(5), acks.recv()).await.unwrap().unwrap();
        assert_eq!(ack.status, AckStatus::Ok);
        completed.push(ack.id);
    }
    let mut unique = completed.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), PRODUCERS * PER_PRODUCER);

    // each producer's commands complete in its submission order
    for ids in &per_producer {
        let positions: Vec<_> = ids.iter().map(|id| completed.iter().position(|c| c == id).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }
    assert_eq!(backend.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_emergency_stop_is_idempotent() {
    let backend = RecordingBackend::new();
    let handle = homed(&backend).await;

    let first = handle.submit(CommandRequest::EmergencyStop).await.unwrap();
    let ack = wait_terminal(&handle, first).await;
    assert_eq!(ack.status, AckStatus::Ok);
    assert_eq!(handle.system_status(), SystemStatus::EmergencyStop);

    let second = handle.submit(CommandRequest::EmergencyStop).await.unwrap();
    let ack = wait_terminal(&handle, second).await;
    assert_eq!(ack.status, AckStatus::Ok);
    assert!(ack.message.contains("already active"));
    assert_eq!(backend.count(|c| matches!(c, Call::EmergencyStop)), 1);

    let id = handle.submit(CommandRequest::Home).await.unwrap();
    assert_eq!(wait_terminal(&handle, id).await.reason, Some(AckReason::EmergencyStopActive));
    assert_eq!(handle.system_status(), SystemStatus::EmergencyStop);
}

#[tokio::test]
async fn test_emergency_stop_during_move_finalizes_and_drains() {
    let backend = RecordingBackend::new();
    let handle = homed(&backend).await;
    backend.move_delay_ms.store(2_000, Ordering::SeqCst);

    let in_flight = handle.submit(move_to(100.0, 100.0, 100.0)).await.unwrap();
    let queued = handle.submit(move_to(5.0, 5.0, 5.0)).await.unwrap();
    eventually(|| handle.system_status() == SystemStatus::Moving).await;

    let stop = handle.submit(CommandRequest::EmergencyStop).await.unwrap();
    assert_eq!(wait_terminal(&handle, stop).await.status, AckStatus::Ok);

    let ack = wait_terminal(&handle, in_flight).await;
    assert_eq!(ack.reason, Some(AckReason::StoppedInFlight));
    assert!(ack.detail.is_some());
    let ack = wait_terminal(&handle, queued).await;
    assert_eq!(ack.reason, Some(AckReason::EmergencyStopActive));

    assert_eq!(handle.system_status(), SystemStatus::EmergencyStop);
    // only the first move was ever dispatched, and the stop reached the backend while it ran
    let calls = backend.calls();
    assert_eq!(backend.count(|c| matches!(c, Call::MoveTo(..))), 1);
    assert_eq!(calls.last(), Some(&Call::EmergencyStop));
}

#[tokio::test]
async fn test_hardware_fault_sets_error_and_loop_continues() {
    let backend = RecordingBackend::new();
    let handle = homed(&backend).await;
    backend.fail_moves.store(true, Ordering::SeqCst);

    let id = handle.submit(move_to(10.0, 10.0, 10.0)).await.unwrap();
    let ack = wait_terminal(&handle, id).await;
    assert_eq!(ack.reason, Some(AckReason::HardwareFault));
    assert!(ack.detail.as_deref().unwrap_or_default().contains("stall"));
    assert_eq!(handle.system_status(), SystemStatus::Error);

    backend.fail_moves.store(false, Ordering::SeqCst);
    let id = handle.submit(move_to(20.0, 10.0, 10.0)).await.unwrap();
    assert_eq!(wait_terminal(&handle, id).await.status, AckStatus::Ok);
    assert_eq!(handle.system_status(), SystemStatus::Idle);
}

#[tokio::test]
async fn test_controller_halt_escalates_to_emergency_stop() {
    let backend = RecordingBackend::new();
    let handle = homed(&backend).await;
    backend.move_delay_ms.store(50, Ordering::SeqCst);
    backend.halt_moves.store(true, Ordering::SeqCst);

    let halted = handle.submit(move_to(10.0, 10.0, 10.0)).await.unwrap();
    let queued = handle.submit(move_to(20.0, 20.0, 20.0)).await.unwrap();

    let ack = wait_terminal(&handle, halted).await;
    assert_eq!(ack.reason, Some(AckReason::HardwareFault));
    let ack = wait_terminal(&handle, queued).await;
    assert_eq!(ack.reason, Some(AckReason::EmergencyStopActive));

    assert_eq!(handle.system_status(), SystemStatus::EmergencyStop);
    assert!(handle.readiness().emergency_stop_active);
    assert_eq!(backend.count(|c| matches!(c, Call::MoveTo(..))), 1);
    assert_eq!(backend.calls().last(), Some(&Call::EmergencyStop));

    // nothing else reaches the controller until an operator reset
    backend.halt_moves.store(false, Ordering::SeqCst);
    let id = handle.submit(CommandRequest::Home).await.unwrap();
    assert_eq!(wait_terminal(&handle, id).await.reason, Some(AckReason::EmergencyStopActive));
    assert_eq!(backend.count(|c| matches!(c, Call::Home)), 1);
}

#[tokio::test]
async fn test_hung_call_times_out() {
    let backend = RecordingBackend::new();
    let mut config = test_config();
    config.safety.hardware_timeout_ms = 100;
    let handle = start(backend.clone(), &config);
    let id = handle.submit(CommandRequest::Home).await.unwrap();
    wait_terminal(&handle, id).await;

    backend.hang_moves.store(true, Ordering::SeqCst);
    let id = handle.submit(move_to(10.0, 10.0, 10.0)).await.unwrap();
    let ack = wait_terminal(&handle, id).await;
    assert_eq!(ack.reason, Some(AckReason::Timeout));
    assert_eq!(handle.system_status(), SystemStatus::Error);

    backend.hang_moves.store(false, Ordering::SeqCst);
    let id = handle.submit(CommandRequest::Capture).await.unwrap();
    assert_eq!(wait_terminal(&handle, id).await.status, AckStatus::Ok);
    assert_eq!(handle.system_status(), SystemStatus::Idle);
}

#[tokio::test]
async fn test_panicking_backend_yields_error_ack() {
    let backend = RecordingBackend::new();
    backend.panic_on_capture.store(true, Ordering::SeqCst);
    let handle = start(backend.clone(), &test_config());

    let id = handle.submit(CommandRequest::Capture).await.unwrap();
    let ack = wait_terminal(&handle, id).await;
    assert_eq!(ack.reason, Some(AckReason::HardwareFault));

    let id = handle.submit(CommandRequest::Home).await.unwrap();
    assert_eq!(wait_terminal(&handle, id).await.status, AckStatus::Ok);
}

#[tokio::test]
async fn test_session_home_move_zoom_capture() {
    let backend = RecordingBackend::new();
    let handle = homed(&backend).await;

    let ids = [
        handle.submit(move_to(50.0, 60.0, 70.0)).await.unwrap(),
        handle.submit(CommandRequest::Zoom { action: ZoomAction::In, value: 800.0 }).await.unwrap(),
        handle.submit(CommandRequest::Capture).await.unwrap(),
    ];
    for id in ids {
        assert_eq!(wait_terminal(&handle, id).await.status, AckStatus::Ok);
    }
    assert_eq!(handle.system_status(), SystemStatus::Idle);
    assert!((handle.readiness().zoom_position - 65.0).abs() < 1e-9);
    let calls = backend.calls();
    assert!(matches!(calls[1], Call::MoveTo(_, 1500)));
    assert_eq!(calls[2], Call::Zoom(ZoomAction::In, 800.0));
    assert_eq!(calls[3], Call::Capture);

    let recent = handle.recent(10).await;
    assert_eq!(recent.len(), 4);
    assert_eq!(recent[0].id, ids[2]);
}

#[tokio::test]
async fn test_move_publishes_moving_then_idle() {
    let backend = RecordingBackend::new();
    let handle = homed(&backend).await;
    backend.move_delay_ms.store(50, Ordering::SeqCst);
    let mut status = handle.watch_status();
    assert_eq!(*status.borrow_and_update(), SystemStatus::Idle);

    let id = handle.submit(move_to(50.0, 60.0, 70.0)).await.unwrap();
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            seen.push(current);
            if current == SystemStatus::Idle {
                break;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(seen, vec![SystemStatus::Moving, SystemStatus::Idle]);
    assert_eq!(wait_terminal(&handle, id).await.status, AckStatus::Ok);
}

#[tokio::test]
async fn test_reset_requires_stop_and_rehoming() {
    let backend = RecordingBackend::new();
    let handle = homed(&backend).await;

    assert_eq!(
        handle.reset_emergency_stop().await,
        Err(ResetError::NotStopped(TransitionError::Reset(SystemStatus::Idle)))
    );

    let id = handle.submit(CommandRequest::EmergencyStop).await.unwrap();
    wait_terminal(&handle, id).await;
    handle.reset_emergency_stop().await.unwrap();
    assert_eq!(handle.system_status(), SystemStatus::Idle);
    assert!(!handle.readiness().homed);
    assert_eq!(backend.calls().last(), Some(&Call::ClearEmergencyStop));

    let id = handle.submit(move_to(1.0, 1.0, 1.0)).await.unwrap();
    assert_eq!(wait_terminal(&handle, id).await.reason, Some(AckReason::NotHomed));
}

#[tokio::test]
async fn test_reset_refused_while_command_in_flight() {
    let backend = RecordingBackend::new();
    let handle = homed(&backend).await;
    backend.ignore_stop.store(true, Ordering::SeqCst);
    backend.move_delay_ms.store(300, Ordering::SeqCst);

    let moving = handle.submit(move_to(10.0, 10.0, 10.0)).await.unwrap();
    eventually(|| handle.system_status() == SystemStatus::Moving).await;
    handle.submit(CommandRequest::EmergencyStop).await.unwrap();
    eventually(|| handle.system_status() == SystemStatus::EmergencyStop).await;
    assert_eq!(handle.reset_emergency_stop().await, Err(ResetError::Busy));

    let ack = wait_terminal(&handle, moving).await;
    assert_eq!(ack.reason, Some(AckReason::StoppedInFlight));
    assert_eq!(handle.reset_emergency_stop().await, Ok(()));
}

#[tokio::test]
async fn test_watchdog_trips_when_telemetry_stops() {
    let backend = RecordingBackend::new();
    let mut config = test_config();
    config.safety.telemetry_deadline_ms = 100;
    config.safety.watchdog_interval_ms = 20;
    config.telemetry.interval_ms = 20;
    let (supervisor, handle) = Supervisor::new(backend.clone(), &config);
    tokio::spawn(supervisor.run());
    tokio::spawn(TelemetryPublisher::new(backend.clone(), handle.clone(), &config).run());
    tokio::spawn(Watchdog::new(handle.clone(), &config.safety).run());

    // healthy telemetry keeps the stage running
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(handle.system_status(), SystemStatus::Idle);

    backend.telemetry_down.store(true, Ordering::SeqCst);
    // deadline plus one watchdog tick, with slack for the scheduler
    let started = tokio::time::Instant::now();
    eventually(|| handle.system_status() == SystemStatus::EmergencyStop).await;
    assert!(started.elapsed() < Duration::from_millis(100 + 20 + 200));
    eventually(|| backend.count(|c| matches!(c, Call::EmergencyStop)) == 1).await;

    let id = handle.submit(CommandRequest::Home).await.unwrap();
    assert_eq!(wait_terminal(&handle, id).await.reason, Some(AckReason::EmergencyStopActive));
    handle.shutdown();
}

#[tokio::test]
async fn test_watchdog_trips_during_in_flight_move() {
    let backend = RecordingBackend::new();
    let mut config = test_config();
    config.safety.telemetry_deadline_ms = 100;
    config.safety.watchdog_interval_ms = 20;
    config.telemetry.interval_ms = 20;
    let (supervisor, handle) = Supervisor::new(backend.clone(), &config);
    tokio::spawn(supervisor.run());
    tokio::spawn(TelemetryPublisher::new(backend.clone(), handle.clone(), &config).run());
    tokio::spawn(Watchdog::new(handle.clone(), &config.safety).run());

    let id = handle.submit(CommandRequest::Home).await.unwrap();
    assert_eq!(wait_terminal(&handle, id).await.status, AckStatus::Ok);
    backend.move_delay_ms.store(2_000, Ordering::SeqCst);
    let in_flight = handle.submit(move_to(100.0, 100.0, 100.0)).await.unwrap();
    let queued = handle.submit(move_to(5.0, 5.0, 5.0)).await.unwrap();
    eventually(|| handle.system_status() == SystemStatus::Moving).await;

    backend.telemetry_down.store(true, Ordering::SeqCst);
    let started = tokio::time::Instant::now();
    eventually(|| handle.system_status() == SystemStatus::EmergencyStop).await;
    assert!(started.elapsed() < Duration::from_millis(100 + 20 + 200));

    let ack = wait_terminal(&handle, queued).await;
    assert_eq!(ack.reason, Some(AckReason::EmergencyStopActive));
    let ack = wait_terminal(&handle, in_flight).await;
    assert_eq!(ack.reason, Some(AckReason::StoppedInFlight));
    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert_eq!(backend.count(|c| matches!(c, Call::MoveTo(..))), 1);
    handle.shutdown();
}

#[tokio::test]
async fn test_submit_refusals() {
    let backend = RecordingBackend::new();
    let mut config = test_config();
    config.supervisor.queue_capacity = Some(1);
    // supervisor never runs, so the queue only fills
    let (_supervisor, handle) = Supervisor::new(backend, &config);

    let malformed = handle.submit(move_to(f64::NAN, 0.0, 0.0)).await;
    assert!(matches!(malformed, Err(SubmitError::Malformed(_))));

    handle.submit(CommandRequest::Home).await.unwrap();
    let full = handle.submit(CommandRequest::Capture).await;
    assert!(matches!(full, Err(SubmitError::Queue(QueueError::Full(1)))));

    let status = handle.queue_status().await;
    assert_eq!(status.queue_length, 1);
    assert_eq!(status.history_size, 1);
    assert!(handle.get_status(&stagehand_rs::CommandId::new()).await.is_none());
}
