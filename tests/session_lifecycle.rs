//! Session controller tests
//!
//! Start/stop transitions, conflict handling, duration expiry and the
//! settings that apply to the next session.

use std::time::Duration;

use loadsim::models::SettingsRequest;
use loadsim::{
    ControlError, DrainPolicy, DynamicLoadState, EngineConfig, LoadController, LoadSettings,
};

fn controller(drain: DrainPolicy) -> LoadController {
    LoadController::new(
        cpu_only(10, 0),
        DynamicLoadState::default(),
        EngineConfig {
            cpu_workers: 1,
            drain,
            ..EngineConfig::default()
        },
    )
}

fn cpu_only(cpu_load_percent: u8, duration_sec: u64) -> LoadSettings {
    LoadSettings {
        cpu_load_percent,
        memory_mb: 0,
        duration_sec,
        ..LoadSettings::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn start_caps_cpu_and_stop_zeroes_status() {
    let ctrl = controller(DrainPolicy::Wait);
    ctrl.start(cpu_only(95, 0)).await.unwrap();

    let status = ctrl.snapshot();
    assert!(status.running);
    assert_eq!(status.cpu_load_percent, 80);
    assert!(ctrl.store().is_busy());

    ctrl.stop().await.unwrap();
    let status = ctrl.snapshot();
    assert!(!status.running);
    assert_eq!(status.cpu_load_percent, 0);
    assert_eq!(status.memory_mb, 0);
    assert!(!ctrl.store().is_busy());
    assert_eq!(ctrl.state().session, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_start_is_rejected_without_side_effects() {
    let ctrl = controller(DrainPolicy::Wait);
    let first = ctrl.start(cpu_only(30, 0)).await.unwrap();
    let before = ctrl.state();

    let err = ctrl.start(cpu_only(60, 0)).await.unwrap_err();
    assert_eq!(err, ControlError::AlreadyRunning);
    assert_eq!(ctrl.state(), before);
    assert_eq!(ctrl.state().session, Some(first));

    ctrl.stop().await.unwrap();
}

#[tokio::test]
async fn stop_while_idle_is_rejected() {
    let ctrl = controller(DrainPolicy::Wait);
    assert_eq!(ctrl.stop().await, Err(ControlError::NotRunning));
    assert!(!ctrl.snapshot().running);
}

#[tokio::test(flavor = "multi_thread")]
async fn duration_expiry_stops_session() {
    let ctrl = controller(DrainPolicy::Wait);
    ctrl.start(cpu_only(90, 1)).await.unwrap();
    assert_eq!(ctrl.snapshot().cpu_load_percent, 80);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = ctrl.snapshot();
    assert!(!status.running);
    assert_eq!(status.cpu_load_percent, 0);
    assert_eq!(ctrl.stop().await, Err(ControlError::NotRunning));
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_expiry_does_not_stop_replacement_session() {
    let ctrl = controller(DrainPolicy::Wait);
    ctrl.start(cpu_only(10, 1)).await.unwrap();
    ctrl.stop().await.unwrap();
    let replacement = ctrl.start(cpu_only(20, 0)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert!(ctrl.snapshot().running);
    assert_eq!(ctrl.state().session, Some(replacement));
    ctrl.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn settings_apply_to_next_start_only() {
    let ctrl = controller(DrainPolicy::Wait);
    ctrl.start_configured().await.unwrap();
    assert_eq!(ctrl.snapshot().cpu_load_percent, 10);

    let request: SettingsRequest = serde_json::from_str(
        r#"{"cpu_load_percent": 40, "memory_mb": 0, "crash_after_time_ms": 750}"#,
    )
    .unwrap();
    let applied = ctrl.apply_settings(&request);
    assert_eq!(applied.cpu_load_percent, 40);
    assert_eq!(applied.shutdown_after_ms, 10000);

    // The live session keeps its targets and delays.
    let status = ctrl.snapshot();
    assert_eq!(status.cpu_load_percent, 10);
    assert_eq!(status.crash_after_ms, 5000);

    ctrl.stop().await.unwrap();
    assert_eq!(ctrl.snapshot().crash_after_ms, 5000);
    ctrl.start_configured().await.unwrap();
    let status = ctrl.snapshot();
    assert_eq!(status.cpu_load_percent, 40);
    assert_eq!(status.crash_after_ms, 750);
    ctrl.halt().await;
    assert!(!ctrl.snapshot().running);
}

#[tokio::test]
async fn idle_reconfigure_updates_reported_delays() {
    let ctrl = controller(DrainPolicy::Wait);
    ctrl.reconfigure(LoadSettings {
        crash_after_ms: 1,
        shutdown_after_ms: 2,
        ..LoadSettings::default()
    });
    let status = ctrl.snapshot();
    assert_eq!(status.crash_after_ms, 1);
    assert_eq!(status.shutdown_after_ms, 2);
    assert!(!status.running);
}

#[tokio::test(flavor = "multi_thread")]
async fn fire_and_forget_stop_returns_idle() {
    let ctrl = controller(DrainPolicy::FireAndForget);
    ctrl.start(cpu_only(50, 0)).await.unwrap();
    ctrl.stop().await.unwrap();
    assert!(!ctrl.snapshot().running);
    assert!(!ctrl.store().is_busy());

    ctrl.start(cpu_only(20, 0)).await.unwrap();
    assert_eq!(ctrl.snapshot().cpu_load_percent, 20);
    ctrl.stop().await.unwrap();
}

#[tokio::test]
async fn zero_targets_still_count_as_running() {
    let ctrl = controller(DrainPolicy::Wait);
    ctrl.start(cpu_only(0, 0)).await.unwrap();
    let status = ctrl.snapshot();
    assert!(status.running);
    assert_eq!(status.cpu_load_percent, 0);
    assert!(!ctrl.store().is_busy());
    ctrl.stop().await.unwrap();
}
