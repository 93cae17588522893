//! Integration tests for StateManager with state change events
//!
//! These tests verify that the StateManager correctly:
//! - Emits state change events on mutations
//! - Supports multiple subscribers
//! - Handles concurrent access from multiple tasks
//! - Reports a full operation run by `ModManager` in order

mod common;

use common::GameFixture;
use nioh3_modmanager::models::{ManagerSettings, OperationKind, Selection};
use nioh3_modmanager::{StateChange, StateManager};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast::Receiver;
use tokio::time::{Duration, timeout};

fn drain(rx: &mut Receiver<StateChange>) -> Vec<StateChange> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_operation_started_event_emitted() {
    let state = Arc::new(StateManager::new());
    let mut rx = state.subscribe();

    state.begin_operation(OperationKind::Install, "Armor.zip");

    let event = timeout(Duration::from_millis(100), rx.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Channel closed");

    assert_eq!(
        event,
        StateChange::OperationStarted {
            operation: OperationKind::Install
        }
    );
}

#[tokio::test]
async fn test_multiple_subscribers_receive_events() {
    let state = Arc::new(StateManager::new());
    let mut receivers = vec![state.subscribe(), state.subscribe(), state.subscribe()];

    state.set_install_counts(2, 1);

    for rx in &mut receivers {
        let event = timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("Timeout")
            .expect("Channel closed");
        assert_eq!(event, StateChange::InstallCountsChanged { yumia: 2, loose: 1 });
    }
}

#[tokio::test]
async fn test_configuration_change_detection() {
    let state = Arc::new(StateManager::new());
    let mut rx = state.subscribe();

    state.set_paths(Some("/downloads".into()), None);
    let event = rx.recv().await.unwrap();
    assert_eq!(
        event,
        StateChange::ConfigurationChanged {
            is_fully_configured: false
        }
    );

    state.set_paths(Some("/downloads".into()), Some("/games/Nioh3/package".into()));
    let event = rx.recv().await.unwrap();
    assert_eq!(
        event,
        StateChange::ConfigurationChanged {
            is_fully_configured: true
        }
    );
}

#[tokio::test]
async fn test_progress_only_reported_while_busy() {
    let state = Arc::new(StateManager::new());
    let mut rx = state.subscribe();

    // Idle: counters move but nobody is told.
    state.advance("stray");
    assert!(drain(&mut rx).is_empty());

    state.begin_operation(OperationKind::Migrate, "yumia -> loose");
    state.set_total_steps(3);
    drain(&mut rx);

    state.advance("planned Armor.zip");
    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![StateChange::ProgressUpdated {
            current: 1,
            total: 3,
            detail: "planned Armor.zip".to_string()
        }]
    );
    assert_eq!(state.snapshot().progress_summary(), "migrate: 1/3 planned Armor.zip");
}

#[tokio::test]
async fn test_failed_operation_reports_error() {
    let state = Arc::new(StateManager::new());
    state.begin_operation(OperationKind::Uninstall, "Armor.zip");
    let mut rx = state.subscribe();

    state.finish_operation(Some("root.rdb.original is missing".to_string()));

    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![StateChange::OperationFinished {
            operation: OperationKind::Uninstall,
            success: false
        }]
    );
    let snapshot = state.snapshot();
    assert!(!snapshot.is_busy);
    assert!(snapshot.current_operation.is_none());
    assert_eq!(snapshot.last_error.as_deref(), Some("root.rdb.original is missing"));
}

#[tokio::test]
async fn test_cancel_only_while_busy() {
    let state = Arc::new(StateManager::new());
    let mut rx = state.subscribe();

    state.request_cancel();
    assert!(!state.is_cancel_requested());

    state.begin_operation(OperationKind::Install, "Armor.zip");
    drain(&mut rx);
    state.request_cancel();
    assert!(state.is_cancel_requested());
    assert_eq!(drain(&mut rx), vec![StateChange::CancelRequested]);

    // Finishing clears the flag for the next operation.
    state.finish_operation(Some("operation cancelled".to_string()));
    assert!(!state.is_cancel_requested());
}

#[tokio::test]
async fn test_drift_event_lists_broken_mods() {
    let state = Arc::new(StateManager::new());
    let mut rx = state.subscribe();

    state.set_broken_mods(BTreeSet::from(["Hair.zip".to_string()]));
    assert_eq!(
        drain(&mut rx),
        vec![StateChange::DriftDetected {
            broken: vec!["Hair.zip".to_string()]
        }]
    );

    // Clearing the set is not drift.
    state.set_broken_mods(BTreeSet::new());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_settings_load_emits_configuration_and_settings_events() {
    let state = Arc::new(StateManager::new());
    let mut rx = state.subscribe();

    let settings = ManagerSettings {
        mods_dir: Some("/downloads".into()),
        game_package_dir: Some("/games/Nioh3/package".into()),
        patcher_timeout_secs: 30,
        mock_patcher: true,
        ..Default::default()
    };
    let changes = state.load_from_settings(&settings);

    assert!(changes.contains(&StateChange::ConfigurationChanged {
        is_fully_configured: true
    }));
    assert!(changes.contains(&StateChange::SettingsChanged));
    assert_eq!(drain(&mut rx).len(), changes.len());
    assert_eq!(state.read(|s| s.patcher_timeout), Duration::from_secs(30));
}

#[tokio::test]
async fn test_reset_keeps_counts() {
    let state = Arc::new(StateManager::new());
    state.set_install_counts(1, 0);
    state.begin_operation(OperationKind::Install, "Armor.zip");

    let changes = state.reset_operation_state();
    assert_eq!(changes.last(), Some(&StateChange::StateReset));
    let snapshot = state.snapshot();
    assert!(!snapshot.is_busy);
    assert_eq!(snapshot.yumia_installed, 1);
}

#[tokio::test]
async fn test_concurrent_state_access() {
    let state = Arc::new(StateManager::new());
    state.begin_operation(OperationKind::Migrate, "");

    let mut handles = vec![];
    for i in 0..10 {
        let state_clone = state.clone();
        handles.push(tokio::spawn(async move {
            state_clone.advance(format!("step {i}"));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Every increment lands regardless of interleaving.
    assert_eq!(state.read(|s| s.progress), 10);
}

#[tokio::test]
async fn test_install_run_reports_start_progress_and_finish() {
    let game = GameFixture::new().with_loose_loader();
    let manager = game.manager();
    let archive = game.zip("Hair.zip", &[("0x0000ABCD.g1t", b"hair".to_vec())]);
    let mut rx = manager.state_manager().subscribe();

    manager
        .install(&archive, &Selection::variant("(default)"))
        .await
        .unwrap();

    let events = drain(&mut rx);
    let position = |wanted: &StateChange| events.iter().position(|e| e == wanted);

    let started = position(&StateChange::OperationStarted {
        operation: OperationKind::Install,
    })
    .expect("OperationStarted");
    let finished = position(&StateChange::OperationFinished {
        operation: OperationKind::Install,
        success: true,
    })
    .expect("OperationFinished");
    let counts = position(&StateChange::InstallCountsChanged { yumia: 0, loose: 1 })
        .expect("InstallCountsChanged");

    assert!(started < finished && finished < counts);
    assert!(events[started..finished].iter().any(|e| matches!(
        e,
        StateChange::ProgressUpdated { detail, .. } if detail == "mods/Hair/0x0000ABCD.g1t"
    )));
    assert!(!manager.is_busy());
}
