//! Tests for graceful shutdown coordination.

use rpcx_core::shutdown::{ShutdownCoordinator, ShutdownResult, ShutdownState};
use std::time::Duration;
use tokio_test::{assert_pending, assert_ready_eq};

#[tokio::test]
async fn test_initial_state_is_running() {
    let coordinator = ShutdownCoordinator::new();
    assert_eq!(coordinator.state(), ShutdownState::Running);
    assert!(coordinator.is_accepting());
    assert!(!coordinator.token().is_cancelled());
}

#[tokio::test]
async fn test_multiple_guards_track_correctly() {
    let coordinator = ShutdownCoordinator::new();

    let g1 = coordinator.track();
    let g2 = coordinator.track();
    let g3 = coordinator.track();
    assert_eq!(coordinator.in_flight_count(), 3);

    drop(g1);
    assert_eq!(coordinator.in_flight_count(), 2);

    drop(g2);
    drop(g3);
    assert_eq!(coordinator.in_flight_count(), 0);
}

#[tokio::test]
async fn test_initiate_stays_pending_until_last_guard_drops() {
    let coordinator = ShutdownCoordinator::new();
    let first = coordinator.track().unwrap();
    let second = coordinator.track().unwrap();

    let mut drain = tokio_test::task::spawn(coordinator.initiate(Duration::from_secs(60)));
    assert_pending!(drain.poll());
    assert_eq!(coordinator.state(), ShutdownState::Draining);
    assert!(coordinator.token().is_cancelled());
    assert!(coordinator.track().is_none());

    drop(first);
    assert!(drain.is_woken());
    assert_pending!(drain.poll());

    drop(second);
    assert_ready_eq!(drain.poll(), ShutdownResult::Complete);
    assert_eq!(coordinator.state(), ShutdownState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reports_remaining_calls() {
    let coordinator = ShutdownCoordinator::new();
    let _stuck = coordinator.track();

    let result = coordinator.initiate(Duration::from_secs(30)).await;
    assert_eq!(result, ShutdownResult::Timeout { remaining: 1 });
    assert_eq!(coordinator.state(), ShutdownState::Stopped);
}

#[tokio::test]
async fn test_clones_share_state() {
    let coordinator = ShutdownCoordinator::new();
    let clone = coordinator.clone();
    let guard = clone.track();
    assert_eq!(coordinator.in_flight_count(), 1);

    let drain = tokio::spawn(async move { clone.initiate(Duration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!coordinator.is_accepting());

    drop(guard);
    assert_eq!(drain.await.unwrap(), ShutdownResult::Complete);
}
