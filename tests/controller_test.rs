//! Integration tests for the rail controller against the simulated link.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use vention_rail::link::MockLink;
use vention_rail::{
    DriveState, MotionRequest, RailConfig, RailController, RailError, RailEvent, RetryPolicy,
};

/// Controller over a shared mock link, with test-friendly timings.
fn sim_rail(span: f64) -> (Arc<RailController>, MockLink) {
    let mut config = RailConfig::new("sim://rail", 10.0, 5.0, span).unwrap();
    config.poll_interval_ms = 10;
    config.completion_timeout_ms = 2_000;
    let link = MockLink::new();
    let rail = Arc::new(RailController::new(config, Box::new(link.clone())));
    (rail, link)
}

#[tokio::test]
async fn full_scenario() {
    let (rail, _link) = sim_rail(500.0);

    rail.connect().await.unwrap();
    assert_eq!(rail.state(), DriveState::Ready);

    rail.move_to(100.0, None, None).await.unwrap();
    let position = rail.get_position().await.unwrap();
    assert!((position - 100.0).abs() <= 1.0);

    assert!(matches!(
        rail.move_to(600.0, None, None).await,
        Err(RailError::OutOfRange { .. })
    ));

    rail.estop().await.unwrap();
    assert!(matches!(
        rail.move_to(50.0, None, None).await,
        Err(RailError::Estopped)
    ));

    rail.release_estop().await.unwrap();
    rail.home().await.unwrap();
    let position = rail.get_position().await.unwrap();
    assert!(position.abs() <= 1.0);

    rail.disconnect().await;
    assert_eq!(rail.state(), DriveState::Disconnected);
}

#[tokio::test]
async fn in_span_moves_settle_within_tolerance() {
    let (rail, _link) = sim_rail(500.0);
    rail.connect().await.unwrap();

    for target in [0.0, 1.0, 250.0, 499.5, 500.0] {
        rail.move_to(target, None, None).await.unwrap();
        let position = rail.get_position().await.unwrap();
        assert!(
            (position - target).abs() <= 1.0,
            "target {} settled at {}",
            target,
            position
        );
    }
}

#[tokio::test]
async fn out_of_span_move_never_reaches_the_adapter() {
    let (rail, link) = sim_rail(500.0);
    rail.connect().await.unwrap();

    assert!(rail.move_to(600.0, None, None).await.is_err());
    assert!(rail.move_to(-1.0, None, None).await.is_err());
    assert_eq!(link.calls_matching("move_absolute"), 0);
}

#[tokio::test]
async fn lone_rate_override_is_rejected_before_any_motion() {
    let (rail, link) = sim_rail(500.0);
    rail.connect().await.unwrap();

    assert!(matches!(
        rail.move_to(100.0, Some(20.0), None).await,
        Err(RailError::Config(_))
    ));
    assert!(matches!(
        rail.move_relative(10.0, None, Some(10.0)).await,
        Err(RailError::Config(_))
    ));
    assert_eq!(link.calls_matching("move_absolute"), 0);
    assert_eq!(link.calls_matching("move_relative"), 0);
}

#[tokio::test]
async fn estop_blocks_motion_until_released() {
    let (rail, _link) = sim_rail(500.0);
    rail.connect().await.unwrap();

    rail.estop().await.unwrap();
    assert!(rail.is_estopped());
    assert!(matches!(
        rail.move_to(50.0, None, None).await,
        Err(RailError::Estopped)
    ));
    assert!(matches!(
        rail.move_relative(10.0, None, None).await,
        Err(RailError::Estopped)
    ));
    assert!(matches!(rail.home().await, Err(RailError::Estopped)));

    // Stop stays available as a recovery operation
    rail.stop().await.unwrap();

    rail.release_estop().await.unwrap();
    assert!(!rail.is_estopped());
    rail.move_to(50.0, None, None).await.unwrap();
}

#[tokio::test]
async fn estop_interrupts_an_in_flight_wait() {
    let (rail, link) = sim_rail(500.0);
    rail.connect().await.unwrap();
    link.hold_motion(true);

    let mover = {
        let rail = Arc::clone(&rail);
        tokio::spawn(async move { rail.move_to(400.0, None, None).await })
    };

    // Let the move reach its completion wait, then estop from this task
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rail.state(), DriveState::Moving);
    rail.estop().await.unwrap();

    let result = timeout(Duration::from_secs(1), mover)
        .await
        .expect("estop did not interrupt the wait in time")
        .unwrap();
    assert!(matches!(result, Err(RailError::Estopped)));
    assert_eq!(rail.state(), DriveState::Ready);
    assert!(rail.is_estopped());
}

#[tokio::test]
async fn concurrent_motion_is_rejected_not_queued() {
    let (rail, link) = sim_rail(500.0);
    rail.connect().await.unwrap();
    link.hold_motion(true);

    let mover = {
        let rail = Arc::clone(&rail);
        tokio::spawn(async move { rail.move_to(400.0, None, None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(
        rail.move_to(100.0, None, None).await,
        Err(RailError::InvalidState(_))
    ));
    assert!(matches!(
        rail.configure(20.0, 10.0).await,
        Err(RailError::InvalidState(_))
    ));

    rail.estop().await.unwrap();
    let _ = timeout(Duration::from_secs(1), mover).await.unwrap();
}

#[tokio::test]
async fn stop_returns_to_ready_from_ready_and_moving() {
    let (rail, link) = sim_rail(500.0);
    rail.connect().await.unwrap();

    // From Ready
    rail.stop().await.unwrap();
    assert_eq!(rail.state(), DriveState::Ready);

    // From Moving: the held move is cut short and reports a motion fault
    link.hold_motion(true);
    let mover = {
        let rail = Arc::clone(&rail);
        tokio::spawn(async move { rail.move_to(400.0, None, None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rail.state(), DriveState::Moving);

    rail.stop().await.unwrap();
    let result = timeout(Duration::from_secs(1), mover).await.unwrap().unwrap();
    assert!(matches!(result, Err(RailError::MotionFault(_))));
    assert_eq!(rail.state(), DriveState::Ready);
}

#[tokio::test]
async fn relative_round_trip_returns_to_start() {
    let (rail, _link) = sim_rail(500.0);
    rail.connect().await.unwrap();
    rail.move_to(100.0, None, None).await.unwrap();

    let out = rail.move_relative(30.0, None, None).await.unwrap();
    // Default scale factor doubles the requested distance
    assert!((out - 160.0).abs() <= 1.0);

    let back = rail.move_relative(-30.0, None, None).await.unwrap();
    assert!((back - 100.0).abs() <= 1.0);
}

#[tokio::test]
async fn relative_scale_is_configurable() {
    let mut config = RailConfig::new("sim://rail", 10.0, 5.0, 500.0).unwrap();
    config.poll_interval_ms = 10;
    config.relative_move_scale = 1.0;
    let link = MockLink::new();
    let rail = RailController::new(config, Box::new(link.clone()));

    rail.connect().await.unwrap();
    let out = rail.move_relative(30.0, None, None).await.unwrap();
    assert!((out - 30.0).abs() <= 1.0);
}

#[tokio::test]
async fn disconnect_is_always_safe() {
    let (rail, link) = sim_rail(500.0);

    // Without a prior connect
    rail.disconnect().await;
    assert_eq!(rail.state(), DriveState::Disconnected);

    // After a failed connect
    link.fail_next_connects(1);
    assert!(matches!(
        rail.connect().await,
        Err(RailError::Connect { .. })
    ));
    rail.disconnect().await;
    assert_eq!(rail.state(), DriveState::Disconnected);

    // Twice in a row after a successful session
    rail.connect().await.unwrap();
    rail.disconnect().await;
    rail.disconnect().await;
    assert_eq!(rail.state(), DriveState::Disconnected);
}

#[tokio::test]
async fn operations_require_a_connection() {
    let (rail, _link) = sim_rail(500.0);

    assert!(matches!(
        rail.move_to(100.0, None, None).await,
        Err(RailError::InvalidState(_))
    ));
    assert!(matches!(rail.home().await, Err(RailError::InvalidState(_))));
    assert!(matches!(rail.stop().await, Err(RailError::InvalidState(_))));
    assert!(matches!(rail.estop().await, Err(RailError::InvalidState(_))));
    assert!(matches!(
        rail.get_position().await,
        Err(RailError::Read(_))
    ));
}

#[tokio::test]
async fn position_read_failures_are_surfaced_not_masked() {
    let (rail, link) = sim_rail(500.0);
    rail.connect().await.unwrap();
    rail.move_to(100.0, None, None).await.unwrap();
    assert_eq!(rail.last_known_position(), Some(100.0));

    link.inject_next_failure();
    assert!(matches!(
        rail.get_position().await,
        Err(RailError::Read(_))
    ));
    // The cache keeps the last good value but is never substituted for a
    // failed read
    assert_eq!(rail.last_known_position(), Some(100.0));
}

#[tokio::test]
async fn connect_applies_default_rates_and_overrides_update_them() {
    let (rail, link) = sim_rail(500.0);
    rail.connect().await.unwrap();
    assert_eq!(link.rates(), (10.0, 5.0));
    assert_eq!(rail.current_rates(), (10.0, 5.0));

    rail.move_to(100.0, Some(20.0), Some(15.0)).await.unwrap();
    assert_eq!(link.rates(), (20.0, 15.0));

    // Out-of-bounds overrides are rejected before reaching the adapter
    assert!(matches!(
        rail.move_to(100.0, Some(150.0), Some(15.0)).await,
        Err(RailError::Config(_))
    ));
    assert_eq!(link.rates(), (20.0, 15.0));
}

#[tokio::test]
async fn homing_uses_conservative_rates_and_restores_them() {
    let mut config = RailConfig::new("sim://rail", 50.0, 25.0, 500.0).unwrap();
    config.poll_interval_ms = 10;
    let link = MockLink::new();
    let rail = RailController::new(config, Box::new(link.clone()));

    rail.connect().await.unwrap();
    link.set_position(321.0);

    rail.home().await.unwrap();
    assert!(rail.get_position().await.unwrap().abs() <= 1.0);
    // Travel rates are restored after homing
    assert_eq!(link.rates(), (50.0, 25.0));
    assert_eq!(rail.current_rates(), (50.0, 25.0));
}

#[tokio::test]
async fn reconnect_retries_within_the_policy() {
    let (rail, link) = sim_rail(500.0);
    rail.connect().await.unwrap();

    // Teardown plus two failing attempts, the third succeeds
    link.fail_next_connects(2);
    let policy = RetryPolicy {
        max_attempts: 3,
        backoff_delay: Duration::from_millis(10),
    };
    rail.reconnect(&policy).await.unwrap();
    assert_eq!(rail.state(), DriveState::Ready);

    // A policy that allows fewer attempts than needed surfaces the failure
    link.fail_next_connects(2);
    let policy = RetryPolicy {
        max_attempts: 1,
        backoff_delay: Duration::from_millis(10),
    };
    assert!(matches!(
        rail.reconnect(&policy).await,
        Err(RailError::Connect { .. })
    ));
    assert_eq!(rail.state(), DriveState::Disconnected);
}

#[tokio::test]
async fn motion_requests_dispatch_to_the_right_operation() {
    let (rail, _link) = sim_rail(500.0);
    rail.connect().await.unwrap();

    let settled = rail
        .execute(MotionRequest::absolute(200.0).with_rates(20.0, 10.0))
        .await
        .unwrap();
    assert!((settled - 200.0).abs() <= 1.0);

    let settled = rail.execute(MotionRequest::relative(-50.0)).await.unwrap();
    assert!((settled - 100.0).abs() <= 1.0);
}

#[tokio::test]
async fn events_are_published_for_subscribers() {
    let (rail, _link) = sim_rail(500.0);
    let mut events = rail.subscribe();

    rail.connect().await.unwrap();
    rail.move_to(100.0, None, None).await.unwrap();
    rail.estop().await.unwrap();

    assert_eq!(
        events.recv().await.unwrap(),
        RailEvent::Connected {
            address: "sim://rail".into()
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        RailEvent::MotionStarted { target: 100.0 }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        RailEvent::MotionComplete { position: 100.0 }
    );
    assert_eq!(events.recv().await.unwrap(), RailEvent::EstopEngaged);
}

#[tokio::test]
async fn completion_timeout_bounds_the_wait() {
    let mut config = RailConfig::new("sim://rail", 10.0, 5.0, 500.0).unwrap();
    config.poll_interval_ms = 10;
    config.completion_timeout_ms = 50;
    let link = MockLink::new();
    let rail = RailController::new(config, Box::new(link.clone()));

    rail.connect().await.unwrap();
    link.hold_motion(true);

    let result = timeout(Duration::from_secs(2), rail.move_to(400.0, None, None))
        .await
        .expect("wait was not bounded by the completion timeout");
    assert!(matches!(result, Err(RailError::CompletionTimeout(_))));
    assert_eq!(rail.state(), DriveState::Ready);
}
