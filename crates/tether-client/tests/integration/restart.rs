//! Restart controller behavior: budgets, backoff, faulting, idempotency.

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;

use crate::support::MockLauncher;
use tether_client::{
    AgentClient, ClientError, ConnectionState, RestartPolicy, RetryLimit,
};

fn strict_policy() -> RestartPolicy {
    RestartPolicy {
        max_restarts_per_window: 3,
        window: Duration::from_secs(60),
        initial_backoff: Duration::from_millis(250),
        max_backoff: Duration::from_secs(10),
        jitter: 0.0,
        max_consecutive_failures: 3,
    }
}

/// Induce one agent death through the public API. The dying call itself
/// surfaces a disconnect (default policy: no retry), and by the time it
/// returns, the auto-restart has completed.
async fn kill_agent(client: &AgentClient) -> ClientError {
    client.call("die", json!({})).await.unwrap_err()
}

#[tokio::test(start_paused = true)]
async fn test_slot_reconnects_after_each_death() {
    crate::init_tracing();
    let launcher = MockLauncher::new();
    let launches = launcher.counters();
    let client = AgentClient::builder(launcher)
        .restart_policy(RestartPolicy {
            max_restarts_per_window: 10,
            ..strict_policy()
        })
        .build();

    assert_eq!(client.state(), ConnectionState::Restarting);
    assert_eq!(client.connection_version(), 0);

    client.call("ping", json!({})).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.connection_version(), 1);

    for death in 1..=3u64 {
        let err = kill_agent(&client).await;
        assert!(err.is_disconnect() , "death {} surfaced {:?}", death, err);

        client.call("ping", json!({})).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.connection_version(), death + 1);
        assert_eq!(client.restart_count(), death);
    }
    assert_eq!(launches.load(Ordering::SeqCst), 4);
    client.dispose().await;
}

#[tokio::test]
async fn test_in_flight_call_resolves_on_connection_close() {
    let client = AgentClient::new(MockLauncher::new());
    // The agent exits without answering; the pending call must not hang.
    let err = kill_agent(&client).await;
    assert!(err.is_disconnect());
    client.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_disconnects_collapse_into_one_restart() {
    let launcher = MockLauncher::new();
    let launches = launcher.counters();
    let client = AgentClient::new(launcher);
    client.call("ping", json!({})).await.unwrap();
    assert_eq!(launches.load(Ordering::SeqCst), 1);

    // Two calls in flight against version 1 when the agent dies: both
    // detect the disconnect and both trigger a restart with the same
    // expected version.
    let a = {
        let client = client.clone();
        tokio::spawn(async move { client.call("slow", json!({"delay_ms": 60_000})).await })
    };
    let b = {
        let client = client.clone();
        tokio::spawn(async move { client.call("slow", json!({"delay_ms": 60_000})).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.notify("die", json!({})).await.unwrap();

    assert!(a.await.unwrap().unwrap_err().is_disconnect());
    assert!(b.await.unwrap().unwrap_err().is_disconnect());

    // Exactly one underlying recreation despite three detections (two
    // callers plus the exit watcher).
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(launches.load(Ordering::SeqCst), 2);
    assert_eq!(client.connection_version(), 2);
    assert_eq!(client.restart_count(), 1);
    client.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_force_restart_replaces_a_healthy_connection() {
    let launcher = MockLauncher::new();
    let launches = launcher.counters();
    let client = AgentClient::new(launcher);
    client.call("ping", json!({})).await.unwrap();

    client.force_restart().await.unwrap();
    assert_eq!(client.connection_version(), 2);
    assert_eq!(client.restart_count(), 1);
    assert_eq!(launches.load(Ordering::SeqCst), 2);
    client.call("ping", json!({})).await.unwrap();
    client.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_rate_limit_and_backoff_schedule() {
    let launcher = MockLauncher::new();
    let launches = launcher.counters();
    let client = AgentClient::builder(launcher)
        .restart_policy(RestartPolicy {
            max_consecutive_failures: 5,
            ..strict_policy()
        })
        .build();
    client.call("ping", json!({})).await.unwrap();

    // Deaths 1-3: restarts succeed with delays 0ms, 250ms, 500ms.
    let expected = [Duration::ZERO, Duration::from_millis(250), Duration::from_millis(500)];
    for (death, floor) in expected.iter().enumerate() {
        let before = tokio::time::Instant::now();
        kill_agent(&client).await;
        let elapsed = before.elapsed();
        assert!(
            elapsed >= *floor,
            "death {}: restarted after {:?}, expected at least {:?}",
            death + 1,
            elapsed,
            floor
        );
        assert!(elapsed < *floor + Duration::from_millis(200));
        client.call("ping", json!({})).await.unwrap();
    }
    assert_eq!(client.restart_count(), 3);
    assert_eq!(launches.load(Ordering::SeqCst), 4);

    // Death 4: the window budget is spent; the slot faults without
    // attempting another connection.
    let err = kill_agent(&client).await;
    assert!(matches!(err, ClientError::Unavailable(_)));
    assert_eq!(client.state(), ConnectionState::Faulted);
    assert_eq!(launches.load(Ordering::SeqCst), 4);

    let err = client.call("ping", json!({})).await.unwrap_err();
    assert!(matches!(err, ClientError::Unavailable(_)));
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_launch_failures_fault_the_slot() {
    let launcher = MockLauncher::new();
    let launches = launcher.counters();
    launcher.fail_next(100);
    let client = AgentClient::builder(launcher)
        .restart_policy(strict_policy())
        .build();

    // Every waiter blocked on the faulting creation observes Unavailable.
    let racing = {
        let client = client.clone();
        tokio::spawn(async move { client.call("ping", json!({})).await })
    };
    let err = client.call("ping", json!({})).await.unwrap_err();
    assert!(matches!(err, ClientError::Unavailable(_)));
    let err = racing.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Unavailable(_)));

    assert_eq!(client.state(), ConnectionState::Faulted);
    assert_eq!(launches.load(Ordering::SeqCst), 0);
    assert_eq!(client.restart_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_policy_recovers_one_disconnect() {
    let launcher = MockLauncher::new();
    let launches = launcher.counters();
    launcher.set_flaky_calls(1);
    let client = AgentClient::builder(launcher)
        .retry_policy(RetryLimit::new(1).with_delay(Duration::from_millis(100)))
        .build();

    let before = tokio::time::Instant::now();
    let result = client.call("flaky", json!({})).await.unwrap();
    assert_eq!(result, json!("recovered"));

    // One death, one restart, one retry delay.
    assert!(before.elapsed() >= Duration::from_millis(100));
    assert_eq!(client.restart_count(), 1);
    assert_eq!(launches.load(Ordering::SeqCst), 2);
    client.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_policy_gives_up_after_budget() {
    let launcher = MockLauncher::new();
    launcher.set_flaky_calls(10);
    let client = AgentClient::builder(launcher)
        .retry_policy(RetryLimit::new(2))
        .restart_policy(RestartPolicy {
            max_restarts_per_window: 10,
            ..strict_policy()
        })
        .build();

    let err = client.call("flaky", json!({})).await.unwrap_err();
    assert!(err.is_disconnect());
    client.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_auto_restart_disabled_leaves_connection_dead() {
    let launcher = MockLauncher::new();
    let launches = launcher.counters();
    let client = AgentClient::builder(launcher).auto_restart(false).build();

    let err = kill_agent(&client).await;
    assert!(err.is_disconnect());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // No proactive restart, and the next operation still fails.
    assert_eq!(launches.load(Ordering::SeqCst), 1);
    let err = client.call("ping", json!({})).await.unwrap_err();
    assert!(err.is_disconnect());

    // Manual restart is the way out.
    client.force_restart().await.unwrap();
    client.call("ping", json!({})).await.unwrap();
    assert_eq!(launches.load(Ordering::SeqCst), 2);
    client.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_callback_and_event_details() {
    let seen: std::sync::Arc<parking_lot::Mutex<Vec<u64>>> = Default::default();
    let launcher = MockLauncher::new();
    let client = {
        let seen = std::sync::Arc::clone(&seen);
        AgentClient::builder(launcher)
            .on_restart(move |event| seen.lock().push(event.restarts))
            .build()
    };

    client.call("ping", json!({})).await.unwrap();
    kill_agent(&client).await;
    client.call("ping", json!({})).await.unwrap();

    assert_eq!(*seen.lock(), vec![1]);
    let event = client.last_restart().unwrap();
    assert_eq!(event.restarts, 1);
    assert!(!event.stderr_tail.is_empty());
    client.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_protocol_violation_triggers_restart() {
    let client = AgentClient::new(MockLauncher::new());
    client.call("ping", json!({})).await.unwrap();

    // The garbage frame kills the connection; the call that asked for it
    // never gets an answer and resolves with the close failure.
    let err = client.call("garbage", json!({})).await.unwrap_err();
    assert!(err.is_disconnect(), "got {:?}", err);

    client.call("ping", json!({})).await.unwrap();
    assert_eq!(client.restart_count(), 1);
    client.dispose().await;
}
