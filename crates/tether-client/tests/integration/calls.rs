//! Call semantics: correlation, application errors, server-initiated
//! requests, timeouts.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::support::MockLauncher;
use tether_client::{AgentClient, ClientError, ServerRequestHandler};
use tether_protocol::{RpcError, METHOD_NOT_FOUND};

#[tokio::test]
async fn test_call_round_trip() {
    let client = AgentClient::new(MockLauncher::new());
    let result = client.call("ping", json!({})).await.unwrap();
    assert_eq!(result, json!("pong"));
    client.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_match_by_id_not_arrival_order() {
    let client = AgentClient::new(MockLauncher::new());

    // The slow call's response arrives long after the fast one's.
    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.call("slow", json!({"delay_ms": 500})).await })
    };
    // Give the slow request a head start onto the wire.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fast = client.call("echo", json!({"tag": "fast"})).await.unwrap();

    assert_eq!(fast["tag"], "fast");
    assert_eq!(slow.await.unwrap().unwrap(), json!("slept"));
    client.dispose().await;
}

#[tokio::test]
async fn test_application_error_propagates_without_restart() {
    let launcher = MockLauncher::new();
    let launches = launcher.counters();
    let client = AgentClient::new(launcher);

    let err = client.call("fail", json!({})).await.unwrap_err();
    match err {
        ClientError::Rpc(e) => assert_eq!(e.code, -32000),
        other => panic!("expected application error, got {:?}", other),
    }

    // Still the same connection: application errors are the agent
    // speaking, not a transport problem.
    assert_eq!(client.restart_count(), 0);
    assert_eq!(launches.load(std::sync::atomic::Ordering::SeqCst), 1);
    let pong = client.call("ping", json!({})).await.unwrap();
    assert_eq!(pong, json!("pong"));
    client.dispose().await;
}

#[tokio::test]
async fn test_call_typed_deserializes_result() {
    #[derive(serde::Deserialize)]
    struct Echoed {
        tag: String,
    }

    let client = AgentClient::new(MockLauncher::new());
    let echoed: Echoed = client
        .call_typed("echo", json!({"tag": "typed"}))
        .await
        .unwrap();
    assert_eq!(echoed.tag, "typed");
    client.dispose().await;
}

struct ApproveEverything;

#[async_trait]
impl ServerRequestHandler for ApproveEverything {
    async fn handle(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        match method {
            "approve" => Ok(json!({"approved": true})),
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

#[tokio::test]
async fn test_agent_initiated_request_is_answered() {
    let client = AgentClient::builder(MockLauncher::new())
        .server_handler(ApproveEverything)
        .build();

    let result = client.call("ask", json!({})).await.unwrap();
    assert_eq!(result["answer"]["approved"], true);
    client.dispose().await;
}

#[tokio::test]
async fn test_unknown_agent_request_gets_method_not_found() {
    // Default handler: every agent-initiated method is unknown.
    let client = AgentClient::new(MockLauncher::new());

    let result = client.call("ask", json!({})).await.unwrap();
    assert_eq!(result["error_code"], METHOD_NOT_FOUND);
    client.dispose().await;
}

#[tokio::test]
async fn test_unknown_method_from_client_side() {
    let client = AgentClient::new(MockLauncher::new());
    let err = client.call("no/such/method", json!({})).await.unwrap_err();
    match err {
        ClientError::Rpc(e) => assert_eq!(e.code, METHOD_NOT_FOUND),
        other => panic!("expected rpc error, got {:?}", other),
    }
    client.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_is_not_a_disconnect() {
    let client = AgentClient::builder(MockLauncher::new())
        .request_timeout(Duration::from_secs(1))
        .build();

    let err = client
        .call("slow", json!({"delay_ms": 60_000}))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));
    assert!(!err.is_disconnect());

    // The connection survives; the late response is discarded.
    assert_eq!(client.restart_count(), 0);
    let pong = client.call("ping", json!({})).await.unwrap();
    assert_eq!(pong, json!("pong"));
    client.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_notify_reaches_agent() {
    let client = AgentClient::new(MockLauncher::new());
    // `die` as a notification kills the agent without a response cycle.
    client.notify("die", json!({})).await.unwrap();

    // Let the watcher observe the exit and restart proactively.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.restart_count(), 1);

    let pong = client.call("ping", json!({})).await.unwrap();
    assert_eq!(pong, json!("pong"));
    client.dispose().await;
}

#[tokio::test]
async fn test_dispose_rejects_future_operations() {
    let client = AgentClient::new(MockLauncher::new());
    client.call("ping", json!({})).await.unwrap();
    client.dispose().await;

    let err = client.call("ping", json!({})).await.unwrap_err();
    assert!(matches!(err, ClientError::Disposed));
    assert_eq!(client.state(), tether_client::ConnectionState::Disposed);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_preempts_in_flight_call() {
    let client = AgentClient::new(MockLauncher::new());
    client.call("ping", json!({})).await.unwrap();

    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move { client.call("slow", json!({"delay_ms": 60_000})).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.dispose().await;

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Disposed));
}
