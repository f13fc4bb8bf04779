//! # Node Lifecycle Tests
//!
//! Health reporting and draining behaviour of a running gateway node.

use axum::http::StatusCode;
use axum_test::TestServer;
use flow_gateway::gateway::server::{router, HEALTH_PATH};
use flow_gateway::{GatewayConfig, NodeLifecycle, NodeState, Reactor};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"
apis:
  - id: mocked
    context_path: /mocked
    endpoint_groups:
      - name: default
        endpoints:
          - name: stub
            mock:
              status: 200
"#;

fn server() -> (TestServer, NodeLifecycle, Arc<Reactor>) {
    let config: GatewayConfig = serde_yaml::from_str(CONFIG).unwrap();
    let lifecycle = NodeLifecycle::new();
    let (reactor, _) = Reactor::from_config(&config, lifecycle.clone()).unwrap();
    let reactor = Arc::new(reactor);
    let server = TestServer::new(router(reactor.clone())).unwrap();
    (server, lifecycle, reactor)
}

#[tokio::test]
async fn test_health_follows_node_state() {
    let (server, lifecycle, _) = server();

    let response = server.get(HEALTH_PATH).await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json::<Value>()["status"], "INITIALIZED");

    lifecycle.start();
    let response = server.get(HEALTH_PATH).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body = response.json::<Value>();
    assert_eq!(body["status"], "STARTED");
    assert_eq!(body["apis"], 1);

    lifecycle.set_state(NodeState::Stopping);
    let response = server.get(HEALTH_PATH).await;
    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_stop_waits_for_held_exchange() {
    let (_, lifecycle, reactor) = server();
    lifecycle.start();

    let request = flow_gateway::core::types::IncomingRequest::new(
        axum::http::Method::GET,
        "/mocked".parse().unwrap(),
        axum::http::Version::HTTP_11,
        axum::http::HeaderMap::new(),
    );
    let exchange = reactor.handle(request, None).await;
    assert_eq!(lifecycle.in_flight(), 1);

    let stopping = lifecycle.clone();
    let stop = tokio::spawn(async move { stopping.stop(Duration::from_secs(5)).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(lifecycle.state(), NodeState::Stopping);

    drop(exchange);
    assert!(stop.await.unwrap());
    assert_eq!(lifecycle.state(), NodeState::Stopped);
}

#[tokio::test]
async fn test_requests_served_while_stopping() {
    let (server, lifecycle, _) = server();
    lifecycle.start();
    lifecycle.set_state(NodeState::Stopping);

    let response = server.get("/mocked").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.header("connection"), "close");
}
