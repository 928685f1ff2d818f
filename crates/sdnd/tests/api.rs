mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use common::{eventually, TestDaemon, PEER};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use sdn_ovsdb::model::tables;
use sdn_ovsdb::tunnel_port_name;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn send(t: &TestDaemon, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, String) {
    let body = match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    };
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();

    let response = t.daemon.router().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

fn parse(body: &str) -> Value {
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn test_version() {
    let t = TestDaemon::start().await;
    let (status, body) = send(&t, Method::GET, "/version", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, sdnd::VERSION);
}

#[tokio::test]
async fn test_configuration_roundtrip() {
    let t = TestDaemon::start().await;

    let (status, body) = send(&t, Method::GET, "/configuration", None).await;
    assert_eq!(status, StatusCode::OK);
    let conf = parse(&body);
    assert_eq!(conf["bridgeName"], "ovs-br0");
    assert_eq!(conf["bridgeIP"], "10.1.42.1");
    assert_eq!(conf["bridgeCIDR"], "10.1.42.1/16");
    assert_eq!(conf["bridgeMTU"], 1440);

    let update = json!({
        "bridgeName": "ovs-br1",
        "bridgeIP": "10.2.0.1",
        "bridgeCIDR": "10.2.0.1/16",
        "bridgeMTU": 9000
    });
    let (status, _) = send(&t, Method::POST, "/configuration", Some(update.clone())).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&t, Method::GET, "/configuration", None).await;
    assert_eq!(parse(&body), update);
}

#[tokio::test]
async fn test_configuration_without_body_is_rejected() {
    let t = TestDaemon::start().await;
    let (status, body) = send(&t, Method::POST, "/configuration", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("no body"));
}

#[tokio::test]
async fn test_network_lifecycle() {
    let t = TestDaemon::start().await;

    let (status, body) = send(
        &t,
        Method::POST,
        "/network",
        Some(json!({"name": "blue", "subnet": "10.9.0.0/24"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let created = parse(&body);
    assert_eq!(created["name"], "blue");
    assert_eq!(created["subnet"], "10.9.0.0/24");
    assert_eq!(created["gateway"], "10.9.0.1");
    assert!(created["vlanid"].as_u64().unwrap() >= 1);

    let (status, body) = send(&t, Method::GET, "/network/blue", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body), created);

    let (status, body) = send(&t, Method::GET, "/networks", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<String> = parse(&body)
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"blue".to_string()));

    let (status, _) = send(&t, Method::DELETE, "/network/blue", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(t.switch.row_by_name(tables::PORT, "blue").is_none());

    let (status, body) = send(&t, Method::GET, "/network/blue", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("Network blue not exist"));
}

#[tokio::test]
async fn test_create_network_with_bad_subnet() {
    let t = TestDaemon::start().await;
    let (status, _) = send(
        &t,
        Method::POST,
        "/network",
        Some(json!({"name": "blue", "subnet": "not-a-subnet"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&t, Method::POST, "/network", Some(json!({"name": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_network_with_oversized_subnet() {
    let t = TestDaemon::start().await;
    let (status, body) = send(
        &t,
        Method::POST,
        "/network",
        Some(json!({"name": "huge", "subnet": "10.0.0.0/4"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Invalid subnet"));
    assert!(t.switch.row_by_name(tables::PORT, "huge").is_none());

    // The VLAN claimed for the rejected network was returned.
    let (_, body) = send(
        &t,
        Method::POST,
        "/network",
        Some(json!({"name": "blue", "subnet": "10.9.0.0/24"})),
    )
    .await;
    assert_eq!(parse(&body)["vlanid"], 1);
}

#[tokio::test]
async fn test_create_network_with_bridge_name() {
    let t = TestDaemon::start().await;
    let (status, body) = send(
        &t,
        Method::POST,
        "/network",
        Some(json!({"name": "ovs-br0", "subnet": "10.9.0.0/24"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("reserved"));
}

#[tokio::test]
async fn test_network_changes_need_the_core() {
    let t = TestDaemon::start().await;
    let state = t.daemon.state().clone();
    t.daemon.shutdown().await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/network")
        .body(Body::from(
            json!({"name": "blue", "subnet": "10.9.0.0/24"}).to_string(),
        ))
        .unwrap();
    let response = sdnd::create_router(state.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    assert!(t.switch.row_by_name(tables::PORT, "blue").is_none());
    assert!(state.networks.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_connection_lifecycle() {
    let t = TestDaemon::start().await;

    let (status, body) = send(
        &t,
        Method::POST,
        "/connection",
        Some(json!({"containerID": "c1", "containerName": "web", "containerPID": "42"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let conn = parse(&body);
    assert_eq!(conn["containerID"], "c1");
    assert_eq!(conn["network"], "default");
    assert_eq!(conn["ovs_connectionDetails"]["ip"], "10.1.0.2");
    assert_eq!(conn["ovs_connectionDetails"]["gateway"], "10.1.0.1");
    let port = conn["ovsPortID"].as_str().unwrap().to_string();
    assert!(t.switch.row_by_name(tables::PORT, &port).is_some());

    let (status, body) = send(&t, Method::GET, "/connection/c1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body), conn);

    let (status, body) = send(&t, Method::GET, "/connections", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body), json!({ "c1": conn }));

    let (status, _) = send(&t, Method::DELETE, "/connection/c1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(t.switch.row_by_name(tables::PORT, &port).is_none());

    let (status, body) = send(&t, Method::GET, "/connections", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body), json!({}));
}

#[tokio::test]
async fn test_unknown_connection_is_not_found() {
    let t = TestDaemon::start().await;

    let (status, _) = send(&t, Method::GET, "/connection/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&t, Method::DELETE, "/connection/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_connection_with_malformed_body() {
    let t = TestDaemon::start().await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/connection")
        .body(Body::from("{not json"))
        .unwrap();
    let response = t.daemon.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, _) = send(&t, Method::POST, "/connection", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cluster_join_validates_address() {
    let t = TestDaemon::start().await;

    let (status, body) = send(&t, Method::POST, "/cluster/join", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "address parameter not exist");

    let (status, _) = send(&t, Method::POST, "/cluster/join?address=", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&t, Method::POST, "/cluster/join?address=300.1.1.1", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Invalid IP address");
}

#[tokio::test]
async fn test_cluster_join_and_leave() {
    let t = TestDaemon::start().await;
    let port = tunnel_port_name(PEER);

    let uri = format!("/cluster/join?address={}", PEER);
    let (status, _) = send(&t, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    eventually(|| t.switch.row_by_name(tables::PORT, &port).is_some()).await;

    let (status, _) = send(&t, Method::POST, "/cluster/leave", None).await;
    assert_eq!(status, StatusCode::OK);
    eventually(|| t.switch.row_by_name(tables::PORT, &port).is_none()).await;
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let t = TestDaemon::start().await;
    t.daemon
        .core()
        .connect(sdnd::Connection::new("c1"))
        .await
        .unwrap();

    let (status, body) = send(&t, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("sdnd_connections 1"));
    assert!(body.contains("sdnd_commands_total"));
}
