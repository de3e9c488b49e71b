//! End-to-end session behaviour over HTTP long-poll
//!
//! Each request is its own POST; requests the server pushes wait in the
//! session outbox until the client's next `poll`.

use serde_json::{Value, json};
use serial_test::serial;
use std::time::Duration;

use tether_client::{ClientError, TransportType};
use tether_json_rpc::{JsonRpcResponse, error_codes, parse_message};
use tether_server::TRANSPORT_ID_HEADER;
use tether_test_shared::{TestFixtures, TestServer};

#[tokio::test]
#[serial]
async fn test_echo_over_http() {
    let server = TestServer::start().await;
    let client = server.http_client(TestFixtures::client_config());
    assert_eq!(client.transport().transport_type(), TransportType::Http);

    let echoed: Value = client
        .send_request("echo", Some(TestFixtures::echo_params()))
        .await
        .unwrap();
    assert_eq!(echoed, TestFixtures::echo_params());
    assert!(client.session_id().is_some());

    let first_again: bool = client.send_request("isNew", None).await.unwrap();
    assert!(!first_again);
    assert_eq!(server.session_count().await, 1);

    client.close().await;
    assert!(server.wait_for_sessions(0, Duration::from_secs(2)).await);
}

#[tokio::test]
#[serial]
async fn test_handler_error_over_http() {
    let server = TestServer::start().await;
    let client = server.http_client(TestFixtures::client_config());

    let error = client.send_request_value("boom", None).await.unwrap_err();
    assert_eq!(error.error_code(), Some(error_codes::HANDLER_ERROR));
}

#[tokio::test]
#[serial]
async fn test_server_request_delivered_by_poll() {
    let server = TestServer::start().await;
    let client = server.http_client(TestFixtures::client_config());

    // Polling starts once the session is known
    let _: bool = client.send_request("isNew", None).await.unwrap();

    let doubled: i64 = client
        .send_request("pushDouble", Some(json!({ "n": 8 })))
        .await
        .unwrap();
    assert_eq!(doubled, 16);
    assert_eq!(server.session_count().await, 1);
}

#[tokio::test]
#[serial]
async fn test_session_survives_between_polls() {
    let server = TestServer::start().await;
    let client = server.http_client(TestFixtures::client_config());

    let _: bool = client.send_request("isNew", None).await.unwrap();
    let session_id = client.session_id().unwrap();

    // Longer than the grace window; the poll loop keeps the binding alive
    tokio::time::sleep(Duration::from_millis(900)).await;

    let is_new: bool = client.send_request("isNew", None).await.unwrap();
    assert!(!is_new);
    assert_eq!(client.session_id().as_deref(), Some(session_id.as_str()));
}

#[tokio::test]
#[serial]
async fn test_raw_poll_returns_queued_requests() {
    let server = TestServer::start().await;
    let http = reqwest::Client::new();
    let url = server.http_url();

    let post = |body: Value| {
        http.post(&url)
            .header(TRANSPORT_ID_HEADER, "raw-1")
            .json(&body)
            .send()
    };

    let created = post(json!({ "jsonrpc": "2.0", "id": 1, "method": "isNew" }))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let created = match parse_message(&created).unwrap() {
        tether_json_rpc::JsonRpcMessage::Response(response) => response,
        other => panic!("expected a response, got {:?}", other),
    };
    assert_eq!(created.result(), Some(&json!(true)));
    let session_id = created.session_id.clone().unwrap();

    // Nothing queued: the poll waits out long_poll_wait and returns empty
    let empty: JsonRpcResponse = post(json!({
        "jsonrpc": "2.0",
        "id": "poll-1",
        "method": "poll",
        "params": { "sessionId": session_id, "responses": [] }
    }))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(empty.result(), Some(&json!([])));

    // A notification gets no body
    let status = post(json!({
        "jsonrpc": "2.0",
        "method": "echo",
        "params": { "sessionId": session_id }
    }))
    .await
    .unwrap()
    .status();
    assert_eq!(status, reqwest::StatusCode::NO_CONTENT);
}

#[tokio::test]
#[serial]
async fn test_unreachable_server_is_transport_error() {
    let client = tether_client::JsonRpcClient::builder()
        .with_url("http://127.0.0.1:9/jsonrpc")
        .unwrap()
        .with_config(TestFixtures::client_config())
        .build()
        .unwrap();

    match client.send_request_value("echo", None).await {
        Err(ClientError::Transport(_)) => {}
        other => panic!("expected a transport error, got {:?}", other),
    }
}
