//! End-to-end tests for the exec WebSocket.
//!
//! A real server runs with the fake cluster behind it; a `tokio-tungstenite`
//! client plays the browser.

mod common;

use common::{create_test_state, eventually, start_test_server, FakeCluster, ForwardMode};
use futures::{SinkExt, StreamExt};
use kubedeck::terminal::TerminalSize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(addr: SocketAddr, pod: &str, query: &str) -> Client {
    let url = format!("ws://{addr}/api/namespaces/default/pods/{pod}/exec{query}");
    let (ws, _) = connect_async(url).await.expect("WebSocket connect failed");
    ws
}

async fn send_frame(ws: &mut Client, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Next JSON frame, or `None` once the socket is closed.
async fn next_frame(ws: &mut Client) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")?;
        match msg {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Collect output frames until `expected` has been seen in full.
async fn read_output_until(ws: &mut Client, expected: &str) -> String {
    let mut output = String::new();
    while !output.contains(expected) {
        let frame = next_frame(ws).await.expect("socket closed before output arrived");
        assert_eq!(frame["type"], "output", "unexpected frame: {frame}");
        output.push_str(frame["data"].as_str().unwrap());
    }
    output
}

#[tokio::test]
async fn input_is_echoed_back_as_output() {
    let cluster = FakeCluster::new(ForwardMode::Echo);
    let addr = start_test_server(create_test_state(cluster.clone())).await;
    let mut ws = connect(addr, "web-1", "").await;

    send_frame(&mut ws, json!({ "type": "input", "data": "echo hello\r" })).await;
    let output = read_output_until(&mut ws, "echo hello\r").await;
    assert_eq!(output, "echo hello\r");

    let calls = cluster.exec_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].pod.to_string(), "default/web-1");
    assert_eq!(calls[0].container.as_deref(), Some("app"), "first container is selected");
    assert_eq!(calls[0].command, vec!["/bin/sh".to_string()]);
}

#[tokio::test]
async fn container_and_shell_come_from_query() {
    let cluster = FakeCluster::new(ForwardMode::Echo);
    let addr = start_test_server(create_test_state(cluster.clone())).await;
    let mut ws = connect(addr, "web-1", "?container=sidecar&shell=/bin/bash").await;

    send_frame(&mut ws, json!({ "type": "input", "data": "x" })).await;
    read_output_until(&mut ws, "x").await;

    let calls = cluster.exec_calls();
    assert_eq!(calls[0].container.as_deref(), Some("sidecar"));
    assert_eq!(calls[0].command, vec!["/bin/bash".to_string()]);
}

#[tokio::test]
async fn resize_reaches_the_remote_terminal() {
    let cluster = FakeCluster::new(ForwardMode::Echo);
    let addr = start_test_server(create_test_state(cluster.clone())).await;
    let mut ws = connect(addr, "web-1", "").await;

    send_frame(&mut ws, json!({ "type": "resize", "rows": 40, "cols": 120 })).await;
    assert!(
        eventually(|| cluster.resizes().last() == Some(&TerminalSize::new(40, 120))).await,
        "resize never arrived: {:?}",
        cluster.resizes()
    );
}

#[tokio::test]
async fn malformed_frames_are_ignored() {
    let cluster = FakeCluster::new(ForwardMode::Echo);
    let addr = start_test_server(create_test_state(cluster)).await;
    let mut ws = connect(addr, "web-1", "").await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    send_frame(&mut ws, json!({ "type": "bogus" })).await;
    send_frame(&mut ws, json!({ "type": "input", "data": "ok" })).await;
    assert_eq!(read_output_until(&mut ws, "ok").await, "ok");
}

#[tokio::test]
async fn missing_pod_sends_one_error_then_closes() {
    let cluster = FakeCluster::new(ForwardMode::Echo);
    let addr = start_test_server(create_test_state(cluster)).await;
    let mut ws = connect(addr, common::MISSING_POD, "").await;

    let frame = next_frame(&mut ws).await.expect("expected an error frame");
    assert_eq!(frame["type"], "error");
    assert!(
        frame["data"].as_str().unwrap().contains("pod not found"),
        "got: {frame}"
    );
    assert_eq!(next_frame(&mut ws).await, None, "socket should close after error");
}

#[tokio::test]
async fn remote_exit_closes_the_socket() {
    let cluster = FakeCluster::new(ForwardMode::Echo);
    let addr = start_test_server(create_test_state(cluster)).await;
    let mut ws = connect(addr, "web-1", "").await;

    send_frame(&mut ws, json!({ "type": "input", "data": "exit\r" })).await;
    read_output_until(&mut ws, "exit").await;
    // A clean exit carries no error frame.
    loop {
        match next_frame(&mut ws).await {
            None => break,
            Some(frame) => assert_eq!(frame["type"], "output", "unexpected frame: {frame}"),
        }
    }
}

#[tokio::test]
async fn failed_exit_is_reported_as_error() {
    let cluster = FakeCluster::new(ForwardMode::Echo);
    cluster.fail_exit_with("command terminated with non-zero exit code");
    let addr = start_test_server(create_test_state(cluster)).await;
    let mut ws = connect(addr, "web-1", "").await;

    send_frame(&mut ws, json!({ "type": "input", "data": "exit\r" })).await;
    read_output_until(&mut ws, "exit").await;

    let mut error = None;
    while let Some(frame) = next_frame(&mut ws).await {
        if frame["type"] == "error" {
            error = Some(frame);
        }
    }
    let error = error.expect("expected an error frame");
    assert_eq!(error["data"], "command terminated with non-zero exit code");
}

#[tokio::test]
async fn shutdown_closes_open_sessions() {
    let cluster = FakeCluster::new(ForwardMode::Echo);
    let state = create_test_state(cluster);
    let shutdown = state.shutdown.clone();
    let addr = start_test_server(state).await;
    let mut ws = connect(addr, "web-1", "").await;

    assert!(eventually(|| shutdown.active_count() == 1).await);
    shutdown.shutdown();

    let frame = next_frame(&mut ws).await.expect("expected shutdown frame");
    assert_eq!(frame, json!({ "type": "error", "data": "server shutting down" }));
    assert_eq!(next_frame(&mut ws).await, None);
    assert!(eventually(|| shutdown.active_count() == 0).await);
}

#[tokio::test]
async fn foreign_origin_is_rejected() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let cluster = FakeCluster::new(ForwardMode::Echo);
    let addr = start_test_server(create_test_state(cluster.clone())).await;

    let mut request = format!("ws://{addr}/api/namespaces/default/pods/web-1/exec")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("origin", "http://evil.example".parse().unwrap());

    assert!(connect_async(request).await.is_err());
    assert!(cluster.exec_calls().is_empty());
}
