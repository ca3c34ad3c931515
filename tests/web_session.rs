//! Web ingress session flow: connect, talk to the control plane, run
//! cluster commands, and read the replies back off the wire.

mod common;

use common::TestCluster;
use futures_util::{SinkExt, StreamExt};
use skirmish_proto::{messages, Message};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Collect server messages from binary frames until one matches, or the
/// deadline passes.
async fn expect_server_message(ws: &mut WsStream, needle: &str) -> Option<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let frame = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return None,
            frame = ws.next() => frame?.ok()?,
        };
        let WsMessage::Binary(data) = frame else {
            continue;
        };
        let Some((_, payload)) = data.split_first() else {
            continue;
        };
        let Ok(decoded) = messages::decode(payload) else {
            continue;
        };
        for message in decoded {
            if let Message::ServerMessage { text } = message {
                if text.contains(needle) {
                    return Some(text);
                }
            }
        }
    }
}

/// Collect text (control) frames until one contains the needle.
async fn expect_control(ws: &mut WsStream, needle: &str) -> Option<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let frame = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return None,
            frame = ws.next() => frame?.ok()?,
        };
        if let WsMessage::Text(text) = frame {
            if text.contains(needle) {
                return Some(text);
            }
        }
    }
}

#[tokio::test]
async fn connecting_yields_assets_and_server_snapshot() {
    let cluster = TestCluster::spawn(29981).await.expect("spawn orchestrator");
    let (mut ws, _) = tokio_tungstenite::connect_async(cluster.url())
        .await
        .expect("connect");

    assert!(
        expect_control(&mut ws, "\"type\":\"assets\"").await.is_some(),
        "no asset index frame"
    );
    assert!(
        expect_control(&mut ws, "\"type\":\"servers\"").await.is_some(),
        "no server snapshot frame"
    );
}

#[tokio::test]
async fn help_lists_the_builtin_commands() {
    let cluster = TestCluster::spawn(29982).await.expect("spawn orchestrator");
    let (mut ws, _) = tokio_tungstenite::connect_async(cluster.url())
        .await
        .expect("connect");

    ws.send(WsMessage::Text(
        r#"{"type":"command","command":"help"}"#.into(),
    ))
    .await
    .expect("send help");

    assert!(
        expect_server_message(&mut ws, "available commands:")
            .await
            .is_some(),
        "help never answered"
    );
    assert!(
        expect_server_message(&mut ws, "#creategame").await.is_some(),
        "help does not list creategame"
    );
}

#[tokio::test]
async fn unknown_commands_answer_the_caller_in_red() {
    let cluster = TestCluster::spawn(29983).await.expect("spawn orchestrator");
    let (mut ws, _) = tokio_tungstenite::connect_async(cluster.url())
        .await
        .expect("connect");

    ws.send(WsMessage::Text(
        r#"{"type":"command","command":"frobnicate"}"#.into(),
    ))
    .await
    .expect("send command");

    let reply = expect_server_message(&mut ws, "unrecognized command")
        .await
        .expect("no error reply");
    assert!(reply.contains("command failed"));
}

#[tokio::test]
async fn joining_a_missing_server_fails_cleanly() {
    let cluster = TestCluster::spawn(29984).await.expect("spawn orchestrator");
    let (mut ws, _) = tokio_tungstenite::connect_async(cluster.url())
        .await
        .expect("connect");

    ws.send(WsMessage::Text(
        r#"{"type":"command","command":"join nowhere"}"#.into(),
    ))
    .await
    .expect("send join");

    assert!(
        expect_server_message(&mut ws, "failed to find server or space matching nowhere")
            .await
            .is_some(),
        "join did not report the missing reference"
    );
}

#[tokio::test]
async fn auth_handshake_round_trips_through_the_sidecar() {
    let cluster = TestCluster::spawn(29985).await.expect("spawn orchestrator");
    let (mut ws, _) = tokio_tungstenite::connect_async(cluster.url())
        .await
        .expect("connect");

    ws.send(WsMessage::Text(
        r#"{"type":"auth","token":"tester-1"}"#.into(),
    ))
    .await
    .expect("send auth");

    let reply = expect_control(&mut ws, "\"type\":\"auth_result\"")
        .await
        .expect("no auth result");
    assert!(reply.contains("\"ok\":true"));
}
