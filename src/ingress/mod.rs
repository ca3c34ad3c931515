//! Ingress transports.
//!
//! Two disjoint transports deliver players: a reliable-datagram host over
//! UDP (desktop builds) and WebSocket (the browser). Both are adapted to the
//! same `Connection` shape so the session layer never cares which one a
//! player arrived on.

pub mod reliable;
pub mod web;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skirmish_proto::GamePacket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Depth of per-connection event channels.
pub const CONNECTION_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Desktop,
    Web,
}

/// Orchestrator-specific control messages toward a web client. Desktop
/// clients have no control stream; sends to them are dropped.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebControl {
    /// Cross-server chat rendered outside the game feed.
    Chat { message: String },
    /// The client's current server reference changed (drives the URL bar).
    ServerChanged { reference: String },
    /// Result of the auth handshake.
    AuthResult { ok: bool, name: Option<String> },
    /// Asset index URLs the client should mount.
    Assets { urls: Vec<String> },
    /// Snapshot of joinable servers.
    Servers { servers: Vec<ServerSnapshot> },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerSnapshot {
    pub reference: String,
    pub preset: String,
    pub clients: i64,
}

/// Control messages a web client sends to the orchestrator.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebRequest {
    /// Authenticate against the sidecar before any server attachment.
    Auth { token: String },
    /// Run a cluster command out of band.
    Command { command: String },
    /// Ask for a fresh server snapshot.
    Info,
}

/// A transport-agnostic handle to one connected player.
#[async_trait]
pub trait Connection: Send + Sync {
    fn kind(&self) -> ConnectionKind;

    /// Remote host, used for per-host bookkeeping (create cooldowns).
    fn host(&self) -> String;

    /// Canceled when the transport connection is gone. This is the
    /// session scope: everything owned by the session hangs off it.
    fn scope(&self) -> &CancellationToken;

    /// Deliver a game packet to the client. Returns false once the
    /// connection is gone.
    async fn send(&self, packet: GamePacket) -> bool;

    /// Deliver a control message; a no-op for transports without a
    /// control stream.
    async fn send_control(&self, _control: WebControl) {}

    /// Forcibly close the connection.
    fn disconnect(&self, reason: i32, message: String);
}

/// Receiver bundle handed to the session layer exactly once per connection.
pub struct ConnectionEvents {
    /// Game packets from the client.
    pub packets: mpsc::Receiver<GamePacket>,
    /// Out-of-band commands (initial ingress command, web command frames).
    pub commands: mpsc::Receiver<String>,
    /// Auth tokens from the web control stream.
    pub auth: mpsc::Receiver<String>,
}

/// A freshly accepted connection, published by each ingress.
pub struct NewConnection {
    pub connection: std::sync::Arc<dyn Connection>,
    pub events: ConnectionEvents,
}

pub type NewConnectionSender = mpsc::Sender<NewConnection>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn web_requests_parse() {
        let auth: WebRequest =
            serde_json::from_str(r#"{"type":"auth","token":"abc"}"#).unwrap();
        assert_eq!(
            auth,
            WebRequest::Auth {
                token: "abc".into()
            }
        );

        let command: WebRequest =
            serde_json::from_str(r#"{"type":"command","command":"join lobby"}"#).unwrap();
        assert_eq!(
            command,
            WebRequest::Command {
                command: "join lobby".into()
            }
        );
    }

    #[test]
    fn web_controls_serialize_with_tags() {
        let control = WebControl::ServerChanged {
            reference: "lobby".into(),
        };
        let json = serde_json::to_string(&control).unwrap();
        assert!(json.contains(r#""type":"server_changed""#));
        assert!(json.contains(r#""reference":"lobby""#));
    }
}
