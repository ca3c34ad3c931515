//! Shared test doubles.

use crate::ingress::{Connection, ConnectionEvents, ConnectionKind, NewConnection, WebControl};
use crate::session::{Session, SessionBundle, SessionManager};
use async_trait::async_trait;
use skirmish_proto::GamePacket;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// An ingress connection that records everything sent to it.
pub struct FakeConnection {
    scope: CancellationToken,
    pub sent: Mutex<Vec<GamePacket>>,
    pub controls: Mutex<Vec<WebControl>>,
}

impl FakeConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scope: CancellationToken::new(),
            sent: Mutex::new(Vec::new()),
            controls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Desktop
    }

    fn host(&self) -> String {
        "127.0.0.1".into()
    }

    fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    async fn send(&self, packet: GamePacket) -> bool {
        self.sent.lock().await.push(packet);
        true
    }

    async fn send_control(&self, control: WebControl) {
        self.controls.lock().await.push(control);
    }

    fn disconnect(&self, _reason: i32, _message: String) {
        self.scope.cancel();
    }
}

/// Channel bundle whose senders are immediately dropped.
pub fn idle_events() -> ConnectionEvents {
    let (_, packets) = mpsc::channel(1);
    let (_, commands) = mpsc::channel(1);
    let (_, auth) = mpsc::channel(1);
    ConnectionEvents {
        packets,
        commands,
        auth,
    }
}

/// Accept a fake connection into the manager and return the session.
pub async fn fake_session(
    manager: &SessionManager,
    new_sessions: &mut mpsc::Receiver<SessionBundle>,
) -> (Arc<Session>, Arc<FakeConnection>) {
    let connection = FakeConnection::new();
    let session = manager
        .accept(NewConnection {
            connection: connection.clone(),
            events: idle_events(),
        })
        .await
        .expect("session accepted");
    let _ = new_sessions.recv().await;
    (session, connection)
}
