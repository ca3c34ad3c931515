//! Per-player sessions.
//!
//! A session spans one ingress connection and may pass through many server
//! attachments. The session scope comes from the ingress; each attachment
//! gets a child scope that dies with the attachment. Sixteen-bit session
//! ids double as the client id the child servers see.

pub mod pipeline;
pub mod task;

use crate::error::AttachError;
use crate::ingress::{Connection, ConnectionEvents, NewConnection, WebControl};
use crate::server::{GameServer, ServerStatus};
use crate::session::pipeline::{Direction, Pipeline};
use dashmap::DashMap;
use skirmish_proto::{colors, messages, GamePacket, Message};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long the child has to confirm a connect before migration fails.
const CONNECT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(1);

/// Depth of the per-session server-to-client packet queue.
const SERVER_PACKET_DEPTH: usize = 64;

/// The session's relationship to its attached server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentStatus {
    #[default]
    Detached,
    Connecting,
    Connected,
}

/// An authenticated identity from the sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub name: String,
}

#[derive(Default)]
struct SessionState {
    server: Option<Arc<GameServer>>,
    server_scope: Option<CancellationToken>,
    status: AttachmentStatus,
    auth: Option<AuthUser>,
    name: String,
    client_num: Option<u32>,
    greeted: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

pub struct Session {
    /// Random 16-bit id, unique among live sessions; also the client id
    /// presented to child servers.
    pub id: u16,
    pub connection: Arc<dyn Connection>,
    /// Client-to-server interception.
    pub from_client: Pipeline,
    /// Server-to-client interception.
    pub to_client: Pipeline,

    state: StdMutex<SessionState>,
    server_packets: mpsc::Sender<GamePacket>,
    /// Serializes attach and detach; a session migrates one step at a time.
    attach_lock: tokio::sync::Mutex<()>,
}

impl Session {
    /// The session scope: everything owned by the session hangs off it.
    pub fn scope(&self) -> &CancellationToken {
        self.connection.scope()
    }

    pub fn server(&self) -> Option<Arc<GameServer>> {
        self.state.lock().unwrap().server.clone()
    }

    pub fn server_scope(&self) -> Option<CancellationToken> {
        self.state.lock().unwrap().server_scope.clone()
    }

    pub fn status(&self) -> AttachmentStatus {
        self.state.lock().unwrap().status
    }

    pub fn auth(&self) -> Option<AuthUser> {
        self.state.lock().unwrap().auth.clone()
    }

    pub fn set_auth(&self, auth: Option<AuthUser>) {
        self.state.lock().unwrap().auth = auth;
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.lock().unwrap().auth.is_some()
    }

    pub fn name(&self) -> String {
        let state = self.state.lock().unwrap();
        if state.name.is_empty() {
            "unnamed".to_string()
        } else {
            state.name.clone()
        }
    }

    pub fn set_name(&self, name: String) {
        self.state.lock().unwrap().name = name;
    }

    /// The client number the current server assigned this player.
    pub fn client_num(&self) -> Option<u32> {
        self.state.lock().unwrap().client_num
    }

    pub fn set_client_num(&self, client_num: Option<u32>) {
        self.state.lock().unwrap().client_num = client_num;
    }

    pub fn was_greeted(&self) -> bool {
        self.state.lock().unwrap().greeted
    }

    pub fn set_greeted(&self) {
        self.state.lock().unwrap().greeted = true;
    }

    /// Queue a server-originated packet for this session's task.
    pub async fn queue_server_packet(&self, packet: GamePacket) -> bool {
        self.server_packets.send(packet).await.is_ok()
    }

    /// Send a branded server message to the player.
    pub async fn message(&self, text: &str) {
        let branded = format!("{} {}", colors::yellow("skirmish"), text);
        self.raw_message(&branded).await;
    }

    /// Send an unbranded server message to the player.
    pub async fn raw_message(&self, text: &str) {
        let payload = messages::encode_all(&[Message::ServerMessage {
            text: text.to_string(),
        }]);
        self.connection.send(GamePacket::new(1, payload)).await;
    }
}

/// A new session plus the receiver halves its task consumes.
pub struct SessionBundle {
    pub session: Arc<Session>,
    pub events: ConnectionEvents,
    pub server_packets: mpsc::Receiver<GamePacket>,
}

pub struct SessionManager {
    sessions: DashMap<u16, Arc<Session>>,
    by_server: DashMap<String, HashSet<u16>>,
    new_sessions: mpsc::Sender<SessionBundle>,
}

impl SessionManager {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<SessionBundle>) {
        let (new_sessions, rx) = mpsc::channel(16);
        (
            Arc::new(Self {
                sessions: DashMap::new(),
                by_server: DashMap::new(),
                new_sessions,
            }),
            rx,
        )
    }

    fn new_id(&self) -> Option<u16> {
        for _ in 0..=u16::MAX as u32 {
            let id = rand::random::<u16>();
            if !self.sessions.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Attach a session record to a fresh connection and publish it.
    pub async fn accept(&self, accepted: NewConnection) -> Option<Arc<Session>> {
        let id = match self.new_id() {
            Some(id) => id,
            None => {
                warn!("session id space exhausted");
                accepted
                    .connection
                    .disconnect(0, "server full".to_string());
                return None;
            }
        };

        let (server_packets, server_packets_rx) = mpsc::channel(SERVER_PACKET_DEPTH);
        let session = Arc::new(Session {
            id,
            connection: accepted.connection,
            from_client: Pipeline::new(Direction::ClientToServer),
            to_client: Pipeline::new(Direction::ServerToClient),
            state: StdMutex::new(SessionState::default()),
            server_packets,
            attach_lock: tokio::sync::Mutex::new(()),
        });

        self.sessions.insert(id, session.clone());
        info!(session = id, host = %session.connection.host(), "session accepted");

        let _ = self
            .new_sessions
            .send(SessionBundle {
                session: session.clone(),
                events: accepted.events,
                server_packets: server_packets_rx,
            })
            .await;
        Some(session)
    }

    pub fn find(&self, id: u16) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Sessions currently attached to a server.
    pub fn on_server(&self, server_id: &str) -> Vec<Arc<Session>> {
        let ids = match self.by_server.get(server_id) {
            Some(ids) => ids.value().clone(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.find(*id)).collect()
    }

    /// Attach a session to a server, migrating away from any current
    /// attachment. The ingress connection is untouched either way.
    pub async fn connect(
        &self,
        session: &Arc<Session>,
        server: &Arc<GameServer>,
    ) -> Result<(), AttachError> {
        if server.status() != ServerStatus::Healthy {
            return Err(AttachError::NotHealthy);
        }
        if session.scope().is_cancelled() {
            return Err(AttachError::SessionGone);
        }

        let _attach = session.attach_lock.lock().await;

        // Subscribe before asking, so the confirmation cannot race us.
        let mut confirmations = server.connect_events();

        let previous = {
            let mut state = session.state.lock().unwrap();
            let previous = state.server.take().map(|s| (s, state.server_scope.take()));
            state.server = Some(server.clone());
            state.server_scope = Some(session.scope().child_token());
            state.status = AttachmentStatus::Connecting;
            state.client_num = None;
            previous
        };

        if let Some((old_server, old_scope)) = previous {
            if let Some(scope) = old_scope {
                scope.cancel();
            }
            self.forget_attachment(&old_server.id, session.id);
            old_server.send_disconnect(session.id).await;
        }

        self.by_server
            .entry(server.id.clone())
            .or_default()
            .insert(session.id);

        info!(session = session.id, server = %server.reference(), "client connecting to server");
        server.send_connect(session.id).await;

        let confirmed = tokio::time::timeout(CONNECT_CONFIRM_TIMEOUT, async {
            loop {
                match confirmations.recv().await {
                    Ok(client) if client == session.id as u32 => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        })
        .await;

        if !matches!(confirmed, Ok(true)) {
            self.detach(session).await;
            return Err(AttachError::Unconfirmed);
        }

        session.state.lock().unwrap().status = AttachmentStatus::Connected;

        // Synthesize the prefix a fresh connection expects from the
        // server's tracked game state, routed through the normal
        // server-to-client path so interception applies.
        let burst = server.game_state().welcome_burst(None);
        let packet = GamePacket::new(1, messages::encode_all(&burst));
        session.queue_server_packet(packet).await;

        session
            .connection
            .send_control(WebControl::ServerChanged {
                reference: server.reference().to_string(),
            })
            .await;

        Ok(())
    }

    /// Detach a session from its current server, if any.
    pub async fn detach(&self, session: &Arc<Session>) {
        let previous = {
            let mut state = session.state.lock().unwrap();
            state.status = AttachmentStatus::Detached;
            state.client_num = None;
            let scope = state.server_scope.take();
            (state.server.take(), scope)
        };

        if let (Some(server), scope) = previous {
            if let Some(scope) = scope {
                scope.cancel();
            }
            self.forget_attachment(&server.id, session.id);
            server.send_disconnect(session.id).await;
        }
    }

    fn forget_attachment(&self, server_id: &str, session_id: u16) {
        if let Some(mut ids) = self.by_server.get_mut(server_id) {
            ids.remove(&session_id);
        }
    }

    /// Remove a session entirely; called after its task unwinds.
    pub async fn remove(&self, session: &Arc<Session>) {
        self.detach(session).await;
        self.sessions.remove(&session.id);
        info!(session = session.id, "session removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fake_session;

    #[tokio::test]
    async fn accept_assigns_unique_ids() {
        let (manager, mut new_sessions) = SessionManager::new();
        let (first, _) = fake_session(&manager, &mut new_sessions).await;
        let (second, _) = fake_session(&manager, &mut new_sessions).await;

        assert_ne!(first.id, second.id);
        assert_eq!(manager.all().len(), 2);
        assert_eq!(manager.find(first.id).unwrap().id, first.id);
    }

    #[tokio::test]
    async fn messages_are_branded_server_messages() {
        let (manager, mut new_sessions) = SessionManager::new();
        let (session, connection) = fake_session(&manager, &mut new_sessions).await;

        session.message("welcome to the cluster").await;

        let sent = connection.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, 1);
        let decoded = messages::decode(&sent[0].data).unwrap();
        assert!(
            matches!(&decoded[0], Message::ServerMessage { text } if text.contains("welcome to the cluster"))
        );
    }

    #[tokio::test]
    async fn fresh_sessions_are_detached_and_anonymous() {
        let (manager, mut new_sessions) = SessionManager::new();
        let (session, _) = fake_session(&manager, &mut new_sessions).await;

        assert_eq!(session.status(), AttachmentStatus::Detached);
        assert!(session.server().is_none());
        assert!(!session.is_logged_in());
        assert_eq!(session.name(), "unnamed");
    }

    #[tokio::test]
    async fn removal_detaches_and_forgets() {
        let (manager, mut new_sessions) = SessionManager::new();
        let (session, _) = fake_session(&manager, &mut new_sessions).await;
        manager.remove(&session).await;
        assert!(manager.find(session.id).is_none());
        assert!(manager.all().is_empty());
    }
}
