//! A single game-server child process.
//!
//! Each record owns exactly one OS process, its control socket, and the
//! tasks that service them: a write task draining the bounded outbound
//! queue, a read loop that decodes child events and supervises health, and
//! pipe tails that follow the child's stdout/stderr. All of them are bound
//! to the server scope; canceling it kills the child.

use crate::server::control::{ClusterEvent, ControlCodec, ServerEvent, SEND_QUEUE_DEPTH};
use crate::server::manager::ServerNotice;
use futures_util::{SinkExt, StreamExt};
use skirmish_proto::{messages, GamePacket, Message, FILE_CHANNEL};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PING_INTERVAL: Duration = Duration::from_millis(500);

/// Depth of each broadcast subscriber's channel.
const SUBSCRIBER_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Starting,
    Started,
    Healthy,
    Exited,
    Failed,
}

/// Game state reconstructed from the child's broadcast stream, used to
/// synthesize the welcome prefix a freshly-migrated client expects.
#[derive(Debug, Default, Clone)]
pub struct TrackedGame {
    map: Option<(String, i32, i32)>,
    time_remaining: Option<i32>,
    teams: Vec<skirmish_proto::messages::TeamScore>,
    players: std::collections::BTreeMap<u32, (String, String, i32)>,
}

impl TrackedGame {
    fn observe(&mut self, message: &Message) {
        match message {
            Message::MapChange {
                name,
                mode,
                has_items,
            } => {
                self.map = Some((name.clone(), *mode, *has_items));
                self.time_remaining = None;
            }
            Message::TimeUp { seconds } => self.time_remaining = Some(*seconds),
            Message::TeamInfo { teams } => self.teams = teams.clone(),
            Message::InitClient {
                client,
                name,
                team,
                model,
            } => {
                self.players
                    .insert(*client, (name.clone(), team.clone(), *model));
            }
            Message::ClientDisconnected { client } => {
                self.players.remove(client);
            }
            _ => {}
        }
    }

    /// The protocol prefix a freshly-connected client expects, minus the
    /// joining player themselves.
    pub fn welcome_burst(&self, exclude_client: Option<u32>) -> Vec<Message> {
        let mut burst = vec![Message::Welcome];
        if let Some((name, mode, has_items)) = &self.map {
            burst.push(Message::MapChange {
                name: name.clone(),
                mode: *mode,
                has_items: *has_items,
            });
        }
        if let Some(seconds) = self.time_remaining {
            burst.push(Message::TimeUp { seconds });
        }
        if !self.teams.is_empty() {
            burst.push(Message::TeamInfo {
                teams: self.teams.clone(),
            });
        }
        for (client, (name, team, model)) in &self.players {
            if Some(*client) == exclude_client {
                continue;
            }
            burst.push(Message::InitClient {
                client: *client,
                name: name.clone(),
                team: team.clone(),
                model: *model,
            });
        }
        burst
    }
}

#[derive(Debug)]
pub struct GameServer {
    /// Short hex id, derived from port and a random nonce.
    pub id: String,
    /// Optional human alias, unique across the registry.
    pub alias: Option<String>,
    /// UDP port the child serves game traffic on; port+1 is its info port.
    pub port: u16,
    /// Name of the preset this server was created from.
    pub preset: String,

    pub(super) socket_path: PathBuf,
    pub(super) config_path: PathBuf,
    /// Description with `#id` already substituted, or empty.
    pub(super) description: String,

    status: StdMutex<ServerStatus>,
    num_clients: AtomicI64,
    last_event: StdMutex<Instant>,

    send: mpsc::Sender<ClusterEvent>,
    send_rx: StdMutex<Option<mpsc::Receiver<ClusterEvent>>>,
    subscribers: StdMutex<Vec<mpsc::Sender<Message>>>,
    connects: broadcast::Sender<u32>,
    game: StdMutex<TrackedGame>,

    /// Canceled when the server exits, fails, or is shut down.
    scope: CancellationToken,
}

impl GameServer {
    pub(super) fn new(
        id: String,
        alias: Option<String>,
        port: u16,
        preset: String,
        socket_path: PathBuf,
        config_path: PathBuf,
        description: String,
        scope: CancellationToken,
    ) -> Self {
        let (send, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (connects, _) = broadcast::channel(SUBSCRIBER_DEPTH);
        Self {
            id,
            alias,
            port,
            preset,
            socket_path,
            config_path,
            description,
            status: StdMutex::new(ServerStatus::Starting),
            num_clients: AtomicI64::new(0),
            last_event: StdMutex::new(Instant::now()),
            send,
            send_rx: StdMutex::new(Some(send_rx)),
            subscribers: StdMutex::new(Vec::new()),
            connects,
            game: StdMutex::new(TrackedGame::default()),
            scope,
        }
    }

    /// Snapshot of the tracked game state.
    pub fn game_state(&self) -> TrackedGame {
        self.game.lock().unwrap().clone()
    }

    /// The string clients use to refer to this server.
    pub fn reference(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.id)
    }

    /// Whether this string refers to this server by id or alias.
    pub fn is_reference(&self, reference: &str) -> bool {
        self.id == reference || self.alias.as_deref() == Some(reference)
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: ServerStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.status(),
            ServerStatus::Starting | ServerStatus::Started | ServerStatus::Healthy
        )
    }

    pub fn num_clients(&self) -> i64 {
        self.num_clients.load(Ordering::Relaxed)
    }

    pub fn idle_since(&self) -> Instant {
        *self.last_event.lock().unwrap()
    }

    fn touch(&self) {
        *self.last_event.lock().unwrap() = Instant::now();
    }

    /// The scope everything serving this process is bound to.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    /// Subscribe to decoded broadcast messages from the child. The
    /// subscription ends when the receiver is dropped.
    pub fn broadcast_subscribe(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_DEPTH);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Subscribe to connect confirmations (client ids) from the child.
    pub fn connect_events(&self) -> broadcast::Receiver<u32> {
        self.connects.subscribe()
    }

    async fn send_event(&self, event: ClusterEvent) -> bool {
        self.send.send(event).await.is_ok()
    }

    pub async fn send_data(&self, client: u16, channel: u32, data: Vec<u8>) -> bool {
        self.send_event(ClusterEvent::Receive {
            client: client as u32,
            channel,
            data,
        })
        .await
    }

    pub async fn send_connect(&self, client: u16) -> bool {
        self.send_event(ClusterEvent::Connect {
            client: client as u32,
        })
        .await
    }

    pub async fn send_disconnect(&self, client: u16) -> bool {
        self.send_event(ClusterEvent::Disconnect {
            client: client as u32,
        })
        .await
    }

    pub async fn send_command(&self, command: &str) -> bool {
        self.send_event(ClusterEvent::Command {
            text: command.to_string(),
        })
        .await
    }

    pub async fn send_map_response(&self, name: &str, mode: i32, ok: i32) -> bool {
        self.send_event(ClusterEvent::RespondMap {
            name: name.to_string(),
            mode,
            ok,
        })
        .await
    }

    /// Stop the server and release its files. The wait task kills the child
    /// when the scope cancels. Idempotent.
    pub fn shutdown(&self) {
        self.scope.cancel();
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(&self.config_path);
    }

    /// Run the control-socket loops until the scope cancels or the socket
    /// dies. Missed pongs for more than two intervals mark the server
    /// `Failed` and cancel the scope.
    pub(super) async fn run(self: Arc<Self>, socket: UnixStream, notices: mpsc::Sender<ServerNotice>) {
        let (mut sink, mut stream) = Framed::new(socket, ControlCodec).split();

        let mut send_rx = match self.send_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return,
        };

        let write_scope = self.scope.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_scope.cancelled() => break,
                    event = send_rx.recv() => match event {
                        Some(event) => {
                            if let Err(e) = sink.send(event).await {
                                warn!(error = %e, "control write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        let mut last_pong = Instant::now();
        let mut read_errors = 0u8;
        let _ = self.send_event(ClusterEvent::Ping).await;

        loop {
            tokio::select! {
                _ = self.scope.cancelled() => break,
                _ = ping.tick() => {
                    if last_pong.elapsed() > 2 * PING_INTERVAL {
                        error!(server = %self.reference(), "server stopped responding to pings, going down");
                        self.set_status(ServerStatus::Failed);
                        let _ = notices.send(ServerNotice::Failed { server: self.clone() }).await;
                        self.scope.cancel();
                        break;
                    }
                    let _ = self.send_event(ClusterEvent::Ping).await;
                }
                event = stream.next() => {
                    match event {
                        Some(Ok(ServerEvent::Pong)) => {
                            last_pong = Instant::now();
                            read_errors = 0;
                        }
                        Some(Ok(event)) => {
                            read_errors = 0;
                            self.clone().handle_event(event, &notices).await;
                        }
                        // One re-read is allowed; a second straight
                        // failure gives up on the socket.
                        Some(Err(e)) => {
                            debug!(server = %self.reference(), error = %e, "control read failed");
                            read_errors += 1;
                            if read_errors > 1 {
                                self.scope.cancel();
                                break;
                            }
                        }
                        None => {
                            debug!(server = %self.reference(), "control socket closed");
                            break;
                        }
                    }
                }
            }
        }

        writer.abort();
    }

    async fn handle_event(self: Arc<Self>, event: ServerEvent, notices: &mpsc::Sender<ServerNotice>) {
        match event {
            ServerEvent::Pong => {}
            ServerEvent::Healthy => {
                info!(server = %self.reference(), "server healthy");
                self.set_status(ServerStatus::Healthy);
                self.touch();
            }
            ServerEvent::Connect { client } => {
                debug!(server = %self.reference(), client, "server confirmed connect");
                let _ = self.connects.send(client);
            }
            ServerEvent::Disconnect {
                client,
                reason,
                text,
            } => {
                let _ = notices
                    .send(ServerNotice::ClientKicked {
                        server: self.clone(),
                        client: client as u16,
                        reason,
                        text,
                    })
                    .await;
            }
            ServerEvent::Broadcast { channel, data } => {
                if channel == FILE_CHANNEL as u32 {
                    return;
                }
                let decoded = match messages::decode(&data) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        debug!(server = %self.reference(), error = %e, "failed to decode broadcast");
                        return;
                    }
                };
                {
                    let mut game = self.game.lock().unwrap();
                    for message in &decoded {
                        game.observe(message);
                    }
                }
                let mut subscribers = self.subscribers.lock().unwrap();
                for message in decoded {
                    subscribers.retain(|sub| match sub.try_send(message.clone()) {
                        Ok(()) => true,
                        // A slow subscriber loses messages rather than
                        // stalling the control channel.
                        Err(mpsc::error::TrySendError::Full(_)) => true,
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    });
                }
            }
            ServerEvent::Unicast {
                client,
                channel,
                data,
            } => {
                let _ = notices
                    .send(ServerNotice::Unicast {
                        server: self.clone(),
                        client: client as u16,
                        packet: GamePacket::new(channel as u8, data),
                    })
                    .await;
            }
            ServerEvent::RequestMap { name, mode } => {
                let _ = notices
                    .send(ServerNotice::MapRequest {
                        server: self.clone(),
                        name,
                        mode,
                    })
                    .await;
            }
        }
    }

    /// Own the child process: tail its pipes, reap it, and kill it if the
    /// server scope cancels first. Stdout doubles as an event source:
    /// `Join:`/`Leave:` lines drive the player counter.
    pub(super) async fn wait(self: Arc<Self>, mut child: Child, notices: mpsc::Sender<ServerNotice>) {
        if let Some(stdout) = child.stdout.take() {
            let server = self.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.starts_with("Join:") {
                        server.num_clients.fetch_add(1, Ordering::Relaxed);
                        server.touch();
                    } else if line.starts_with("Leave:") {
                        if server.num_clients.fetch_sub(1, Ordering::Relaxed) <= 0 {
                            server.num_clients.store(0, Ordering::Relaxed);
                        }
                        server.touch();
                    }
                    info!(server = %server.reference(), "{line}");
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let server = self.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(server = %server.reference(), "{line}");
                }
            });
        }

        let status = tokio::select! {
            status = child.wait() => status,
            _ = self.scope.cancelled() => {
                let _ = child.start_kill();
                child.wait().await
            }
        };

        match status {
            Ok(status) if status.success() => {
                info!(server = %self.reference(), "exited");
                self.set_status(ServerStatus::Exited);
            }
            Ok(status) => {
                error!(server = %self.reference(), code = ?status.code(), "exited with failure");
                self.set_status(ServerStatus::Failed);
                let _ = notices
                    .send(ServerNotice::Failed {
                        server: self.clone(),
                    })
                    .await;
            }
            Err(e) => {
                error!(server = %self.reference(), error = %e, "failed to reap child");
                self.set_status(ServerStatus::Failed);
            }
        }
        self.scope.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skirmish_proto::messages::TeamScore;

    #[test]
    fn tracked_game_follows_roster_changes() {
        let mut game = TrackedGame::default();
        game.observe(&Message::MapChange {
            name: "arena".into(),
            mode: 3,
            has_items: 1,
        });
        game.observe(&Message::InitClient {
            client: 0,
            name: "alpha".into(),
            team: "good".into(),
            model: 0,
        });
        game.observe(&Message::InitClient {
            client: 1,
            name: "beta".into(),
            team: "evil".into(),
            model: 0,
        });
        game.observe(&Message::ClientDisconnected { client: 0 });
        game.observe(&Message::TeamInfo {
            teams: vec![TeamScore {
                team: "evil".into(),
                frags: 5,
            }],
        });

        let burst = game.welcome_burst(None);
        assert_eq!(burst[0], Message::Welcome);
        assert!(matches!(&burst[1], Message::MapChange { name, .. } if name == "arena"));
        assert!(burst
            .iter()
            .any(|m| matches!(m, Message::TeamInfo { teams } if teams.len() == 1)));
        assert!(burst
            .iter()
            .any(|m| matches!(m, Message::InitClient { client: 1, .. })));
        assert!(!burst
            .iter()
            .any(|m| matches!(m, Message::InitClient { client: 0, .. })));
    }

    #[test]
    fn map_change_resets_the_clock() {
        let mut game = TrackedGame::default();
        game.observe(&Message::TimeUp { seconds: 90 });
        game.observe(&Message::MapChange {
            name: "next".into(),
            mode: 0,
            has_items: 0,
        });
        assert!(!game
            .welcome_burst(None)
            .iter()
            .any(|m| matches!(m, Message::TimeUp { .. })));
    }

    #[test]
    fn welcome_burst_excludes_the_joining_client() {
        let mut game = TrackedGame::default();
        game.observe(&Message::InitClient {
            client: 7,
            name: "self".into(),
            team: "good".into(),
            model: 0,
        });
        assert!(!game
            .welcome_burst(Some(7))
            .iter()
            .any(|m| matches!(m, Message::InitClient { .. })));
    }
}
