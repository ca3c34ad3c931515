//! Reliable-datagram (desktop) ingress.
//!
//! The actual reliable-UDP implementation is an external concern; this
//! module models only the event stream such a host produces (peer connect,
//! per-channel receive, peer disconnect) and adapts peers to the common
//! `Connection` shape. A plain UDP host is provided for the wire: each
//! datagram is a one-byte channel tag followed by the payload, a first
//! datagram from an address is a connect, and silence past a timeout is a
//! disconnect.

use crate::ingress::{
    Connection, ConnectionEvents, ConnectionKind, NewConnection, NewConnectionSender,
    CONNECTION_QUEUE_DEPTH,
};
use async_trait::async_trait;
use dashmap::DashMap;
use skirmish_proto::GamePacket;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PEER_TIMEOUT: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const MAX_DATAGRAM: usize = 64 * 1024;

/// Opaque peer handle within one host.
pub type PeerId = SocketAddr;

/// The event stream a reliable-datagram host produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Connect(PeerId),
    Receive(PeerId, GamePacket),
    Disconnect(PeerId),
}

/// The slice of host behavior the ingress depends on.
#[async_trait]
pub trait DatagramHost: Send + Sync + 'static {
    /// Next host event; `None` when the host shuts down.
    async fn recv(&self) -> Option<HostEvent>;
    /// Deliver a packet to a peer.
    async fn send(&self, peer: PeerId, packet: GamePacket) -> bool;
    /// Drop a peer.
    async fn kick(&self, peer: PeerId, reason: i32);
}

struct PeerState {
    last_seen: Instant,
}

/// UDP-backed host.
pub struct UdpHost {
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<HostEvent>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<HostEvent>>,
    peers: DashMap<PeerId, PeerState>,
    scope: CancellationToken,
}

impl UdpHost {
    pub async fn bind(port: u16, scope: CancellationToken) -> std::io::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        let (events, events_rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH * 4);
        let host = Arc::new(Self {
            socket,
            events,
            events_rx: tokio::sync::Mutex::new(events_rx),
            peers: DashMap::new(),
            scope,
        });
        tokio::spawn(host.clone().poll());
        tokio::spawn(host.clone().sweep());
        info!(port, "desktop ingress listening");
        Ok(host)
    }

    async fn poll(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, addr) = tokio::select! {
                _ = self.scope.cancelled() => return,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "udp receive failed");
                        continue;
                    }
                },
            };
            if len == 0 {
                continue;
            }

            let fresh = !self.peers.contains_key(&addr);
            self.peers.insert(
                addr,
                PeerState {
                    last_seen: Instant::now(),
                },
            );
            if fresh {
                let _ = self.events.send(HostEvent::Connect(addr)).await;
            }

            let packet = GamePacket::new(buf[0], buf[1..len].to_vec());
            let _ = self.events.send(HostEvent::Receive(addr, packet)).await;
        }
    }

    async fn sweep(self: Arc<Self>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.scope.cancelled() => return,
                _ = tick.tick() => {}
            }
            let stale: Vec<PeerId> = self
                .peers
                .iter()
                .filter(|p| p.value().last_seen.elapsed() > PEER_TIMEOUT)
                .map(|p| *p.key())
                .collect();
            for peer in stale {
                self.peers.remove(&peer);
                let _ = self.events.send(HostEvent::Disconnect(peer)).await;
            }
        }
    }
}

#[async_trait]
impl DatagramHost for UdpHost {
    async fn recv(&self) -> Option<HostEvent> {
        self.events_rx.lock().await.recv().await
    }

    async fn send(&self, peer: PeerId, packet: GamePacket) -> bool {
        let mut datagram = Vec::with_capacity(packet.data.len() + 1);
        datagram.push(packet.channel);
        datagram.extend_from_slice(&packet.data);
        self.socket.send_to(&datagram, peer).await.is_ok()
    }

    async fn kick(&self, peer: PeerId, _reason: i32) {
        self.peers.remove(&peer);
        let _ = self.events.send(HostEvent::Disconnect(peer)).await;
    }
}

struct ReliablePeer<H: DatagramHost> {
    host: Arc<H>,
    peer: PeerId,
    scope: CancellationToken,
}

#[async_trait]
impl<H: DatagramHost> Connection for ReliablePeer<H> {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Desktop
    }

    fn host(&self) -> String {
        self.peer.ip().to_string()
    }

    fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    async fn send(&self, packet: GamePacket) -> bool {
        if self.scope.is_cancelled() {
            return false;
        }
        self.host.send(self.peer, packet).await
    }

    fn disconnect(&self, reason: i32, message: String) {
        debug!(peer = %self.peer, reason, message, "kicking desktop peer");
        self.scope.cancel();
        let host = self.host.clone();
        let peer = self.peer;
        tokio::spawn(async move {
            host.kick(peer, reason).await;
        });
    }
}

struct PeerChannels {
    packets: mpsc::Sender<GamePacket>,
    scope: CancellationToken,
}

/// Accepts host events and publishes one `Connection` per peer.
pub struct ReliableIngress<H: DatagramHost> {
    host: Arc<H>,
    /// Command injected into every fresh session, as if the player typed it.
    initial_command: Option<String>,
    new_connections: NewConnectionSender,
    scope: CancellationToken,
}

impl<H: DatagramHost> ReliableIngress<H> {
    pub fn new(
        host: Arc<H>,
        initial_command: Option<String>,
        new_connections: NewConnectionSender,
        scope: CancellationToken,
    ) -> Self {
        Self {
            host,
            initial_command,
            new_connections,
            scope,
        }
    }

    pub async fn poll(self) {
        let mut peers: std::collections::HashMap<PeerId, PeerChannels> =
            std::collections::HashMap::new();

        loop {
            let event = tokio::select! {
                _ = self.scope.cancelled() => return,
                event = self.host.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            match event {
                HostEvent::Connect(peer) => {
                    info!(peer = %peer, "client joined (desktop)");
                    let scope = self.scope.child_token();
                    let (packets_tx, packets) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
                    let (commands_tx, commands) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
                    let (_auth_tx, auth) = mpsc::channel(1);

                    peers.insert(
                        peer,
                        PeerChannels {
                            packets: packets_tx,
                            scope: scope.clone(),
                        },
                    );

                    if let Some(command) = &self.initial_command {
                        let _ = commands_tx.send(command.clone()).await;
                    }

                    let connection = Arc::new(ReliablePeer {
                        host: self.host.clone(),
                        peer,
                        scope,
                    });
                    let _ = self
                        .new_connections
                        .send(NewConnection {
                            connection,
                            events: ConnectionEvents {
                                packets,
                                commands,
                                auth,
                            },
                        })
                        .await;
                }
                HostEvent::Receive(peer, packet) => {
                    if let Some(channels) = peers.get(&peer) {
                        if channels.packets.send(packet).await.is_err() {
                            channels.scope.cancel();
                            peers.remove(&peer);
                        }
                    }
                }
                HostEvent::Disconnect(peer) => {
                    if let Some(channels) = peers.remove(&peer) {
                        info!(peer = %peer, "client left (desktop)");
                        channels.scope.cancel();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    /// In-memory host for driving the ingress without sockets.
    pub struct TestHost {
        inbound: Mutex<mpsc::Receiver<HostEvent>>,
        pub sent: Mutex<Vec<(PeerId, GamePacket)>>,
    }

    impl TestHost {
        fn new() -> (Arc<Self>, mpsc::Sender<HostEvent>) {
            let (tx, rx) = mpsc::channel(64);
            (
                Arc::new(Self {
                    inbound: Mutex::new(rx),
                    sent: Mutex::new(Vec::new()),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl DatagramHost for TestHost {
        async fn recv(&self) -> Option<HostEvent> {
            self.inbound.lock().await.recv().await
        }

        async fn send(&self, peer: PeerId, packet: GamePacket) -> bool {
            self.sent.lock().await.push((peer, packet));
            true
        }

        async fn kick(&self, _peer: PeerId, _reason: i32) {}
    }

    fn peer(n: u8) -> PeerId {
        format!("127.0.0.{n}:9000").parse().unwrap()
    }

    #[tokio::test]
    async fn connect_publishes_connection_with_initial_command() {
        let (host, events) = TestHost::new();
        let (new_tx, mut new_rx) = mpsc::channel(4);
        let ingress = ReliableIngress::new(
            host,
            Some("join lobby".into()),
            new_tx,
            CancellationToken::new(),
        );
        tokio::spawn(ingress.poll());

        events.send(HostEvent::Connect(peer(1))).await.unwrap();
        let mut accepted = new_rx.recv().await.expect("connection published");
        assert_eq!(accepted.connection.kind(), ConnectionKind::Desktop);
        assert_eq!(accepted.connection.host(), "127.0.0.1");
        assert_eq!(
            accepted.events.commands.recv().await,
            Some("join lobby".into())
        );
    }

    #[tokio::test]
    async fn receive_routes_to_peer_packets() {
        let (host, events) = TestHost::new();
        let (new_tx, mut new_rx) = mpsc::channel(4);
        let ingress = ReliableIngress::new(host, None, new_tx, CancellationToken::new());
        tokio::spawn(ingress.poll());

        events.send(HostEvent::Connect(peer(2))).await.unwrap();
        events
            .send(HostEvent::Receive(
                peer(2),
                GamePacket::new(1, vec![1, 2, 3]),
            ))
            .await
            .unwrap();

        let mut accepted = new_rx.recv().await.unwrap();
        assert_eq!(
            accepted.events.packets.recv().await,
            Some(GamePacket::new(1, vec![1, 2, 3]))
        );
    }

    #[tokio::test]
    async fn disconnect_cancels_session_scope() {
        let (host, events) = TestHost::new();
        let (new_tx, mut new_rx) = mpsc::channel(4);
        let ingress = ReliableIngress::new(host, None, new_tx, CancellationToken::new());
        tokio::spawn(ingress.poll());

        events.send(HostEvent::Connect(peer(3))).await.unwrap();
        let accepted = new_rx.recv().await.unwrap();
        assert!(!accepted.connection.scope().is_cancelled());

        events.send(HostEvent::Disconnect(peer(3))).await.unwrap();
        accepted.connection.scope().cancelled().await;
    }
}
