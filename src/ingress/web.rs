//! WebSocket (browser) ingress.
//!
//! Each frame is either a binary game packet (one channel byte followed by
//! the payload) or a JSON control message for orchestrator features: the
//! auth handshake, out-of-band commands, and server-info snapshots. The
//! control stream is answered with `WebControl` frames.

use crate::ingress::{
    Connection, ConnectionEvents, ConnectionKind, NewConnection, NewConnectionSender,
    ServerSnapshot, WebControl, WebRequest, CONNECTION_QUEUE_DEPTH,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use skirmish_proto::GamePacket;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Provider for on-demand server snapshots.
pub type SnapshotFn = Arc<dyn Fn() -> Vec<ServerSnapshot> + Send + Sync>;

enum Outbound {
    Packet(GamePacket),
    Control(WebControl),
}

struct WebConnection {
    addr: SocketAddr,
    outgoing: mpsc::Sender<Outbound>,
    scope: CancellationToken,
}

#[async_trait]
impl Connection for WebConnection {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Web
    }

    fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    async fn send(&self, packet: GamePacket) -> bool {
        self.outgoing.send(Outbound::Packet(packet)).await.is_ok()
    }

    async fn send_control(&self, control: WebControl) {
        let _ = self.outgoing.send(Outbound::Control(control)).await;
    }

    fn disconnect(&self, reason: i32, message: String) {
        debug!(peer = %self.addr, reason, message, "closing web client");
        self.scope.cancel();
    }
}

fn packet_from_frame(data: &[u8]) -> Option<GamePacket> {
    let (&channel, payload) = data.split_first()?;
    Some(GamePacket::new(channel, payload.to_vec()))
}

fn frame_from_packet(packet: &GamePacket) -> Vec<u8> {
    let mut frame = Vec::with_capacity(packet.data.len() + 1);
    frame.push(packet.channel);
    frame.extend_from_slice(&packet.data);
    frame
}

pub struct WebIngress {
    path: String,
    assets: Vec<String>,
    snapshots: SnapshotFn,
    new_connections: NewConnectionSender,
    scope: CancellationToken,
}

impl WebIngress {
    pub fn new(
        path: String,
        assets: Vec<String>,
        snapshots: SnapshotFn,
        new_connections: NewConnectionSender,
        scope: CancellationToken,
    ) -> Self {
        Self {
            path,
            assets,
            snapshots,
            new_connections,
            scope,
        }
    }

    /// Accept upgrades forever on an already-bound listener; binding is
    /// the caller's problem so its failure stays fatal at startup.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, path = %self.path, "web ingress listening");
        }
        let this = Arc::new(self);

        loop {
            let (stream, addr) = tokio::select! {
                _ = this.scope.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept web client");
                        continue;
                    }
                },
            };

            let this = this.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle(stream, addr).await {
                    debug!(peer = %addr, error = %e, "web connection ended");
                }
            });
        }
    }

    async fn handle(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let path = self.path.clone();
        let check_path = move |req: &Request, resp: Response| {
            if req.uri().path() == path {
                Ok(resp)
            } else {
                Err(ErrorResponse::new(Some("not found".into())))
            }
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
        info!(peer = %addr, "client joined (web)");

        let (mut sink, mut stream) = ws.split();
        let scope = self.scope.child_token();
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        let (packets_tx, packets) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        let (commands_tx, commands) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        let (auth_tx, auth) = mpsc::channel(CONNECTION_QUEUE_DEPTH);

        let connection = Arc::new(WebConnection {
            addr,
            outgoing: outgoing_tx,
            scope: scope.clone(),
        });

        connection
            .send_control(WebControl::Assets {
                urls: self.assets.clone(),
            })
            .await;
        connection
            .send_control(WebControl::Servers {
                servers: (self.snapshots)(),
            })
            .await;

        let _ = self
            .new_connections
            .send(NewConnection {
                connection: connection.clone(),
                events: ConnectionEvents {
                    packets,
                    commands,
                    auth,
                },
            })
            .await;

        let write_scope = scope.clone();
        let writer = tokio::spawn(async move {
            loop {
                let outbound = tokio::select! {
                    _ = write_scope.cancelled() => break,
                    outbound = outgoing_rx.recv() => match outbound {
                        Some(outbound) => outbound,
                        None => break,
                    },
                };
                let frame = match outbound {
                    Outbound::Packet(packet) => WsMessage::Binary(frame_from_packet(&packet)),
                    Outbound::Control(control) => match serde_json::to_string(&control) {
                        Ok(json) => WsMessage::Text(json),
                        Err(_) => continue,
                    },
                };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(WsMessage::Close(None)).await;
        });

        loop {
            let frame = tokio::select! {
                _ = scope.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        debug!(peer = %addr, error = %e, "web read failed");
                        break;
                    }
                    None => break,
                },
            };

            match frame {
                WsMessage::Binary(data) => {
                    if let Some(packet) = packet_from_frame(&data) {
                        if packets_tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                }
                WsMessage::Text(text) => match serde_json::from_str::<WebRequest>(&text) {
                    Ok(WebRequest::Auth { token }) => {
                        let _ = auth_tx.send(token).await;
                    }
                    Ok(WebRequest::Command { command }) => {
                        let _ = commands_tx.send(command).await;
                    }
                    Ok(WebRequest::Info) => {
                        connection
                            .send_control(WebControl::Servers {
                                servers: (self.snapshots)(),
                            })
                            .await;
                    }
                    Err(e) => {
                        debug!(peer = %addr, error = %e, "bad web control frame");
                    }
                },
                WsMessage::Close(_) => break,
                _ => {}
            }
        }

        info!(peer = %addr, "client left (web)");
        scope.cancel();
        let _ = writer.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_frames_carry_a_channel_byte() {
        let packet = packet_from_frame(&[1, 9, 8, 7]).unwrap();
        assert_eq!(packet, GamePacket::new(1, vec![9, 8, 7]));
        assert_eq!(frame_from_packet(&packet), vec![1, 9, 8, 7]);
    }

    #[test]
    fn empty_frames_are_dropped() {
        assert!(packet_from_frame(&[]).is_none());
    }

    #[test]
    fn channel_only_frame_is_an_empty_packet() {
        let packet = packet_from_frame(&[2]).unwrap();
        assert_eq!(packet, GamePacket::new(2, Vec::new()));
    }
}
