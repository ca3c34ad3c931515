//! In-band map delivery.
//!
//! A player missing a map cannot be told to download a file; the
//! orchestrator only speaks the game protocol. So it abuses two in-band
//! mechanisms: a tiny synthesized "proxy map" whose `maptitle` variable is
//! a script that requests a demo, and the demo transfer itself, which
//! carries the real map bytes. Two teleporters in the proxy map drive the
//! two halves of the script; the player's avatar is moved onto them at the
//! right moments.

use crate::session::{Session, SessionManager};
use crate::verse::VerseHandle;
use dashmap::DashMap;
use skirmish_proto::mapfile::{MapEntity, Vec3, WorldMap};
use skirmish_proto::{colors, mapfile, messages, GamePacket, Message, VarValue, FILE_CHANNEL};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long the player has to run `/do $maptitle`.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);
/// Settling delays around pause/teleport nudges, so client physics runs.
const SETTLE_LONG: Duration = Duration::from_secs(1);
const SETTLE_SHORT: Duration = Duration::from_millis(500);

/// World center of the synthesized proxy map.
const CENTER: f32 = 512.0;
/// Teleporter offset from center.
const OFFSET: f32 = 10.0;
/// Spawn height above the teleporters.
const HEIGHT: f32 = 512.0 + 14.0;

/// Mode the proxy map is pushed under (cooperative edit keeps the child
/// server permissive while the transfer runs).
const PROXY_MODE: i32 = 1;

/// Synthesize the proxy map for a bundle name.
pub fn make_download_map(bundle: &str) -> Result<Vec<u8>, mapfile::MapError> {
    let file: String = bundle.chars().take(20).collect();
    let script = format!(
        "can_teleport_1 = [\n\
         demodir skirmish\n\
         getdemo 0 {file}\n\
         can_teleport_1 = []\n\
         ]\n\
         can_teleport_2 = [\n\
         addzip skirmish/{file}.dmo\n\
         demodir demo\n\
         can_teleport_2 = []\n\
         ]\n\
         say a\n"
    );

    let mut map = WorldMap::new();
    map.set_var("cloudlayer", VarValue::String(String::new()));
    map.set_var("skyboxcolour", VarValue::Int(0));
    map.set_var("maptitle", VarValue::String(script));
    map.entities.push(MapEntity::teleport(
        1,
        Vec3::new(CENTER + OFFSET, CENTER + OFFSET, CENTER),
    ));
    map.entities.push(MapEntity::teleport(
        2,
        Vec3::new(CENTER - OFFSET, CENTER - OFFSET, CENTER),
    ));
    map.encode()
}

struct SendHandle {
    accepted: mpsc::Sender<()>,
    demo: mpsc::Sender<i32>,
}

pub struct MapSender {
    sessions: Arc<SessionManager>,
    active: DashMap<u16, SendHandle>,
}

impl MapSender {
    pub fn new(sessions: Arc<SessionManager>) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            active: DashMap::new(),
        })
    }

    /// Whether a map is being sent to this session.
    pub fn is_handling(&self, session_id: u16) -> bool {
        self.active.contains_key(&session_id)
    }

    /// The player ran the maptitle script (observed as its `say a`).
    pub fn trigger_accept(&self, session_id: u16) {
        if let Some(handle) = self.active.get(&session_id) {
            let _ = handle.accepted.try_send(());
        }
    }

    /// The client's engine asked for the demo carrying the map.
    pub fn demo_requested(&self, session_id: u16, tag: i32) {
        if let Some(handle) = self.active.get(&session_id) {
            let _ = handle.demo.try_send(tag);
        }
    }

    /// Start the send flow for a session missing `map_name`. Runs in its
    /// own task bound to the current server attachment; any disconnect
    /// along the way cancels the flow and reverts the player.
    pub fn send_map(self: Arc<Self>, verse: Arc<VerseHandle>, session: Arc<Session>, map_name: String) {
        if self.is_handling(session.id) {
            return;
        }

        let (accepted_tx, accepted) = mpsc::channel(1);
        let (demo_tx, demo) = mpsc::channel(1);
        self.active.insert(
            session.id,
            SendHandle {
                accepted: accepted_tx,
                demo: demo_tx,
            },
        );

        let this = self;
        tokio::spawn(async move {
            let origin = session.server();
            let scope = session
                .server_scope()
                .unwrap_or_else(|| session.scope().clone());

            info!(session = session.id, map = %map_name, "sending map");
            let result = this
                .run_send(&scope, &verse, &session, &map_name, accepted, demo)
                .await;

            this.active.remove(&session.id);

            match result {
                Ok(()) => info!(session = session.id, map = %map_name, "map sent"),
                Err(reason) => {
                    warn!(session = session.id, map = %map_name, reason, "map send failed");
                    session
                        .message(&colors::red("we could not send you the map"))
                        .await;
                }
            }

            // Reconnect to where the player was headed, whatever happened.
            if !session.scope().is_cancelled() {
                if let Some(origin) = origin {
                    let _ = this.sessions.connect(&session, &origin).await;
                }
            }
        });
    }

    async fn run_send(
        &self,
        scope: &CancellationToken,
        verse: &VerseHandle,
        session: &Arc<Session>,
        map_name: &str,
        mut accepted: mpsc::Receiver<()>,
        mut demo: mpsc::Receiver<i32>,
    ) -> Result<(), &'static str> {
        let origin = session.server();
        let client_num = session.client_num().map(|n| n as i32).unwrap_or(-1);

        let map_bytes = verse.map_data(map_name).await.ok_or("map not found")?;
        let proxy = make_download_map(map_name).map_err(|_| "proxy map synthesis failed")?;

        self.pause(session, true, client_num).await;
        self.send_messages(
            session,
            1,
            &[Message::MapChange {
                name: "sending".into(),
                mode: PROXY_MODE,
                has_items: 0,
            }],
        )
        .await;

        Self::settle(scope, SETTLE_LONG).await?;
        self.send_messages(session, FILE_CHANNEL, &[Message::SendMap { map: proxy }])
            .await;

        session
            .message("you are missing this map. run '/do $maptitle' to download it.")
            .await;

        // Wait for the script to run.
        tokio::select! {
            _ = scope.cancelled() => return Err("canceled"),
            _ = tokio::time::sleep(ACCEPT_TIMEOUT) => return Err("player never ran the script"),
            received = accepted.recv() => {
                if received.is_none() {
                    return Err("canceled");
                }
            }
        }

        if let Some(origin) = &origin {
            origin
                .send_command(&format!("forcerespawn {client_num}"))
                .await;
        }
        Self::settle(scope, SETTLE_LONG).await?;
        self.move_client(session, CENTER + OFFSET, CENTER + OFFSET).await;
        Self::settle(scope, SETTLE_LONG).await?;
        // Physics must run for the teleporter to fire.
        self.pause(session, false, client_num).await;

        let tag = tokio::select! {
            _ = scope.cancelled() => return Err("canceled"),
            tag = demo.recv() => tag.ok_or("canceled")?,
        };

        self.send_messages(
            session,
            FILE_CHANNEL,
            &[Message::SendDemo {
                tag,
                data: map_bytes,
            }],
        )
        .await;
        Self::settle(scope, SETTLE_SHORT).await?;

        // Second teleporter mounts the demo as a map asset.
        self.pause(session, true, client_num).await;
        self.move_client(session, CENTER - OFFSET, CENTER - OFFSET).await;
        Self::settle(scope, SETTLE_SHORT).await?;
        self.pause(session, false, client_num).await;

        Ok(())
    }

    async fn settle(scope: &CancellationToken, duration: Duration) -> Result<(), &'static str> {
        tokio::select! {
            _ = scope.cancelled() => Err("canceled"),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn send_messages(&self, session: &Arc<Session>, channel: u8, batch: &[Message]) {
        let packet = GamePacket::new(channel, messages::encode_all(batch));
        session.connection.send(packet).await;
    }

    async fn pause(&self, session: &Arc<Session>, paused: bool, client_num: i32) {
        self.send_messages(
            session,
            1,
            &[Message::Paused {
                paused: paused as i32,
                client: client_num,
            }],
        )
        .await;
    }

    async fn move_client(&self, session: &Arc<Session>, x: f32, y: f32) {
        let client = session.client_num().unwrap_or(0);
        self.send_messages(
            session,
            0,
            &[Message::Pos {
                client,
                life_sequence: 0,
                x,
                y,
                z: HEIGHT,
            }],
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_map_carries_script_and_teleporters() {
        let encoded = make_download_map("complex-bundle-name-that-is-long").unwrap();
        let map = WorldMap::decode(&encoded).unwrap();

        let teleports: Vec<_> = map
            .entities
            .iter()
            .filter(|e| e.kind == mapfile::EntityKind::Teleport)
            .collect();
        assert_eq!(teleports.len(), 2);
        assert_eq!(teleports[0].attrs[2], 1);
        assert_eq!(teleports[1].attrs[2], 2);

        match map.vars.get("maptitle") {
            Some(VarValue::String(script)) => {
                // The demo name is truncated to twenty characters.
                assert!(script.contains("getdemo 0 complex-bundle-name-"));
                assert!(script.contains("addzip skirmish/complex-bundle-name-.dmo"));
                assert!(script.contains("say a"));
            }
            other => panic!("maptitle missing: {other:?}"),
        }
    }

    #[tokio::test]
    async fn handles_track_active_sessions() {
        let (sessions, _rx) = crate::session::SessionManager::new();
        let sender = MapSender::new(sessions);
        assert!(!sender.is_handling(7));
        // Triggers against unknown sessions are harmless.
        sender.trigger_accept(7);
        sender.demo_requested(7, 3);
    }
}
