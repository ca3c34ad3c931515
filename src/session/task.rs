//! The per-session coordinating task.
//!
//! One task per session drives both directions: ingress packets decode,
//! pass through the client-side pipeline, and go to the attached server;
//! server packets pass through the server-side pipeline and go to the
//! client, with non-essential traffic held back while the client loads a
//! map. Two helper tasks own the interception taps that feed the command
//! router, the matchmaker hooks, the map sender, and the auth path.

use crate::cluster::Cluster;
use crate::session::{AttachmentStatus, Session, SessionBundle};
use skirmish_proto::{colors, messages, GamePacket, Message, MessageCode};
use std::sync::Arc;
use tracing::{debug, info};

/// Longest chat line the protocol allows; the rest is cut.
const MAX_CHAT_LEN: usize = 260;

/// Gameplay traffic that would get the client kicked for protocol
/// violations if delivered mid-map-load.
fn deferred_during_load(code: MessageCode) -> bool {
    use MessageCode as C;
    matches!(
        code,
        C::Pos
            | C::Shoot
            | C::Explode
            | C::Suicide
            | C::Died
            | C::Damage
            | C::HitPush
            | C::Sound
            | C::GunSelect
            | C::Taunt
            | C::ItemSpawn
            | C::ItemPickup
            | C::ItemAcc
            | C::Teleport
            | C::JumpPad
    ) || code.is_edit()
}

pub async fn run_session(cluster: Arc<Cluster>, bundle: SessionBundle) {
    let SessionBundle {
        session,
        mut events,
        mut server_packets,
    } = bundle;

    tokio::spawn(watch_from_client(cluster.clone(), session.clone()));
    tokio::spawn(watch_to_client(cluster.clone(), session.clone()));

    // Map-load queueing state: set when a map change heads to the client,
    // cleared when the client acknowledges with a CRC.
    let mut loading_map = false;
    let mut held: Vec<GamePacket> = Vec::new();

    let mut commands_open = true;
    let mut auth_open = true;

    loop {
        tokio::select! {
            _ = session.scope().cancelled() => break,

            packet = events.packets.recv() => match packet {
                Some(packet) => {
                    client_packet(&session, packet, &mut loading_map, &mut held).await;
                }
                None => break,
            },

            packet = server_packets.recv() => match packet {
                Some(packet) => {
                    server_packet(&session, packet, &mut loading_map, &mut held).await;
                }
                None => break,
            },

            command = events.commands.recv(), if commands_open => match command {
                Some(command) => {
                    let cluster = cluster.clone();
                    let session = session.clone();
                    tokio::spawn(async move {
                        let input = command.strip_prefix('#').unwrap_or(&command);
                        cluster.run_command(&session, input).await;
                    });
                }
                None => commands_open = false,
            },

            token = events.auth.recv(), if auth_open => match token {
                Some(token) => cluster.authenticate(&session, &token).await,
                None => auth_open = false,
            },
        }
    }

    info!(session = session.id, "session ended");
    cluster.matchmaker.dequeue(&session).await;
    cluster.notify_presence(&session, false).await;
    cluster.sessions.remove(&session).await;
}

/// One inbound packet from the ingress.
async fn client_packet(
    session: &Arc<Session>,
    packet: GamePacket,
    loading_map: &mut bool,
    held: &mut Vec<GamePacket>,
) {
    let decoded = match messages::decode(&packet.data) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(session = session.id, error = %e, "client -> server (failed to decode)");
            return;
        }
    };

    let mut survivors = Vec::with_capacity(decoded.len());
    for message in decoded {
        let code = message.code();
        if !code.is_spammy() {
            debug!(session = session.id, code = ?code, "client -> server");
        }
        if let Some(message) = session.from_client.process(packet.channel, message).await {
            survivors.push(message);
        }
    }

    // The client acknowledged the map; release everything we held back.
    if *loading_map
        && survivors
            .iter()
            .any(|m| matches!(m, Message::MapCrc { .. }))
    {
        *loading_map = false;
        for packet in held.drain(..) {
            session.connection.send(packet).await;
        }
    }

    if survivors.is_empty() {
        return;
    }
    let Some(server) = session.server() else {
        return;
    };
    server
        .send_data(
            session.id,
            packet.channel as u32,
            messages::encode_all(&survivors),
        )
        .await;
}

/// One packet from the attached server toward the client.
async fn server_packet(
    session: &Arc<Session>,
    packet: GamePacket,
    loading_map: &mut bool,
    held: &mut Vec<GamePacket>,
) {
    let decoded = match messages::decode(&packet.data) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(session = session.id, error = %e, "server -> client (failed to decode)");
            return;
        }
    };

    let mut deliver: Vec<Message> = Vec::new();
    let mut defer: Vec<Message> = Vec::new();

    for message in decoded {
        let code = message.code();
        if !code.is_spammy() {
            debug!(session = session.id, code = ?code, "server -> client");
        }
        let Some(message) = session.to_client.process(packet.channel, message).await else {
            continue;
        };

        if matches!(message, Message::MapChange { .. }) {
            *loading_map = true;
        }

        if *loading_map && deferred_during_load(message.code()) {
            defer.push(message);
        } else {
            deliver.push(message);
        }
    }

    if !defer.is_empty() {
        held.push(GamePacket::new(
            packet.channel,
            messages::encode_all(&defer),
        ));
    }
    if !deliver.is_empty() {
        session
            .connection
            .send(GamePacket::new(
                packet.channel,
                messages::encode_all(&deliver),
            ))
            .await;
    }
}

/// Taps on the client-to-server stream.
async fn watch_from_client(cluster: Arc<Cluster>, session: Arc<Session>) {
    let mut chats = session.from_client.intercept(&[MessageCode::Text]);
    let mut connects = session.from_client.intercept(&[MessageCode::Connect]);
    let mut names = session.from_client.intercept(&[MessageCode::SwitchName]);
    let mut crcs = session.from_client.intercept(&[MessageCode::MapCrc]);
    let mut votes = session.from_client.intercept(&[MessageCode::MapVote]);
    let mut teleports = session.from_client.intercept(&[MessageCode::Teleport]);
    let mut demos = session.from_client.intercept(&[MessageCode::GetDemo]);
    let mut edits = session.from_client.intercept_with(MessageCode::is_edit);
    // Everything not permitted while the attachment is still being
    // confirmed is swallowed; it would get the client kicked.
    let mut gate = session
        .from_client
        .intercept_with(|code| !code.is_connecting());

    loop {
        tokio::select! {
            _ = session.scope().cancelled() => return,

            Some(msg) = chats.recv() => {
                let Message::Text { text } = msg.message.clone() else {
                    msg.pass();
                    continue;
                };
                msg.discard();
                handle_chat(&cluster, &session, text).await;
            }

            Some(msg) = connects.recv() => {
                if let Message::Connect { name, auth_name, auth_description, .. } = msg.message.clone() {
                    session.set_name(name);
                    msg.pass();
                    if !session.was_greeted() {
                        if auth_description == cluster.auth_domain && !auth_name.is_empty() {
                            cluster.authenticate(&session, &auth_name).await;
                        } else {
                            cluster.greet(&session).await;
                        }
                    }
                } else {
                    msg.pass();
                }
            }

            Some(msg) = names.recv() => {
                if let Message::SwitchName { name } = msg.message.clone() {
                    let old = session.name();
                    session.set_name(name);
                    msg.pass();
                    cluster.notify_name_change(&session, &old).await;
                } else {
                    msg.pass();
                }
            }

            Some(msg) = crcs.recv() => {
                let crc = match &msg.message {
                    Message::MapCrc { name, crc } => Some((name.clone(), *crc)),
                    _ => None,
                };
                msg.pass();
                if let Some((map, 0)) = crc {
                    // The client does not have the map; push it in-band.
                    cluster
                        .mapsend
                        .clone()
                        .send_map(cluster.verse.clone(), session.clone(), map);
                }
            }

            Some(msg) = votes.recv() => handle_vote(&cluster, &session, msg).await,

            Some(msg) = teleports.recv() => {
                let source = match &msg.message {
                    Message::Teleport { source, .. } => Some(*source),
                    _ => None,
                };
                msg.pass();
                if let Some(source) = source {
                    cluster.clone().handle_teleport(&session, source).await;
                }
            }

            Some(msg) = demos.recv() => {
                if cluster.mapsend.is_handling(session.id) {
                    if let Message::GetDemo { tag } = msg.message {
                        cluster.mapsend.demo_requested(session.id, tag);
                    }
                    msg.discard();
                } else {
                    msg.pass();
                }
            }

            Some(msg) = edits.recv() => {
                match cluster.edit_denial(&session) {
                    None => msg.pass(),
                    Some(reason) => {
                        msg.discard();
                        session.message(reason).await;
                    }
                }
            }

            Some(msg) = gate.recv() => {
                if session.status() == AttachmentStatus::Connecting {
                    msg.discard();
                } else {
                    msg.pass();
                }
            }
        }
    }
}

async fn handle_chat(cluster: &Arc<Cluster>, session: &Arc<Session>, mut text: String) {
    if text.len() > MAX_CHAT_LEN {
        let cut = text.len() - MAX_CHAT_LEN;
        text.truncate(MAX_CHAT_LEN);
        session
            .message(&colors::red(&format!(
                "your message was too long; we cut off the last {cut} characters"
            )))
            .await;
    }

    if let Some(command) = text.strip_prefix('#') {
        let cluster = cluster.clone();
        let session = session.clone();
        let command = command.to_string();
        tokio::spawn(async move {
            cluster.run_command(&session, &command).await;
        });
        return;
    }

    // The map-send script announces itself with a bare "a".
    if text == "a" && cluster.mapsend.is_handling(session.id) {
        cluster.mapsend.trigger_accept(session.id);
        return;
    }

    cluster.forward_global_chat(session, &text).await;
}

async fn handle_vote(
    cluster: &Arc<Cluster>,
    session: &Arc<Session>,
    msg: crate::session::pipeline::InterceptedMessage,
) {
    let Message::MapVote { name, mode } = msg.message.clone() else {
        msg.pass();
        return;
    };

    // Only spaces that opt into vote-driven creation take over the vote.
    let voting_creates = session
        .server()
        .and_then(|server| cluster.spaces.find_instance(&server.id))
        .map(|instance| instance.space.voting_creates)
        .unwrap_or(false);
    let mode_name = crate::commands::MODE_NAMES.get(mode as usize);

    match (voting_creates, mode_name) {
        (true, Some(mode_name)) => {
            msg.discard();
            let cluster = cluster.clone();
            let session = session.clone();
            let command = format!("creategame {mode_name} {name}");
            tokio::spawn(async move {
                cluster.run_command(&session, &command).await;
            });
        }
        _ => msg.pass(),
    }
}

/// Taps on the server-to-client stream.
async fn watch_to_client(cluster: Arc<Cluster>, session: Arc<Session>) {
    let mut infos = session.to_client.intercept(&[MessageCode::ServerInfo]);

    loop {
        tokio::select! {
            _ = session.scope().cancelled() => return,

            Some(msg) = infos.recv() => {
                let Message::ServerInfo {
                    client,
                    protocol,
                    session: server_session,
                    has_password,
                    description,
                    domain,
                } = msg.message.clone() else {
                    msg.pass();
                    continue;
                };

                session.set_client_num(Some(client));

                // Ask an ungreeted client to identify itself: the domain
                // makes it fill the auth fields of its connect message.
                let domain = if session.was_greeted() {
                    domain
                } else {
                    cluster.auth_domain.clone()
                };
                msg.replace(Message::ServerInfo {
                    client,
                    protocol,
                    session: server_session,
                    has_password,
                    description,
                    domain,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gameplay_defers_during_load_but_welcome_does_not() {
        assert!(deferred_during_load(MessageCode::Pos));
        assert!(deferred_during_load(MessageCode::Shoot));
        assert!(deferred_during_load(MessageCode::EditFace));
        assert!(!deferred_during_load(MessageCode::Welcome));
        assert!(!deferred_during_load(MessageCode::MapChange));
        assert!(!deferred_during_load(MessageCode::InitClient));
        assert!(!deferred_during_load(MessageCode::ServerMessage));
        assert!(!deferred_during_load(MessageCode::SendDemo));
    }
}
