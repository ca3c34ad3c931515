//! Cross-module protocol flows: whole packets the orchestrator actually
//! sees, decoded and re-encoded through the public API.

use skirmish_proto::mapfile::{MapEntity, Vec3, WorldMap};
use skirmish_proto::messages::{self, PlayerState, TeamScore};
use skirmish_proto::{Message, MessageCode, Packet, VarValue};

/// The welcome burst a freshly-connected client receives, as one packet.
#[test]
fn welcome_burst_round_trips_as_one_packet() {
    let burst = vec![
        Message::Welcome,
        Message::MapChange {
            name: "turbine".into(),
            mode: 3,
            has_items: 0,
        },
        Message::TimeUp { seconds: 540 },
        Message::TeamInfo {
            teams: vec![
                TeamScore {
                    team: "good".into(),
                    frags: 3,
                },
                TeamScore {
                    team: "evil".into(),
                    frags: 7,
                },
            ],
        },
        Message::Resume {
            players: vec![PlayerState {
                client: 0,
                life_sequence: 1,
                health: 100,
                max_health: 100,
                armour: 0,
                gun: 2,
                frags: 7,
                deaths: 2,
            }],
        },
        Message::InitClient {
            client: 0,
            name: "rival".into(),
            team: "evil".into(),
            model: 0,
        },
    ];

    let encoded = messages::encode_all(&burst);
    let decoded = messages::decode(&encoded).expect("welcome burst decodes");
    assert_eq!(decoded, burst);

    // Re-encoding the decoded sequence is stable.
    assert_eq!(messages::encode_all(&decoded), encoded);
}

/// A mixed gameplay packet keeps message order across kinds.
#[test]
fn gameplay_packet_preserves_order() {
    let batch = vec![
        Message::Pos {
            client: 4,
            life_sequence: 2,
            x: 128.0,
            y: 256.5,
            z: 512.0,
        },
        Message::Text {
            text: "nice shot".into(),
        },
        Message::Died {
            client: 4,
            killer: 1,
            frags: 12,
            victim_frags: 3,
        },
        Message::ClientPing { ping: 35 },
    ];

    let decoded = messages::decode(&messages::encode_all(&batch)).unwrap();
    let codes: Vec<MessageCode> = decoded.iter().map(Message::code).collect();
    assert_eq!(
        codes,
        vec![
            MessageCode::Pos,
            MessageCode::Text,
            MessageCode::Died,
            MessageCode::ClientPing,
        ]
    );
    assert_eq!(decoded, batch);
}

/// A truncated packet fails cleanly instead of producing garbage.
#[test]
fn truncated_packet_is_rejected() {
    let encoded = messages::encode_all(&[Message::MapCrc {
        name: "turbine".into(),
        crc: 0x1badb002u32 as i32,
    }]);
    assert!(messages::decode(&encoded[..encoded.len() - 2]).is_err());
}

/// The proxy-map flow: synthesize, ship as a file payload, decode on the
/// other side, and confirm what the client engine would see.
#[test]
fn proxy_map_survives_the_file_channel() {
    let mut map = WorldMap::new();
    map.set_var(
        "maptitle",
        VarValue::String("can_teleport_1 = [ getdemo 0 turbine ]".into()),
    );
    map.entities
        .push(MapEntity::teleport(1, Vec3::new(522.0, 522.0, 512.0)));
    map.entities
        .push(MapEntity::teleport(2, Vec3::new(502.0, 502.0, 512.0)));
    let ogz = map.encode().unwrap();

    // Crosses the wire inside a SendMap message on the file channel.
    let wire = messages::encode_all(&[Message::SendMap { map: ogz.clone() }]);
    let decoded = messages::decode(&wire).unwrap();
    let Message::SendMap { map: payload } = &decoded[0] else {
        panic!("expected SendMap");
    };
    assert_eq!(payload, &ogz);

    let received = WorldMap::decode(payload).unwrap();
    assert_eq!(received, map);
    assert_eq!(received.entities.len(), 2);
}

/// Raw packet primitives compose with message framing.
#[test]
fn hand_built_packet_matches_encoder() {
    let mut by_hand = Packet::new();
    by_hand.put_int(MessageCode::ServerMessage as i32);
    by_hand.put_string("hello");

    let encoded = messages::encode_all(&[Message::ServerMessage {
        text: "hello".into(),
    }]);
    assert_eq!(by_hand.into_vec(), encoded);
}
