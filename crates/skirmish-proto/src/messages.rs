//! The closed-world game message catalog.
//!
//! Every message the protocol can carry is listed here with a hand-written
//! encoder and decoder keyed by its numeric code. Decoding a packet yields
//! the full ordered sequence of messages in its body; an unknown code is a
//! protocol violation and poisons the remainder of the packet, since the
//! stream is self-delimiting only for known shapes.

use crate::packet::{Packet, PacketError};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown message code {0}")]
    UnknownCode(i32),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

macro_rules! message_codes {
    ($($name:ident = $code:literal),+ $(,)?) => {
        /// Numeric message codes, in wire order.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i32)]
        pub enum MessageCode {
            $($name = $code),+
        }

        impl MessageCode {
            pub fn from_wire(code: i32) -> Option<Self> {
                match code {
                    $($code => Some(Self::$name),)+
                    _ => None,
                }
            }
        }
    };
}

message_codes! {
    Connect = 0,
    ServerInfo = 1,
    Welcome = 2,
    InitClient = 3,
    Pos = 4,
    Text = 5,
    Sound = 6,
    ClientDisconnected = 7,
    Shoot = 8,
    Explode = 9,
    Suicide = 10,
    Died = 11,
    Damage = 12,
    HitPush = 13,
    TrySpawn = 14,
    SpawnState = 15,
    Spawn = 16,
    ForceDeath = 17,
    GunSelect = 18,
    Taunt = 19,
    MapChange = 20,
    MapVote = 21,
    TeamInfo = 22,
    ItemSpawn = 23,
    ItemPickup = 24,
    ItemAcc = 25,
    Teleport = 26,
    JumpPad = 27,
    Ping = 28,
    Pong = 29,
    ClientPing = 30,
    TimeUp = 31,
    ServerMessage = 32,
    Resume = 33,
    Paused = 34,
    MapCrc = 35,
    CheckMaps = 36,
    SwitchName = 37,
    SwitchTeam = 38,
    EditMode = 39,
    EditEntity = 40,
    EditFace = 41,
    EditTexture = 42,
    EditMaterial = 43,
    EditVar = 44,
    Copy = 45,
    Paste = 46,
    Flip = 47,
    Rotate = 48,
    Replace = 49,
    DeleteCubes = 50,
    Remip = 51,
    Undo = 52,
    Redo = 53,
    NewMap = 54,
    GetMap = 55,
    SendMap = 56,
    GetDemo = 57,
    SendDemo = 58,
}

impl MessageCode {
    /// Frequent, small messages that skip verbose logging.
    pub fn is_spammy(self) -> bool {
        matches!(
            self,
            Self::Pos | Self::Ping | Self::Pong | Self::ClientPing | Self::Sound
        )
    }

    /// Messages a client may send while its server attachment is still
    /// being confirmed. Everything else is held back so the game server
    /// does not disconnect the client for protocol violations mid-switch.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::Connect | Self::MapCrc | Self::Ping | Self::ClientPing | Self::Pos
        )
    }

    /// World-mutating edit messages, gated by the edit-permission policy.
    pub fn is_edit(self) -> bool {
        (Self::EditMode as i32..=Self::NewMap as i32).contains(&(self as i32))
    }
}

/// One ray hit inside a shot or explosion report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hit {
    pub target: i32,
    pub life_sequence: i32,
    pub dist: i32,
    pub rays: i32,
    pub dir: [i32; 3],
}

/// A cube selection box shared by all edit messages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selection {
    pub origin: [i32; 3],
    pub size: [i32; 3],
    pub grid: i32,
    pub orient: i32,
    pub corner: [i32; 5],
}

/// One team's score line inside a `TeamInfo` burst.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamScore {
    pub team: String,
    pub frags: i32,
}

/// One player snapshot inside a `Resume` burst.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlayerState {
    pub client: i32,
    pub life_sequence: i32,
    pub health: i32,
    pub max_health: i32,
    pub armour: i32,
    pub gun: i32,
    pub frags: i32,
    pub deaths: i32,
}

/// A typed configuration variable value (edit vars and map vars).
#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Int(i32),
    Float(f32),
    String(String),
}

/// Every message the protocol can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Connect {
        name: String,
        model: i32,
        auth_name: String,
        auth_description: String,
    },
    ServerInfo {
        client: u32,
        protocol: i32,
        session: i32,
        has_password: i32,
        description: String,
        domain: String,
    },
    Welcome,
    InitClient {
        client: u32,
        name: String,
        team: String,
        model: i32,
    },
    Pos {
        client: u32,
        life_sequence: i32,
        x: f32,
        y: f32,
        z: f32,
    },
    Text {
        text: String,
    },
    Sound {
        sound: i32,
    },
    ClientDisconnected {
        client: u32,
    },
    Shoot {
        id: i32,
        gun: i32,
        from: [f32; 3],
        to: [f32; 3],
        hits: Vec<Hit>,
    },
    Explode {
        cmillis: i32,
        gun: i32,
        id: i32,
        hits: Vec<Hit>,
    },
    Suicide,
    Died {
        client: i32,
        killer: i32,
        frags: i32,
        victim_frags: i32,
    },
    Damage {
        client: i32,
        aggressor: i32,
        damage: i32,
    },
    HitPush {
        client: i32,
        gun: i32,
        damage: i32,
        dir: [i32; 3],
    },
    TrySpawn,
    SpawnState {
        client: u32,
        life_sequence: i32,
        health: i32,
        max_health: i32,
        armour: i32,
        gun: i32,
    },
    Spawn {
        life_sequence: i32,
        gun: i32,
    },
    ForceDeath {
        client: u32,
    },
    GunSelect {
        gun: i32,
    },
    Taunt,
    MapChange {
        name: String,
        mode: i32,
        has_items: i32,
    },
    MapVote {
        name: String,
        mode: i32,
    },
    TeamInfo {
        teams: Vec<TeamScore>,
    },
    ItemSpawn {
        index: i32,
    },
    ItemPickup {
        index: i32,
    },
    ItemAcc {
        index: i32,
        client: u32,
    },
    Teleport {
        client: u32,
        source: i32,
        destination: i32,
    },
    JumpPad {
        client: u32,
        pad: i32,
    },
    Ping {
        cmillis: i32,
    },
    Pong {
        cmillis: i32,
    },
    ClientPing {
        ping: i32,
    },
    TimeUp {
        seconds: i32,
    },
    ServerMessage {
        text: String,
    },
    Resume {
        players: Vec<PlayerState>,
    },
    Paused {
        paused: i32,
        client: i32,
    },
    MapCrc {
        name: String,
        crc: i32,
    },
    CheckMaps,
    SwitchName {
        name: String,
    },
    SwitchTeam {
        team: String,
    },
    EditMode {
        on: i32,
    },
    EditEntity {
        index: i32,
        x: f32,
        y: f32,
        z: f32,
        kind: i32,
        attrs: [i32; 5],
    },
    EditFace {
        sel: Selection,
        dir: i32,
        mode: i32,
    },
    EditTexture {
        sel: Selection,
        tex: i32,
        all_faces: i32,
    },
    EditMaterial {
        sel: Selection,
        material: i32,
    },
    EditVar {
        name: String,
        value: VarValue,
    },
    Copy {
        sel: Selection,
    },
    Paste {
        sel: Selection,
    },
    Flip {
        sel: Selection,
    },
    Rotate {
        sel: Selection,
        dir: i32,
    },
    Replace {
        sel: Selection,
        tex: i32,
        new_tex: i32,
        in_selection: i32,
    },
    DeleteCubes {
        sel: Selection,
    },
    Remip,
    Undo,
    Redo,
    NewMap {
        size: i32,
    },
    GetMap,
    SendMap {
        map: Vec<u8>,
    },
    GetDemo {
        tag: i32,
    },
    SendDemo {
        tag: i32,
        data: Vec<u8>,
    },
}

fn put_hits(p: &mut Packet, hits: &[Hit]) {
    p.put_int(hits.len() as i32);
    for hit in hits {
        p.put_int(hit.target);
        p.put_int(hit.life_sequence);
        p.put_int(hit.dist);
        p.put_int(hit.rays);
        for d in hit.dir {
            p.put_int(d);
        }
    }
}

fn get_hits(p: &mut Packet) -> Result<Vec<Hit>, MessageError> {
    let count = p.get_int()?.max(0) as usize;
    let mut hits = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        hits.push(Hit {
            target: p.get_int()?,
            life_sequence: p.get_int()?,
            dist: p.get_int()?,
            rays: p.get_int()?,
            dir: [p.get_int()?, p.get_int()?, p.get_int()?],
        });
    }
    Ok(hits)
}

fn put_selection(p: &mut Packet, sel: &Selection) {
    for v in sel.origin {
        p.put_int(v);
    }
    for v in sel.size {
        p.put_int(v);
    }
    p.put_int(sel.grid);
    p.put_int(sel.orient);
    for v in sel.corner {
        p.put_int(v);
    }
}

fn get_selection(p: &mut Packet) -> Result<Selection, MessageError> {
    Ok(Selection {
        origin: [p.get_int()?, p.get_int()?, p.get_int()?],
        size: [p.get_int()?, p.get_int()?, p.get_int()?],
        grid: p.get_int()?,
        orient: p.get_int()?,
        corner: [
            p.get_int()?,
            p.get_int()?,
            p.get_int()?,
            p.get_int()?,
            p.get_int()?,
        ],
    })
}

impl Message {
    pub fn code(&self) -> MessageCode {
        use MessageCode as C;
        match self {
            Self::Connect { .. } => C::Connect,
            Self::ServerInfo { .. } => C::ServerInfo,
            Self::Welcome => C::Welcome,
            Self::InitClient { .. } => C::InitClient,
            Self::Pos { .. } => C::Pos,
            Self::Text { .. } => C::Text,
            Self::Sound { .. } => C::Sound,
            Self::ClientDisconnected { .. } => C::ClientDisconnected,
            Self::Shoot { .. } => C::Shoot,
            Self::Explode { .. } => C::Explode,
            Self::Suicide => C::Suicide,
            Self::Died { .. } => C::Died,
            Self::Damage { .. } => C::Damage,
            Self::HitPush { .. } => C::HitPush,
            Self::TrySpawn => C::TrySpawn,
            Self::SpawnState { .. } => C::SpawnState,
            Self::Spawn { .. } => C::Spawn,
            Self::ForceDeath { .. } => C::ForceDeath,
            Self::GunSelect { .. } => C::GunSelect,
            Self::Taunt => C::Taunt,
            Self::MapChange { .. } => C::MapChange,
            Self::MapVote { .. } => C::MapVote,
            Self::TeamInfo { .. } => C::TeamInfo,
            Self::ItemSpawn { .. } => C::ItemSpawn,
            Self::ItemPickup { .. } => C::ItemPickup,
            Self::ItemAcc { .. } => C::ItemAcc,
            Self::Teleport { .. } => C::Teleport,
            Self::JumpPad { .. } => C::JumpPad,
            Self::Ping { .. } => C::Ping,
            Self::Pong { .. } => C::Pong,
            Self::ClientPing { .. } => C::ClientPing,
            Self::TimeUp { .. } => C::TimeUp,
            Self::ServerMessage { .. } => C::ServerMessage,
            Self::Resume { .. } => C::Resume,
            Self::Paused { .. } => C::Paused,
            Self::MapCrc { .. } => C::MapCrc,
            Self::CheckMaps => C::CheckMaps,
            Self::SwitchName { .. } => C::SwitchName,
            Self::SwitchTeam { .. } => C::SwitchTeam,
            Self::EditMode { .. } => C::EditMode,
            Self::EditEntity { .. } => C::EditEntity,
            Self::EditFace { .. } => C::EditFace,
            Self::EditTexture { .. } => C::EditTexture,
            Self::EditMaterial { .. } => C::EditMaterial,
            Self::EditVar { .. } => C::EditVar,
            Self::Copy { .. } => C::Copy,
            Self::Paste { .. } => C::Paste,
            Self::Flip { .. } => C::Flip,
            Self::Rotate { .. } => C::Rotate,
            Self::Replace { .. } => C::Replace,
            Self::DeleteCubes { .. } => C::DeleteCubes,
            Self::Remip => C::Remip,
            Self::Undo => C::Undo,
            Self::Redo => C::Redo,
            Self::NewMap { .. } => C::NewMap,
            Self::GetMap => C::GetMap,
            Self::SendMap { .. } => C::SendMap,
            Self::GetDemo { .. } => C::GetDemo,
            Self::SendDemo { .. } => C::SendDemo,
        }
    }

    /// Append this message (code and body) to a packet.
    pub fn encode_into(&self, p: &mut Packet) {
        p.put_int(self.code() as i32);
        match self {
            Self::Connect {
                name,
                model,
                auth_name,
                auth_description,
            } => {
                p.put_string(name);
                p.put_int(*model);
                p.put_string(auth_name);
                p.put_string(auth_description);
            }
            Self::ServerInfo {
                client,
                protocol,
                session,
                has_password,
                description,
                domain,
            } => {
                p.put_uint(*client);
                p.put_int(*protocol);
                p.put_int(*session);
                p.put_int(*has_password);
                p.put_string(description);
                p.put_string(domain);
            }
            Self::Welcome
            | Self::Suicide
            | Self::TrySpawn
            | Self::Taunt
            | Self::CheckMaps
            | Self::Remip
            | Self::Undo
            | Self::Redo
            | Self::GetMap => {}
            Self::InitClient {
                client,
                name,
                team,
                model,
            } => {
                p.put_uint(*client);
                p.put_string(name);
                p.put_string(team);
                p.put_int(*model);
            }
            Self::Pos {
                client,
                life_sequence,
                x,
                y,
                z,
            } => {
                p.put_uint(*client);
                p.put_int(*life_sequence);
                p.put_coord(*x);
                p.put_coord(*y);
                p.put_coord(*z);
            }
            Self::Text { text } => p.put_string(text),
            Self::Sound { sound } => p.put_int(*sound),
            Self::ClientDisconnected { client } => p.put_uint(*client),
            Self::Shoot {
                id,
                gun,
                from,
                to,
                hits,
            } => {
                p.put_int(*id);
                p.put_int(*gun);
                for v in from {
                    p.put_coord(*v);
                }
                for v in to {
                    p.put_coord(*v);
                }
                put_hits(p, hits);
            }
            Self::Explode {
                cmillis,
                gun,
                id,
                hits,
            } => {
                p.put_int(*cmillis);
                p.put_int(*gun);
                p.put_int(*id);
                put_hits(p, hits);
            }
            Self::Died {
                client,
                killer,
                frags,
                victim_frags,
            } => {
                p.put_int(*client);
                p.put_int(*killer);
                p.put_int(*frags);
                p.put_int(*victim_frags);
            }
            Self::Damage {
                client,
                aggressor,
                damage,
            } => {
                p.put_int(*client);
                p.put_int(*aggressor);
                p.put_int(*damage);
            }
            Self::HitPush {
                client,
                gun,
                damage,
                dir,
            } => {
                p.put_int(*client);
                p.put_int(*gun);
                p.put_int(*damage);
                for v in dir {
                    p.put_int(*v);
                }
            }
            Self::SpawnState {
                client,
                life_sequence,
                health,
                max_health,
                armour,
                gun,
            } => {
                p.put_uint(*client);
                p.put_int(*life_sequence);
                p.put_int(*health);
                p.put_int(*max_health);
                p.put_int(*armour);
                p.put_int(*gun);
            }
            Self::Spawn { life_sequence, gun } => {
                p.put_int(*life_sequence);
                p.put_int(*gun);
            }
            Self::ForceDeath { client } => p.put_uint(*client),
            Self::GunSelect { gun } => p.put_int(*gun),
            Self::MapChange {
                name,
                mode,
                has_items,
            } => {
                p.put_string(name);
                p.put_int(*mode);
                p.put_int(*has_items);
            }
            Self::MapVote { name, mode } => {
                p.put_string(name);
                p.put_int(*mode);
            }
            Self::TeamInfo { teams } => {
                for team in teams {
                    p.put_string(&team.team);
                    p.put_int(team.frags);
                }
                p.put_string("");
            }
            Self::ItemSpawn { index } | Self::ItemPickup { index } => p.put_int(*index),
            Self::ItemAcc { index, client } => {
                p.put_int(*index);
                p.put_uint(*client);
            }
            Self::Teleport {
                client,
                source,
                destination,
            } => {
                p.put_uint(*client);
                p.put_int(*source);
                p.put_int(*destination);
            }
            Self::JumpPad { client, pad } => {
                p.put_uint(*client);
                p.put_int(*pad);
            }
            Self::Ping { cmillis } | Self::Pong { cmillis } => p.put_int(*cmillis),
            Self::ClientPing { ping } => p.put_int(*ping),
            Self::TimeUp { seconds } => p.put_int(*seconds),
            Self::ServerMessage { text } => p.put_string(text),
            Self::Resume { players } => {
                for player in players {
                    p.put_int(player.client);
                    p.put_int(player.life_sequence);
                    p.put_int(player.health);
                    p.put_int(player.max_health);
                    p.put_int(player.armour);
                    p.put_int(player.gun);
                    p.put_int(player.frags);
                    p.put_int(player.deaths);
                }
                p.put_int(-1);
            }
            Self::Paused { paused, client } => {
                p.put_int(*paused);
                p.put_int(*client);
            }
            Self::MapCrc { name, crc } => {
                p.put_string(name);
                p.put_int(*crc);
            }
            Self::SwitchName { name } => p.put_string(name),
            Self::SwitchTeam { team } => p.put_string(team),
            Self::EditMode { on } => p.put_int(*on),
            Self::EditEntity {
                index,
                x,
                y,
                z,
                kind,
                attrs,
            } => {
                p.put_int(*index);
                p.put_coord(*x);
                p.put_coord(*y);
                p.put_coord(*z);
                p.put_int(*kind);
                for a in attrs {
                    p.put_int(*a);
                }
            }
            Self::EditFace { sel, dir, mode } => {
                put_selection(p, sel);
                p.put_int(*dir);
                p.put_int(*mode);
            }
            Self::EditTexture {
                sel,
                tex,
                all_faces,
            } => {
                put_selection(p, sel);
                p.put_int(*tex);
                p.put_int(*all_faces);
            }
            Self::EditMaterial { sel, material } => {
                put_selection(p, sel);
                p.put_int(*material);
            }
            Self::EditVar { name, value } => {
                match value {
                    VarValue::Int(_) => p.put_int(0),
                    VarValue::Float(_) => p.put_int(1),
                    VarValue::String(_) => p.put_int(2),
                }
                p.put_string(name);
                match value {
                    VarValue::Int(v) => p.put_int(*v),
                    VarValue::Float(v) => p.put_float(*v),
                    VarValue::String(v) => p.put_string(v),
                }
            }
            Self::Copy { sel } | Self::Paste { sel } | Self::Flip { sel } | Self::DeleteCubes { sel } => {
                put_selection(p, sel)
            }
            Self::Rotate { sel, dir } => {
                put_selection(p, sel);
                p.put_int(*dir);
            }
            Self::Replace {
                sel,
                tex,
                new_tex,
                in_selection,
            } => {
                put_selection(p, sel);
                p.put_int(*tex);
                p.put_int(*new_tex);
                p.put_int(*in_selection);
            }
            Self::NewMap { size } => p.put_int(*size),
            Self::SendMap { map } => p.put_raw(map),
            Self::GetDemo { tag } => p.put_int(*tag),
            Self::SendDemo { tag, data } => {
                p.put_int(*tag);
                p.put_int(data.len() as i32);
                p.put_raw(data);
            }
        }
    }

    /// Encode a single message as a standalone payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut p = Packet::new();
        self.encode_into(&mut p);
        p.into_vec()
    }

    fn decode_body(code: MessageCode, p: &mut Packet) -> Result<Self, MessageError> {
        use MessageCode as C;
        Ok(match code {
            C::Connect => Self::Connect {
                name: p.get_string()?,
                model: p.get_int()?,
                auth_name: p.get_string()?,
                auth_description: p.get_string()?,
            },
            C::ServerInfo => Self::ServerInfo {
                client: p.get_uint()?,
                protocol: p.get_int()?,
                session: p.get_int()?,
                has_password: p.get_int()?,
                description: p.get_string()?,
                domain: p.get_string()?,
            },
            C::Welcome => Self::Welcome,
            C::InitClient => Self::InitClient {
                client: p.get_uint()?,
                name: p.get_string()?,
                team: p.get_string()?,
                model: p.get_int()?,
            },
            C::Pos => Self::Pos {
                client: p.get_uint()?,
                life_sequence: p.get_int()?,
                x: p.get_coord()?,
                y: p.get_coord()?,
                z: p.get_coord()?,
            },
            C::Text => Self::Text {
                text: p.get_string()?,
            },
            C::Sound => Self::Sound {
                sound: p.get_int()?,
            },
            C::ClientDisconnected => Self::ClientDisconnected {
                client: p.get_uint()?,
            },
            C::Shoot => Self::Shoot {
                id: p.get_int()?,
                gun: p.get_int()?,
                from: [p.get_coord()?, p.get_coord()?, p.get_coord()?],
                to: [p.get_coord()?, p.get_coord()?, p.get_coord()?],
                hits: get_hits(p)?,
            },
            C::Explode => Self::Explode {
                cmillis: p.get_int()?,
                gun: p.get_int()?,
                id: p.get_int()?,
                hits: get_hits(p)?,
            },
            C::Suicide => Self::Suicide,
            C::Died => Self::Died {
                client: p.get_int()?,
                killer: p.get_int()?,
                frags: p.get_int()?,
                victim_frags: p.get_int()?,
            },
            C::Damage => Self::Damage {
                client: p.get_int()?,
                aggressor: p.get_int()?,
                damage: p.get_int()?,
            },
            C::HitPush => Self::HitPush {
                client: p.get_int()?,
                gun: p.get_int()?,
                damage: p.get_int()?,
                dir: [p.get_int()?, p.get_int()?, p.get_int()?],
            },
            C::TrySpawn => Self::TrySpawn,
            C::SpawnState => Self::SpawnState {
                client: p.get_uint()?,
                life_sequence: p.get_int()?,
                health: p.get_int()?,
                max_health: p.get_int()?,
                armour: p.get_int()?,
                gun: p.get_int()?,
            },
            C::Spawn => Self::Spawn {
                life_sequence: p.get_int()?,
                gun: p.get_int()?,
            },
            C::ForceDeath => Self::ForceDeath {
                client: p.get_uint()?,
            },
            C::GunSelect => Self::GunSelect { gun: p.get_int()? },
            C::Taunt => Self::Taunt,
            C::MapChange => Self::MapChange {
                name: p.get_string()?,
                mode: p.get_int()?,
                has_items: p.get_int()?,
            },
            C::MapVote => Self::MapVote {
                name: p.get_string()?,
                mode: p.get_int()?,
            },
            C::TeamInfo => {
                let mut teams = Vec::new();
                loop {
                    let team = p.get_string()?;
                    if team.is_empty() {
                        break;
                    }
                    teams.push(TeamScore {
                        team,
                        frags: p.get_int()?,
                    });
                }
                Self::TeamInfo { teams }
            }
            C::ItemSpawn => Self::ItemSpawn {
                index: p.get_int()?,
            },
            C::ItemPickup => Self::ItemPickup {
                index: p.get_int()?,
            },
            C::ItemAcc => Self::ItemAcc {
                index: p.get_int()?,
                client: p.get_uint()?,
            },
            C::Teleport => Self::Teleport {
                client: p.get_uint()?,
                source: p.get_int()?,
                destination: p.get_int()?,
            },
            C::JumpPad => Self::JumpPad {
                client: p.get_uint()?,
                pad: p.get_int()?,
            },
            C::Ping => Self::Ping {
                cmillis: p.get_int()?,
            },
            C::Pong => Self::Pong {
                cmillis: p.get_int()?,
            },
            C::ClientPing => Self::ClientPing { ping: p.get_int()? },
            C::TimeUp => Self::TimeUp {
                seconds: p.get_int()?,
            },
            C::ServerMessage => Self::ServerMessage {
                text: p.get_string()?,
            },
            C::Resume => {
                let mut players = Vec::new();
                loop {
                    let client = p.get_int()?;
                    if client < 0 {
                        break;
                    }
                    players.push(PlayerState {
                        client,
                        life_sequence: p.get_int()?,
                        health: p.get_int()?,
                        max_health: p.get_int()?,
                        armour: p.get_int()?,
                        gun: p.get_int()?,
                        frags: p.get_int()?,
                        deaths: p.get_int()?,
                    });
                }
                Self::Resume { players }
            }
            C::Paused => Self::Paused {
                paused: p.get_int()?,
                client: p.get_int()?,
            },
            C::MapCrc => Self::MapCrc {
                name: p.get_string()?,
                crc: p.get_int()?,
            },
            C::CheckMaps => Self::CheckMaps,
            C::SwitchName => Self::SwitchName {
                name: p.get_string()?,
            },
            C::SwitchTeam => Self::SwitchTeam {
                team: p.get_string()?,
            },
            C::EditMode => Self::EditMode { on: p.get_int()? },
            C::EditEntity => Self::EditEntity {
                index: p.get_int()?,
                x: p.get_coord()?,
                y: p.get_coord()?,
                z: p.get_coord()?,
                kind: p.get_int()?,
                attrs: [
                    p.get_int()?,
                    p.get_int()?,
                    p.get_int()?,
                    p.get_int()?,
                    p.get_int()?,
                ],
            },
            C::EditFace => Self::EditFace {
                sel: get_selection(p)?,
                dir: p.get_int()?,
                mode: p.get_int()?,
            },
            C::EditTexture => Self::EditTexture {
                sel: get_selection(p)?,
                tex: p.get_int()?,
                all_faces: p.get_int()?,
            },
            C::EditMaterial => Self::EditMaterial {
                sel: get_selection(p)?,
                material: p.get_int()?,
            },
            C::EditVar => {
                let kind = p.get_int()?;
                let name = p.get_string()?;
                let value = match kind {
                    0 => VarValue::Int(p.get_int()?),
                    1 => VarValue::Float(p.get_float()?),
                    _ => VarValue::String(p.get_string()?),
                };
                Self::EditVar { name, value }
            }
            C::Copy => Self::Copy {
                sel: get_selection(p)?,
            },
            C::Paste => Self::Paste {
                sel: get_selection(p)?,
            },
            C::Flip => Self::Flip {
                sel: get_selection(p)?,
            },
            C::Rotate => Self::Rotate {
                sel: get_selection(p)?,
                dir: p.get_int()?,
            },
            C::Replace => Self::Replace {
                sel: get_selection(p)?,
                tex: p.get_int()?,
                new_tex: p.get_int()?,
                in_selection: p.get_int()?,
            },
            C::DeleteCubes => Self::DeleteCubes {
                sel: get_selection(p)?,
            },
            C::Remip => Self::Remip,
            C::Undo => Self::Undo,
            C::Redo => Self::Redo,
            C::NewMap => Self::NewMap { size: p.get_int()? },
            C::GetMap => Self::GetMap,
            C::SendMap => Self::SendMap { map: p.get_rest() },
            C::GetDemo => Self::GetDemo { tag: p.get_int()? },
            C::SendDemo => {
                let tag = p.get_int()?;
                let len = p.get_int()?.max(0) as usize;
                Self::SendDemo {
                    tag,
                    data: p.get_raw(len)?,
                }
            }
        })
    }
}

/// Decode every message in a packet body, in order.
pub fn decode(data: &[u8]) -> Result<Vec<Message>, MessageError> {
    let mut p = Packet::from_bytes(data);
    let mut out = Vec::new();
    while !p.is_empty() {
        let raw = p.get_int()?;
        let code = MessageCode::from_wire(raw).ok_or(MessageError::UnknownCode(raw))?;
        out.push(Message::decode_body(code, &mut p)?);
    }
    Ok(out)
}

/// Encode a sequence of messages into one packet body.
pub fn encode_all(messages: &[Message]) -> Vec<u8> {
    let mut p = Packet::new();
    for message in messages {
        message.encode_into(&mut p);
    }
    p.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let encoded = msg.encode();
        let decoded = decode(&encoded).expect("decode");
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn simple_messages_round_trip() {
        round_trip(Message::Welcome);
        round_trip(Message::Text {
            text: "#join lobby".into(),
        });
        round_trip(Message::ServerMessage {
            text: "hello there".into(),
        });
        round_trip(Message::Died {
            client: 1,
            killer: 0,
            frags: 7,
            victim_frags: -2,
        });
        round_trip(Message::MapChange {
            name: "complex".into(),
            mode: 3,
            has_items: 1,
        });
        round_trip(Message::MapCrc {
            name: "complex".into(),
            crc: 0,
        });
        round_trip(Message::Paused {
            paused: 1,
            client: -1,
        });
    }

    #[test]
    fn nested_lists_round_trip() {
        round_trip(Message::Shoot {
            id: 901,
            gun: 2,
            from: [512.0, 512.0, 528.5],
            to: [100.25, 90.0, 510.0],
            hits: vec![
                Hit {
                    target: 1,
                    life_sequence: 3,
                    dist: 1024,
                    rays: 1,
                    dir: [0, -16, 16],
                },
                Hit::default(),
            ],
        });
        round_trip(Message::TeamInfo {
            teams: vec![
                TeamScore {
                    team: "good".into(),
                    frags: 12,
                },
                TeamScore {
                    team: "evil".into(),
                    frags: 9,
                },
            ],
        });
        round_trip(Message::Resume {
            players: vec![PlayerState {
                client: 0,
                life_sequence: 2,
                health: 100,
                max_health: 100,
                armour: 50,
                gun: 1,
                frags: 4,
                deaths: 1,
            }],
        });
    }

    #[test]
    fn edit_messages_round_trip() {
        let sel = Selection {
            origin: [512, 256, 128],
            size: [16, 16, 16],
            grid: 8,
            orient: 2,
            corner: [1, 2, 3, 4, 5],
        };
        round_trip(Message::EditFace {
            sel: sel.clone(),
            dir: 1,
            mode: 0,
        });
        round_trip(Message::Rotate { sel, dir: -1 });
        round_trip(Message::EditVar {
            name: "maptitle".into(),
            value: VarValue::String("a script".into()),
        });
        round_trip(Message::EditVar {
            name: "skyboxcolour".into(),
            value: VarValue::Int(0x88aaff),
        });
    }

    #[test]
    fn file_transfer_messages_round_trip() {
        round_trip(Message::SendDemo {
            tag: 3,
            data: vec![1, 2, 3, 4, 5],
        });
        // SendMap consumes the rest of the packet, so it must come last.
        let batch = vec![
            Message::ServerMessage {
                text: "incoming".into(),
            },
            Message::SendMap {
                map: vec![0xde, 0xad, 0xbe, 0xef],
            },
        ];
        let encoded = encode_all(&batch);
        assert_eq!(decode(&encoded).unwrap(), batch);
    }

    #[test]
    fn multiple_messages_preserve_order() {
        let batch = vec![
            Message::Welcome,
            Message::MapChange {
                name: "arena".into(),
                mode: 5,
                has_items: 0,
            },
            Message::TimeUp { seconds: 600 },
            Message::InitClient {
                client: 2,
                name: "blue".into(),
                team: "evil".into(),
                model: 0,
            },
        ];
        let encoded = encode_all(&batch);
        assert_eq!(decode(&encoded).unwrap(), batch);
    }

    #[test]
    fn unknown_code_is_rejected() {
        let mut p = Packet::new();
        p.put_int(99);
        assert!(matches!(
            decode(p.as_slice()),
            Err(MessageError::UnknownCode(99))
        ));
    }

    #[test]
    fn classifiers() {
        assert!(MessageCode::Pos.is_spammy());
        assert!(!MessageCode::Text.is_spammy());
        assert!(MessageCode::MapCrc.is_connecting());
        assert!(!MessageCode::Shoot.is_connecting());
        assert!(MessageCode::EditFace.is_edit());
        assert!(MessageCode::NewMap.is_edit());
        assert!(!MessageCode::SendMap.is_edit());
    }
}
