//! skirmish-proto - the Skirmish game wire protocol.
//!
//! Everything the orchestrator needs to speak the game's own language:
//! - the variable-length packet codec shared by every message body
//! - the closed-world message catalog with per-code encoders and decoders
//! - in-game text color escapes
//! - the minimal map container used to synthesize download proxy maps

pub mod colors;
pub mod mapfile;
pub mod messages;
pub mod packet;

pub use messages::{Message, MessageCode, VarValue};
pub use packet::{Packet, PacketError};

/// A raw game packet as carried by an ingress transport or the control
/// channel: an opaque payload plus the channel it travels on.
///
/// Channel 0 carries unreliable movement traffic, channel 1 reliable game
/// messages, channel 2 file transfers (maps and demos).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GamePacket {
    pub channel: u8,
    pub data: Vec<u8>,
}

impl GamePacket {
    pub fn new(channel: u8, data: Vec<u8>) -> Self {
        Self { channel, data }
    }
}

/// The channel reserved for file-transfer messages.
pub const FILE_CHANNEL: u8 = 2;
