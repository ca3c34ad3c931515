//! The control channel between orchestrator and child server.
//!
//! Frames are length-prefixed over the Unix-domain stream socket. Each body
//! starts with a little-endian u32 event tag; strings are a u32 length plus
//! UTF-8 bytes; embedded game payloads are carried verbatim. The codec never
//! yields a partially-read frame, and writes are serialized through one
//! bounded outbound queue owned by the server's write task.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Hard cap on a single control frame; anything larger is a protocol fault.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Outbound queue depth; beyond this, senders block.
pub const SEND_QUEUE_DEPTH: usize = 16;

const CLUSTER_CONNECT: u32 = 0;
const CLUSTER_DISCONNECT: u32 = 1;
const CLUSTER_RECEIVE: u32 = 2;
const CLUSTER_COMMAND: u32 = 3;
const CLUSTER_PING: u32 = 4;
const CLUSTER_RESPOND_MAP: u32 = 5;

const SERVER_PONG: u32 = 0;
const SERVER_HEALTHY: u32 = 1;
const SERVER_CONNECT: u32 = 2;
const SERVER_DISCONNECT: u32 = 3;
const SERVER_BROADCAST: u32 = 4;
const SERVER_UNICAST: u32 = 5;
const SERVER_REQUEST_MAP: u32 = 6;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control io: {0}")]
    Io(#[from] std::io::Error),
    #[error("control frame exceeds {MAX_FRAME} bytes")]
    FrameTooLarge,
    #[error("control frame is truncated")]
    Truncated,
    #[error("unknown server event tag {0}")]
    UnknownEvent(u32),
    #[error("control string is not valid utf-8")]
    BadString,
}

/// Events the orchestrator sends to a child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Connect {
        client: u32,
    },
    Disconnect {
        client: u32,
    },
    Receive {
        client: u32,
        channel: u32,
        data: Vec<u8>,
    },
    Command {
        text: String,
    },
    Ping,
    RespondMap {
        name: String,
        mode: i32,
        ok: i32,
    },
}

/// Events a child sends to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Pong,
    Healthy,
    Connect {
        client: u32,
    },
    Disconnect {
        client: u32,
        reason: i32,
        text: String,
    },
    Broadcast {
        channel: u32,
        data: Vec<u8>,
    },
    Unicast {
        client: u32,
        channel: u32,
        data: Vec<u8>,
    },
    RequestMap {
        name: String,
        mode: i32,
    },
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

struct FrameReader<'a> {
    frame: &'a [u8],
}

impl<'a> FrameReader<'a> {
    fn u32(&mut self) -> Result<u32, ControlError> {
        if self.frame.len() < 4 {
            return Err(ControlError::Truncated);
        }
        let v = u32::from_le_bytes(self.frame[..4].try_into().unwrap());
        self.frame = &self.frame[4..];
        Ok(v)
    }

    fn i32(&mut self) -> Result<i32, ControlError> {
        Ok(self.u32()? as i32)
    }

    fn string(&mut self) -> Result<String, ControlError> {
        let len = self.u32()? as usize;
        if self.frame.len() < len {
            return Err(ControlError::Truncated);
        }
        let s = String::from_utf8(self.frame[..len].to_vec()).map_err(|_| ControlError::BadString)?;
        self.frame = &self.frame[len..];
        Ok(s)
    }

    fn take(&mut self, len: usize) -> Result<Vec<u8>, ControlError> {
        if self.frame.len() < len {
            return Err(ControlError::Truncated);
        }
        let out = self.frame[..len].to_vec();
        self.frame = &self.frame[len..];
        Ok(out)
    }
}

/// Frame codec for the control socket.
#[derive(Debug, Default)]
pub struct ControlCodec;

impl Encoder<ClusterEvent> for ControlCodec {
    type Error = ControlError;

    fn encode(&mut self, event: ClusterEvent, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        match event {
            ClusterEvent::Connect { client } => {
                body.put_u32_le(CLUSTER_CONNECT);
                body.put_u32_le(client);
            }
            ClusterEvent::Disconnect { client } => {
                body.put_u32_le(CLUSTER_DISCONNECT);
                body.put_u32_le(client);
            }
            ClusterEvent::Receive {
                client,
                channel,
                data,
            } => {
                body.put_u32_le(CLUSTER_RECEIVE);
                body.put_u32_le(client);
                body.put_u32_le(channel);
                body.put_slice(&data);
            }
            ClusterEvent::Command { text } => {
                body.put_u32_le(CLUSTER_COMMAND);
                put_string(&mut body, &text);
            }
            ClusterEvent::Ping => {
                body.put_u32_le(CLUSTER_PING);
            }
            ClusterEvent::RespondMap { name, mode, ok } => {
                body.put_u32_le(CLUSTER_RESPOND_MAP);
                put_string(&mut body, &name);
                body.put_u32_le(mode as u32);
                body.put_u32_le(ok as u32);
            }
        }

        if body.len() > MAX_FRAME {
            return Err(ControlError::FrameTooLarge);
        }
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for ControlCodec {
    type Item = ServerEvent;
    type Error = ControlError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(src[..4].try_into().unwrap()) as usize;
        if len > MAX_FRAME {
            return Err(ControlError::FrameTooLarge);
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let frame = src.split_to(len);
        let mut r = FrameReader { frame: &frame };

        let tag = r.u32()?;
        let event = match tag {
            SERVER_PONG => ServerEvent::Pong,
            SERVER_HEALTHY => ServerEvent::Healthy,
            SERVER_CONNECT => ServerEvent::Connect { client: r.u32()? },
            SERVER_DISCONNECT => ServerEvent::Disconnect {
                client: r.u32()?,
                reason: r.i32()?,
                text: r.string()?,
            },
            SERVER_BROADCAST => {
                let len = r.u32()? as usize;
                let channel = r.u32()?;
                ServerEvent::Broadcast {
                    channel,
                    data: r.take(len)?,
                }
            }
            SERVER_UNICAST => {
                let len = r.u32()? as usize;
                let client = r.u32()?;
                let channel = r.u32()?;
                ServerEvent::Unicast {
                    client,
                    channel,
                    data: r.take(len)?,
                }
            }
            SERVER_REQUEST_MAP => ServerEvent::RequestMap {
                name: r.string()?,
                mode: r.i32()?,
            },
            other => return Err(ControlError::UnknownEvent(other)),
        };
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &[u8]) -> BytesMut {
        let mut out = BytesMut::new();
        out.put_u32_le(body.len() as u32);
        out.put_slice(body);
        out
    }

    #[test]
    fn encodes_connect_and_command() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(ClusterEvent::Connect { client: 7 }, &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[8, 0, 0, 0, 0, 0, 0, 0, 7, 0, 0, 0]);

        buf.clear();
        codec
            .encode(
                ClusterEvent::Command {
                    text: "pausegame 1".into(),
                },
                &mut buf,
            )
            .unwrap();
        // length(4) + tag(4) + strlen(4) + 11 bytes
        assert_eq!(buf.len(), 4 + 4 + 4 + 11);
        assert_eq!(u32::from_le_bytes(buf[..4].try_into().unwrap()), 19);
    }

    #[test]
    fn decodes_unicast() {
        let mut body = BytesMut::new();
        body.put_u32_le(SERVER_UNICAST);
        body.put_u32_le(3); // payload length
        body.put_u32_le(42); // client
        body.put_u32_le(1); // channel
        body.put_slice(&[9, 9, 9]);

        let mut codec = ControlCodec;
        let mut buf = frame(&body);
        let event = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            event,
            ServerEvent::Unicast {
                client: 42,
                channel: 1,
                data: vec![9, 9, 9],
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_request_map() {
        let mut body = BytesMut::new();
        body.put_u32_le(SERVER_REQUEST_MAP);
        body.put_u32_le(3);
        body.put_slice(b"foo");
        body.put_u32_le(5);

        let mut codec = ControlCodec;
        let event = codec.decode(&mut frame(&body)).unwrap().unwrap();
        assert_eq!(
            event,
            ServerEvent::RequestMap {
                name: "foo".into(),
                mode: 5,
            }
        );
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut body = BytesMut::new();
        body.put_u32_le(SERVER_HEALTHY);
        let full = frame(&body);

        let mut codec = ControlCodec;
        let mut buf = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_slice(&full[3..6]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_slice(&full[6..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ServerEvent::Healthy));
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut a = BytesMut::new();
        a.put_u32_le(SERVER_PONG);
        let mut b = BytesMut::new();
        b.put_u32_le(SERVER_CONNECT);
        b.put_u32_le(5);

        let mut buf = frame(&a);
        buf.put_slice(&frame(&b));

        let mut codec = ControlCodec;
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ServerEvent::Pong));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ServerEvent::Connect { client: 5 })
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let mut body = BytesMut::new();
        body.put_u32_le(99);
        let mut codec = ControlCodec;
        assert!(matches!(
            codec.decode(&mut frame(&body)),
            Err(ControlError::UnknownEvent(99))
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_FRAME + 1) as u32);
        let mut codec = ControlCodec;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ControlError::FrameTooLarge)
        ));
    }
}
