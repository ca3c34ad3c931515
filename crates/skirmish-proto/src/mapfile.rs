//! The minimal map container.
//!
//! The orchestrator never edits real geometry; it only needs to synthesize
//! tiny proxy maps (two teleporters and a scripted `maptitle`) and to carry
//! existing map bytes around. This module models exactly that slice of the
//! format: a gzip-framed body holding a fixed header, typed variables, an
//! entity list, and an opaque geometry blob that round-trips byte-identically.

use crate::messages::VarValue;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"SKMP";
const VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum MapError {
    #[error("map io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a map file")]
    BadMagic,
    #[error("unsupported map version {0}")]
    BadVersion(u32),
    #[error("map body is truncated")]
    Truncated,
    #[error("map field is not valid utf-8")]
    BadString,
}

/// Entity kinds the orchestrator knows how to place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntityKind {
    Empty = 0,
    Light = 1,
    PlayerStart = 2,
    Teleport = 3,
    TeleDestination = 4,
    JumpPad = 5,
}

impl EntityKind {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Light,
            2 => Self::PlayerStart,
            3 => Self::Teleport,
            4 => Self::TeleDestination,
            5 => Self::JumpPad,
            _ => Self::Empty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// One placed map entity. `attrs[2]` carries the teleporter tag.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntity {
    pub kind: EntityKind,
    pub position: Vec3,
    pub attrs: [i16; 5],
}

impl MapEntity {
    pub fn teleport(tag: i16, position: Vec3) -> Self {
        Self {
            kind: EntityKind::Teleport,
            position,
            attrs: [0, 0, tag, 0, 0],
        }
    }
}

/// A decoded map: header fields, variables, entities, opaque geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldMap {
    pub world_size: u32,
    pub vars: BTreeMap<String, VarValue>,
    pub entities: Vec<MapEntity>,
    pub geometry: Vec<u8>,
}

impl Default for WorldMap {
    fn default() -> Self {
        Self::new()
    }
}

struct BodyReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], MapError> {
        if self.data.len() - self.pos < n {
            return Err(MapError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, MapError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MapError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn i16(&mut self) -> Result<i16, MapError> {
        Ok(self.u16()? as i16)
    }

    fn u32(&mut self) -> Result<u32, MapError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32, MapError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, MapError> {
        let len = self.u16()? as usize;
        String::from_utf8(self.take(len)?.to_vec()).map_err(|_| MapError::BadString)
    }

    fn rest(&mut self) -> Vec<u8> {
        let out = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        out
    }
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

impl WorldMap {
    /// An empty map of the default world size.
    pub fn new() -> Self {
        Self {
            world_size: 1024,
            vars: BTreeMap::new(),
            entities: Vec::new(),
            geometry: Vec::new(),
        }
    }

    pub fn set_var(&mut self, name: &str, value: VarValue) {
        self.vars.insert(name.to_string(), value);
    }

    /// Serialize and gzip-frame the map.
    pub fn encode(&self) -> Result<Vec<u8>, MapError> {
        let mut body = Vec::new();
        body.extend_from_slice(MAGIC);
        body.extend_from_slice(&VERSION.to_le_bytes());
        body.extend_from_slice(&self.world_size.to_le_bytes());
        body.extend_from_slice(&(self.vars.len() as u32).to_le_bytes());
        body.extend_from_slice(&(self.entities.len() as u32).to_le_bytes());

        for (name, value) in &self.vars {
            match value {
                VarValue::Int(v) => {
                    body.push(0);
                    put_string(&mut body, name);
                    body.extend_from_slice(&v.to_le_bytes());
                }
                VarValue::Float(v) => {
                    body.push(1);
                    put_string(&mut body, name);
                    body.extend_from_slice(&v.to_le_bytes());
                }
                VarValue::String(v) => {
                    body.push(2);
                    put_string(&mut body, name);
                    put_string(&mut body, v);
                }
            }
        }

        for entity in &self.entities {
            body.extend_from_slice(&entity.position.x.to_le_bytes());
            body.extend_from_slice(&entity.position.y.to_le_bytes());
            body.extend_from_slice(&entity.position.z.to_le_bytes());
            for attr in entity.attrs {
                body.extend_from_slice(&attr.to_le_bytes());
            }
            body.push(entity.kind as u8);
            body.push(0);
        }

        body.extend_from_slice(&self.geometry);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body)?;
        Ok(encoder.finish()?)
    }

    /// Parse a gzip-framed map produced by [`WorldMap::encode`].
    pub fn decode(data: &[u8]) -> Result<Self, MapError> {
        let mut body = Vec::new();
        GzDecoder::new(data).read_to_end(&mut body)?;
        let mut r = BodyReader {
            data: &body,
            pos: 0,
        };

        if r.take(4)? != MAGIC {
            return Err(MapError::BadMagic);
        }
        let version = r.u32()?;
        if version != VERSION {
            return Err(MapError::BadVersion(version));
        }

        let world_size = r.u32()?;
        let num_vars = r.u32()? as usize;
        let num_entities = r.u32()? as usize;

        let mut vars = BTreeMap::new();
        for _ in 0..num_vars {
            let kind = r.u8()?;
            let name = r.string()?;
            let value = match kind {
                0 => VarValue::Int(r.u32()? as i32),
                1 => VarValue::Float(r.f32()?),
                _ => VarValue::String(r.string()?),
            };
            vars.insert(name, value);
        }

        let mut entities = Vec::with_capacity(num_entities.min(1024));
        for _ in 0..num_entities {
            let position = Vec3::new(r.f32()?, r.f32()?, r.f32()?);
            let attrs = [r.i16()?, r.i16()?, r.i16()?, r.i16()?, r.i16()?];
            let kind = EntityKind::from_raw(r.u8()?);
            r.u8()?;
            entities.push(MapEntity {
                kind,
                position,
                attrs,
            });
        }

        Ok(Self {
            world_size,
            vars,
            entities,
            geometry: r.rest(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy_map() -> WorldMap {
        let mut map = WorldMap::new();
        map.set_var("cloudlayer", VarValue::String(String::new()));
        map.set_var("skyboxcolour", VarValue::Int(0));
        map.set_var("maptitle", VarValue::String("can_teleport_1 = [...]".into()));
        map.entities
            .push(MapEntity::teleport(1, Vec3::new(522.0, 522.0, 512.0)));
        map.entities
            .push(MapEntity::teleport(2, Vec3::new(502.0, 502.0, 512.0)));
        map.geometry = vec![7; 128];
        map
    }

    #[test]
    fn round_trip_preserves_everything() {
        let map = proxy_map();
        let encoded = map.encode().unwrap();
        let decoded = WorldMap::decode(&encoded).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn round_trip_is_stable() {
        let map = proxy_map();
        let once = map.encode().unwrap();
        let twice = WorldMap::decode(&once).unwrap().encode().unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_garbage() {
        assert!(WorldMap::decode(&[0, 1, 2, 3]).is_err());
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"OOPS\0\0\0\0").unwrap();
        let data = encoder.finish().unwrap();
        assert!(matches!(WorldMap::decode(&data), Err(MapError::BadMagic)));
    }

    #[test]
    fn teleport_tag_lands_in_third_attr() {
        let entity = MapEntity::teleport(2, Vec3::default());
        assert_eq!(entity.attrs[2], 2);
        assert_eq!(entity.kind, EntityKind::Teleport);
    }
}
