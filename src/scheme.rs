//! Scheme init data and PSSH parsing.
//!
//! A session is created for one DRM scheme and carries the [`SchemeData`]
//! entries found in the media for that scheme. Widevine and common PSSH
//! boxes can be inspected with [`Pssh`].
use std::io::{Cursor, Read};
use std::str::FromStr;

use base64::Engine;
use byteorder::{BigEndian, ReadBytesExt};
use prost::Message;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Known DRM system IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemId {
    Widevine,
    PlayReady,
    ClearKey,
    /// Common PSSH (W3C `cenc` key ids), valid for every scheme.
    Common,
}

impl SystemId {
    pub const fn to_uuid(self) -> Uuid {
        match self {
            SystemId::Widevine => Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed),
            SystemId::PlayReady => Uuid::from_u128(0x9a04f07998404286ab92e65be0885f95),
            SystemId::ClearKey => Uuid::from_u128(0xe2719d58a985b3c9781ab030af78d30e),
            SystemId::Common => Uuid::from_u128(0x1077efecc0b24d02ace33c1e52e2fb4b),
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        [
            SystemId::Widevine,
            SystemId::PlayReady,
            SystemId::ClearKey,
            SystemId::Common,
        ]
        .into_iter()
        .find(|id| id.to_uuid() == uuid)
    }
}

/// Widevine system UUID.
pub const WIDEVINE_UUID: Uuid = SystemId::Widevine.to_uuid();

/// Init data for one DRM scheme as found in the media container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeData {
    /// System id of the scheme this data belongs to.
    pub uuid: Uuid,
    /// License server URL carried by the manifest, if any.
    pub license_server_url: Option<String>,
    /// MIME type of the media the data applies to.
    pub mime_type: String,
    /// Scheme specific payload, usually a full PSSH box.
    pub data: Option<Vec<u8>>,
}

impl SchemeData {
    pub fn new(
        uuid: Uuid,
        license_server_url: Option<String>,
        mime_type: impl Into<String>,
        data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            uuid,
            license_server_url,
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Whether this entry applies to the scheme with the given id.
    ///
    /// Common PSSH entries apply to every scheme.
    pub fn matches(&self, scheme: Uuid) -> bool {
        self.uuid == SystemId::Common.to_uuid() || self.uuid == scheme
    }

    /// Whether the entry carries init data.
    pub fn has_data(&self) -> bool {
        self.data.as_ref().is_some_and(|d| !d.is_empty())
    }

    /// Parse the payload as a PSSH box (see [`Pssh::from_bytes`]).
    pub fn pssh(&self) -> Result<Pssh> {
        let data = self
            .data
            .as_deref()
            .ok_or_else(|| Error::InvalidInitData("Scheme data has no payload".to_string()))?;
        Pssh::from_bytes(data)
    }
}

/// Widevine Cenc header carried inside Widevine PSSH boxes.
#[derive(Clone, PartialEq, Message)]
pub struct WidevinePsshData {
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub key_ids: Vec<Vec<u8>>,
    #[prost(string, optional, tag = "3")]
    pub provider: Option<String>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub content_id: Option<Vec<u8>>,
    #[prost(string, optional, tag = "6")]
    pub policy: Option<String>,
}

const PSSH_BOX_TYPE: &[u8; 4] = b"pssh";

/// A `pssh` box, or bare init data wrapped as one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pssh {
    pub version: u8,
    pub flags: u32,
    pub system_id: Uuid,
    key_ids: Vec<Uuid>,
    pub init_data: Vec<u8>,
}

impl Pssh {
    /// Build a box. Version 1 boxes list `key_ids` in the header; version 0
    /// boxes carry only `init_data`.
    pub fn new(
        system_id: Uuid,
        key_ids: Vec<Uuid>,
        init_data: Vec<u8>,
        version: u8,
        flags: u32,
    ) -> Result<Self> {
        match version {
            0 if !key_ids.is_empty() => Err(Error::InvalidInitData(
                "Version 0 boxes cannot carry key ids".to_string(),
            )),
            0 | 1 => Ok(Self {
                version,
                flags: flags & 0x00FF_FFFF,
                system_id,
                key_ids,
                init_data,
            }),
            v => Err(Error::InvalidInitData(format!("Unsupported PSSH version {}", v))),
        }
    }

    /// Parse a full box, falling back to a Widevine Cenc header or, failing
    /// that, to opaque Widevine init data.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidInitData("Init data is empty".to_string()));
        }
        if let Some(pssh) = read_box(data) {
            return Ok(pssh);
        }
        Self::new(WIDEVINE_UUID, Vec::new(), data.to_vec(), 0, 0)
    }

    pub fn from_base64(data: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(data.trim())?;
        Self::from_bytes(&bytes)
    }

    /// Serialize as a full `pssh` box.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(32 + self.key_ids.len() * 16 + self.init_data.len());
        body.push(self.version);
        body.extend_from_slice(&self.flags.to_be_bytes()[1..]);
        body.extend_from_slice(self.system_id.as_bytes());
        if self.version == 1 {
            body.extend_from_slice(&(self.key_ids.len() as u32).to_be_bytes());
            for kid in &self.key_ids {
                body.extend_from_slice(kid.as_bytes());
            }
        }
        body.extend_from_slice(&(self.init_data.len() as u32).to_be_bytes());
        body.extend_from_slice(&self.init_data);

        let mut out = Vec::with_capacity(body.len() + 8);
        out.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(PSSH_BOX_TYPE);
        out.append(&mut body);
        out
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_bytes())
    }

    /// Key ids from the v1 header, or from the Widevine Cenc header.
    pub fn key_ids(&self) -> Result<Vec<Uuid>> {
        if !self.key_ids.is_empty() {
            return Ok(self.key_ids.clone());
        }
        if self.system_id != WIDEVINE_UUID {
            return Err(Error::InvalidInitData(format!(
                "Cannot read key ids of system {}",
                self.system_id
            )));
        }
        let header = WidevinePsshData::decode(self.init_data.as_slice())?;
        Ok(header.key_ids.iter().map(|kid| key_id_to_uuid(kid)).collect())
    }
}

impl FromStr for Pssh {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Pssh::from_base64(s)
    }
}

/// Read a `pssh` box, `None` if `data` is not a well formed one.
fn read_box(data: &[u8]) -> Option<Pssh> {
    let mut cursor = Cursor::new(data);
    let size = cursor.read_u32::<BigEndian>().ok()?;
    let mut box_type = [0u8; 4];
    cursor.read_exact(&mut box_type).ok()?;
    if &box_type != PSSH_BOX_TYPE {
        return None;
    }
    let size = match size {
        0 => data.len() as u64,
        1 => cursor.read_u64::<BigEndian>().ok()?,
        n => n as u64,
    };
    if size > data.len() as u64 {
        return None;
    }

    let version = cursor.read_u8().ok()?;
    let flags = cursor.read_u24::<BigEndian>().ok()?;
    let mut system_id = [0u8; 16];
    cursor.read_exact(&mut system_id).ok()?;

    let mut key_ids = Vec::new();
    if version == 1 {
        let count = cursor.read_u32::<BigEndian>().ok()?;
        if u64::from(count) * 16 > remaining(&cursor) {
            return None;
        }
        for _ in 0..count {
            let mut kid = [0u8; 16];
            cursor.read_exact(&mut kid).ok()?;
            key_ids.push(Uuid::from_bytes(kid));
        }
    }

    let len = cursor.read_u32::<BigEndian>().ok()?;
    if u64::from(len) > remaining(&cursor) {
        return None;
    }
    let mut init_data = vec![0u8; len as usize];
    cursor.read_exact(&mut init_data).ok()?;

    Pssh::new(Uuid::from_bytes(system_id), key_ids, init_data, version, flags).ok()
}

fn remaining(cursor: &Cursor<&[u8]>) -> u64 {
    (cursor.get_ref().len() as u64).saturating_sub(cursor.position())
}

/// Widevine headers store key ids as 16 raw bytes, 32 hex characters, or
/// occasionally as a shorter big-endian number.
fn key_id_to_uuid(kid: &[u8]) -> Uuid {
    if let Ok(bytes) = <[u8; 16]>::try_from(kid) {
        return Uuid::from_bytes(bytes);
    }
    if let Some(uuid) = std::str::from_utf8(kid).ok().and_then(|s| Uuid::try_parse(s).ok()) {
        return uuid;
    }
    let mut bytes = [0u8; 16];
    let tail = &kid[kid.len().saturating_sub(16)..];
    bytes[16 - tail.len()..].copy_from_slice(tail);
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::{Pssh, SchemeData, SystemId, WidevinePsshData, WIDEVINE_UUID};
    use prost::Message;
    use uuid::Uuid;

    #[test]
    fn pssh_box_survives_serialization() {
        let init_data = b"widevine-init-data".to_vec();
        let pssh = Pssh::new(WIDEVINE_UUID, Vec::new(), init_data.clone(), 0, 0)
            .expect("create pssh");

        let parsed = Pssh::from_bytes(&pssh.to_bytes()).expect("parse pssh");

        assert_eq!(parsed.version, 0);
        assert_eq!(parsed.flags, 0);
        assert_eq!(parsed.system_id, WIDEVINE_UUID);
        assert_eq!(parsed.init_data, init_data);
    }

    #[test]
    fn pssh_key_ids_from_widevine_init_data() {
        let kid = Uuid::new_v4();
        let pssh_data = WidevinePsshData {
            key_ids: vec![kid.as_bytes().to_vec()],
            ..Default::default()
        };
        let pssh = Pssh::new(WIDEVINE_UUID, Vec::new(), pssh_data.encode_to_vec(), 0, 0)
            .expect("create pssh");

        assert_eq!(pssh.key_ids().expect("key ids"), vec![kid]);
    }

    #[test]
    fn pssh_key_ids_from_v1_box() {
        let kid = Uuid::new_v4();
        let pssh = Pssh::new(SystemId::PlayReady.to_uuid(), vec![kid], Vec::new(), 1, 0)
            .expect("create pssh");

        let parsed = Pssh::from_base64(&pssh.to_base64()).expect("parse pssh");
        assert_eq!(parsed.system_id, SystemId::PlayReady.to_uuid());
        assert_eq!(parsed.key_ids().expect("key ids"), vec![kid]);
    }

    #[test]
    fn unknown_init_data_is_wrapped_for_widevine() {
        let pssh = Pssh::from_bytes(b"\x01opaque").expect("wrap init data");

        assert_eq!(pssh.system_id, WIDEVINE_UUID);
        assert_eq!(pssh.version, 0);
        assert_eq!(pssh.init_data, b"\x01opaque".to_vec());
    }

    fn v0_box_header(system_id: Uuid) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&32u32.to_be_bytes());
        data.extend_from_slice(b"pssh");
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(system_id.as_bytes());
        data
    }

    #[test]
    fn oversized_init_data_length_is_not_trusted() {
        let mut data = v0_box_header(WIDEVINE_UUID);
        data.extend_from_slice(&0xFFFF_FFF0u32.to_be_bytes());
        assert_eq!(data.len(), 32);

        let pssh = Pssh::from_bytes(&data).expect("wrap as opaque init data");

        // Not read as a box; the whole input is kept as opaque init data.
        assert_eq!(pssh.init_data, data);
    }

    #[test]
    fn oversized_key_id_count_is_not_trusted() {
        let mut data = v0_box_header(SystemId::PlayReady.to_uuid());
        data[8] = 1;
        data.extend_from_slice(&u32::MAX.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());

        let pssh = Pssh::from_bytes(&data).expect("wrap as opaque init data");

        assert_eq!(pssh.system_id, WIDEVINE_UUID);
        assert_eq!(pssh.init_data, data);
    }

    #[test]
    fn pssh_empty_base64_is_error() {
        let err = Pssh::from_base64("").expect_err("empty input should fail");
        assert!(format!("{}", err).contains("empty"));
    }

    #[test]
    fn common_scheme_data_matches_every_scheme() {
        let common = SchemeData::new(SystemId::Common.to_uuid(), None, "video/mp4", None);
        let widevine = SchemeData::new(WIDEVINE_UUID, None, "video/mp4", Some(vec![1]));

        assert!(common.matches(SystemId::PlayReady.to_uuid()));
        assert!(!common.has_data());
        assert!(widevine.matches(WIDEVINE_UUID));
        assert!(!widevine.matches(SystemId::ClearKey.to_uuid()));
        assert_eq!(
            SystemId::from_uuid(SystemId::ClearKey.to_uuid()),
            Some(SystemId::ClearKey)
        );
    }
}
