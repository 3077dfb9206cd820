use std::collections::{BTreeMap, btree_map};

use bytes::{Bytes, BytesMut};

use crate::{
    frame::{self, FrameError, FrameHeader},
    varint::{VarInt, be_varint},
};

/// ``` ignore
/// Setting {
///   Identifier (i),
///   Value (i),
/// }
/// ```
///
/// https://datatracker.ietf.org/doc/html/rfc9114#name-settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: VarInt,
    pub value: VarInt,
}

impl Setting {
    pub const fn new(id: VarInt, value: VarInt) -> Self {
        Self { id, value }
    }

    /// Advises the peer of the largest message header this endpoint accepts.
    ///
    /// https://datatracker.ietf.org/doc/html/rfc9114#name-header-size-constraints
    pub const MAX_FIELD_SECTION_SIZE_ID: VarInt = VarInt::from_u32(0x06);

    pub const fn max_field_section_size(value: VarInt) -> Self {
        Self {
            id: Self::MAX_FIELD_SECTION_SIZE_ID,
            value,
        }
    }

    /// The maximum dynamic table capacity this decoder permits the peer's
    /// QPACK encoder to use. The equivalent of SETTINGS_HEADER_TABLE_SIZE
    /// from HTTP/2.
    ///
    /// https://datatracker.ietf.org/doc/html/rfc9204#section-3.2.3-1
    pub const QPACK_MAX_TABLE_CAPACITY_ID: VarInt = VarInt::from_u32(0x01);

    pub const fn qpack_max_table_capacity(value: VarInt) -> Self {
        Self {
            id: Self::QPACK_MAX_TABLE_CAPACITY_ID,
            value,
        }
    }

    /// An upper bound on the number of streams that can be blocked on QPACK
    /// dynamic table updates.
    ///
    /// https://datatracker.ietf.org/doc/html/rfc9204#section-2.1.2-4
    pub const QPACK_BLOCKED_STREAMS_ID: VarInt = VarInt::from_u32(0x07);

    pub const fn qpack_blocked_streams(value: VarInt) -> Self {
        Self {
            id: Self::QPACK_BLOCKED_STREAMS_ID,
            value,
        }
    }
}

impl From<(VarInt, VarInt)> for Setting {
    fn from((id, value): (VarInt, VarInt)) -> Self {
        Self::new(id, value)
    }
}

/// The parameters carried by a SETTINGS frame.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    map: BTreeMap<VarInt, VarInt>,
}

impl Settings {
    pub fn get(&self, id: VarInt) -> Option<VarInt> {
        self.map.get(&id).copied()
    }

    pub fn set(&mut self, Setting { id, value }: Setting) {
        self.map.insert(id, value);
    }

    pub fn max_field_section_size(&self) -> Option<VarInt> {
        self.get(Setting::MAX_FIELD_SECTION_SIZE_ID)
    }

    pub fn qpack_max_table_capacity(&self) -> VarInt {
        self.get(Setting::QPACK_MAX_TABLE_CAPACITY_ID)
            .unwrap_or(VarInt::from_u32(0))
    }

    pub fn qpack_blocked_streams(&self) -> VarInt {
        self.get(Setting::QPACK_BLOCKED_STREAMS_ID)
            .unwrap_or(VarInt::from_u32(0))
    }

    /// Encode a complete SETTINGS frame (type, length, payload).
    pub fn encode_frame(&self) -> Bytes {
        let mut payload = BytesMut::new();
        for Setting { id, value } in self {
            id.encode(&mut payload);
            value.encode(&mut payload);
        }
        let mut buf = BytesMut::with_capacity(payload.len() + 2 * VarInt::MAX_SIZE);
        FrameHeader {
            r#type: frame::SETTINGS_FRAME_TYPE,
            length: VarInt::try_from(payload.len()).expect("settings payload below 2^62"),
        }
        .encode(&mut buf);
        buf.extend_from_slice(&payload);
        buf.freeze()
    }

    /// Decode the payload of a SETTINGS frame into its `(identifier, value)`
    /// pairs.
    pub fn decode_payload(payload: &[u8]) -> Result<Vec<Setting>, FrameError> {
        let mut settings = Vec::new();
        let mut rest = payload;
        while !rest.is_empty() {
            let (after_id, id) = be_varint(rest).map_err(|_| FrameError::Malformed {
                length: payload.len(),
            })?;
            let (after_value, value) = be_varint(after_id).map_err(|_| FrameError::Malformed {
                length: payload.len(),
            })?;
            settings.push(Setting::new(id, value));
            rest = after_value;
        }
        Ok(settings)
    }
}

impl IntoIterator for Settings {
    type Item = Setting;

    type IntoIter = std::iter::Map<btree_map::IntoIter<VarInt, VarInt>, fn((VarInt, VarInt)) -> Setting>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.into_iter().map(From::from)
    }
}

impl<'s> IntoIterator for &'s Settings {
    type Item = Setting;

    type IntoIter = std::iter::Map<
        btree_map::Iter<'s, VarInt, VarInt>,
        for<'v> fn((&'v VarInt, &'v VarInt)) -> Setting,
    >;

    fn into_iter(self) -> Self::IntoIter {
        self.map.iter().map(|(&id, &value)| Setting { id, value })
    }
}

impl FromIterator<Setting> for Settings {
    fn from_iter<T: IntoIterator<Item = Setting>>(iter: T) -> Self {
        Self {
            map: iter
                .into_iter()
                .map(|Setting { id, value }| (id, value))
                .collect(),
        }
    }
}
