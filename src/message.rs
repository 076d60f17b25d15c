//! Wire schema for firmware messages.
//!
//! Every frame is a compact JSON object with five keys: `c` (command code),
//! `s` (source id), `d` (destination id), `b` (base64 payload) and `l`
//! (payload length). Serialisation keeps that key order so encoded frames
//! match what existing firmware emits byte for byte.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    registry::{ModuleId, PropertyType},
    topology::Neighbours,
};

/// Fixed marker byte carried in every property request.
pub const PROPERTY_REQUEST_MARKER: u8 = 95;

/// Command codes understood by the message pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum Command {
    /// Periodic heartbeat from a module.
    Health,
    /// Ask a module to report one property.
    RequestProperty,
    /// Registration: a module announces its id, uuid and firmware version.
    AssignId,
    /// Neighbour links of a module.
    Topology,
    /// Module warning; counts as liveness.
    Warning,
    /// Property value reported by a module.
    PropertyUpdate,
    /// Discovery trigger asking modules to register.
    RequestUuid,
    /// Any code the pipeline does not interpret.
    Other(u16),
}

impl From<u16> for Command {
    fn from(code: u16) -> Self {
        match code {
            0x00 => Self::Health,
            0x03 => Self::RequestProperty,
            0x05 => Self::AssignId,
            0x07 => Self::Topology,
            0x0A => Self::Warning,
            0x1F => Self::PropertyUpdate,
            0x28 => Self::RequestUuid,
            other => Self::Other(other),
        }
    }
}

impl From<Command> for u16 {
    fn from(command: Command) -> Self {
        match command {
            Command::Health => 0x00,
            Command::RequestProperty => 0x03,
            Command::AssignId => 0x05,
            Command::Topology => 0x07,
            Command::Warning => 0x0A,
            Command::PropertyUpdate => 0x1F,
            Command::RequestUuid => 0x28,
            Command::Other(code) => code,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = u16::from(*self);
        match self {
            Self::Health => write!(f, "health({code:#04x})"),
            Self::RequestProperty => write!(f, "request-property({code:#04x})"),
            Self::AssignId => write!(f, "assign-id({code:#04x})"),
            Self::Topology => write!(f, "topology({code:#04x})"),
            Self::Warning => write!(f, "warning({code:#04x})"),
            Self::PropertyUpdate => write!(f, "property-update({code:#04x})"),
            Self::RequestUuid => write!(f, "request-uuid({code:#04x})"),
            Self::Other(_) => write!(f, "other({code:#04x})"),
        }
    }
}

/// A frame that could not be decoded into a usable [`Message`].
///
/// The frame is dropped and counted; processing continues with the next one.
#[derive(Debug, Error)]
pub enum MalformedFrame {
    /// The frame is not JSON, or a required key is missing or mistyped.
    #[error("frame is not a valid message: {0}")]
    Json(#[from] serde_json::Error),
    /// The payload is shorter than the command requires.
    #[error("{command} payload too short: have {have} bytes, need {need}")]
    ShortPayload {
        /// Command whose payload was inspected.
        command: Command,
        /// Bytes present.
        have: usize,
        /// Bytes required.
        need: usize,
    },
    /// A property update named a slot outside the property table.
    #[error("property number {0} is outside the property table")]
    PropertyOutOfRange(u16),
}

/// Registration fields carried by an [`Command::AssignId`] payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration {
    /// 48-bit module uuid.
    pub uuid: u64,
    /// Packed firmware version, zero when absent.
    pub version: u16,
}

/// Decoded firmware message.
///
/// # Examples
///
/// ```
/// use modilink::message::{Command, Message};
///
/// let msg = Message::decode(br#"{"c":0,"s":12,"d":4095,"b":"AAE=","l":2}"#)
///     .expect("valid frame");
/// assert_eq!(msg.command, Command::Health);
/// assert_eq!(msg.payload, vec![0, 1]);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Command code.
    #[serde(rename = "c")]
    pub command: Command,
    /// Source module id.
    #[serde(rename = "s")]
    pub source: u16,
    /// Destination module id, or a property number for property updates.
    #[serde(rename = "d")]
    pub destination: u16,
    /// Raw payload, base64 on the wire.
    #[serde(rename = "b", with = "base64_payload")]
    pub payload: Vec<u8>,
    /// Declared payload length.
    #[serde(rename = "l")]
    pub length: u16,
}

mod base64_payload {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub(super) fn serialize<S: Serializer>(payload: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(payload))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text.as_bytes()).map_err(D::Error::custom)
    }
}

impl Message {
    /// Build a message whose declared length matches the payload.
    #[must_use]
    pub fn new(
        command: Command,
        source: u16,
        destination: u16,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        let payload = payload.into();
        let length = u16::try_from(payload.len()).unwrap_or(u16::MAX);
        Self {
            command,
            source,
            destination,
            payload,
            length,
        }
    }

    /// Request one property value from `destination`.
    #[must_use]
    pub fn request_property(destination: ModuleId, property: PropertyType) -> Self {
        Self::new(
            Command::RequestProperty,
            0,
            destination.as_u16(),
            [property.index(), 0, PROPERTY_REQUEST_MARKER, 0],
        )
    }

    /// Ask `destination` (usually [`ModuleId::BROADCAST`]) to register.
    #[must_use]
    pub fn request_uuid(destination: ModuleId) -> Self {
        let [lo, hi] = ModuleId::BROADCAST.as_u16().to_le_bytes();
        Self::new(Command::RequestUuid, 0, destination.as_u16(), [lo, hi])
    }

    /// Registration sent by a module with `uuid` and packed `version`.
    #[must_use]
    pub fn assign_id(module: ModuleId, uuid: u64, version: u16) -> Self {
        let mut payload = uuid.to_le_bytes()[..6].to_vec();
        payload.extend_from_slice(&version.to_le_bytes());
        Self::new(Command::AssignId, module.as_u16(), ModuleId::BROADCAST.as_u16(), payload)
    }

    /// Property value reported by `module`.
    #[must_use]
    pub fn property_update(module: ModuleId, property: PropertyType, value: f32) -> Self {
        Self::new(
            Command::PropertyUpdate,
            module.as_u16(),
            u16::from(property.index()),
            value.to_le_bytes(),
        )
    }

    /// Neighbour links reported by `module`.
    #[must_use]
    pub fn topology(module: ModuleId, links: Neighbours) -> Self {
        Self::new(
            Command::Topology,
            module.as_u16(),
            ModuleId::BROADCAST.as_u16(),
            links.to_payload(),
        )
    }

    /// Heartbeat from `module`.
    #[must_use]
    pub fn health(module: ModuleId) -> Self {
        Self::new(Command::Health, module.as_u16(), ModuleId::BROADCAST.as_u16(), [0u8; 8])
    }

    /// Decode a frame extracted by [`crate::frame::FrameBuffer`].
    ///
    /// # Errors
    ///
    /// Returns [`MalformedFrame::Json`] if the frame is not JSON or a
    /// required key is absent or of the wrong type.
    pub fn decode(frame: &[u8]) -> Result<Self, MalformedFrame> {
        Ok(serde_json::from_slice(frame)?)
    }

    /// Encode into the compact wire form.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error if serialisation fails.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    fn require(&self, need: usize) -> Result<&[u8], MalformedFrame> {
        self.payload
            .get(..need)
            .ok_or(MalformedFrame::ShortPayload {
                command: self.command,
                have: self.payload.len(),
                need,
            })
    }

    /// First payload word as a little-endian `f32`.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedFrame::ShortPayload`] if fewer than four bytes are
    /// present.
    pub fn property_value(&self) -> Result<f32, MalformedFrame> {
        let bytes = self.require(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Registration fields: a 48-bit uuid and an optional version word.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedFrame::ShortPayload`] if the uuid is truncated.
    pub fn registration(&self) -> Result<Registration, MalformedFrame> {
        let bytes = self.require(6)?;
        let mut uuid = [0u8; 8];
        uuid[..6].copy_from_slice(bytes);
        let version = match self.payload.get(6..8) {
            Some(word) => u16::from_le_bytes([word[0], word[1]]),
            None => 0,
        };
        Ok(Registration {
            uuid: u64::from_le_bytes(uuid),
            version,
        })
    }

    /// Neighbour links carried by a topology payload.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedFrame::ShortPayload`] if fewer than eight bytes are
    /// present.
    pub fn neighbours(&self) -> Result<Neighbours, MalformedFrame> {
        let bytes = self.require(8)?;
        Ok(Neighbours::from_payload(bytes))
    }
}
