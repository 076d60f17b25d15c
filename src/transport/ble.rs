//! Fixed-size BLE packets carried as JSON frames.
//!
//! BLE links deliver 16-byte packets: command, source, destination and
//! length as little-endian `u16` words followed by eight data bytes.
//! [`BlePacketTransport`] rewrites them into the JSON frames the rest of the
//! pipeline expects, and packs outgoing frames back into packets.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use super::{Transport, TransportError, TransportKind};
use crate::message::Message;

/// Size of one BLE packet.
pub const BLE_PACKET_LEN: usize = 16;
/// Data bytes carried by one BLE packet.
pub const BLE_DATA_LEN: usize = 8;

fn word(packet: &[u8], at: usize) -> u16 { u16::from_le_bytes([packet[at], packet[at + 1]]) }

/// Convert one BLE packet into a [`Message`].
///
/// The payload is the first `l` data bytes, capped at [`BLE_DATA_LEN`].
///
/// # Errors
///
/// Returns [`TransportError::Rejected`] if `packet` is not exactly
/// [`BLE_PACKET_LEN`] bytes.
pub fn packet_to_message(packet: &[u8]) -> Result<Message, TransportError> {
    if packet.len() != BLE_PACKET_LEN {
        return Err(TransportError::Rejected(format!(
            "ble packet must be {BLE_PACKET_LEN} bytes, got {}",
            packet.len()
        )));
    }
    let length = word(packet, 6);
    let data = BLE_PACKET_LEN - BLE_DATA_LEN;
    let end = data + usize::from(length).min(BLE_DATA_LEN);
    Ok(Message {
        command: word(packet, 0).into(),
        source: word(packet, 2),
        destination: word(packet, 4),
        length,
        payload: packet[data..end].to_vec(),
    })
}

/// Pack a [`Message`] into one BLE packet, zero-padding short payloads.
///
/// # Errors
///
/// Returns [`TransportError::Rejected`] if the payload exceeds
/// [`BLE_DATA_LEN`] bytes.
pub fn message_to_packet(message: &Message) -> Result<[u8; BLE_PACKET_LEN], TransportError> {
    if message.payload.len() > BLE_DATA_LEN {
        return Err(TransportError::Rejected(format!(
            "{} payload of {} bytes does not fit a ble packet",
            message.command,
            message.payload.len()
        )));
    }
    let mut packet = [0u8; BLE_PACKET_LEN];
    packet[0..2].copy_from_slice(&u16::from(message.command).to_le_bytes());
    packet[2..4].copy_from_slice(&message.source.to_le_bytes());
    packet[4..6].copy_from_slice(&message.destination.to_le_bytes());
    packet[6..8].copy_from_slice(&message.length.to_le_bytes());
    packet[8..8 + message.payload.len()].copy_from_slice(&message.payload);
    Ok(packet)
}

/// Wraps a packet-oriented transport so it speaks JSON frames.
pub struct BlePacketTransport<T> {
    inner: T,
    pending: Mutex<BytesMut>,
}

impl<T: Transport> BlePacketTransport<T> {
    /// Wrap `inner`, which delivers raw 16-byte packets.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            pending: Mutex::new(BytesMut::new()),
        }
    }

    /// Borrow the wrapped transport.
    pub fn get_ref(&self) -> &T { &self.inner }

    fn convert_pending(&self, chunk: &[u8]) -> BytesMut {
        let mut pending = self.pending.lock();
        pending.extend_from_slice(chunk);
        let mut out = BytesMut::new();
        while pending.len() >= BLE_PACKET_LEN {
            let packet = pending.split_to(BLE_PACKET_LEN);
            match packet_to_message(&packet).and_then(|m| {
                m.encode()
                    .map_err(|e| TransportError::Rejected(e.to_string()))
            }) {
                Ok(frame) => out.extend_from_slice(&frame),
                Err(e) => tracing::warn!(error = %e, "skipping corrupt ble packet"),
            }
        }
        out
    }
}

#[async_trait]
impl<T: Transport> Transport for BlePacketTransport<T> {
    fn kind(&self) -> TransportKind { TransportKind::Ble }

    async fn open(&self) -> Result<(), TransportError> { self.inner.open().await }

    async fn close(&self) -> Result<(), TransportError> {
        self.pending.lock().clear();
        self.inner.close().await
    }

    async fn read_available(&self) -> Result<Option<Bytes>, TransportError> {
        let Some(chunk) = self.inner.read_available().await? else {
            return Ok(None);
        };
        let frames = self.convert_pending(&chunk);
        Ok((!frames.is_empty()).then(|| frames.freeze()))
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let message =
            Message::decode(frame).map_err(|e| TransportError::Rejected(e.to_string()))?;
        let packet = message_to_packet(&message)?;
        self.inner.write_frame(&packet).await
    }
}
