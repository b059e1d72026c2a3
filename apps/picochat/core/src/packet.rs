use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MAX_MSG_LENGTH;

/// Largest total packet length the one-byte prefix can describe.
const MAX_PACKET_LENGTH: usize = u8::MAX as usize;

/// Wire packet: a length byte followed by one byte per character code.
///
/// On the socket the packet travels as a JSON integer array such as
/// `[4, 104, 105, 33]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Packet(Vec<u8>);

impl Packet {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Every character after the prefix, without the inbound length bound.
    /// Clients use this to read relay notices, which may exceed
    /// [`MAX_MSG_LENGTH`].
    pub fn body(&self) -> String {
        self.0.iter().skip(1).map(|&code| char::from(code)).collect()
    }

    pub fn to_json(&self) -> String {
        // A Vec<u8> always serializes to a JSON array of integers.
        serde_json::to_string(&self.0).unwrap_or_else(|_| String::from("[]"))
    }

    pub fn from_json(payload: &str) -> Result<Self, DecodingError> {
        let bytes: Vec<u8> = serde_json::from_str(payload).map_err(DecodingError::Malformed)?;
        Ok(Self(bytes))
    }
}

/// Errors raised while turning text into a packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("character {ch:?} at index {index} does not fit in a single byte")]
    CharacterOutOfRange { ch: char, index: usize },
    #[error("packet of {len} bytes exceeds the {max} byte length prefix")]
    TooLong { len: usize, max: usize },
}

/// Errors raised while reading an inbound packet.
#[derive(Debug, Error)]
pub enum DecodingError {
    #[error("packet is empty")]
    Empty,
    #[error("payload is not an integer array in 0..=255: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Builds the wire packet for `text`. Callers bound the text length; nothing
/// is truncated here.
pub fn encode(text: &str) -> Result<Packet, EncodingError> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.push(0);
    for (index, ch) in text.chars().enumerate() {
        let code = u8::try_from(u32::from(ch))
            .map_err(|_| EncodingError::CharacterOutOfRange { ch, index })?;
        bytes.push(code);
    }

    if bytes.len() > MAX_PACKET_LENGTH {
        return Err(EncodingError::TooLong {
            len: bytes.len(),
            max: MAX_PACKET_LENGTH,
        });
    }

    bytes[0] = bytes.len() as u8;
    Ok(Packet(bytes))
}

/// Returns the body text of `packet`, keeping at most [`MAX_MSG_LENGTH`]
/// characters. The length prefix is skipped, not validated.
pub fn decode(packet: &[u8]) -> Result<String, DecodingError> {
    if packet.is_empty() {
        return Err(DecodingError::Empty);
    }

    let end = packet.len().min(MAX_MSG_LENGTH + 1);
    Ok(packet[1..end].iter().map(|&code| char::from(code)).collect())
}

/// Parses a JSON packet received from the socket and decodes its body.
pub fn decode_frame(payload: &str) -> Result<String, DecodingError> {
    let packet = Packet::from_json(payload)?;
    decode(packet.as_bytes())
}
