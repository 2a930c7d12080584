//! Message protocol definitions
//!
//! Every frame on the wire is one JSON object carrying five fields, each
//! paired with its length:
//!
//! ```json
//! {"roomLength":5,"room":"lobby","eventLength":4,"event":"chat",
//!  "dstLength":0,"dst":"","srcLength":0,"src":"",
//!  "payloadLength":2,"payload":"aGk="}
//! ```
//!
//! The payload is raw bytes and travels base64 encoded. Length fields are
//! filled in by [`Message::new`]; on receipt they are informational only,
//! since each frame is decoded as a complete unit. They are signed so a
//! client's bogus length (even a negative one) never costs it the rest
//! of the frame.

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Wire envelope exchanged between clients and the relay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    pub room_length: i64,
    pub room: String,
    pub event_length: i64,
    pub event: String,
    pub dst_length: i64,
    /// Destination connection id, empty when not directed
    pub dst: String,
    pub src_length: i64,
    pub src: String,
    pub payload_length: i64,
    #[serde(with = "payload")]
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message with every length field matching its value
    pub fn new(
        room: impl Into<String>,
        event: impl Into<String>,
        dst: impl Into<String>,
        src: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        let (room, event, dst, src, payload) =
            (room.into(), event.into(), dst.into(), src.into(), payload.into());
        Self {
            room_length: byte_len(&room),
            room,
            event_length: byte_len(&event),
            event,
            dst_length: byte_len(&dst),
            dst,
            src_length: byte_len(&src),
            src,
            payload_length: byte_len(&payload),
            payload,
        }
    }

    /// Parse a frame, reporting why it was rejected
    pub fn parse(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Parse a frame, falling back to an empty message
    ///
    /// An empty message routes nowhere (no room has an empty name), so a
    /// malformed frame is effectively dropped without closing the
    /// connection. The failure is still logged.
    pub fn decode(data: &[u8]) -> Self {
        Self::parse(data).unwrap_or_else(|e| {
            warn!("Discarding malformed frame ({} bytes): {}", data.len(), e);
            Self::default()
        })
    }

    /// Serialize to the JSON text sent over the wire
    pub fn encode(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                String::new()
            }
        }
    }

    /// Whether this message names a destination connection
    pub fn is_directed(&self) -> bool {
        !self.dst.is_empty()
    }
}

fn byte_len(field: impl AsRef<[u8]>) -> i64 {
    i64::try_from(field.as_ref().len()).unwrap_or(i64::MAX)
}

/// Base64 representation of the payload field
///
/// `null` and a missing field both decode to an empty payload.
mod payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
