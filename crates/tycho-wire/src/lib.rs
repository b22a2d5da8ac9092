// Envelope model and wire codecs for the duplex mission-control link.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const MAGIC: u32 = 0x54594331;
pub const VERSION: u16 = 1;
// Flags describe which envelope direction the frame payload carries.
pub const FLAG_CLIENT_ENVELOPE: u16 = 0x0001;
pub const FLAG_SERVER_ENVELOPE: u16 = 0x0002;

/// Topic names with reserved runtime meaning or a typed payload.
pub mod topics {
    /// Call-correlation replies. Never dispatched to listeners as data.
    pub const REPLY: &str = "reply";
    /// Tears down a server-side call.
    pub const CANCEL: &str = "cancel";
    pub const PARAMETERS: &str = "parameters";
    pub const EVENTS: &str = "events";
    pub const ALARMS: &str = "alarms";
    pub const GLOBAL_ALARM_STATUS: &str = "global-alarm-status";
    pub const COMMANDS: &str = "commands";
    pub const TIME: &str = "time";
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("failed to serialize envelope")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize envelope")]
    Deserialize(serde_json::Error),
}

/// Wire form of a connection. Fixed at connect time and never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Framed binary payloads on binary WebSocket messages.
    Binary,
    /// Plain JSON on text WebSocket messages.
    Json,
}

/// Client-to-server envelope. `id` is the connection-local client sequence
/// used for reply correlation; `call` targets an existing server call for
/// update messages and is zero for fresh requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub topic: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub call: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub low_priority: bool,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

/// Server-to-client envelope. `call` identifies the server call the frame
/// belongs to; `seq` is the per-connection delivery sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEnvelope {
    #[serde(rename = "type")]
    pub topic: String,
    #[serde(default)]
    pub call: u64,
    #[serde(default)]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Payload of a `reply` envelope. `reply_to` echoes the client sequence of
/// the request being answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub reply_to: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

/// Payload of a `cancel` envelope naming the call to tear down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOptions {
    pub call: u64,
}

impl ClientEnvelope {
    /// Fresh request envelope for `topic` with the given options payload.
    pub fn request(topic: &str, options: serde_json::Value) -> Self {
        Self {
            topic: topic.to_string(),
            id: 0,
            call: 0,
            low_priority: false,
            options,
        }
    }

    /// Fire-and-forget update addressed to an existing server call.
    pub fn update(topic: &str, call: u64, options: serde_json::Value) -> Self {
        Self {
            topic: topic.to_string(),
            id: 0,
            call,
            low_priority: false,
            options,
        }
    }

    /// Teardown message for an existing server call.
    pub fn cancel(call: u64) -> Result<Self> {
        let options = serde_json::to_value(CancelOptions { call }).map_err(Error::Serialize)?;
        Ok(Self::request(topics::CANCEL, options))
    }
}

impl ServerEnvelope {
    /// Parse the data payload of a `reply` envelope.
    pub fn reply(&self) -> Result<Reply> {
        serde_json::from_value(self.data.clone()).map_err(Error::Deserialize)
    }

    pub fn is_reply(&self) -> bool {
        self.topic == topics::REPLY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    // Create a header with the current protocol constants.
    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        // Always encode in network byte order for portability.
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate header before we trust the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use tycho_wire::Frame;
///
/// let frame = Frame::new(0x1, Bytes::from_static(b"hello")).expect("frame");
/// let encoded = frame.encode();
/// let decoded = Frame::decode(encoded).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        // Keep length within the on-wire u32 size.
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(flags, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        // Pre-allocate the exact size to avoid reallocation.
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        // Split header and payload based on the declared length.
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

impl Encoding {
    /// Encode a client envelope into the bytes of one WebSocket message.
    ///
    /// ```
    /// use tycho_wire::{ClientEnvelope, Encoding};
    ///
    /// let env = ClientEnvelope::request("time", serde_json::json!({"instance": "sim"}));
    /// let bytes = Encoding::Binary.encode_client(&env).expect("encode");
    /// assert!(!bytes.is_empty());
    /// ```
    pub fn encode_client(&self, envelope: &ClientEnvelope) -> Result<Bytes> {
        match self {
            Encoding::Json => {
                let payload = serde_json::to_vec(envelope).map_err(Error::Serialize)?;
                Ok(Bytes::from(payload))
            }
            Encoding::Binary => {
                let options = serde_json::to_vec(&envelope.options).map_err(Error::Serialize)?;
                let topic_bytes = envelope.topic.as_bytes();
                let topic_len =
                    u16::try_from(topic_bytes.len()).map_err(|_| Error::FrameTooLarge)?;
                let options_len =
                    u32::try_from(options.len()).map_err(|_| Error::FrameTooLarge)?;
                let payload_len = 2 + topic_bytes.len() + 8 + 8 + 1 + 4 + options.len();
                if payload_len > u32::MAX as usize {
                    return Err(Error::FrameTooLarge);
                }
                let mut buf = BytesMut::with_capacity(FrameHeader::LEN + payload_len);
                FrameHeader::new(FLAG_CLIENT_ENVELOPE, payload_len as u32).encode(&mut buf);
                buf.put_u16(topic_len);
                buf.extend_from_slice(topic_bytes);
                buf.put_u64(envelope.id);
                buf.put_u64(envelope.call);
                buf.put_u8(envelope.low_priority as u8);
                buf.put_u32(options_len);
                buf.extend_from_slice(&options);
                Ok(buf.freeze())
            }
        }
    }

    /// Decode the bytes of one WebSocket message into a server envelope.
    pub fn decode_server(&self, input: Bytes) -> Result<ServerEnvelope> {
        match self {
            Encoding::Json => serde_json::from_slice(&input).map_err(Error::Deserialize),
            Encoding::Binary => {
                let frame = Frame::decode(input)?;
                if frame.header.flags & FLAG_SERVER_ENVELOPE == 0 {
                    return Err(Error::Incomplete);
                }
                let mut buf = frame.payload;
                if buf.remaining() < 2 {
                    return Err(Error::Incomplete);
                }
                let topic_len = buf.get_u16() as usize;
                if buf.remaining() < topic_len + 8 + 8 + 4 {
                    return Err(Error::Incomplete);
                }
                let topic_bytes = buf.copy_to_bytes(topic_len);
                let topic = String::from_utf8(topic_bytes.to_vec()).map_err(|_| {
                    Error::Deserialize(<serde_json::Error as serde::de::Error>::custom(
                        "invalid topic",
                    ))
                })?;
                let call = buf.get_u64();
                let seq = buf.get_u64();
                let data_len = buf.get_u32() as usize;
                if buf.remaining() < data_len {
                    return Err(Error::Incomplete);
                }
                let data_bytes = buf.copy_to_bytes(data_len);
                let data = if data_bytes.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::from_slice(&data_bytes).map_err(Error::Deserialize)?
                };
                Ok(ServerEnvelope {
                    topic,
                    call,
                    seq,
                    data,
                })
            }
        }
    }

    /// Encode a server envelope. The client runtime only needs this for
    /// loopback test fixtures, but the codec stays symmetric.
    pub fn encode_server(&self, envelope: &ServerEnvelope) -> Result<Bytes> {
        match self {
            Encoding::Json => {
                let payload = serde_json::to_vec(envelope).map_err(Error::Serialize)?;
                Ok(Bytes::from(payload))
            }
            Encoding::Binary => {
                let data = serde_json::to_vec(&envelope.data).map_err(Error::Serialize)?;
                let topic_bytes = envelope.topic.as_bytes();
                let topic_len =
                    u16::try_from(topic_bytes.len()).map_err(|_| Error::FrameTooLarge)?;
                let data_len = u32::try_from(data.len()).map_err(|_| Error::FrameTooLarge)?;
                let payload_len = 2 + topic_bytes.len() + 8 + 8 + 4 + data.len();
                if payload_len > u32::MAX as usize {
                    return Err(Error::FrameTooLarge);
                }
                let mut buf = BytesMut::with_capacity(FrameHeader::LEN + payload_len);
                FrameHeader::new(FLAG_SERVER_ENVELOPE, payload_len as u32).encode(&mut buf);
                buf.put_u16(topic_len);
                buf.extend_from_slice(topic_bytes);
                buf.put_u64(envelope.call);
                buf.put_u64(envelope.seq);
                buf.put_u32(data_len);
                buf.extend_from_slice(&data);
                Ok(buf.freeze())
            }
        }
    }

    /// Decode a client envelope, the other half of the loopback symmetry.
    pub fn decode_client(&self, input: Bytes) -> Result<ClientEnvelope> {
        match self {
            Encoding::Json => serde_json::from_slice(&input).map_err(Error::Deserialize),
            Encoding::Binary => {
                let frame = Frame::decode(input)?;
                if frame.header.flags & FLAG_CLIENT_ENVELOPE == 0 {
                    return Err(Error::Incomplete);
                }
                let mut buf = frame.payload;
                if buf.remaining() < 2 {
                    return Err(Error::Incomplete);
                }
                let topic_len = buf.get_u16() as usize;
                if buf.remaining() < topic_len + 8 + 8 + 1 + 4 {
                    return Err(Error::Incomplete);
                }
                let topic_bytes = buf.copy_to_bytes(topic_len);
                let topic = String::from_utf8(topic_bytes.to_vec()).map_err(|_| {
                    Error::Deserialize(<serde_json::Error as serde::de::Error>::custom(
                        "invalid topic",
                    ))
                })?;
                let id = buf.get_u64();
                let call = buf.get_u64();
                let low_priority = buf.get_u8() != 0;
                let options_len = buf.get_u32() as usize;
                if buf.remaining() < options_len {
                    return Err(Error::Incomplete);
                }
                let options_bytes = buf.copy_to_bytes(options_len);
                let options = if options_bytes.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::from_slice(&options_bytes).map_err(Error::Deserialize)?
                };
                Ok(ClientEnvelope {
                    topic,
                    id,
                    call,
                    low_priority,
                    options,
                })
            }
        }
    }
}

/// Base64 helpers for binary payload fields carried inside JSON data, the
/// form the server uses for raw binary parameter values.
pub mod base64_bytes {
    use base64::Engine;
    use serde::de::Error;
    use serde::Deserialize;

    // Encode Vec<u8> as base64 string for JSON payloads.
    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    // Decode base64 string into Vec<u8>.
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_round_trip() {
        // Encoding then decoding should preserve header and payload.
        let frame = Frame::new(0x1, Bytes::from_static(b"hello")).expect("frame");
        let encoded = frame.encode();
        let decoded = Frame::decode(encoded).expect("decode");
        assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
        assert_eq!(decoded.header.flags, 0x1);
    }

    #[test]
    fn decode_rejects_invalid_magic() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&0xDEADBEEFu32.to_be_bytes());
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let err = FrameHeader::decode(buf.freeze()).expect_err("invalid magic");
        assert!(matches!(err, Error::InvalidMagic));
    }

    #[test]
    fn decode_rejects_unsupported_version() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        buf.extend_from_slice(&0xFFFFu16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let err = FrameHeader::decode(buf.freeze()).expect_err("unsupported version");
        assert!(matches!(err, Error::UnsupportedVersion(0xFFFF)));
    }

    #[test]
    fn decode_rejects_incomplete_payload() {
        let header = FrameHeader {
            magic: MAGIC,
            version: VERSION,
            flags: 0,
            length: 5,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(b"hi");
        let err = Frame::decode(buf.freeze()).expect_err("incomplete payload");
        assert!(matches!(err, Error::Incomplete));
    }

    #[test]
    fn client_envelope_binary_round_trip() {
        let envelope = ClientEnvelope {
            topic: topics::PARAMETERS.to_string(),
            id: 42,
            call: 7,
            low_priority: true,
            options: json!({"instance": "sim", "processor": "realtime"}),
        };
        let encoded = Encoding::Binary.encode_client(&envelope).expect("encode");
        let decoded = Encoding::Binary.decode_client(encoded).expect("decode");
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn server_envelope_binary_round_trip() {
        let envelope = ServerEnvelope {
            topic: topics::TIME.to_string(),
            call: 3,
            seq: 991,
            data: json!({"value": "2024-01-01T00:00:00Z"}),
        };
        let encoded = Encoding::Binary.encode_server(&envelope).expect("encode");
        let decoded = Encoding::Binary.decode_server(encoded).expect("decode");
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn server_envelope_json_round_trip() {
        let envelope = ServerEnvelope {
            topic: topics::EVENTS.to_string(),
            call: 12,
            seq: 1,
            data: json!({"message": "link up"}),
        };
        let encoded = Encoding::Json.encode_server(&envelope).expect("encode");
        let decoded = Encoding::Json.decode_server(encoded).expect("decode");
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn client_envelope_json_omits_defaults() {
        let envelope = ClientEnvelope::request(topics::TIME, serde_json::Value::Null);
        let encoded = Encoding::Json.encode_client(&envelope).expect("encode");
        let text = std::str::from_utf8(&encoded).expect("utf8");
        assert!(text.contains("\"type\":\"time\""));
        assert!(!text.contains("lowPriority"));
        assert!(!text.contains("\"call\""));
    }

    #[test]
    fn reply_parses_from_envelope_data() {
        let envelope = ServerEnvelope {
            topic: topics::REPLY.to_string(),
            call: 5,
            seq: 2,
            data: json!({"replyTo": 9}),
        };
        assert!(envelope.is_reply());
        let reply = envelope.reply().expect("reply");
        assert_eq!(reply.reply_to, 9);
        assert!(reply.exception.is_none());
    }

    #[test]
    fn reply_carries_exception() {
        let envelope = ServerEnvelope {
            topic: topics::REPLY.to_string(),
            call: 0,
            seq: 3,
            data: json!({"replyTo": 4, "exception": "no such processor"}),
        };
        let reply = envelope.reply().expect("reply");
        assert_eq!(reply.exception.as_deref(), Some("no such processor"));
    }

    #[test]
    fn cancel_envelope_names_call() {
        let envelope = ClientEnvelope::cancel(17).expect("cancel");
        assert_eq!(envelope.topic, topics::CANCEL);
        assert_eq!(envelope.options["call"], json!(17));
    }

    #[test]
    fn binary_decode_rejects_truncated_options() {
        let envelope = ClientEnvelope::request(topics::EVENTS, json!({"instance": "sim"}));
        let encoded = Encoding::Binary.encode_client(&envelope).expect("encode");
        let truncated = encoded.slice(0..encoded.len() - 3);
        let header = FrameHeader::decode(truncated.slice(0..FrameHeader::LEN)).expect("header");
        // Rebuild a frame whose declared length matches the shortened payload.
        let mut buf = BytesMut::new();
        FrameHeader::new(header.flags, (truncated.len() - FrameHeader::LEN) as u32)
            .encode(&mut buf);
        buf.extend_from_slice(&truncated[FrameHeader::LEN..]);
        let err = Encoding::Binary
            .decode_client(buf.freeze())
            .expect_err("truncated");
        assert!(matches!(err, Error::Incomplete));
    }
}
