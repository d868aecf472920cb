//! Length-prefixed framing for envelopes on a byte stream.
//!
//! A frame is an 8-byte big-endian header followed by an rkyv archive of
//! an [`Envelope`](crate::Envelope):
//!
//! ```text
//! +---------+--------------+----------------+-------------------+
//! | version | message type | payload length | archived envelope |
//! |   u16   |     u16      |      u32       |  payload length   |
//! +---------+--------------+----------------+-------------------+
//! ```

use rkyv::api::high::{HighDeserializer, HighSerializer, HighValidator};
use rkyv::bytecheck::CheckBytes;
use rkyv::rancor::Error as RkyvError;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::version;

/// Bytes preceding every payload.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest payload either side accepts. Registration chunks stay far below it.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Version stamped on outgoing frames.
pub const CURRENT_VERSION: u16 = version::CURRENT;

/// Which service a frame is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Auth,
    BlockMaster,
}

impl From<MessageType> for u16 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Auth => 0x01,
            MessageType::BlockMaster => 0x02,
        }
    }
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        match raw {
            0x01 => Ok(Self::Auth),
            0x02 => Ok(Self::BlockMaster),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Decoded frame prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u16,
    pub message_type: MessageType,
    pub payload_len: u32,
}

impl FrameHeader {
    #[must_use]
    pub const fn new(message_type: MessageType, payload_len: u32) -> Self {
        Self {
            version: CURRENT_VERSION,
            message_type,
            payload_len,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let [v0, v1] = self.version.to_be_bytes();
        let [t0, t1] = u16::from(self.message_type).to_be_bytes();
        let [l0, l1, l2, l3] = self.payload_len.to_be_bytes();
        [v0, v1, t0, t1, l0, l1, l2, l3]
    }

    /// Parses a header. Only the message type can be rejected here; version
    /// and length are checked by [`validate`](Self::validate).
    pub fn decode(bytes: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let [v0, v1, t0, t1, l0, l1, l2, l3] = *bytes;
        Ok(Self {
            version: u16::from_be_bytes([v0, v1]),
            message_type: MessageType::try_from(u16::from_be_bytes([t0, t1]))?,
            payload_len: u32::from_be_bytes([l0, l1, l2, l3]),
        })
    }

    /// Returns the payload length to read, or why the frame must be refused.
    pub fn validate(&self) -> Result<usize, ProtocolError> {
        if !(version::MIN_SUPPORTED..=version::CURRENT).contains(&self.version) {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }
        let len = usize::try_from(self.payload_len).unwrap_or(usize::MAX);
        check_size(len)?;
        Ok(len)
    }
}

fn check_size(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// Frame writer with a reusable output buffer, plus the matching payload
/// reader.
#[derive(Debug, Default)]
pub struct Codec {
    frame: Vec<u8>,
}

impl Codec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frame: Vec::with_capacity(capacity),
        }
    }

    /// Archives `envelope` and returns the whole frame, header included.
    /// The slice is valid until the next call.
    pub fn encode<T>(
        &mut self,
        envelope: &crate::Envelope<T>,
        message_type: MessageType,
    ) -> Result<&[u8], ProtocolError>
    where
        T: Archive,
        crate::Envelope<T>: for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
    {
        let archived = rkyv::to_bytes::<RkyvError>(envelope)
            .map_err(|e| ProtocolError::Serialisation(e.to_string()))?;
        check_size(archived.len())?;
        let payload_len = u32::try_from(archived.len()).map_err(|_| ProtocolError::MessageTooLarge {
            size: archived.len(),
            max: MAX_MESSAGE_SIZE,
        })?;

        self.frame.clear();
        self.frame
            .extend_from_slice(&FrameHeader::new(message_type, payload_len).encode());
        self.frame.extend_from_slice(&archived);
        Ok(&self.frame)
    }

    /// Validates and deserialises a payload (the bytes after the header).
    ///
    /// Socket reads give no alignment guarantee, so the bytes are first
    /// copied into a 16-byte aligned buffer.
    pub fn decode<T>(payload: &[u8]) -> Result<T, ProtocolError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
            + Deserialize<T, HighDeserializer<RkyvError>>,
    {
        let mut aligned = AlignedVec::<16>::with_capacity(payload.len());
        aligned.extend_from_slice(payload);
        rkyv::from_bytes::<T, RkyvError>(&aligned)
            .map_err(|e| ProtocolError::Deserialisation(e.to_string()))
    }

    /// The most recently encoded frame.
    #[must_use]
    pub fn last_frame(&self) -> &[u8] {
        &self.frame
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{AuthMessage, Envelope, Method, RpcFrame, RpcMessage};

    #[test]
    fn header_layout_is_big_endian() {
        let header = FrameHeader::new(MessageType::BlockMaster, 0x0102_0304);
        let bytes = header.encode();
        assert_eq!(&bytes[2..], &[0x00, 0x02, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(FrameHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn unknown_service_is_refused() {
        let mut bytes = FrameHeader::new(MessageType::Auth, 10).encode();
        bytes[3] = 0x7f;
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(ProtocolError::UnknownMessageType(0x7f))
        ));
    }

    #[test]
    fn oversized_or_foreign_frames_fail_validation() {
        assert_eq!(FrameHeader::new(MessageType::Auth, 1000).validate().unwrap(), 1000);

        let oversized = FrameHeader::new(MessageType::Auth, u32::try_from(MAX_MESSAGE_SIZE + 1).unwrap());
        assert!(matches!(
            oversized.validate(),
            Err(ProtocolError::MessageTooLarge { .. })
        ));

        let ancient = FrameHeader {
            version: 0,
            ..FrameHeader::new(MessageType::Auth, 10)
        };
        assert!(matches!(ancient.validate(), Err(ProtocolError::UnsupportedVersion(0))));
    }

    #[test]
    fn auth_challenge_survives_framing() {
        let mut codec = Codec::new();
        let envelope = Envelope::new(RpcFrame::Message(RpcMessage::Auth(AuthMessage::challenge(
            "channel-1",
            b"hello".to_vec(),
        ))));

        let frame = codec.encode(&envelope, MessageType::Auth).unwrap().to_vec();
        let (head, payload) = frame.split_at(FRAME_HEADER_SIZE);
        let header = FrameHeader::decode(head.try_into().unwrap()).unwrap();
        assert_eq!(header.message_type, MessageType::Auth);
        assert_eq!(header.validate().unwrap(), payload.len());

        let decoded: Envelope<RpcFrame> = Codec::decode(payload).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn corrupt_payload_is_a_deserialisation_error() {
        let result: Result<Envelope<RpcFrame>, _> = Codec::decode(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(matches!(result, Err(ProtocolError::Deserialisation(_))));
    }

    #[test]
    fn encoder_buffer_holds_only_the_latest_frame() {
        let mut codec = Codec::with_capacity(256);
        let long = codec
            .encode(&Envelope::new(RpcFrame::Open(Method::RegisterWorker)), MessageType::BlockMaster)
            .unwrap()
            .len();
        let short = codec
            .encode(&Envelope::new(RpcFrame::Complete), MessageType::BlockMaster)
            .unwrap()
            .len();
        assert_eq!(codec.last_frame().len(), short);
        assert!(long >= FRAME_HEADER_SIZE && short >= FRAME_HEADER_SIZE);
    }
}
