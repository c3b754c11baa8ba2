//! AMQP Frame Codec
//!
//! [`AmqpCodec`] is a `tokio_util` codec with three states:
//!
//! - `ProtocolInit`: waits for the 8 byte protocol header
//! - `ReadFrame`: decodes complete frames, leaving partial ones in the buffer
//! - `BadMessage`: terminal; every incoming byte is discarded
//!
//! A malformed frame never surfaces as a codec error. The codec emits a single
//! [`Frame::BadMessage`] instead so the connection can close itself cleanly.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use super::frame::{ContentHeader, Frame, ProtocolHeader};
use super::method::MethodRegistry;
use super::types::read_u16;
use super::{
    DecodeError, Result, FRAME_BODY, FRAME_END, FRAME_HEADER, FRAME_HEADER_SIZE,
    FRAME_HEARTBEAT, FRAME_METHOD, MIN_FRAME_SIZE, PROTOCOL_ID,
};

/// Largest frame payload accepted unless configured otherwise
pub const DEFAULT_MAX_FRAME_SIZE: usize = 131_072;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    ProtocolInit,
    ReadFrame,
    BadMessage,
}

pub struct AmqpCodec {
    state: DecoderState,
    max_frame_size: usize,
    registry: &'static MethodRegistry,
}

impl AmqpCodec {
    /// Server side codec expecting the protocol header first
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            state: DecoderState::ProtocolInit,
            max_frame_size,
            registry: MethodRegistry::global(),
        }
    }

    /// Codec that skips the protocol header and reads frames straight away.
    /// Used on the client side of a connection.
    pub fn frames_only() -> Self {
        let mut codec = Self::new();
        codec.state = DecoderState::ReadFrame;
        codec
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Lower the accepted payload size after `connection.tune-ok`
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    fn decode_protocol_header(&mut self, src: &mut BytesMut) -> Option<Frame> {
        if src.len() < 8 {
            return None;
        }
        let header = src.split_to(8);
        if &header[..4] != PROTOCOL_ID {
            let mut id = [0u8; 4];
            id.copy_from_slice(&header[..4]);
            return Some(self.fail(src, DecodeError::InvalidProtocolHeader(id)));
        }

        let protocol = ProtocolHeader {
            major: header[5],
            minor: header[6],
            revision: header[7],
        };
        debug!(
            "Received protocol header {}-{}-{}",
            protocol.major, protocol.minor, protocol.revision
        );
        self.state = DecoderState::ReadFrame;
        Some(Frame::ProtocolInit(protocol))
    }

    fn decode_frame(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < MIN_FRAME_SIZE {
            return Ok(None);
        }

        // Peek at the header without consuming bytes
        let frame_type = src[0];
        let channel = u16::from_be_bytes([src[1], src[2]]);
        let size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;

        if size > self.max_frame_size {
            return Err(DecodeError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        let total = FRAME_HEADER_SIZE + size + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut raw = src.split_to(total);
        raw.advance(FRAME_HEADER_SIZE);
        let end = raw[size];
        if end != FRAME_END {
            return Err(DecodeError::InvalidFrameEnd(end));
        }
        raw.truncate(size);
        let mut payload = raw.freeze();

        let frame = match frame_type {
            FRAME_METHOD => {
                let class_id = read_u16(&mut payload)?;
                let method_id = read_u16(&mut payload)?;
                let method = self.registry.parse(class_id, method_id, &mut payload)?;
                Frame::Method { channel, method }
            }
            FRAME_HEADER => Frame::Header {
                channel,
                header: ContentHeader::decode(&mut payload)?,
            },
            FRAME_BODY => Frame::Body { channel, payload },
            FRAME_HEARTBEAT => Frame::Heartbeat,
            other => return Err(DecodeError::UnknownFrameType(other)),
        };
        Ok(Some(frame))
    }

    fn fail(&mut self, src: &mut BytesMut, err: DecodeError) -> Frame {
        warn!("Closing stream after malformed input: {}", err);
        self.state = DecoderState::BadMessage;
        src.clear();
        Frame::BadMessage {
            reason: err.to_string(),
        }
    }
}

impl Default for AmqpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AmqpCodec {
    type Item = Frame;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.state {
            DecoderState::ProtocolInit => Ok(self.decode_protocol_header(src)),
            DecoderState::ReadFrame => match self.decode_frame(src) {
                Ok(frame) => Ok(frame),
                Err(err) => Ok(Some(self.fail(src, err))),
            },
            DecoderState::BadMessage => {
                src.clear();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    debug!("Discarding {} trailing bytes at end of stream", src.len());
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for AmqpCodec {
    type Error = DecodeError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let (frame_type, channel) = match &frame {
            Frame::ProtocolInit(header) => {
                header.encode(dst);
                return Ok(());
            }
            Frame::BadMessage { reason } => {
                return Err(DecodeError::InvalidFormat(format!(
                    "Bad message frames cannot be written: {}",
                    reason
                )))
            }
            Frame::Method { channel, .. } => (FRAME_METHOD, *channel),
            Frame::Header { channel, .. } => (FRAME_HEADER, *channel),
            Frame::Body { channel, .. } => (FRAME_BODY, *channel),
            Frame::Heartbeat => (FRAME_HEARTBEAT, 0),
        };

        dst.put_u8(frame_type);
        dst.put_u16(channel);
        let size_at = dst.len();
        dst.put_u32(0);
        let start = dst.len();

        match &frame {
            Frame::Method { method, .. } => method.encode(dst)?,
            Frame::Header { header, .. } => header.encode(dst)?,
            Frame::Body { payload, .. } => dst.extend_from_slice(payload),
            _ => {}
        }

        let size = dst.len() - start;
        dst[size_at..size_at + 4].copy_from_slice(&(size as u32).to_be_bytes());
        dst.put_u8(FRAME_END);
        Ok(())
    }
}

/// Split a message body into frames no larger than `max_payload` bytes.
pub fn body_frames(channel: u16, body: &Bytes, max_payload: usize) -> Vec<Frame> {
    if body.is_empty() {
        return Vec::new();
    }
    let chunk = max_payload.max(1);
    let mut frames = Vec::with_capacity(body.len().div_ceil(chunk));
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + chunk).min(body.len());
        frames.push(Frame::Body {
            channel,
            payload: body.slice(offset..end),
        });
        offset = end;
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::method::Method;
    use crate::protocol::BasicProperties;
    use proptest::prelude::*;

    fn encode_all(frames: &[Frame]) -> BytesMut {
        let mut codec = AmqpCodec::frames_only();
        let mut dst = BytesMut::new();
        for frame in frames {
            codec.encode(frame.clone(), &mut dst).unwrap();
        }
        dst
    }

    fn decode_all(codec: &mut AmqpCodec, src: &mut BytesMut) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(src).unwrap() {
            out.push(frame);
        }
        out
    }

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::method(
                1,
                Method::BasicPublish {
                    exchange: "amq.direct".to_string(),
                    routing_key: "orders".to_string(),
                    mandatory: false,
                    immediate: false,
                },
            ),
            Frame::Header {
                channel: 1,
                header: ContentHeader {
                    class_id: 60,
                    body_size: 5,
                    properties: BasicProperties {
                        delivery_mode: Some(2),
                        ..Default::default()
                    },
                },
            },
            Frame::Body {
                channel: 1,
                payload: Bytes::from_static(b"hello"),
            },
            Frame::Heartbeat,
        ]
    }

    #[test]
    fn test_protocol_header_then_frames() {
        let mut codec = AmqpCodec::new();
        let mut src = BytesMut::from(&b"AMQP\x00\x00\x09\x01"[..]);
        src.extend_from_slice(&encode_all(&sample_frames()));

        let frames = decode_all(&mut codec, &mut src);
        assert_eq!(frames.len(), 5);
        assert_eq!(
            frames[0],
            Frame::ProtocolInit(ProtocolHeader {
                major: 0,
                minor: 9,
                revision: 1
            })
        );
        assert_eq!(&frames[1..], &sample_frames()[..]);
        assert_eq!(codec.state(), DecoderState::ReadFrame);
    }

    #[test]
    fn test_partial_header_waits() {
        let mut codec = AmqpCodec::new();
        let mut src = BytesMut::from(&b"AMQP\x00"[..]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert_eq!(src.len(), 5);
        assert_eq!(codec.state(), DecoderState::ProtocolInit);
    }

    #[test]
    fn test_wrong_protocol_id_is_fatal() {
        let mut codec = AmqpCodec::new();
        let mut src = BytesMut::from(&b"HTTP/1.1 GET /"[..]);

        match codec.decode(&mut src).unwrap() {
            Some(Frame::BadMessage { .. }) => {}
            other => panic!("Expected bad message, got {:?}", other),
        }
        assert_eq!(codec.state(), DecoderState::BadMessage);
        assert!(src.is_empty());

        src.extend_from_slice(&encode_all(&sample_frames()));
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(src.is_empty());
    }

    #[test]
    fn test_unsupported_version_still_reported() {
        let mut codec = AmqpCodec::new();
        let mut src = BytesMut::from(&b"AMQP\x01\x01\x00\x0a"[..]);
        match codec.decode(&mut src).unwrap() {
            Some(Frame::ProtocolInit(header)) => assert!(!header.is_supported()),
            other => panic!("Expected protocol init, got {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_frame_leaves_buffer_untouched() {
        let mut codec = AmqpCodec::frames_only();
        let full = encode_all(&sample_frames()[..1]);
        let mut src = BytesMut::from(&full[..full.len() - 1]);

        assert!(codec.decode(&mut src).unwrap().is_none());
        assert_eq!(src.len(), full.len() - 1);

        src.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(sample_frames()[0].clone())
        );
    }

    #[test]
    fn test_bad_frame_end_emits_single_bad_message() {
        let mut codec = AmqpCodec::frames_only();
        let mut src = encode_all(&[Frame::Heartbeat]);
        let last = src.len() - 1;
        src[last] = 0x00;
        src.extend_from_slice(&encode_all(&[Frame::Heartbeat]));

        let frames = decode_all(&mut codec, &mut src);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::BadMessage { .. }));
        assert_eq!(codec.state(), DecoderState::BadMessage);
    }

    #[test]
    fn test_unknown_frame_type_and_method() {
        let mut codec = AmqpCodec::frames_only();
        let mut src = BytesMut::from(&[4u8, 0, 0, 0, 0, 0, 0, FRAME_END][..]);
        assert!(matches!(
            codec.decode(&mut src).unwrap(),
            Some(Frame::BadMessage { .. })
        ));

        let mut codec = AmqpCodec::frames_only();
        let mut src = BytesMut::from(&[1u8, 0, 1, 0, 0, 0, 4, 0, 60, 0, 99, FRAME_END][..]);
        match codec.decode(&mut src).unwrap() {
            Some(Frame::BadMessage { reason }) => assert!(reason.contains("class=60")),
            other => panic!("Expected bad message, got {:?}", other),
        }
    }

    #[test]
    fn test_deeply_nested_arguments_close_the_stream() {
        let mut payload = BytesMut::new();
        payload.put_u16(50);
        payload.put_u16(10);
        payload.put_u16(0);
        payload.put_u8(1);
        payload.put_u8(b'q');
        payload.put_u8(0);
        payload.extend_from_slice(&crate::protocol::types::tests::nested_tables(10_000));

        let mut src = BytesMut::new();
        src.put_u8(FRAME_METHOD);
        src.put_u16(1);
        src.put_u32(payload.len() as u32);
        src.extend_from_slice(&payload);
        src.put_u8(FRAME_END);

        let mut codec = AmqpCodec::frames_only();
        match codec.decode(&mut src).unwrap() {
            Some(Frame::BadMessage { reason }) => assert!(reason.contains("nested")),
            other => panic!("Expected bad message, got {:?}", other),
        }
        assert_eq!(codec.state(), DecoderState::BadMessage);
    }

    #[test]
    fn test_oversized_frame_rejected_before_buffering() {
        let mut codec = AmqpCodec::frames_only();
        codec.set_max_frame_size(16);
        let mut src = BytesMut::from(&[3u8, 0, 1, 0, 0, 1, 0][..]);
        src.put_u8(0);
        assert!(matches!(
            codec.decode(&mut src).unwrap(),
            Some(Frame::BadMessage { .. })
        ));
    }

    #[test]
    fn test_encoding_bad_message_fails() {
        let mut codec = AmqpCodec::new();
        let mut dst = BytesMut::new();
        let result = codec.encode(
            Frame::BadMessage {
                reason: "x".to_string(),
            },
            &mut dst,
        );
        assert!(result.is_err());
        assert!(dst.is_empty());
    }

    #[test]
    fn test_body_frames_split() {
        let body = Bytes::from_static(b"0123456789");
        let frames = body_frames(3, &body, 4);
        let sizes: Vec<usize> = frames
            .iter()
            .map(|f| match f {
                Frame::Body { payload, .. } => payload.len(),
                _ => 0,
            })
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(body_frames(3, &Bytes::new(), 4).is_empty());
    }

    proptest! {
        #[test]
        fn prop_decoding_is_independent_of_chunking(cuts in proptest::collection::vec(1usize..32, 1..20)) {
            let stream = encode_all(&sample_frames());
            let mut codec = AmqpCodec::frames_only();
            let mut src = BytesMut::new();
            let mut frames = Vec::new();
            let mut offset = 0;
            for cut in cuts.iter().cycle() {
                if offset >= stream.len() {
                    break;
                }
                let end = (offset + cut).min(stream.len());
                src.extend_from_slice(&stream[offset..end]);
                offset = end;
                frames.extend(decode_all(&mut codec, &mut src));
            }
            prop_assert_eq!(frames, sample_frames());
        }
    }
}
