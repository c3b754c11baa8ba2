//! AMQP 0-9-1 Wire Protocol
//!
//! This module turns the raw byte stream of a client connection into typed
//! [`Frame`] values and back again.
//!
//! The wire format of a frame is:
//! - `type: u8` (1 = method, 2 = content header, 3 = content body, 8 = heartbeat)
//! - `channel: u16`
//! - `payload_size: u32`
//! - `payload: [u8; payload_size]` (method frames start with `class: u16, method: u16`)
//! - `frame_end: u8` (always `0xCE`)
//!
//! All integers are big-endian. Before the first frame the client sends an
//! 8 byte protocol header (`"AMQP" 0 0 9 1`).

pub mod codec;
pub mod frame;
pub mod method;
pub mod types;

pub use codec::{AmqpCodec, DecoderState};
pub use frame::{BasicProperties, ContentHeader, Frame, ProtocolHeader};
pub use method::{Method, MethodRegistry};
pub use types::{FieldTable, FieldValue};

use std::io;
use thiserror::Error;

/// Marker byte closing every frame
pub const FRAME_END: u8 = 0xCE;

/// Frame type discriminants
pub const FRAME_METHOD: u8 = 1;
pub const FRAME_HEADER: u8 = 2;
pub const FRAME_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;

/// `type(1) + channel(2) + size(4)`
pub const FRAME_HEADER_SIZE: usize = 7;

/// Smallest complete frame: header plus the frame-end marker
pub const MIN_FRAME_SIZE: usize = FRAME_HEADER_SIZE + 1;

/// Protocol identifier sent by the client before the first frame
pub const PROTOCOL_ID: &[u8; 4] = b"AMQP";

/// Version advertised and accepted by the broker
pub const PROTOCOL_VERSION: (u8, u8, u8) = (0, 9, 1);

/// Errors produced while decoding or encoding frames.
///
/// Decode errors are always fatal to the connection: the codec converts them
/// into a [`Frame::BadMessage`] and discards everything that follows.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Unknown protocol identifier: {0:?}")]
    InvalidProtocolHeader([u8; 4]),
    #[error("Unknown frame type: {0}")]
    UnknownFrameType(u8),
    #[error("Unknown method: class={class_id}, method={method_id}")]
    UnknownMethod { class_id: u16, method_id: u16 },
    #[error("Invalid frame end marker: {0:#04x}")]
    InvalidFrameEnd(u8),
    #[error("Frame payload of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Buffer underrun: needed {needed}, available {available}")]
    BufferUnderrun { needed: usize, available: usize },
    #[error("Unknown field value type: {0:#04x}")]
    UnknownFieldType(u8),
    #[error("Field tables nested deeper than {max} levels")]
    NestingTooDeep { max: usize },
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

pub type Result<T> = std::result::Result<T, DecodeError>;
