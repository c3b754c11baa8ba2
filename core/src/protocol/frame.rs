use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::method::Method;
use super::types::{
    put_short_string, read_short_string, read_u16, read_u64, read_u8, FieldTable,
};
use super::Result;

/// The 8 byte header a client sends before any frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
}

impl ProtocolHeader {
    pub fn supported() -> Self {
        let (major, minor, revision) = super::PROTOCOL_VERSION;
        Self {
            major,
            minor,
            revision,
        }
    }

    pub fn is_supported(&self) -> bool {
        (self.major, self.minor, self.revision) == super::PROTOCOL_VERSION
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(super::PROTOCOL_ID);
        dst.put_u8(0);
        dst.put_u8(self.major);
        dst.put_u8(self.minor);
        dst.put_u8(self.revision);
    }
}

/// A decoded protocol unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Protocol header received while in the initial decoder state
    ProtocolInit(ProtocolHeader),
    Method { channel: u16, method: Method },
    Header { channel: u16, header: ContentHeader },
    Body { channel: u16, payload: Bytes },
    Heartbeat,
    /// Emitted once when the decoder gives up on the stream. Every byte after
    /// it is discarded until the connection closes.
    BadMessage { reason: String },
}

impl Frame {
    pub fn method(channel: u16, method: Method) -> Self {
        Frame::Method { channel, method }
    }

    pub fn channel(&self) -> u16 {
        match self {
            Frame::Method { channel, .. }
            | Frame::Header { channel, .. }
            | Frame::Body { channel, .. } => *channel,
            _ => 0,
        }
    }
}

const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_CONTENT_ENCODING: u16 = 1 << 14;
const FLAG_HEADERS: u16 = 1 << 13;
const FLAG_DELIVERY_MODE: u16 = 1 << 12;
const FLAG_PRIORITY: u16 = 1 << 11;
const FLAG_CORRELATION_ID: u16 = 1 << 10;
const FLAG_REPLY_TO: u16 = 1 << 9;
const FLAG_EXPIRATION: u16 = 1 << 8;
const FLAG_MESSAGE_ID: u16 = 1 << 7;
const FLAG_TIMESTAMP: u16 = 1 << 6;
const FLAG_TYPE: u16 = 1 << 5;
const FLAG_USER_ID: u16 = 1 << 4;
const FLAG_APP_ID: u16 = 1 << 3;

/// `delivery_mode` value marking a message as persistent
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Properties carried by a `basic` content header
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

impl BasicProperties {
    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(PERSISTENT_DELIVERY_MODE)
    }

    fn flags(&self) -> u16 {
        let mut flags = 0u16;
        let mut set = |present: bool, flag: u16| {
            if present {
                flags |= flag;
            }
        };
        set(self.content_type.is_some(), FLAG_CONTENT_TYPE);
        set(self.content_encoding.is_some(), FLAG_CONTENT_ENCODING);
        set(self.headers.is_some(), FLAG_HEADERS);
        set(self.delivery_mode.is_some(), FLAG_DELIVERY_MODE);
        set(self.priority.is_some(), FLAG_PRIORITY);
        set(self.correlation_id.is_some(), FLAG_CORRELATION_ID);
        set(self.reply_to.is_some(), FLAG_REPLY_TO);
        set(self.expiration.is_some(), FLAG_EXPIRATION);
        set(self.message_id.is_some(), FLAG_MESSAGE_ID);
        set(self.timestamp.is_some(), FLAG_TIMESTAMP);
        set(self.message_type.is_some(), FLAG_TYPE);
        set(self.user_id.is_some(), FLAG_USER_ID);
        set(self.app_id.is_some(), FLAG_APP_ID);
        flags
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let flags = read_u16(buf)?;
        let short = |buf: &mut Bytes, flag: u16| -> Result<Option<String>> {
            if flags & flag != 0 {
                read_short_string(buf).map(Some)
            } else {
                Ok(None)
            }
        };

        let content_type = short(buf, FLAG_CONTENT_TYPE)?;
        let content_encoding = short(buf, FLAG_CONTENT_ENCODING)?;
        let headers = if flags & FLAG_HEADERS != 0 {
            Some(FieldTable::decode(buf)?)
        } else {
            None
        };
        let delivery_mode = if flags & FLAG_DELIVERY_MODE != 0 {
            Some(read_u8(buf)?)
        } else {
            None
        };
        let priority = if flags & FLAG_PRIORITY != 0 {
            Some(read_u8(buf)?)
        } else {
            None
        };
        let correlation_id = short(buf, FLAG_CORRELATION_ID)?;
        let reply_to = short(buf, FLAG_REPLY_TO)?;
        let expiration = short(buf, FLAG_EXPIRATION)?;
        let message_id = short(buf, FLAG_MESSAGE_ID)?;
        let timestamp = if flags & FLAG_TIMESTAMP != 0 {
            Some(read_u64(buf)?)
        } else {
            None
        };
        let message_type = short(buf, FLAG_TYPE)?;
        let user_id = short(buf, FLAG_USER_ID)?;
        let app_id = short(buf, FLAG_APP_ID)?;

        Ok(Self {
            content_type,
            content_encoding,
            headers,
            delivery_mode,
            priority,
            correlation_id,
            reply_to,
            expiration,
            message_id,
            timestamp,
            message_type,
            user_id,
            app_id,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u16(self.flags());
        let short = |dst: &mut BytesMut, value: &Option<String>| -> Result<()> {
            match value {
                Some(v) => put_short_string(dst, v),
                None => Ok(()),
            }
        };

        short(dst, &self.content_type)?;
        short(dst, &self.content_encoding)?;
        if let Some(headers) = &self.headers {
            headers.encode(dst)?;
        }
        if let Some(mode) = self.delivery_mode {
            dst.put_u8(mode);
        }
        if let Some(priority) = self.priority {
            dst.put_u8(priority);
        }
        short(dst, &self.correlation_id)?;
        short(dst, &self.reply_to)?;
        short(dst, &self.expiration)?;
        short(dst, &self.message_id)?;
        if let Some(timestamp) = self.timestamp {
            dst.put_u64(timestamp);
        }
        short(dst, &self.message_type)?;
        short(dst, &self.user_id)?;
        short(dst, &self.app_id)?;
        Ok(())
    }
}

/// Payload of a content header frame (type 2)
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    pub class_id: u16,
    pub body_size: u64,
    pub properties: BasicProperties,
}

impl ContentHeader {
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let class_id = read_u16(buf)?;
        // weight, unused
        let _ = read_u16(buf)?;
        let body_size = read_u64(buf)?;
        let properties = BasicProperties::decode(buf)?;
        Ok(Self {
            class_id,
            body_size,
            properties,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u16(self.class_id);
        dst.put_u16(0);
        dst.put_u64(self.body_size);
        self.properties.encode(dst)
    }
}
