use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::protocol::BasicProperties;

/// Routing information and properties published with a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub exchange: String,
    pub routing_key: String,
    pub content_length: u64,
    pub properties: BasicProperties,
}

impl Metadata {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, content_length: u64) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            content_length,
            properties: BasicProperties::default(),
        }
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Absolute expiry time in epoch milliseconds taken from the `expiration`
    /// property. Zero, empty or unparsable values never expire.
    pub fn expiry_timestamp(&self) -> Option<i64> {
        self.properties
            .expiration
            .as_deref()
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|ts| *ts > 0)
    }
}

/// Metadata plus payload, shared between every queue the message was routed to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    pub metadata: Metadata,
    pub content: Bytes,
}

impl MessageData {
    pub fn new(metadata: Metadata, content: Bytes) -> Self {
        Self { metadata, content }
    }
}

/// A message reference held by a queue.
///
/// The data is optional: a "bare" message only carries its id and is filled
/// from the message store when it is about to be delivered.
#[derive(Debug, Clone)]
pub struct Message {
    id: u64,
    data: Option<Arc<MessageData>>,
    redelivery_count: u32,
    redelivered: bool,
}

impl Message {
    pub fn new(id: u64, data: Arc<MessageData>) -> Self {
        Self {
            id,
            data: Some(data),
            redelivery_count: 0,
            redelivered: false,
        }
    }

    pub fn bare(id: u64) -> Self {
        Self {
            id,
            data: None,
            redelivery_count: 0,
            redelivered: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn data(&self) -> Option<&Arc<MessageData>> {
        self.data.as_ref()
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.data.as_ref().map(|d| &d.metadata)
    }

    pub fn content(&self) -> Option<&Bytes> {
        self.data.as_ref().map(|d| &d.content)
    }

    pub fn has_content(&self) -> bool {
        self.data.is_some()
    }

    pub fn set_data(&mut self, data: Arc<MessageData>) {
        self.data = Some(data);
    }

    /// Drop the in-memory copy, keeping only the id
    pub fn clear_data(&mut self) {
        self.data = None;
    }

    /// Copy with the same id and delivery state but no data
    pub fn bare_copy(&self) -> Self {
        Self {
            id: self.id,
            data: None,
            redelivery_count: self.redelivery_count,
            redelivered: self.redelivered,
        }
    }

    /// Mark for redelivery and return the new redelivery count
    pub fn set_redeliver(&mut self) -> u32 {
        self.redelivered = true;
        self.redelivery_count += 1;
        self.redelivery_count
    }

    pub fn redelivery_count(&self) -> u32 {
        self.redelivery_count
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn is_persistent(&self) -> bool {
        self.metadata()
            .map(|m| m.properties.is_persistent())
            .unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.metadata()
            .and_then(Metadata::expiry_timestamp)
            .map(|expiry| chrono::Utc::now().timestamp_millis() > expiry)
            .unwrap_or(false)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.metadata() {
            Some(m) => write!(
                f,
                "Message{{id={}, exchange='{}', routing_key='{}', length={}}}",
                self.id, m.exchange, m.routing_key, m.content_length
            ),
            None => write!(f, "Message{{id={}, bare}}", self.id),
        }
    }
}
