//! Connection negotiation and channel multiplexing.
//!
//! [`AmqpConnection`] is a synchronous state machine fed with decoded frames
//! by the server's connection task. It writes replies to a [`FrameSink`] and
//! tells the caller when the transport should be closed.

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::channel::AmqpChannel;
use super::core::BrokerCore;
use crate::flow::FrameSink;
use crate::protocol::method::{CLASS_BASIC, CLASS_CHANNEL};
use crate::protocol::{FieldTable, FieldValue, Frame, Method, ProtocolHeader};
use crate::ValidationError;

/// Smallest `frame_max` a client may negotiate
pub const MIN_FRAME_MAX: u32 = 4096;

const LOCALES: &str = "en_US";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingProtocolHeader,
    AwaitingStartOk,
    AwaitingTuneOk,
    AwaitingOpen,
    Open,
    /// `connection.close` sent, waiting for `close-ok`
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    Continue,
    Close,
}

pub struct AmqpConnection {
    id: u64,
    broker: Arc<BrokerCore>,
    sink: Arc<dyn FrameSink>,
    state: ConnectionState,
    channels: HashMap<u16, AmqpChannel>,
    /// Channels closed by the broker, waiting for the client's close-ok
    closing_channels: HashSet<u16>,
    channel_max: u16,
    frame_max: u32,
    heartbeat: u16,
    user: Option<String>,
}

impl AmqpConnection {
    pub fn new(id: u64, broker: Arc<BrokerCore>, sink: Arc<dyn FrameSink>) -> Self {
        let network = &broker.config().network;
        let (channel_max, frame_max, heartbeat) =
            (network.channel_max, network.frame_max, network.heartbeat_secs);
        Self {
            id,
            broker,
            sink,
            state: ConnectionState::AwaitingProtocolHeader,
            channels: HashMap::new(),
            closing_channels: HashSet::new(),
            channel_max,
            frame_max,
            heartbeat,
            user: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Negotiated maximum frame size
    pub fn frame_max(&self) -> u32 {
        self.frame_max
    }

    /// Negotiated heartbeat interval in seconds, zero when disabled
    pub fn heartbeat(&self) -> u16 {
        self.heartbeat
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn handle_frame(&mut self, frame: Frame) -> ConnectionAction {
        match frame {
            Frame::ProtocolInit(header) => self.on_protocol_header(header),
            Frame::Heartbeat => ConnectionAction::Continue,
            Frame::BadMessage { reason } => {
                warn!(connection = self.id, reason = %reason, "Closing connection after malformed frame");
                ConnectionAction::Close
            }
            Frame::Method { channel: 0, method } => self.on_connection_method(method),
            frame => self.on_channel_frame(frame),
        }
    }

    fn on_protocol_header(&mut self, header: ProtocolHeader) -> ConnectionAction {
        if self.state != ConnectionState::AwaitingProtocolHeader {
            warn!(connection = self.id, "Unexpected protocol header");
            return ConnectionAction::Close;
        }
        if !header.is_supported() {
            info!(connection = self.id, ?header, "Unsupported protocol version requested");
            self.sink
                .write_and_flush(Frame::ProtocolInit(ProtocolHeader::supported()));
            return ConnectionAction::Close;
        }

        let server_properties = FieldTable::new()
            .with("product", FieldValue::LongString(Bytes::from_static(b"amqbroker")))
            .with(
                "version",
                FieldValue::LongString(Bytes::from_static(env!("CARGO_PKG_VERSION").as_bytes())),
            );
        self.reply(Method::ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties,
            mechanisms: Bytes::from_static(self.broker.authenticator().mechanisms().as_bytes()),
            locales: Bytes::from_static(LOCALES.as_bytes()),
        });
        self.state = ConnectionState::AwaitingStartOk;
        ConnectionAction::Continue
    }

    fn on_connection_method(&mut self, method: Method) -> ConnectionAction {
        if self.state == ConnectionState::Closing {
            return match method {
                Method::ConnectionCloseOk => ConnectionAction::Close,
                Method::ConnectionClose { .. } => {
                    self.reply(Method::ConnectionCloseOk);
                    ConnectionAction::Close
                }
                _ => ConnectionAction::Continue,
            };
        }

        let (class_id, method_id) = method.id();
        match (self.state, method) {
            (
                ConnectionState::AwaitingStartOk,
                Method::ConnectionStartOk {
                    mechanism, response, ..
                },
            ) => match self
                .broker
                .authenticator()
                .authenticate_sasl(&mechanism, &response)
            {
                Ok(user) => {
                    info!(connection = self.id, user = %user, "Client authenticated");
                    self.user = Some(user);
                    self.reply(Method::ConnectionTune {
                        channel_max: self.channel_max,
                        frame_max: self.frame_max,
                        heartbeat: self.heartbeat,
                    });
                    self.state = ConnectionState::AwaitingTuneOk;
                    ConnectionAction::Continue
                }
                Err(e) => {
                    warn!(connection = self.id, error = %e, "Authentication failed");
                    self.close_with_error(
                        ValidationError::access_refused(e.to_string()),
                        class_id,
                        method_id,
                    )
                }
            },
            (
                ConnectionState::AwaitingTuneOk,
                Method::ConnectionTuneOk {
                    channel_max,
                    frame_max,
                    heartbeat,
                },
            ) => {
                if frame_max != 0 && frame_max < MIN_FRAME_MAX {
                    return self.close_with_error(
                        ValidationError::not_allowed(format!(
                            "frame_max {} is below the minimum of {}",
                            frame_max, MIN_FRAME_MAX
                        )),
                        class_id,
                        method_id,
                    );
                }
                if channel_max != 0 {
                    self.channel_max = self.channel_max.min(channel_max);
                }
                if frame_max != 0 {
                    self.frame_max = self.frame_max.min(frame_max);
                }
                self.heartbeat = heartbeat;
                debug!(
                    connection = self.id,
                    channel_max = self.channel_max,
                    frame_max = self.frame_max,
                    heartbeat = self.heartbeat,
                    "Connection tuned"
                );
                self.state = ConnectionState::AwaitingOpen;
                ConnectionAction::Continue
            }
            (ConnectionState::AwaitingOpen, Method::ConnectionOpen { virtual_host }) => {
                debug!(connection = self.id, virtual_host = %virtual_host, "Connection opened");
                self.reply(Method::ConnectionOpenOk);
                self.state = ConnectionState::Open;
                ConnectionAction::Continue
            }
            (_, Method::ConnectionClose {
                reply_code,
                reply_text,
                ..
            }) => {
                debug!(connection = self.id, reply_code, reply_text = %reply_text, "Client closed connection");
                self.close_channels();
                self.reply(Method::ConnectionCloseOk);
                ConnectionAction::Close
            }
            (state, _) => self.close_with_error(
                ValidationError::command_invalid(format!(
                    "Unexpected method class={}, method={} in state {:?}",
                    class_id, method_id, state
                )),
                class_id,
                method_id,
            ),
        }
    }

    fn on_channel_frame(&mut self, frame: Frame) -> ConnectionAction {
        let channel_id = frame.channel();
        if self.state == ConnectionState::Closing {
            return ConnectionAction::Continue;
        }
        if self.state != ConnectionState::Open {
            return self.close_with_error(
                ValidationError::command_invalid("Channel frame before the connection was opened"),
                0,
                0,
            );
        }

        if self.closing_channels.contains(&channel_id) {
            // everything but the close handshake is discarded
            match frame {
                Frame::Method {
                    method: Method::ChannelCloseOk,
                    ..
                } => {
                    self.closing_channels.remove(&channel_id);
                }
                Frame::Method {
                    method: Method::ChannelClose { .. },
                    ..
                } => {
                    self.closing_channels.remove(&channel_id);
                    self.sink
                        .write_and_flush(Frame::method(channel_id, Method::ChannelCloseOk));
                }
                _ => {}
            }
            return ConnectionAction::Continue;
        }

        match frame {
            Frame::Method {
                method: Method::ChannelOpen,
                ..
            } => self.open_channel(channel_id),
            Frame::Method {
                method: Method::ChannelClose { reply_code, .. },
                ..
            } => {
                match self.channels.remove(&channel_id) {
                    Some(mut channel) => {
                        debug!(connection = self.id, channel = channel_id, reply_code, "Client closed channel");
                        channel.close();
                    }
                    None => return self.unknown_channel(channel_id, (CLASS_CHANNEL, 40)),
                }
                self.sink
                    .write_and_flush(Frame::method(channel_id, Method::ChannelCloseOk));
                ConnectionAction::Continue
            }
            Frame::Method {
                method: Method::ChannelCloseOk,
                ..
            } => ConnectionAction::Continue,
            Frame::Method { method, .. } => {
                let id = method.id();
                let Some(channel) = self.channels.get_mut(&channel_id) else {
                    return self.unknown_channel(channel_id, id);
                };
                if let Err(e) = channel.handle_method(method) {
                    self.close_channel_with_error(channel_id, e, id);
                }
                ConnectionAction::Continue
            }
            Frame::Header { header, .. } => {
                let Some(channel) = self.channels.get_mut(&channel_id) else {
                    return self.unknown_channel(channel_id, (CLASS_BASIC, 40));
                };
                if let Err(e) = channel.handle_header(header) {
                    self.close_channel_with_error(channel_id, e, (CLASS_BASIC, 40));
                }
                ConnectionAction::Continue
            }
            Frame::Body { payload, .. } => {
                let Some(channel) = self.channels.get_mut(&channel_id) else {
                    return self.unknown_channel(channel_id, (CLASS_BASIC, 40));
                };
                if let Err(e) = channel.handle_body(payload) {
                    self.close_channel_with_error(channel_id, e, (CLASS_BASIC, 40));
                }
                ConnectionAction::Continue
            }
            _ => ConnectionAction::Continue,
        }
    }

    fn open_channel(&mut self, channel_id: u16) -> ConnectionAction {
        if channel_id > self.channel_max || self.channels.contains_key(&channel_id) {
            return self.close_with_error(
                ValidationError::channel_error(format!(
                    "Channel {} is already open or out of range",
                    channel_id
                )),
                CLASS_CHANNEL,
                10,
            );
        }
        let channel = AmqpChannel::new(
            channel_id,
            Arc::clone(&self.broker),
            Arc::clone(&self.sink),
            self.frame_max,
        );
        self.channels.insert(channel_id, channel);
        self.sink
            .write_and_flush(Frame::method(channel_id, Method::ChannelOpenOk));
        ConnectionAction::Continue
    }

    fn unknown_channel(&mut self, channel_id: u16, (class_id, method_id): (u16, u16)) -> ConnectionAction {
        self.close_with_error(
            ValidationError::channel_error(format!("Channel {} is not open", channel_id)),
            class_id,
            method_id,
        )
    }

    /// Close a channel after a client error and wait for its close-ok.
    fn close_channel_with_error(&mut self, channel_id: u16, error: ValidationError, (class_id, method_id): (u16, u16)) {
        warn!(
            connection = self.id,
            channel = channel_id,
            reply_code = error.reply_code,
            reason = %error.reason,
            "Closing channel"
        );
        if let Some(mut channel) = self.channels.remove(&channel_id) {
            channel.close();
        }
        self.closing_channels.insert(channel_id);
        self.sink.write_and_flush(Frame::method(
            channel_id,
            Method::ChannelClose {
                reply_code: error.reply_code,
                reply_text: error.reply_text(),
                class_id,
                method_id,
            },
        ));
    }

    fn close_with_error(&mut self, error: ValidationError, class_id: u16, method_id: u16) -> ConnectionAction {
        warn!(
            connection = self.id,
            reply_code = error.reply_code,
            reason = %error.reason,
            "Closing connection"
        );
        self.close_channels();
        self.reply(Method::ConnectionClose {
            reply_code: error.reply_code,
            reply_text: error.reply_text(),
            class_id,
            method_id,
        });
        self.state = ConnectionState::Closing;
        ConnectionAction::Continue
    }

    fn close_channels(&mut self) {
        for (_, mut channel) in self.channels.drain() {
            channel.close();
        }
        self.closing_channels.clear();
    }

    fn reply(&self, method: Method) {
        self.sink.write_and_flush(Frame::method(0, method));
    }

    /// Release every channel once the transport is gone.
    pub fn on_disconnect(&mut self) {
        if !self.channels.is_empty() {
            debug!(connection = self.id, channels = self.channels.len(), "Closing channels of disconnected client");
        }
        self.close_channels();
    }
}

impl Drop for AmqpConnection {
    fn drop(&mut self) {
        self.close_channels();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::protocol::method::CLASS_CONNECTION;
    use crate::metrics::MetricsRegistry;
    use crate::store::InMemoryAdapter;
    use parking_lot::Mutex;
    use std::collections::HashMap as Map;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Frame>>,
    }

    impl RecordingSink {
        fn last_method(&self) -> Option<(u16, Method)> {
            self.frames.lock().iter().rev().find_map(|f| match f {
                Frame::Method { channel, method } => Some((*channel, method.clone())),
                _ => None,
            })
        }
    }

    impl FrameSink for RecordingSink {
        fn write(&self, frame: Frame) {
            self.frames.lock().push(frame);
        }

        fn write_and_flush(&self, frame: Frame) {
            self.write(frame);
        }

        fn flush(&self) {}
    }

    fn connection(config: BrokerConfig) -> (AmqpConnection, Arc<RecordingSink>) {
        let broker = BrokerCore::with_adapter(
            config.with_ring_buffer_size(64),
            Arc::new(InMemoryAdapter::new()),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        let sink = Arc::new(RecordingSink::default());
        (AmqpConnection::new(1, broker, sink.clone()), sink)
    }

    fn start_ok(response: &'static [u8]) -> Frame {
        Frame::method(
            0,
            Method::ConnectionStartOk {
                client_properties: FieldTable::new(),
                mechanism: "PLAIN".to_string(),
                response: Bytes::from_static(response),
                locale: "en_US".to_string(),
            },
        )
    }

    fn open(conn: &mut AmqpConnection) {
        conn.handle_frame(Frame::ProtocolInit(ProtocolHeader::supported()));
        conn.handle_frame(start_ok(b"\0guest\0guest"));
        conn.handle_frame(Frame::method(
            0,
            Method::ConnectionTuneOk {
                channel_max: 16,
                frame_max: 8192,
                heartbeat: 0,
            },
        ));
        conn.handle_frame(Frame::method(
            0,
            Method::ConnectionOpen {
                virtual_host: "/".to_string(),
            },
        ));
    }

    #[test]
    fn test_handshake() {
        let (mut conn, sink) = connection(BrokerConfig::default());
        open(&mut conn);
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.frame_max(), 8192);
        assert_eq!(conn.user(), Some("guest"));
        assert_eq!(sink.last_method(), Some((0, Method::ConnectionOpenOk)));
    }

    #[test]
    fn test_unsupported_protocol_version() {
        let (mut conn, sink) = connection(BrokerConfig::default());
        let header = ProtocolHeader {
            major: 0,
            minor: 8,
            revision: 0,
        };
        assert_eq!(conn.handle_frame(Frame::ProtocolInit(header)), ConnectionAction::Close);
        assert!(matches!(sink.frames.lock()[0], Frame::ProtocolInit(h) if h.is_supported()));
    }

    #[test]
    fn test_failed_authentication_closes_connection() {
        let users = Map::from([("admin".to_string(), "secret".to_string())]);
        let (mut conn, sink) = connection(BrokerConfig::default().with_plain_auth(users));
        conn.handle_frame(Frame::ProtocolInit(ProtocolHeader::supported()));
        conn.handle_frame(start_ok(b"\0admin\0wrong"));

        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(matches!(
            sink.last_method(),
            Some((0, Method::ConnectionClose { reply_code: 403, class_id, method_id, .. }))
                if (class_id, method_id) == (CLASS_CONNECTION, 11)
        ));
        assert_eq!(
            conn.handle_frame(Frame::method(0, Method::ConnectionCloseOk)),
            ConnectionAction::Close
        );
    }

    #[test]
    fn test_channel_error_closes_only_the_channel() {
        let (mut conn, sink) = connection(BrokerConfig::default());
        open(&mut conn);
        conn.handle_frame(Frame::method(1, Method::ChannelOpen));
        assert_eq!(sink.last_method(), Some((1, Method::ChannelOpenOk)));

        conn.handle_frame(Frame::method(
            1,
            Method::BasicConsume {
                queue: "missing".to_string(),
                consumer_tag: String::new(),
                no_local: false,
                no_ack: false,
                exclusive: false,
                no_wait: false,
                arguments: FieldTable::new(),
            },
        ));
        assert!(matches!(
            sink.last_method(),
            Some((1, Method::ChannelClose { reply_code: 404, class_id: 60, method_id: 20, .. }))
        ));
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.channel_count(), 0);

        // frames for the closing channel are dropped until close-ok
        conn.handle_frame(Frame::method(1, Method::BasicQos {
            prefetch_size: 0,
            prefetch_count: 1,
            global: false,
        }));
        conn.handle_frame(Frame::method(1, Method::ChannelCloseOk));
        conn.handle_frame(Frame::method(1, Method::ChannelOpen));
        assert_eq!(sink.last_method(), Some((1, Method::ChannelOpenOk)));
    }

    #[test]
    fn test_duplicate_channel_open_is_connection_error() {
        let (mut conn, sink) = connection(BrokerConfig::default());
        open(&mut conn);
        conn.handle_frame(Frame::method(1, Method::ChannelOpen));
        conn.handle_frame(Frame::method(1, Method::ChannelOpen));
        assert!(matches!(
            sink.last_method(),
            Some((0, Method::ConnectionClose { reply_code: 504, .. }))
        ));
        assert_eq!(conn.state(), ConnectionState::Closing);
    }
}
