//! AMQP method bodies and the `(class, method)` parser registry.
//!
//! Every method the broker understands can be encoded and decoded. Decoding
//! goes through [`MethodRegistry`], which maps a `(class_id, method_id)` pair
//! onto a parser function; pairs without a parser are rejected as
//! [`DecodeError::UnknownMethod`].

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::OnceLock;

use super::types::{
    flag_set, pack_flags, put_long_string, put_short_string, read_bool, read_long_string,
    read_short_string, read_u16, read_u32, read_u64, read_u8, skip, FieldTable,
};
use super::{DecodeError, Result};
use crate::transaction::Xid;

pub const CLASS_CONNECTION: u16 = 10;
pub const CLASS_CHANNEL: u16 = 20;
pub const CLASS_EXCHANGE: u16 = 40;
pub const CLASS_QUEUE: u16 = 50;
pub const CLASS_BASIC: u16 = 60;
pub const CLASS_TX: u16 = 90;
pub const CLASS_DTX: u16 = 100;

/// XA result codes returned by the `dtx` `*-ok` methods
pub const XA_OK: u16 = 0;
pub const XA_RBROLLBACK: u16 = 1;
pub const XA_RBTIMEOUT: u16 = 2;
pub const XA_HEURCOM: u16 = 4;
pub const XA_HEURRB: u16 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: FieldTable,
        mechanisms: Bytes,
        locales: Bytes,
    },
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        response: Bytes,
        locale: String,
    },
    ConnectionSecure {
        challenge: Bytes,
    },
    ConnectionSecureOk {
        response: Bytes,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        virtual_host: String,
    },
    ConnectionOpenOk,
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,

    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,

    ExchangeDeclare {
        exchange: String,
        exchange_type: String,
        passive: bool,
        durable: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeDeclareOk,
    ExchangeDelete {
        exchange: String,
        if_unused: bool,
        no_wait: bool,
    },
    ExchangeDeleteOk,

    QueueDeclare {
        queue: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueBindOk,
    QueuePurge {
        queue: String,
        no_wait: bool,
    },
    QueuePurgeOk {
        message_count: u32,
    },
    QueueDelete {
        queue: String,
        if_unused: bool,
        if_empty: bool,
        no_wait: bool,
    },
    QueueDeleteOk {
        message_count: u32,
    },
    QueueUnbind {
        queue: String,
        exchange: String,
        routing_key: String,
        arguments: FieldTable,
    },
    QueueUnbindOk,

    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
        no_wait: bool,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicReject {
        delivery_tag: u64,
        requeue: bool,
    },
    BasicRecover {
        requeue: bool,
    },
    BasicRecoverOk,

    TxSelect,
    TxSelectOk,
    TxCommit,
    TxCommitOk,
    TxRollback,
    TxRollbackOk,

    DtxSelect,
    DtxSelectOk,
    DtxStart {
        xid: Xid,
        join: bool,
        resume: bool,
    },
    DtxStartOk {
        xa_result: u16,
    },
    DtxEnd {
        xid: Xid,
        fail: bool,
        suspend: bool,
    },
    DtxEndOk {
        xa_result: u16,
    },
    DtxCommit {
        xid: Xid,
        one_phase: bool,
    },
    DtxCommitOk {
        xa_result: u16,
    },
    DtxForget {
        xid: Xid,
    },
    DtxForgetOk,
    DtxPrepare {
        xid: Xid,
    },
    DtxPrepareOk {
        xa_result: u16,
    },
    DtxRecover,
    DtxRecoverOk {
        xids: Vec<Xid>,
    },
    DtxRollback {
        xid: Xid,
    },
    DtxRollbackOk {
        xa_result: u16,
    },
    DtxSetTimeout {
        xid: Xid,
        timeout: u64,
    },
    DtxSetTimeoutOk,
}

impl Method {
    /// `(class_id, method_id)` on the wire
    pub fn id(&self) -> (u16, u16) {
        use Method::*;
        match self {
            ConnectionStart { .. } => (CLASS_CONNECTION, 10),
            ConnectionStartOk { .. } => (CLASS_CONNECTION, 11),
            ConnectionSecure { .. } => (CLASS_CONNECTION, 20),
            ConnectionSecureOk { .. } => (CLASS_CONNECTION, 21),
            ConnectionTune { .. } => (CLASS_CONNECTION, 30),
            ConnectionTuneOk { .. } => (CLASS_CONNECTION, 31),
            ConnectionOpen { .. } => (CLASS_CONNECTION, 40),
            ConnectionOpenOk => (CLASS_CONNECTION, 41),
            ConnectionClose { .. } => (CLASS_CONNECTION, 50),
            ConnectionCloseOk => (CLASS_CONNECTION, 51),
            ChannelOpen => (CLASS_CHANNEL, 10),
            ChannelOpenOk => (CLASS_CHANNEL, 11),
            ChannelFlow { .. } => (CLASS_CHANNEL, 20),
            ChannelFlowOk { .. } => (CLASS_CHANNEL, 21),
            ChannelClose { .. } => (CLASS_CHANNEL, 40),
            ChannelCloseOk => (CLASS_CHANNEL, 41),
            ExchangeDeclare { .. } => (CLASS_EXCHANGE, 10),
            ExchangeDeclareOk => (CLASS_EXCHANGE, 11),
            ExchangeDelete { .. } => (CLASS_EXCHANGE, 20),
            ExchangeDeleteOk => (CLASS_EXCHANGE, 21),
            QueueDeclare { .. } => (CLASS_QUEUE, 10),
            QueueDeclareOk { .. } => (CLASS_QUEUE, 11),
            QueueBind { .. } => (CLASS_QUEUE, 20),
            QueueBindOk => (CLASS_QUEUE, 21),
            QueuePurge { .. } => (CLASS_QUEUE, 30),
            QueuePurgeOk { .. } => (CLASS_QUEUE, 31),
            QueueDelete { .. } => (CLASS_QUEUE, 40),
            QueueDeleteOk { .. } => (CLASS_QUEUE, 41),
            QueueUnbind { .. } => (CLASS_QUEUE, 50),
            QueueUnbindOk => (CLASS_QUEUE, 51),
            BasicQos { .. } => (CLASS_BASIC, 10),
            BasicQosOk => (CLASS_BASIC, 11),
            BasicConsume { .. } => (CLASS_BASIC, 20),
            BasicConsumeOk { .. } => (CLASS_BASIC, 21),
            BasicCancel { .. } => (CLASS_BASIC, 30),
            BasicCancelOk { .. } => (CLASS_BASIC, 31),
            BasicPublish { .. } => (CLASS_BASIC, 40),
            BasicDeliver { .. } => (CLASS_BASIC, 60),
            BasicAck { .. } => (CLASS_BASIC, 80),
            BasicReject { .. } => (CLASS_BASIC, 90),
            BasicRecover { .. } => (CLASS_BASIC, 110),
            BasicRecoverOk => (CLASS_BASIC, 111),
            TxSelect => (CLASS_TX, 10),
            TxSelectOk => (CLASS_TX, 11),
            TxCommit => (CLASS_TX, 20),
            TxCommitOk => (CLASS_TX, 21),
            TxRollback => (CLASS_TX, 30),
            TxRollbackOk => (CLASS_TX, 31),
            DtxSelect => (CLASS_DTX, 10),
            DtxSelectOk => (CLASS_DTX, 11),
            DtxStart { .. } => (CLASS_DTX, 20),
            DtxStartOk { .. } => (CLASS_DTX, 21),
            DtxEnd { .. } => (CLASS_DTX, 30),
            DtxEndOk { .. } => (CLASS_DTX, 31),
            DtxCommit { .. } => (CLASS_DTX, 40),
            DtxCommitOk { .. } => (CLASS_DTX, 41),
            DtxForget { .. } => (CLASS_DTX, 50),
            DtxForgetOk => (CLASS_DTX, 51),
            DtxPrepare { .. } => (CLASS_DTX, 70),
            DtxPrepareOk { .. } => (CLASS_DTX, 71),
            DtxRecover => (CLASS_DTX, 80),
            DtxRecoverOk { .. } => (CLASS_DTX, 81),
            DtxRollback { .. } => (CLASS_DTX, 90),
            DtxRollbackOk { .. } => (CLASS_DTX, 91),
            DtxSetTimeout { .. } => (CLASS_DTX, 100),
            DtxSetTimeoutOk => (CLASS_DTX, 101),
        }
    }

    /// Encode the class id, method id and arguments.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        use Method::*;
        let (class_id, method_id) = self.id();
        dst.put_u16(class_id);
        dst.put_u16(method_id);

        match self {
            ConnectionStart {
                version_major,
                version_minor,
                server_properties,
                mechanisms,
                locales,
            } => {
                dst.put_u8(*version_major);
                dst.put_u8(*version_minor);
                server_properties.encode(dst)?;
                put_long_string(dst, mechanisms)?;
                put_long_string(dst, locales)?;
            }
            ConnectionStartOk {
                client_properties,
                mechanism,
                response,
                locale,
            } => {
                client_properties.encode(dst)?;
                put_short_string(dst, mechanism)?;
                put_long_string(dst, response)?;
                put_short_string(dst, locale)?;
            }
            ConnectionSecure { challenge } => put_long_string(dst, challenge)?,
            ConnectionSecureOk { response } => put_long_string(dst, response)?,
            ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            }
            | ConnectionTuneOk {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                dst.put_u16(*channel_max);
                dst.put_u32(*frame_max);
                dst.put_u16(*heartbeat);
            }
            ConnectionOpen { virtual_host } => {
                put_short_string(dst, virtual_host)?;
                put_short_string(dst, "")?;
                dst.put_u8(0);
            }
            ConnectionOpenOk => put_short_string(dst, "")?,
            ConnectionClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            }
            | ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => {
                dst.put_u16(*reply_code);
                put_short_string(dst, reply_text)?;
                dst.put_u16(*class_id);
                dst.put_u16(*method_id);
            }
            ChannelOpen => put_short_string(dst, "")?,
            ChannelOpenOk => put_long_string(dst, b"")?,
            ChannelFlow { active } | ChannelFlowOk { active } => dst.put_u8(u8::from(*active)),
            ExchangeDeclare {
                exchange,
                exchange_type,
                passive,
                durable,
                no_wait,
                arguments,
            } => {
                dst.put_u16(0);
                put_short_string(dst, exchange)?;
                put_short_string(dst, exchange_type)?;
                dst.put_u8(pack_flags(&[*passive, *durable, false, false, *no_wait]));
                arguments.encode(dst)?;
            }
            ExchangeDelete {
                exchange,
                if_unused,
                no_wait,
            } => {
                dst.put_u16(0);
                put_short_string(dst, exchange)?;
                dst.put_u8(pack_flags(&[*if_unused, *no_wait]));
            }
            QueueDeclare {
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
                arguments,
            } => {
                dst.put_u16(0);
                put_short_string(dst, queue)?;
                dst.put_u8(pack_flags(&[
                    *passive,
                    *durable,
                    *exclusive,
                    *auto_delete,
                    *no_wait,
                ]));
                arguments.encode(dst)?;
            }
            QueueDeclareOk {
                queue,
                message_count,
                consumer_count,
            } => {
                put_short_string(dst, queue)?;
                dst.put_u32(*message_count);
                dst.put_u32(*consumer_count);
            }
            QueueBind {
                queue,
                exchange,
                routing_key,
                no_wait,
                arguments,
            } => {
                dst.put_u16(0);
                put_short_string(dst, queue)?;
                put_short_string(dst, exchange)?;
                put_short_string(dst, routing_key)?;
                dst.put_u8(u8::from(*no_wait));
                arguments.encode(dst)?;
            }
            QueuePurge { queue, no_wait } => {
                dst.put_u16(0);
                put_short_string(dst, queue)?;
                dst.put_u8(u8::from(*no_wait));
            }
            QueuePurgeOk { message_count } | QueueDeleteOk { message_count } => {
                dst.put_u32(*message_count)
            }
            QueueDelete {
                queue,
                if_unused,
                if_empty,
                no_wait,
            } => {
                dst.put_u16(0);
                put_short_string(dst, queue)?;
                dst.put_u8(pack_flags(&[*if_unused, *if_empty, *no_wait]));
            }
            QueueUnbind {
                queue,
                exchange,
                routing_key,
                arguments,
            } => {
                dst.put_u16(0);
                put_short_string(dst, queue)?;
                put_short_string(dst, exchange)?;
                put_short_string(dst, routing_key)?;
                arguments.encode(dst)?;
            }
            BasicQos {
                prefetch_size,
                prefetch_count,
                global,
            } => {
                dst.put_u32(*prefetch_size);
                dst.put_u16(*prefetch_count);
                dst.put_u8(u8::from(*global));
            }
            BasicConsume {
                queue,
                consumer_tag,
                no_local,
                no_ack,
                exclusive,
                no_wait,
                arguments,
            } => {
                dst.put_u16(0);
                put_short_string(dst, queue)?;
                put_short_string(dst, consumer_tag)?;
                dst.put_u8(pack_flags(&[*no_local, *no_ack, *exclusive, *no_wait]));
                arguments.encode(dst)?;
            }
            BasicConsumeOk { consumer_tag } | BasicCancelOk { consumer_tag } => {
                put_short_string(dst, consumer_tag)?
            }
            BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                put_short_string(dst, consumer_tag)?;
                dst.put_u8(u8::from(*no_wait));
            }
            BasicPublish {
                exchange,
                routing_key,
                mandatory,
                immediate,
            } => {
                dst.put_u16(0);
                put_short_string(dst, exchange)?;
                put_short_string(dst, routing_key)?;
                dst.put_u8(pack_flags(&[*mandatory, *immediate]));
            }
            BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                put_short_string(dst, consumer_tag)?;
                dst.put_u64(*delivery_tag);
                dst.put_u8(u8::from(*redelivered));
                put_short_string(dst, exchange)?;
                put_short_string(dst, routing_key)?;
            }
            BasicAck {
                delivery_tag,
                multiple,
            } => {
                dst.put_u64(*delivery_tag);
                dst.put_u8(u8::from(*multiple));
            }
            BasicReject {
                delivery_tag,
                requeue,
            } => {
                dst.put_u64(*delivery_tag);
                dst.put_u8(u8::from(*requeue));
            }
            BasicRecover { requeue } => dst.put_u8(u8::from(*requeue)),
            DtxStart { xid, join, resume } => {
                put_xid(dst, xid)?;
                dst.put_u8(pack_flags(&[*join, *resume]));
            }
            DtxEnd { xid, fail, suspend } => {
                put_xid(dst, xid)?;
                dst.put_u8(pack_flags(&[*fail, *suspend]));
            }
            DtxCommit { xid, one_phase } => {
                put_xid(dst, xid)?;
                dst.put_u8(u8::from(*one_phase));
            }
            DtxForget { xid } | DtxPrepare { xid } | DtxRollback { xid } => put_xid(dst, xid)?,
            DtxSetTimeout { xid, timeout } => {
                put_xid(dst, xid)?;
                dst.put_u64(*timeout);
            }
            DtxStartOk { xa_result }
            | DtxEndOk { xa_result }
            | DtxCommitOk { xa_result }
            | DtxPrepareOk { xa_result }
            | DtxRollbackOk { xa_result } => dst.put_u16(*xa_result),
            DtxRecoverOk { xids } => {
                let count = u32::try_from(xids.len()).map_err(|_| {
                    DecodeError::InvalidFormat("Too many xids in dtx.recover-ok".to_string())
                })?;
                dst.put_u32(count);
                for xid in xids {
                    put_xid(dst, xid)?;
                }
            }
            ExchangeDeclareOk | ExchangeDeleteOk | QueueBindOk | QueueUnbindOk | BasicQosOk
            | BasicRecoverOk | ChannelCloseOk | ConnectionCloseOk | TxSelect | TxSelectOk
            | TxCommit | TxCommitOk | TxRollback | TxRollbackOk | DtxSelect | DtxSelectOk
            | DtxForgetOk | DtxRecover | DtxSetTimeoutOk => {}
        }
        Ok(())
    }
}

fn read_xid(buf: &mut Bytes) -> Result<Xid> {
    Ok(Xid {
        format_id: read_u16(buf)?,
        global_id: read_long_string(buf)?,
        branch_id: read_long_string(buf)?,
    })
}

fn put_xid(dst: &mut BytesMut, xid: &Xid) -> Result<()> {
    dst.put_u16(xid.format_id);
    put_long_string(dst, &xid.global_id)?;
    put_long_string(dst, &xid.branch_id)
}

/// Parses the arguments of one method; the class and method ids have
/// already been consumed.
pub type MethodParser = fn(&mut Bytes) -> Result<Method>;

/// Lookup table from `(class_id, method_id)` to the parser for that method
pub struct MethodRegistry {
    parsers: HashMap<(u16, u16), MethodParser>,
}

impl MethodRegistry {
    /// Registry shared by every codec instance
    pub fn global() -> &'static MethodRegistry {
        static REGISTRY: OnceLock<MethodRegistry> = OnceLock::new();
        REGISTRY.get_or_init(MethodRegistry::new)
    }

    pub fn new() -> Self {
        let mut registry = Self {
            parsers: HashMap::with_capacity(72),
        };
        registry.register_connection();
        registry.register_channel();
        registry.register_exchange();
        registry.register_queue();
        registry.register_basic();
        registry.register_tx();
        registry.register_dtx();
        registry
    }

    pub fn register(&mut self, class_id: u16, method_id: u16, parser: MethodParser) {
        self.parsers.insert((class_id, method_id), parser);
    }

    pub fn contains(&self, class_id: u16, method_id: u16) -> bool {
        self.parsers.contains_key(&(class_id, method_id))
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    pub fn parse(&self, class_id: u16, method_id: u16, buf: &mut Bytes) -> Result<Method> {
        let parser = self
            .parsers
            .get(&(class_id, method_id))
            .ok_or(DecodeError::UnknownMethod {
                class_id,
                method_id,
            })?;
        parser(buf)
    }

    fn register_connection(&mut self) {
        self.register(CLASS_CONNECTION, 10, |buf| {
            Ok(Method::ConnectionStart {
                version_major: read_u8(buf)?,
                version_minor: read_u8(buf)?,
                server_properties: FieldTable::decode(buf)?,
                mechanisms: read_long_string(buf)?,
                locales: read_long_string(buf)?,
            })
        });
        self.register(CLASS_CONNECTION, 11, |buf| {
            Ok(Method::ConnectionStartOk {
                client_properties: FieldTable::decode(buf)?,
                mechanism: read_short_string(buf)?,
                response: read_long_string(buf)?,
                locale: read_short_string(buf)?,
            })
        });
        self.register(CLASS_CONNECTION, 20, |buf| {
            Ok(Method::ConnectionSecure {
                challenge: read_long_string(buf)?,
            })
        });
        self.register(CLASS_CONNECTION, 21, |buf| {
            Ok(Method::ConnectionSecureOk {
                response: read_long_string(buf)?,
            })
        });
        self.register(CLASS_CONNECTION, 30, |buf| {
            Ok(Method::ConnectionTune {
                channel_max: read_u16(buf)?,
                frame_max: read_u32(buf)?,
                heartbeat: read_u16(buf)?,
            })
        });
        self.register(CLASS_CONNECTION, 31, |buf| {
            Ok(Method::ConnectionTuneOk {
                channel_max: read_u16(buf)?,
                frame_max: read_u32(buf)?,
                heartbeat: read_u16(buf)?,
            })
        });
        self.register(CLASS_CONNECTION, 40, |buf| {
            let virtual_host = read_short_string(buf)?;
            // reserved capabilities and insist bit
            read_short_string(buf)?;
            read_u8(buf)?;
            Ok(Method::ConnectionOpen { virtual_host })
        });
        self.register(CLASS_CONNECTION, 41, |buf| {
            read_short_string(buf)?;
            Ok(Method::ConnectionOpenOk)
        });
        self.register(CLASS_CONNECTION, 50, |buf| {
            Ok(Method::ConnectionClose {
                reply_code: read_u16(buf)?,
                reply_text: read_short_string(buf)?,
                class_id: read_u16(buf)?,
                method_id: read_u16(buf)?,
            })
        });
        self.register(CLASS_CONNECTION, 51, |_| Ok(Method::ConnectionCloseOk));
    }

    fn register_channel(&mut self) {
        self.register(CLASS_CHANNEL, 10, |buf| {
            read_short_string(buf)?;
            Ok(Method::ChannelOpen)
        });
        self.register(CLASS_CHANNEL, 11, |buf| {
            read_long_string(buf)?;
            Ok(Method::ChannelOpenOk)
        });
        self.register(CLASS_CHANNEL, 20, |buf| {
            Ok(Method::ChannelFlow {
                active: read_bool(buf)?,
            })
        });
        self.register(CLASS_CHANNEL, 21, |buf| {
            Ok(Method::ChannelFlowOk {
                active: read_bool(buf)?,
            })
        });
        self.register(CLASS_CHANNEL, 40, |buf| {
            Ok(Method::ChannelClose {
                reply_code: read_u16(buf)?,
                reply_text: read_short_string(buf)?,
                class_id: read_u16(buf)?,
                method_id: read_u16(buf)?,
            })
        });
        self.register(CLASS_CHANNEL, 41, |_| Ok(Method::ChannelCloseOk));
    }

    fn register_exchange(&mut self) {
        self.register(CLASS_EXCHANGE, 10, |buf| {
            skip(buf, 2)?;
            let exchange = read_short_string(buf)?;
            let exchange_type = read_short_string(buf)?;
            let flags = read_u8(buf)?;
            Ok(Method::ExchangeDeclare {
                exchange,
                exchange_type,
                passive: flag_set(flags, 0x1),
                durable: flag_set(flags, 0x2),
                no_wait: flag_set(flags, 0x10),
                arguments: FieldTable::decode(buf)?,
            })
        });
        self.register(CLASS_EXCHANGE, 11, |_| Ok(Method::ExchangeDeclareOk));
        self.register(CLASS_EXCHANGE, 20, |buf| {
            skip(buf, 2)?;
            let exchange = read_short_string(buf)?;
            let flags = read_u8(buf)?;
            Ok(Method::ExchangeDelete {
                exchange,
                if_unused: flag_set(flags, 0x1),
                no_wait: flag_set(flags, 0x2),
            })
        });
        self.register(CLASS_EXCHANGE, 21, |_| Ok(Method::ExchangeDeleteOk));
    }

    fn register_queue(&mut self) {
        self.register(CLASS_QUEUE, 10, |buf| {
            skip(buf, 2)?;
            let queue = read_short_string(buf)?;
            let flags = read_u8(buf)?;
            Ok(Method::QueueDeclare {
                queue,
                passive: flag_set(flags, 0x1),
                durable: flag_set(flags, 0x2),
                exclusive: flag_set(flags, 0x4),
                auto_delete: flag_set(flags, 0x8),
                no_wait: flag_set(flags, 0x10),
                arguments: FieldTable::decode(buf)?,
            })
        });
        self.register(CLASS_QUEUE, 11, |buf| {
            Ok(Method::QueueDeclareOk {
                queue: read_short_string(buf)?,
                message_count: read_u32(buf)?,
                consumer_count: read_u32(buf)?,
            })
        });
        self.register(CLASS_QUEUE, 20, |buf| {
            skip(buf, 2)?;
            Ok(Method::QueueBind {
                queue: read_short_string(buf)?,
                exchange: read_short_string(buf)?,
                routing_key: read_short_string(buf)?,
                no_wait: read_bool(buf)?,
                arguments: FieldTable::decode(buf)?,
            })
        });
        self.register(CLASS_QUEUE, 21, |_| Ok(Method::QueueBindOk));
        self.register(CLASS_QUEUE, 30, |buf| {
            skip(buf, 2)?;
            Ok(Method::QueuePurge {
                queue: read_short_string(buf)?,
                no_wait: read_bool(buf)?,
            })
        });
        self.register(CLASS_QUEUE, 31, |buf| {
            Ok(Method::QueuePurgeOk {
                message_count: read_u32(buf)?,
            })
        });
        self.register(CLASS_QUEUE, 40, |buf| {
            skip(buf, 2)?;
            let queue = read_short_string(buf)?;
            let flags = read_u8(buf)?;
            Ok(Method::QueueDelete {
                queue,
                if_unused: flag_set(flags, 0x1),
                if_empty: flag_set(flags, 0x2),
                no_wait: flag_set(flags, 0x4),
            })
        });
        self.register(CLASS_QUEUE, 41, |buf| {
            Ok(Method::QueueDeleteOk {
                message_count: read_u32(buf)?,
            })
        });
        self.register(CLASS_QUEUE, 50, |buf| {
            skip(buf, 2)?;
            Ok(Method::QueueUnbind {
                queue: read_short_string(buf)?,
                exchange: read_short_string(buf)?,
                routing_key: read_short_string(buf)?,
                arguments: FieldTable::decode(buf)?,
            })
        });
        self.register(CLASS_QUEUE, 51, |_| Ok(Method::QueueUnbindOk));
    }

    fn register_basic(&mut self) {
        self.register(CLASS_BASIC, 10, |buf| {
            Ok(Method::BasicQos {
                prefetch_size: read_u32(buf)?,
                prefetch_count: read_u16(buf)?,
                global: read_bool(buf)?,
            })
        });
        self.register(CLASS_BASIC, 11, |_| Ok(Method::BasicQosOk));
        self.register(CLASS_BASIC, 20, |buf| {
            skip(buf, 2)?;
            let queue = read_short_string(buf)?;
            let consumer_tag = read_short_string(buf)?;
            let flags = read_u8(buf)?;
            Ok(Method::BasicConsume {
                queue,
                consumer_tag,
                no_local: flag_set(flags, 0x1),
                no_ack: flag_set(flags, 0x2),
                exclusive: flag_set(flags, 0x4),
                no_wait: flag_set(flags, 0x8),
                arguments: FieldTable::decode(buf)?,
            })
        });
        self.register(CLASS_BASIC, 21, |buf| {
            Ok(Method::BasicConsumeOk {
                consumer_tag: read_short_string(buf)?,
            })
        });
        self.register(CLASS_BASIC, 30, |buf| {
            Ok(Method::BasicCancel {
                consumer_tag: read_short_string(buf)?,
                no_wait: read_bool(buf)?,
            })
        });
        self.register(CLASS_BASIC, 31, |buf| {
            Ok(Method::BasicCancelOk {
                consumer_tag: read_short_string(buf)?,
            })
        });
        self.register(CLASS_BASIC, 40, |buf| {
            skip(buf, 2)?;
            let exchange = read_short_string(buf)?;
            let routing_key = read_short_string(buf)?;
            let flags = read_u8(buf)?;
            Ok(Method::BasicPublish {
                exchange,
                routing_key,
                mandatory: flag_set(flags, 0x1),
                immediate: flag_set(flags, 0x2),
            })
        });
        self.register(CLASS_BASIC, 60, |buf| {
            Ok(Method::BasicDeliver {
                consumer_tag: read_short_string(buf)?,
                delivery_tag: read_u64(buf)?,
                redelivered: read_bool(buf)?,
                exchange: read_short_string(buf)?,
                routing_key: read_short_string(buf)?,
            })
        });
        self.register(CLASS_BASIC, 80, |buf| {
            Ok(Method::BasicAck {
                delivery_tag: read_u64(buf)?,
                multiple: read_bool(buf)?,
            })
        });
        self.register(CLASS_BASIC, 90, |buf| {
            Ok(Method::BasicReject {
                delivery_tag: read_u64(buf)?,
                requeue: read_bool(buf)?,
            })
        });
        self.register(CLASS_BASIC, 110, |buf| {
            Ok(Method::BasicRecover {
                requeue: read_bool(buf)?,
            })
        });
        self.register(CLASS_BASIC, 111, |_| Ok(Method::BasicRecoverOk));
    }

    fn register_tx(&mut self) {
        self.register(CLASS_TX, 10, |_| Ok(Method::TxSelect));
        self.register(CLASS_TX, 11, |_| Ok(Method::TxSelectOk));
        self.register(CLASS_TX, 20, |_| Ok(Method::TxCommit));
        self.register(CLASS_TX, 21, |_| Ok(Method::TxCommitOk));
        self.register(CLASS_TX, 30, |_| Ok(Method::TxRollback));
        self.register(CLASS_TX, 31, |_| Ok(Method::TxRollbackOk));
    }

    fn register_dtx(&mut self) {
        self.register(CLASS_DTX, 10, |_| Ok(Method::DtxSelect));
        self.register(CLASS_DTX, 11, |_| Ok(Method::DtxSelectOk));
        self.register(CLASS_DTX, 20, |buf| {
            let xid = read_xid(buf)?;
            let flags = read_u8(buf)?;
            Ok(Method::DtxStart {
                xid,
                join: flag_set(flags, 0x1),
                resume: flag_set(flags, 0x2),
            })
        });
        self.register(CLASS_DTX, 21, |buf| {
            Ok(Method::DtxStartOk {
                xa_result: read_u16(buf)?,
            })
        });
        self.register(CLASS_DTX, 30, |buf| {
            let xid = read_xid(buf)?;
            let flags = read_u8(buf)?;
            Ok(Method::DtxEnd {
                xid,
                fail: flag_set(flags, 0x1),
                suspend: flag_set(flags, 0x2),
            })
        });
        self.register(CLASS_DTX, 31, |buf| {
            Ok(Method::DtxEndOk {
                xa_result: read_u16(buf)?,
            })
        });
        self.register(CLASS_DTX, 40, |buf| {
            let xid = read_xid(buf)?;
            let flags = read_u8(buf)?;
            Ok(Method::DtxCommit {
                xid,
                one_phase: flag_set(flags, 0x1),
            })
        });
        self.register(CLASS_DTX, 41, |buf| {
            Ok(Method::DtxCommitOk {
                xa_result: read_u16(buf)?,
            })
        });
        self.register(CLASS_DTX, 50, |buf| {
            Ok(Method::DtxForget {
                xid: read_xid(buf)?,
            })
        });
        self.register(CLASS_DTX, 51, |_| Ok(Method::DtxForgetOk));
        self.register(CLASS_DTX, 70, |buf| {
            Ok(Method::DtxPrepare {
                xid: read_xid(buf)?,
            })
        });
        self.register(CLASS_DTX, 71, |buf| {
            Ok(Method::DtxPrepareOk {
                xa_result: read_u16(buf)?,
            })
        });
        self.register(CLASS_DTX, 80, |_| Ok(Method::DtxRecover));
        self.register(CLASS_DTX, 81, |buf| {
            let count = read_u32(buf)?;
            let mut xids = Vec::new();
            for _ in 0..count {
                xids.push(read_xid(buf)?);
            }
            Ok(Method::DtxRecoverOk { xids })
        });
        self.register(CLASS_DTX, 90, |buf| {
            Ok(Method::DtxRollback {
                xid: read_xid(buf)?,
            })
        });
        self.register(CLASS_DTX, 91, |buf| {
            Ok(Method::DtxRollbackOk {
                xa_result: read_u16(buf)?,
            })
        });
        self.register(CLASS_DTX, 100, |buf| {
            Ok(Method::DtxSetTimeout {
                xid: read_xid(buf)?,
                timeout: read_u64(buf)?,
            })
        });
        self.register(CLASS_DTX, 101, |_| Ok(Method::DtxSetTimeoutOk));
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    fn round_trip(method: Method) -> Method {
        let mut dst = BytesMut::new();
        method.encode(&mut dst).unwrap();
        let mut buf = dst.freeze();
        let class_id = buf.get_u16();
        let method_id = buf.get_u16();
        let decoded = MethodRegistry::global()
            .parse(class_id, method_id, &mut buf)
            .unwrap();
        assert!(buf.is_empty(), "trailing bytes after {:?}", decoded);
        decoded
    }

    fn xid() -> Xid {
        Xid::new(1, &b"global-1"[..], &b"branch-1"[..])
    }

    #[test]
    fn test_every_method_id_has_a_parser() {
        let registry = MethodRegistry::new();
        let samples = vec![
            Method::ConnectionOpenOk,
            Method::ChannelOpen,
            Method::ExchangeDeleteOk,
            Method::QueueUnbindOk,
            Method::BasicRecoverOk,
            Method::TxRollbackOk,
            Method::DtxSetTimeoutOk,
            Method::DtxRecover,
        ];
        for method in samples {
            let (class_id, method_id) = method.id();
            assert!(registry.contains(class_id, method_id), "{:?}", method);
        }
        assert_eq!(registry.len(), 66);
    }

    #[test]
    fn test_unknown_method_pair_is_rejected() {
        let registry = MethodRegistry::new();
        let err = registry
            .parse(60, 70, &mut Bytes::new())
            .unwrap_err();
        assert!(matches!(
            err,
            DecodeError::UnknownMethod {
                class_id: 60,
                method_id: 70
            }
        ));
        assert!(registry.parse(999, 10, &mut Bytes::new()).is_err());
    }

    #[test]
    fn test_queue_declare_flags() {
        let method = Method::QueueDeclare {
            queue: "orders".to_string(),
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: true,
            no_wait: false,
            arguments: FieldTable::new(),
        };

        let mut dst = BytesMut::new();
        method.encode(&mut dst).unwrap();
        // class, method, reserved, "orders"
        assert_eq!(dst[4 + 2 + 1 + 6], 0x2 | 0x8);
        assert_eq!(round_trip(method.clone()), method);
    }

    #[test]
    fn test_publish_and_deliver_arguments() {
        let publish = Method::BasicPublish {
            exchange: "amq.topic".to_string(),
            routing_key: "stock.nyse.ibm".to_string(),
            mandatory: true,
            immediate: false,
        };
        assert_eq!(round_trip(publish.clone()), publish);

        let deliver = Method::BasicDeliver {
            consumer_tag: "sgen-1".to_string(),
            delivery_tag: 42,
            redelivered: true,
            exchange: String::new(),
            routing_key: "orders".to_string(),
        };
        assert_eq!(round_trip(deliver.clone()), deliver);
    }

    #[test]
    fn test_dtx_methods_carry_xid() {
        let start = Method::DtxStart {
            xid: xid(),
            join: false,
            resume: true,
        };
        assert_eq!(round_trip(start.clone()), start);

        let set_timeout = Method::DtxSetTimeout {
            xid: xid(),
            timeout: 30,
        };
        assert_eq!(round_trip(set_timeout.clone()), set_timeout);

        let recovered = Method::DtxRecoverOk {
            xids: vec![xid(), Xid::new(2, &b"g"[..], &b""[..])],
        };
        assert_eq!(round_trip(recovered.clone()), recovered);
    }

    #[test]
    fn test_truncated_arguments_fail() {
        let mut buf = Bytes::from_static(&[0, 0, 5, b'a']);
        let err = MethodRegistry::global()
            .parse(CLASS_QUEUE, 10, &mut buf)
            .unwrap_err();
        assert!(matches!(err, DecodeError::BufferUnderrun { .. }));
    }
}
