use amqbroker::protocol::method::CLASS_BASIC;
use amqbroker::protocol::{BasicProperties, ContentHeader, FieldTable, ProtocolHeader};
use amqbroker::{
    AmqpCodec, BrokerConfig, BrokerCore, BrokerServer, Frame, InMemoryAdapter, Method,
    MetricsRegistry,
};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

type Client = Framed<TcpStream, AmqpCodec>;

/// Start a broker on an ephemeral port and connect a client reading with
/// `codec`.
async fn start_server(codec: AmqpCodec) -> Result<(Arc<BrokerServer>, JoinHandle<()>, Client)> {
    let core = BrokerCore::with_adapter(
        BrokerConfig::default().with_ring_buffer_size(64),
        Arc::new(InMemoryAdapter::new()),
        Arc::new(MetricsRegistry::new()),
    )?;
    let server = Arc::new(BrokerServer::with_core(core));
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            server.serve(listener).await.expect("Server failed");
        })
    };

    let stream = TcpStream::connect(addr).await?;
    Ok((server, task, Framed::new(stream, codec)))
}

async fn next_frame(client: &mut Client) -> Result<Frame> {
    let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .context("Timed out waiting for a frame")?
        .context("Connection closed by broker")??;
    Ok(frame)
}

async fn next_method(client: &mut Client) -> Result<(u16, Method)> {
    match next_frame(client).await? {
        Frame::Method { channel, method } => Ok((channel, method)),
        other => bail!("Expected a method frame, got {:?}", other),
    }
}

async fn open_connection(client: &mut Client) -> Result<()> {
    client
        .send(Frame::ProtocolInit(ProtocolHeader::supported()))
        .await?;
    let (_, start) = next_method(client).await?;
    let Method::ConnectionStart { mechanisms, .. } = start else {
        bail!("Expected connection.start, got {:?}", start);
    };
    assert_eq!(mechanisms, Bytes::from_static(b"PLAIN"));

    client
        .send(Frame::method(
            0,
            Method::ConnectionStartOk {
                client_properties: FieldTable::new(),
                mechanism: "PLAIN".to_string(),
                response: Bytes::from_static(b"\0guest\0guest"),
                locale: "en_US".to_string(),
            },
        ))
        .await?;
    let (_, tune) = next_method(client).await?;
    let Method::ConnectionTune { frame_max, .. } = tune else {
        bail!("Expected connection.tune, got {:?}", tune);
    };

    client
        .send(Frame::method(
            0,
            Method::ConnectionTuneOk {
                channel_max: 8,
                frame_max,
                heartbeat: 0,
            },
        ))
        .await?;
    client
        .send(Frame::method(
            0,
            Method::ConnectionOpen {
                virtual_host: "/".to_string(),
            },
        ))
        .await?;
    assert_eq!(next_method(client).await?, (0, Method::ConnectionOpenOk));
    Ok(())
}

#[tokio::test]
async fn test_publish_and_consume_over_tcp() -> Result<()> {
    let (server, task, mut client) = start_server(AmqpCodec::frames_only()).await?;
    open_connection(&mut client).await?;

    client.send(Frame::method(1, Method::ChannelOpen)).await?;
    assert_eq!(next_method(&mut client).await?, (1, Method::ChannelOpenOk));

    client
        .send(Frame::method(
            1,
            Method::QueueDeclare {
                queue: "greetings".to_string(),
                passive: false,
                durable: false,
                exclusive: false,
                auto_delete: false,
                no_wait: false,
                arguments: FieldTable::new(),
            },
        ))
        .await?;
    let (_, declare_ok) = next_method(&mut client).await?;
    assert!(matches!(declare_ok, Method::QueueDeclareOk { ref queue, .. } if queue == "greetings"));

    client
        .send(Frame::method(
            1,
            Method::BasicConsume {
                queue: "greetings".to_string(),
                consumer_tag: "reader".to_string(),
                no_local: false,
                no_ack: true,
                exclusive: false,
                no_wait: false,
                arguments: FieldTable::new(),
            },
        ))
        .await?;
    assert_eq!(
        next_method(&mut client).await?,
        (
            1,
            Method::BasicConsumeOk {
                consumer_tag: "reader".to_string()
            }
        )
    );

    let body = Bytes::from_static(b"hello over tcp");
    client
        .send(Frame::method(
            1,
            Method::BasicPublish {
                exchange: String::new(),
                routing_key: "greetings".to_string(),
                mandatory: false,
                immediate: false,
            },
        ))
        .await?;
    client
        .send(Frame::Header {
            channel: 1,
            header: ContentHeader {
                class_id: CLASS_BASIC,
                body_size: body.len() as u64,
                properties: BasicProperties::default(),
            },
        })
        .await?;
    client
        .send(Frame::Body {
            channel: 1,
            payload: body.clone(),
        })
        .await?;

    let (_, deliver) = next_method(&mut client).await?;
    assert!(matches!(
        deliver,
        Method::BasicDeliver { ref consumer_tag, delivery_tag: 1, redelivered: false, .. }
            if consumer_tag == "reader"
    ));
    let Frame::Header { header, .. } = next_frame(&mut client).await? else {
        bail!("Expected a content header");
    };
    assert_eq!(header.body_size, body.len() as u64);
    let Frame::Body { payload, .. } = next_frame(&mut client).await? else {
        bail!("Expected a content body");
    };
    assert_eq!(payload, body);

    client
        .send(Frame::method(
            0,
            Method::ConnectionClose {
                reply_code: 200,
                reply_text: "bye".to_string(),
                class_id: 0,
                method_id: 0,
            },
        ))
        .await?;
    assert_eq!(next_method(&mut client).await?, (0, Method::ConnectionCloseOk));

    server.shutdown();
    task.await?;
    Ok(())
}

#[tokio::test]
async fn test_channel_error_keeps_connection_open() -> Result<()> {
    let (server, task, mut client) = start_server(AmqpCodec::frames_only()).await?;
    open_connection(&mut client).await?;

    client.send(Frame::method(1, Method::ChannelOpen)).await?;
    assert_eq!(next_method(&mut client).await?, (1, Method::ChannelOpenOk));

    client
        .send(Frame::method(
            1,
            Method::QueueDeclare {
                queue: "missing".to_string(),
                passive: true,
                durable: false,
                exclusive: false,
                auto_delete: false,
                no_wait: false,
                arguments: FieldTable::new(),
            },
        ))
        .await?;
    let (channel, close) = next_method(&mut client).await?;
    assert_eq!(channel, 1);
    assert!(matches!(close, Method::ChannelClose { reply_code: 404, .. }));
    client.send(Frame::method(1, Method::ChannelCloseOk)).await?;

    // the connection still serves new channels
    client.send(Frame::method(2, Method::ChannelOpen)).await?;
    assert_eq!(next_method(&mut client).await?, (2, Method::ChannelOpenOk));

    server.shutdown();
    task.await?;
    Ok(())
}

#[tokio::test]
async fn test_unsupported_protocol_version_is_answered() -> Result<()> {
    // the broker answers with a protocol header, not a frame
    let (server, task, mut client) = start_server(AmqpCodec::new()).await?;
    client
        .send(Frame::ProtocolInit(ProtocolHeader {
            major: 0,
            minor: 8,
            revision: 0,
        }))
        .await?;

    let Frame::ProtocolInit(header) = next_frame(&mut client).await? else {
        bail!("Expected the supported protocol header");
    };
    assert!(header.is_supported());

    server.shutdown();
    task.await?;
    Ok(())
}
