use crate::broker::connection::{AmqpConnection, ConnectionAction};
use crate::broker::core::BrokerCore;
use crate::flow::FrameSink;
use crate::metrics::MetricsRegistry;
use crate::protocol::{AmqpCodec, Frame};
use crate::{config::BrokerConfig, Result};
use futures::SinkExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Interval;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

pub struct BrokerServer {
    config: BrokerConfig,
    core: Arc<BrokerCore>,
    // Graceful shutdown coordination
    shutdown_tx: broadcast::Sender<()>,
    connection_ids: AtomicU64,
}

/// Work item for a connection's writer task
enum Outbound {
    Frame(Frame),
    Flush,
    Close,
}

/// [`FrameSink`] feeding the writer task of one connection.
///
/// Sends fail only once the writer is gone, in which case the connection is
/// already shutting down and the frames are dropped.
struct ConnectionSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl FrameSink for ConnectionSink {
    fn write(&self, frame: Frame) {
        let _ = self.tx.send(Outbound::Frame(frame));
    }

    fn write_and_flush(&self, frame: Frame) {
        self.write(frame);
        self.flush();
    }

    fn flush(&self) {
        let _ = self.tx.send(Outbound::Flush);
    }
}

impl BrokerServer {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let metrics = Arc::new(MetricsRegistry::new());
        let core = BrokerCore::open(config, metrics)?;
        Ok(Self::with_core(core))
    }

    /// Serve an already assembled broker core
    pub fn with_core(core: Arc<BrokerCore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            config: core.config().clone(),
            core,
            shutdown_tx,
            connection_ids: AtomicU64::new(1),
        }
    }

    pub fn core(&self) -> &Arc<BrokerCore> {
        &self.core
    }

    pub fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        let _ = self.shutdown_tx.send(());
    }

    pub async fn run(&self) -> Result<()> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr).await?;
        info!("AMQP broker listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept clients on `listener` until [`shutdown`](Self::shutdown) is
    /// called.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let sweep = self.core.start_transaction_sweep();
        let expiry = self.core.start_expiry_sweep();
        let reporter = Arc::clone(self.core.metrics())
            .start_reporting(Duration::from_secs(self.config.metrics_report_interval_secs.max(1)));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let max_connections = self.config.network.max_connections;

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let active = self.core.metrics().broker.active_connections();
                            if max_connections > 0 && active >= max_connections {
                                warn!(
                                    "Connection limit of {} reached, dropping connection from {}",
                                    max_connections, peer_addr
                                );
                                continue;
                            }

                            if let Err(e) = Self::configure_client_socket(&stream) {
                                warn!("Failed to configure client socket {}: {}", peer_addr, e);
                            }

                            let id = self.connection_ids.fetch_add(1, Ordering::Relaxed);
                            info!(connection = id, "New client connected: {} (active: {})", peer_addr, active + 1);

                            let core = Arc::clone(&self.core);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_client(id, stream, peer_addr, core, shutdown_rx).await {
                                    error!("Error handling client {}: {}", peer_addr, e);
                                } else {
                                    info!(connection = id, "Client {} disconnected", peer_addr);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping server gracefully...");
                    break;
                }
            }
        }

        sweep.abort();
        expiry.abort();
        reporter.abort();
        self.core.shutdown();
        info!("Server shutdown complete");
        Ok(())
    }

    fn configure_client_socket(stream: &TcpStream) -> Result<()> {
        use socket2::SockRef;

        let socket_ref = SockRef::from(stream);
        socket_ref.set_tcp_nodelay(true)?;
        socket_ref.set_keepalive(true)?;
        Ok(())
    }

    /// Drive one client: frames are decoded and handled in order on this
    /// task, replies and deliveries leave through a dedicated writer task.
    async fn handle_client(
        id: u64,
        stream: TcpStream,
        peer_addr: SocketAddr,
        core: Arc<BrokerCore>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let metrics = Arc::clone(core.metrics());
        metrics.broker.connection_opened();

        let (reader, writer) = stream.into_split();
        let mut frames = FramedRead::new(
            reader,
            AmqpCodec::with_max_frame_size(core.config().network.frame_max as usize),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(Self::write_frames(FramedWrite::new(writer, AmqpCodec::new()), rx));
        let sink = Arc::new(ConnectionSink { tx: tx.clone() });

        let mut connection = AmqpConnection::new(id, core, sink.clone());
        let mut frame_max = connection.frame_max();
        let mut heartbeat: Option<(Interval, Duration)> = None;
        let mut last_read = Instant::now();
        let mut result = Ok(());

        loop {
            tokio::select! {
                next = frames.next() => {
                    let frame = match next {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            warn!(connection = id, "Failed to read from {}: {}", peer_addr, e);
                            result = Err(e.into());
                            break;
                        }
                        None => break,
                    };
                    last_read = Instant::now();
                    if connection.handle_frame(frame) == ConnectionAction::Close {
                        break;
                    }

                    if connection.frame_max() != frame_max {
                        frame_max = connection.frame_max();
                        frames.decoder_mut().set_max_frame_size(frame_max as usize);
                    }
                    if heartbeat.is_none() && connection.heartbeat() > 0 {
                        let period = Duration::from_secs(u64::from(connection.heartbeat()));
                        let mut ticker = tokio::time::interval(period);
                        ticker.reset();
                        heartbeat = Some((ticker, period));
                    }
                }
                _ = Self::heartbeat_tick(&mut heartbeat) => {
                    if let Some((_, period)) = &heartbeat {
                        if last_read.elapsed() > *period * 2 {
                            warn!(connection = id, "Missed heartbeats from {}, closing", peer_addr);
                            break;
                        }
                    }
                    sink.write_and_flush(Frame::Heartbeat);
                }
                _ = shutdown_rx.recv() => {
                    debug!(connection = id, "Closing connection for shutdown");
                    break;
                }
            }
        }

        connection.on_disconnect();
        drop(connection);
        let _ = tx.send(Outbound::Close);
        if let Err(e) = writer_task.await {
            warn!(connection = id, "Writer task failed: {}", e);
        }
        metrics.broker.connection_closed();
        result
    }

    async fn heartbeat_tick(heartbeat: &mut Option<(Interval, Duration)>) {
        match heartbeat {
            Some((ticker, _)) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    async fn write_frames(
        mut framed: FramedWrite<OwnedWriteHalf, AmqpCodec>,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        while let Some(outbound) = rx.recv().await {
            let result = match outbound {
                Outbound::Frame(frame) => framed.feed(frame).await,
                Outbound::Flush => framed.flush().await,
                Outbound::Close => break,
            };
            if let Err(e) = result {
                debug!("Failed to write frame: {}", e);
                return;
            }
        }
        if let Err(e) = framed.close().await {
            debug!("Failed to close writer: {}", e);
        }
    }
}
