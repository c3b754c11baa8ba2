use amqbroker::{AuthMechanism, BrokerConfig, BrokerError, BrokerServer, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "amqbroker")]
#[command(about = "An AMQP 0-9-1 message broker written in Rust")]
struct Args {
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Journal directory for durable messages; in-memory storage when unset
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Messages kept in memory per queue before older ones are evicted
    #[arg(long)]
    in_memory_limit: Option<usize>,

    #[arg(long)]
    flow_low_limit: Option<usize>,

    #[arg(long)]
    flow_high_limit: Option<usize>,

    /// Authentication mechanism: none, plain or external
    #[arg(long)]
    auth: Option<AuthMechanism>,

    /// User for plain authentication as `name:password`, may be repeated
    #[arg(long = "user", value_name = "NAME:PASSWORD")]
    users: Vec<String>,
}

impl Args {
    /// Command-line values take precedence over the environment
    fn apply(self, mut config: BrokerConfig) -> Result<BrokerConfig> {
        if let Some(host) = self.host {
            config.network.host = host;
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(data_dir) = self.data_dir {
            config.persistence.data_dir = Some(data_dir);
        }
        if let Some(limit) = self.in_memory_limit {
            config.queue.in_memory_limit = limit;
        }
        if let Some(low) = self.flow_low_limit {
            config.flow.flow_low_limit = low;
        }
        if let Some(high) = self.flow_high_limit {
            config.flow.flow_high_limit = high;
        }
        if let Some(mechanism) = self.auth {
            config.auth.auth_mechanism = mechanism;
        }
        for user in self.users {
            let (name, password) = user.split_once(':').ok_or_else(|| {
                BrokerError::Config(format!("user '{}' is not of the form name:password", user))
            })?;
            config.auth.users.insert(name.to_string(), password.to_string());
        }

        config.validate().map_err(BrokerError::Config)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", args.log_level);
        EnvFilter::new("info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.apply(BrokerConfig::from_env()?)?;

    info!("Starting AMQP broker on {}", config.bind_address());
    info!("Data directory: {:?}", config.persistence.data_dir);
    info!("Queue in-memory limit: {}", config.queue.in_memory_limit);
    info!(
        "Flow limits: low={}, high={}",
        config.flow.flow_low_limit, config.flow.flow_high_limit
    );
    info!("Authentication: {}", config.auth.auth_mechanism);
    if config.auth.auth_mechanism == AuthMechanism::Plain && config.auth.users.is_empty() {
        warn!("Plain authentication enabled without users, every client will be refused");
    }

    let server = Arc::new(BrokerServer::new(config)?);

    let mut server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Server error: {}", e);
            }
        })
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            server.shutdown();
            if let Err(e) = (&mut server_task).await {
                error!("Server task failed: {}", e);
            }
        }
        _ = &mut server_task => {
            info!("Server task completed");
        }
    }

    info!("Broker shut down successfully");
    Ok(())
}
