pub mod settings;

use crate::auth::AuthMechanism;
use crate::store::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Smallest `frame_max` a peer may negotiate
const MIN_FRAME_MAX: u32 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub network: NetworkConfig,
    pub queue: QueueConfig,
    pub flow: FlowConfig,
    pub persistence: PersistenceConfig,
    pub transactions: TransactionConfig,
    pub auth: AuthConfig,
    pub metrics_report_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            queue: QueueConfig::default(),
            flow: FlowConfig::default(),
            persistence: PersistenceConfig::default(),
            transactions: TransactionConfig::default(),
            auth: AuthConfig::default(),
            metrics_report_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub frame_max: u32,
    pub channel_max: u16,
    /// Zero disables heartbeats
    pub heartbeat_secs: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5672,
            max_connections: 1000,
            frame_max: 131_072,
            channel_max: 2047,
            heartbeat_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub in_memory_limit: usize,
    pub indelible_limit: usize,
    pub max_redelivery_count: u32,
    /// Period of the sweep moving expired messages to the dead letter queue
    pub expiry_sweep_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            in_memory_limit: 10_000,
            indelible_limit: 1000,
            max_redelivery_count: 5,
            expiry_sweep_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub flow_low_limit: usize,
    pub flow_high_limit: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            flow_low_limit: 100,
            flow_high_limit: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub ring_buffer_size: usize,
    pub max_batch_size: usize,
    pub max_persist_retries: u32,
    pub persist_retry_backoff_ms: u64,
    pub wait_timeout_ms: u64,
    /// Journal directory; messages stay in memory when unset
    pub data_dir: Option<PathBuf>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            ring_buffer_size: 4096,
            max_batch_size: 256,
            max_persist_retries: 3,
            persist_retry_backoff_ms: 50,
            wait_timeout_ms: 10,
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub dtx_sweep_interval_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            dtx_sweep_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub auth_mechanism: AuthMechanism,
    pub users: HashMap<String, String>,
}

impl BrokerConfig {
    pub fn with_address(mut self, host: &str, port: u16) -> Self {
        self.network.host = host.to_string();
        self.network.port = port;
        self
    }

    pub fn with_in_memory_limit(mut self, in_memory_limit: usize) -> Self {
        self.queue.in_memory_limit = in_memory_limit;
        self
    }

    pub fn with_flow_limits(mut self, low: usize, high: usize) -> Self {
        self.flow.flow_low_limit = low;
        self.flow.flow_high_limit = high;
        self
    }

    /// Persist durable messages to a journal under `data_dir`
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.persistence.data_dir = Some(data_dir.into());
        self
    }

    pub fn with_ring_buffer_size(mut self, ring_buffer_size: usize) -> Self {
        self.persistence.ring_buffer_size = ring_buffer_size;
        self
    }

    pub fn with_plain_auth(mut self, users: HashMap<String, String>) -> Self {
        self.auth.auth_mechanism = AuthMechanism::Plain;
        self.auth.users = users;
        self
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.network.host, self.network.port)
    }

    pub fn dtx_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.transactions.dtx_sweep_interval_ms)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.queue.expiry_sweep_interval_ms)
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::default()
            .with_ring_size(self.persistence.ring_buffer_size)
            .with_max_batch_size(self.persistence.max_batch_size)
            .with_retries(
                self.persistence.max_persist_retries,
                Duration::from_millis(self.persistence.persist_retry_backoff_ms),
            )
            .with_wait_timeout(Duration::from_millis(self.persistence.wait_timeout_ms))
    }

    /// Validate configuration bounds before anything is started
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.network.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }
        if self.network.frame_max < MIN_FRAME_MAX {
            return Err(format!("frame_max must be >= {}", MIN_FRAME_MAX));
        }
        if self.queue.in_memory_limit == 0 {
            return Err("in_memory_limit must be > 0".to_string());
        }
        if self.flow.flow_low_limit >= self.flow.flow_high_limit {
            return Err(format!(
                "flow_low_limit ({}) must be lower than flow_high_limit ({})",
                self.flow.flow_low_limit, self.flow.flow_high_limit
            ));
        }
        if !self.persistence.ring_buffer_size.is_power_of_two() {
            return Err(format!(
                "ring_buffer_size must be a power of two, got {}",
                self.persistence.ring_buffer_size
            ));
        }
        if self.persistence.max_batch_size == 0 {
            return Err("max_batch_size must be > 0".to_string());
        }
        if self.queue.expiry_sweep_interval_ms == 0 {
            return Err("expiry_sweep_interval_ms must be > 0".to_string());
        }
        if self.transactions.dtx_sweep_interval_ms == 0 {
            return Err("dtx_sweep_interval_ms must be > 0".to_string());
        }
        Ok(())
    }
}
