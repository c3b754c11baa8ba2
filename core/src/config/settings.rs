use super::BrokerConfig;
use crate::{BrokerError, Result};
use config::{Config, Environment};

impl BrokerConfig {
    /// Load `AMQBROKER_*` variables over the defaults. Nested keys use a
    /// double underscore, e.g. `AMQBROKER_FLOW__FLOW_HIGH_LIMIT`.
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .add_source(Config::try_from(&BrokerConfig::default()).map_err(config_error)?)
            .add_source(
                Environment::with_prefix("AMQBROKER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;

        let config = settings
            .try_deserialize::<BrokerConfig>()
            .map_err(config_error)?;
        config.validate().map_err(BrokerError::Config)?;
        Ok(config)
    }
}

fn config_error(e: config::ConfigError) -> BrokerError {
    BrokerError::Config(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_without_overrides() {
        // no AMQBROKER_* variables are set in the test environment
        let config = BrokerConfig::from_env().unwrap();
        assert_eq!(config.flow.flow_high_limit, 1000);
        assert_eq!(config.persistence.ring_buffer_size, 4096);
    }
}
