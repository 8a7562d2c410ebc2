//! Per-component settings derived from the flat [`Config`].

use super::{Config, ConfigError};
use crate::sender::{ConnectionSettings, IndexSelector, PublisherSettings};
use crate::server::ServerConfig;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    pub enabled: bool,
    pub refresh_interval: Duration,
    pub shipper_name: String,
}

impl Config {
    pub fn connection_settings(&self) -> Result<ConnectionSettings, ConfigError> {
        let mut settings = ConnectionSettings::new(&self.endpoint)
            .map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        // Explicit credentials win over ones embedded in the URL.
        if self.username.is_some() {
            settings.username.clone_from(&self.username);
            settings.password.clone_from(&self.password);
        }
        settings.api_key.clone_from(&self.api_key);
        settings.timeout = self.request_timeout;
        settings.reconnect_interval = Duration::from_millis(self.reconnect_interval_ms);
        Ok(settings)
    }

    pub fn publisher_settings(&self) -> Result<PublisherSettings, ConfigError> {
        let index = IndexSelector::new(self.index_template.as_str())
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        Ok(PublisherSettings {
            store: self.store,
            index,
            compression_level: self.compression_level,
            push_path: self.push_path.clone(),
            topology_index: self.topology_index.clone(),
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            timeout: self.read_timeout,
            keepalive: (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs)),
            sniff_timeout: Duration::from_secs(self.sniff_timeout_secs),
            versions: self.protocols.clone(),
            handoff_capacity: self.handoff_capacity,
            ..ServerConfig::default()
        }
    }

    pub fn topology_config(&self) -> TopologyConfig {
        TopologyConfig {
            enabled: self.topology,
            refresh_interval: Duration::from_secs(self.topology_refresh_secs),
            shipper_name: self.resolve_shipper_name(),
        }
    }
}
