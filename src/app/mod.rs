pub mod config;
pub mod logging;
pub mod relay;
pub mod shutdown;

pub use config::{Config, ConfigError, LogFormat, LogLevel, TopologyConfig};
pub use logging::{LoggingError, init_tracing};
pub use relay::{Delivery, Relay};

use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domain::ShipperError;
use crate::sender::{Connection, Publisher};
use crate::server::Server;

/// The relay binary: listener, publishers and signal handling.
#[derive(Debug)]
pub struct App {
    relay: Relay,
    cancel: CancellationToken,
}

impl App {
    pub async fn from_config(config: Config) -> Result<Self, ShipperError> {
        let cancel = CancellationToken::new();

        let server = Server::bind(&config.listen, config.server_config(), cancel.clone()).await?;
        let connection = Connection::new(config.connection_settings()?, cancel.child_token())?;
        let publisher = Publisher::new(connection, config.publisher_settings()?);

        info!(
            listen = %server.local_addr(),
            endpoint = %config.endpoint,
            store = ?config.store,
            workers = config.workers,
            "Configuration loaded"
        );

        let relay = Relay::new(server, publisher, cancel.clone())
            .with_workers(config.workers)
            .with_retry(config.retry.clone())
            .with_topology(config.topology_config());

        Ok(Self { relay, cancel })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.relay.local_addr()
    }

    /// Cancelling this token stops the app as a signal would.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> Result<(), ShipperError> {
        let signals = shutdown::spawn_signal_handler(self.cancel.clone());
        let result = self.relay.run().await;
        signals.abort();
        result
    }
}

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

pub async fn main() -> anyhow::Result<()> {
    let config = Config::load(std::env::args_os())?;
    init_tracing(config.log_level, config.log_format)?;
    info!("Starting rask-shipper v{}", get_version());

    let app = App::from_config(config).await?;
    app.run().await?;

    info!("rask-shipper stopped");
    Ok(())
}
