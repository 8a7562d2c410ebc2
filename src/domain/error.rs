use thiserror::Error;

use crate::app::config::ConfigError;
use crate::sender::{ConnectionError, PublishError};
use crate::server::ServerError;

/// Top-level error type for the shipper.
#[derive(Error, Debug)]
pub enum ShipperError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}
