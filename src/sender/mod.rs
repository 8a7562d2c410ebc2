//! Client side: ships event batches to a store and sorts out per-item results.

pub mod classifier;
pub mod connection;
pub mod encoder;
pub mod index;
pub mod publisher;
pub mod response;
pub mod stats;
pub mod topology;

pub use classifier::{RetryDecision, classify};
pub use connection::{Connection, ConnectionError, ConnectionSettings, ConnectionState, StoreVersion};
pub use encoder::{BatchEncoder, BulkEncoder, EncodeError, LineEncoder};
pub use index::{DEFAULT_INDEX_TEMPLATE, IndexError, IndexSelector};
pub use publisher::{
    DEFAULT_PUSH_PATH, DEFAULT_TOPOLOGY_INDEX, PublishError, PublishSummary, Publisher, PublisherSettings, StoreKind, TopologyError,
};
pub use response::{ItemResult, ResponseError};
pub use stats::{PublishStats, PublishStatsSnapshot};
pub use topology::{TopologyEntry, TopologyMap};
