//! Listener side: accepts batches from upstream shippers over the framed,
//! version-sniffed protocol and hands them to a consumer under an explicit
//! acknowledgment contract.

pub mod batch;
pub mod codec;
pub mod handler;
pub mod mux;
pub mod sniff;
pub mod stats;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domain::Event;

pub use batch::{Acker, Batch, BatchReceiver, BatchSender, HANDOFF_CAPACITY, handoff_queue};
pub use codec::{Frame, FrameDecoder, ProtocolError, ProtocolVersion};
pub use handler::VersionHandler;
pub use mux::{ListenerError, ProtocolListener, RoutedConn, VersionListener};
pub use stats::{ServerStats, ServerStatsSnapshot};

/// Why a pluggable decoder rejected a payload.
pub type DecodeError = Box<dyn std::error::Error + Send + Sync>;

/// Pluggable decoder for v2 JSON event payloads.
pub type JsonDecoder = Arc<dyn Fn(&[u8]) -> Result<Event, DecodeError> + Send + Sync>;

pub fn default_json_decoder() -> JsonDecoder {
    Arc::new(decode_json)
}

fn decode_json(bytes: &[u8]) -> Result<Event, DecodeError> {
    Ok(Event::from_json(bytes)?)
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),
}

#[derive(Clone)]
pub struct ServerConfig {
    /// Deadline for each read and ack write. A connection with no batch
    /// awaiting its ack is closed after sitting idle this long.
    pub timeout: Duration,
    /// Liveness ack interval while a batch is outstanding (v2 only).
    pub keepalive: Option<Duration>,
    /// How long a new connection may take to send its version byte.
    pub sniff_timeout: Duration,
    pub versions: Vec<ProtocolVersion>,
    pub handoff_capacity: usize,
    pub json_decoder: JsonDecoder,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            keepalive: Some(Duration::from_secs(3)),
            sniff_timeout: Duration::from_secs(5),
            versions: ProtocolVersion::ALL.to_vec(),
            handoff_capacity: HANDOFF_CAPACITY,
            json_decoder: default_json_decoder(),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("timeout", &self.timeout)
            .field("keepalive", &self.keepalive)
            .field("sniff_timeout", &self.sniff_timeout)
            .field("versions", &self.versions)
            .field("handoff_capacity", &self.handoff_capacity)
            .finish_non_exhaustive()
    }
}

/// Consumer-facing listener: one socket, every enabled version, one queue.
#[derive(Debug)]
pub struct Server {
    listener: ProtocolListener,
    receiver: tokio::sync::Mutex<BatchReceiver>,
    cancel: CancellationToken,
    stats: Arc<ServerStats>,
}

impl Server {
    pub async fn bind(
        address: &str,
        config: ServerConfig,
        cancel: CancellationToken,
    ) -> Result<Self, ServerError> {
        let stats = Arc::new(ServerStats::new());
        let cancel = cancel.child_token();
        let listener = ProtocolListener::bind_with_stats(
            address,
            &config.versions,
            config.sniff_timeout,
            cancel.clone(),
            Arc::clone(&stats),
        )
        .await?;

        let (queue, receiver) = handoff_queue(config.handoff_capacity);
        let config = Arc::new(config);
        for &version in listener.versions() {
            let accept = listener.listener(version)?;
            let handler = VersionHandler::new(
                version,
                Arc::clone(&config),
                queue.clone(),
                Arc::clone(&stats),
                cancel.clone(),
            );
            tokio::spawn(handler.run(accept));
        }

        info!(address = %listener.local_addr(), versions = ?listener.versions(), "Server ready");
        Ok(Self {
            listener,
            receiver: tokio::sync::Mutex::new(receiver),
            cancel,
            stats,
        })
    }

    /// Next batch awaiting acknowledgment, or `None` once the server is closed.
    pub async fn receive(&self) -> Option<Batch> {
        let mut receiver = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return None,
            receiver = self.receiver.lock() => receiver,
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                receiver.close();
                None
            }
            batch = receiver.recv() => batch,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Stop accepting, close every connection and wake all `receive` callers.
    pub fn close(&self) {
        self.cancel.cancel();
        self.listener.close();
        // A waiting `receive` holds the lock and closes the queue itself.
        if let Ok(mut receiver) = self.receiver.try_lock() {
            receiver.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
