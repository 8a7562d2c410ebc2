//! Version-sniffing listener: one TCP socket, one accept queue per protocol version.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::codec::ProtocolVersion;
use crate::server::sniff::SniffedStream;
use crate::server::stats::ServerStats;

/// Sniffed connections waiting for their version listener to accept them.
const ROUTE_QUEUE: usize = 32;

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("Listener closed")]
    Closed,
    #[error("Protocol {0} is not enabled on this listener")]
    NotEnabled(ProtocolVersion),
    #[error("Listener for {0} was already taken")]
    AlreadyTaken(ProtocolVersion),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A connection whose version marker has been read and put back.
#[derive(Debug)]
pub struct RoutedConn {
    pub stream: SniffedStream<TcpStream>,
    pub peer: SocketAddr,
    pub version: ProtocolVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RejectReason {
    UnknownMarker(u8),
    Eof,
    Timeout,
    Io,
}

/// Where a freshly accepted connection is in the sniffing process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SniffState {
    Sniffing,
    Routed(ProtocolVersion),
    Rejected(RejectReason),
    Closed,
}

/// Accept queue for one protocol version.
#[derive(Debug)]
pub struct VersionListener {
    version: ProtocolVersion,
    rx: mpsc::Receiver<RoutedConn>,
    cancel: CancellationToken,
}

impl VersionListener {
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Next connection for this version. Fails with [`ListenerError::Closed`]
    /// once the parent listener is closed.
    pub async fn accept(&mut self) -> Result<RoutedConn, ListenerError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(ListenerError::Closed),
            conn = self.rx.recv() => conn.ok_or(ListenerError::Closed),
        }
    }
}

/// Listens on one socket and routes each connection by its first byte.
#[derive(Debug)]
pub struct ProtocolListener {
    local_addr: SocketAddr,
    versions: Vec<ProtocolVersion>,
    listeners: Mutex<HashMap<ProtocolVersion, VersionListener>>,
    cancel: CancellationToken,
    stats: Arc<ServerStats>,
}

impl ProtocolListener {
    pub async fn bind(
        address: &str,
        versions: &[ProtocolVersion],
        sniff_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, ListenerError> {
        Self::bind_with_stats(address, versions, sniff_timeout, cancel, Arc::default()).await
    }

    pub async fn bind_with_stats(
        address: &str,
        versions: &[ProtocolVersion],
        sniff_timeout: Duration,
        cancel: CancellationToken,
        stats: Arc<ServerStats>,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ListenerError::Bind {
                address: address.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        let cancel = cancel.child_token();

        let mut versions = versions.to_vec();
        versions.sort();
        versions.dedup();

        let mut routes = HashMap::new();
        let mut listeners = HashMap::new();
        for &version in &versions {
            let (tx, rx) = mpsc::channel(ROUTE_QUEUE);
            routes.insert(version, tx);
            listeners.insert(
                version,
                VersionListener {
                    version,
                    rx,
                    cancel: cancel.clone(),
                },
            );
        }

        info!(address = %local_addr, ?versions, "Protocol listener bound");
        tokio::spawn(accept_loop(
            listener,
            Arc::new(routes),
            sniff_timeout,
            cancel.clone(),
            Arc::clone(&stats),
        ));

        Ok(Self {
            local_addr,
            versions,
            listeners: Mutex::new(listeners),
            cancel,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn versions(&self) -> &[ProtocolVersion] {
        &self.versions
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Take the accept queue for `version`. Each queue can be taken once.
    pub fn listener(&self, version: ProtocolVersion) -> Result<VersionListener, ListenerError> {
        if !self.versions.contains(&version) {
            return Err(ListenerError::NotEnabled(version));
        }
        self.listeners
            .lock()
            .remove(&version)
            .ok_or(ListenerError::AlreadyTaken(version))
    }

    /// Stop accepting and unblock every pending [`VersionListener::accept`].
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ProtocolListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    routes: Arc<HashMap<ProtocolVersion, mpsc::Sender<RoutedConn>>>,
    sniff_timeout: Duration,
    cancel: CancellationToken,
    stats: Arc<ServerStats>,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    stats.connection_accepted();
                    tokio::spawn(sniff_connection(
                        stream,
                        peer,
                        Arc::clone(&routes),
                        sniff_timeout,
                        cancel.clone(),
                        Arc::clone(&stats),
                    ));
                }
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    debug!("Protocol listener stopped accepting");
}

async fn sniff_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    routes: Arc<HashMap<ProtocolVersion, mpsc::Sender<RoutedConn>>>,
    sniff_timeout: Duration,
    cancel: CancellationToken,
    stats: Arc<ServerStats>,
) {
    let mut state = SniffState::Sniffing;
    while state != SniffState::Closed {
        state = match state {
            SniffState::Sniffing => {
                let read = tokio::select! {
                    () = cancel.cancelled() => return,
                    read = tokio::time::timeout(sniff_timeout, stream.read_u8()) => read,
                };
                match read {
                    Ok(Ok(marker)) => match ProtocolVersion::from_marker(marker) {
                        Some(version) if routes.contains_key(&version) => SniffState::Routed(version),
                        _ => SniffState::Rejected(RejectReason::UnknownMarker(marker)),
                    },
                    Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        SniffState::Rejected(RejectReason::Eof)
                    }
                    Ok(Err(_)) => SniffState::Rejected(RejectReason::Io),
                    Err(_) => SniffState::Rejected(RejectReason::Timeout),
                }
            }
            SniffState::Routed(version) => {
                let Some(route) = routes.get(&version) else {
                    return;
                };
                debug!(peer = %peer, %version, "Routing connection");
                let conn = RoutedConn {
                    stream: SniffedStream::new(version.marker(), stream),
                    peer,
                    version,
                };
                tokio::select! {
                    () = cancel.cancelled() => {}
                    sent = route.send(conn) => {
                        if sent.is_err() {
                            debug!(peer = %peer, %version, "No listener for routed connection");
                        }
                    }
                }
                return;
            }
            SniffState::Rejected(reason) => {
                stats.connection_rejected();
                match reason {
                    RejectReason::UnknownMarker(marker) => {
                        warn!(peer = %peer, marker = %format!("{marker:#04x}"), "Rejecting connection with unknown protocol version");
                    }
                    other => debug!(peer = %peer, reason = ?other, "Connection closed before protocol version"),
                }
                SniffState::Closed
            }
            SniffState::Closed => SniffState::Closed,
        };
    }
    // Dropping the stream closes the socket.
}
