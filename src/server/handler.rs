//! Per-version connection handling: decode windows into batches, hand them to
//! the consumer, and write acknowledgments back in order.

use futures::StreamExt;
use std::net::SocketAddr;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{Event, Fields, Value};
use crate::server::ServerConfig;
use crate::server::batch::{AckReceiver, Batch, BatchSender, ack_pair};
use crate::server::codec::{Frame, FrameDecoder, ProtocolError, ProtocolVersion, encode_ack};
use crate::server::mux::{ListenerError, VersionListener};
use crate::server::stats::ServerStats;

/// Windows decoded but not yet acknowledged on a single connection.
const MAX_INFLIGHT_PER_CONNECTION: usize = 8;

/// Cap on up-front allocation for a window; larger windows grow as events arrive.
const MAX_PREALLOCATED_EVENTS: usize = 4096;

/// A window handed to the consumer, waiting for its acknowledgment.
struct PendingAck {
    count: u32,
    rx: AckReceiver,
}

/// Batches a connection still owes an ack for, and when it last owed none.
/// The idle deadline only runs while nothing is outstanding.
struct Activity {
    outstanding: AtomicUsize,
    quiet_since: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            quiet_since: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.quiet_since.lock() = Instant::now();
    }

    fn batch_pending(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn batch_settled(&self) {
        self.touch();
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    /// `None` while a batch is waiting on the consumer.
    fn idle_deadline(&self, timeout: Duration) -> Option<Instant> {
        if self.outstanding.load(Ordering::SeqCst) > 0 {
            return None;
        }
        Some(*self.quiet_since.lock() + timeout)
    }
}

#[derive(Debug)]
enum AckOutcome {
    Drained,
    Cancelled,
    Abandoned,
    WriteFailed(String),
}

/// Serves every connection routed to one protocol version.
#[derive(Clone)]
pub struct VersionHandler {
    version: ProtocolVersion,
    config: Arc<ServerConfig>,
    queue: BatchSender,
    stats: Arc<ServerStats>,
    cancel: CancellationToken,
}

impl VersionHandler {
    pub fn new(
        version: ProtocolVersion,
        config: Arc<ServerConfig>,
        queue: BatchSender,
        stats: Arc<ServerStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            version,
            config,
            queue,
            stats,
            cancel,
        }
    }

    /// Accept loop. Returns once the listener is closed.
    pub async fn run(self, mut listener: VersionListener) {
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let handler = self.clone();
                    tokio::spawn(async move {
                        handler.serve_connection(conn.stream, Some(conn.peer)).await;
                    });
                }
                Err(ListenerError::Closed) => break,
                Err(e) => warn!(version = %self.version, error = %e, "Accept failed"),
            }
        }
        debug!(version = %self.version, "Version handler stopped");
    }

    /// Serve one connection until the peer leaves, a protocol error occurs,
    /// a batch is abandoned, or the server shuts down.
    pub async fn serve_connection<S>(&self, stream: S, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn_cancel = self.cancel.child_token();
        let (reader, writer) = tokio::io::split(stream);
        let (inflight_tx, inflight_rx) = mpsc::channel(MAX_INFLIGHT_PER_CONNECTION);
        let activity = Activity::new();

        self.stats.connection_opened();
        debug!(peer = ?peer, version = %self.version, "Connection opened");

        let read_side = async {
            let result = self.read_batches(reader, peer, inflight_tx, &activity, &conn_cancel).await;
            if let Err(e) = &result {
                self.stats.protocol_error();
                warn!(peer = ?peer, version = %self.version, error = %e, "Closing connection after protocol error");
                conn_cancel.cancel();
            }
            result
        };
        let ack_side = async {
            let outcome = self.write_acks(writer, inflight_rx, &activity, &conn_cancel).await;
            match &outcome {
                AckOutcome::Drained | AckOutcome::Cancelled => {}
                AckOutcome::Abandoned => {
                    info!(peer = ?peer, version = %self.version, "Batch abandoned; closing connection for redelivery");
                    conn_cancel.cancel();
                }
                AckOutcome::WriteFailed(e) => {
                    debug!(peer = ?peer, error = %e, "Failed to write ack");
                    conn_cancel.cancel();
                }
            }
            outcome
        };

        let _ = tokio::join!(read_side, ack_side);
        self.stats.connection_closed();
        debug!(peer = ?peer, version = %self.version, "Connection closed");
    }

    async fn read_batches<S: AsyncRead>(
        &self,
        reader: ReadHalf<S>,
        peer: Option<SocketAddr>,
        inflight: mpsc::Sender<PendingAck>,
        activity: &Activity,
        cancel: &CancellationToken,
    ) -> Result<(), ProtocolError> {
        let mut frames = FramedRead::new(reader, FrameDecoder::new(self.version));

        loop {
            // Waiting on the consumer does not count as idle.
            let frame = loop {
                let deadline = activity
                    .idle_deadline(self.config.timeout)
                    .unwrap_or_else(|| Instant::now() + self.config.timeout);
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    frame = tokio::time::timeout_at(deadline, frames.next()) => match frame {
                        Ok(frame) => break frame,
                        Err(_) => {
                            let expired = activity
                                .idle_deadline(self.config.timeout)
                                .is_some_and(|at| at <= Instant::now());
                            if expired {
                                debug!(peer = ?peer, version = %self.version, "Closing idle connection");
                                return Ok(());
                            }
                        }
                    },
                }
            };
            activity.touch();
            let count = match frame {
                None => return Ok(()),
                Some(Err(e)) => return Err(e),
                Some(Ok(Frame::Window(0))) => continue,
                Some(Ok(Frame::Window(count))) => count,
                Some(Ok(_)) => return Err(ProtocolError::EventBeforeWindow),
            };

            let mut events = Vec::with_capacity((count as usize).min(MAX_PREALLOCATED_EVENTS));
            while events.len() < count as usize {
                let frame = tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    frame = tokio::time::timeout(self.config.timeout, frames.next()) => frame,
                };
                let frame = match frame {
                    Err(_) => return Err(ProtocolError::Timeout),
                    Ok(None) => {
                        return Err(ProtocolError::Io(std::io::ErrorKind::UnexpectedEof.into()));
                    }
                    Ok(Some(frame)) => frame?,
                };
                match frame {
                    Frame::Window(_) => {
                        return Err(ProtocolError::WindowWhileOpen {
                            remaining: count - events.len() as u32,
                        });
                    }
                    Frame::Json { payload, .. } => {
                        let event = (self.config.json_decoder)(&payload)
                            .map_err(ProtocolError::InvalidEvent)?;
                        events.push(event);
                    }
                    Frame::Data { fields, .. } => events.push(data_event(fields)),
                }
            }

            let (acker, ack_rx) = ack_pair();
            let pending = PendingAck { count, rx: ack_rx };
            activity.batch_pending();
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                sent = inflight.send(pending) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }

            let batch = Batch::new(events, peer, self.version, acker);
            self.stats.batch_received(batch.len());
            debug!(peer = ?peer, batch_id = %batch.id(), count, "Batch decoded");

            // Blocks while the consumer has too many batches outstanding.
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                pushed = self.queue.push(batch) => {
                    if pushed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn write_acks<S: AsyncWrite>(
        &self,
        mut writer: WriteHalf<S>,
        mut inflight: mpsc::Receiver<PendingAck>,
        activity: &Activity,
        cancel: &CancellationToken,
    ) -> AckOutcome {
        let keepalive = self
            .config
            .keepalive
            .filter(|_| self.version.supports_keepalive());

        loop {
            let pending = tokio::select! {
                () = cancel.cancelled() => return AckOutcome::Cancelled,
                pending = inflight.recv() => match pending {
                    Some(pending) => pending,
                    None => return AckOutcome::Drained,
                },
            };

            let mut ticker = keepalive.map(keepalive_interval);
            let mut ack_rx = pending.rx;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return AckOutcome::Cancelled,
                    acked = &mut ack_rx => {
                        if acked.is_err() {
                            self.stats.batch_abandoned();
                            return AckOutcome::Abandoned;
                        }
                        if let Err(e) = self.send_ack(&mut writer, pending.count).await {
                            return AckOutcome::WriteFailed(e);
                        }
                        self.stats.batch_acked();
                        activity.batch_settled();
                        break;
                    }
                    () = tick(&mut ticker) => {
                        if let Err(e) = self.send_ack(&mut writer, 0).await {
                            return AckOutcome::WriteFailed(e);
                        }
                    }
                }
            }
        }
    }

    async fn send_ack<W: AsyncWrite + Unpin>(&self, writer: &mut W, seq: u32) -> Result<(), String> {
        let frame = encode_ack(self.version, seq);
        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.config.timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("ack write timed out".to_string()),
        }
    }
}

fn keepalive_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// v1 events are flat string maps.
fn data_event(fields: Vec<(String, String)>) -> Event {
    Event::from_fields(
        fields
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect::<Fields>(),
    )
}
