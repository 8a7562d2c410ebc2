//! Moves batches from the listener to the store: publish, retry the
//! failed subset, then acknowledge upstream.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::TopologyConfig;
use crate::domain::event::TIMESTAMP_FIELD;
use crate::domain::{Event, ShipperError};
use crate::reliability::RetryConfig;
use crate::sender::{Publisher, TopologyMap};
use crate::server::{Batch, Server};

/// Logical name of the upstream shipper, looked up in the topology by peer address.
pub const SHIPPER_FIELD: &str = "shipper";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Every event was stored or permanently dropped; upstream was acked.
    Acked,
    /// Retries ran out or shutdown began; upstream will redeliver.
    Abandoned,
}

#[derive(Debug)]
pub struct Relay {
    server: Arc<Server>,
    publisher: Publisher,
    workers: usize,
    retry: RetryConfig,
    topology: Option<TopologyConfig>,
    cancel: CancellationToken,
}

impl Relay {
    pub fn new(server: Server, publisher: Publisher, cancel: CancellationToken) -> Self {
        Self {
            server: Arc::new(server),
            publisher,
            workers: 1,
            retry: RetryConfig::default(),
            topology: None,
            cancel,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_topology(mut self, topology: TopologyConfig) -> Self {
        self.topology = topology.enabled.then_some(topology);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Run until the cancellation token fires, then drain the workers.
    pub async fn run(self) -> Result<(), ShipperError> {
        let mut publishers = Vec::with_capacity(self.workers);
        publishers.push(self.publisher.clone());
        for _ in 1..self.workers {
            publishers.push(self.publisher.independent_clone()?);
        }

        for publisher in &publishers {
            if let Err(e) = publisher.connect().await {
                warn!(
                    endpoint = %publisher.connection().endpoint(),
                    error = %e,
                    "Store unavailable at startup; reconnecting in background"
                );
                publisher.connection().spawn_reconnect();
            }
        }

        let retry = Arc::new(self.retry);
        let mut tasks = JoinSet::new();
        for (id, publisher) in publishers.iter().cloned().enumerate() {
            tasks.spawn(worker(
                id,
                Arc::clone(&self.server),
                publisher,
                Arc::clone(&retry),
                self.cancel.clone(),
            ));
        }
        if let Some(topology) = self.topology {
            tasks.spawn(topology_loop(self.publisher.clone(), topology, self.cancel.clone()));
        }

        info!(
            address = %self.server.local_addr(),
            workers = publishers.len(),
            "Relay running"
        );

        self.cancel.cancelled().await;
        self.server.close();
        while tasks.join_next().await.is_some() {}
        for publisher in &publishers {
            publisher.close();
        }

        let stats = self.publisher.stats().snapshot();
        info!(
            acked = stats.acked,
            retried = stats.retried,
            dropped = stats.dropped(),
            "Relay stopped"
        );
        Ok(())
    }
}

async fn worker(
    id: usize,
    server: Arc<Server>,
    publisher: Publisher,
    retry: Arc<RetryConfig>,
    cancel: CancellationToken,
) {
    debug!(worker = id, "Publish worker started");
    while let Some(batch) = server.receive().await {
        deliver(&publisher, batch, &retry, &cancel).await;
    }
    debug!(worker = id, "Publish worker stopped");
}

/// Publish one batch and settle it with upstream.
pub async fn deliver(
    publisher: &Publisher,
    batch: Batch,
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> Delivery {
    let batch_id = batch.id();
    let peer = batch.peer();
    let received_at = batch.received_at();
    let (mut pending, acker) = batch.into_parts();
    annotate(&mut pending, peer, received_at, publisher.topology());

    let mut backoff = retry.backoff();
    loop {
        let failed = match publisher.bulk_publish(pending).await {
            Ok(summary) => {
                debug!(batch = %batch_id, acked = summary.acked, dropped = summary.dropped, "Batch delivered");
                Vec::new()
            }
            Err(e) => {
                debug!(batch = %batch_id, error = %e, "Batch partially delivered");
                e.into_failed()
            }
        };

        if failed.is_empty() {
            acker.ack();
            return Delivery::Acked;
        }

        let Some(delay) = backoff.next_delay() else {
            warn!(
                batch = %batch_id,
                attempts = backoff.attempts(),
                remaining = failed.len(),
                "Giving up on batch; upstream will resend it"
            );
            return Delivery::Abandoned;
        };

        tokio::select! {
            () = cancel.cancelled() => {
                debug!(batch = %batch_id, remaining = failed.len(), "Shutdown during retry; abandoning batch");
                return Delivery::Abandoned;
            }
            () = tokio::time::sleep(delay) => {}
        }
        pending = failed;
    }
}

/// Fill in a missing timestamp and tag events with the upstream shipper's name.
pub fn annotate(
    events: &mut [Event],
    peer: Option<SocketAddr>,
    received_at: DateTime<Utc>,
    topology: &TopologyMap,
) {
    let shipper = peer.and_then(|p| topology.lookup(&p.ip().to_string()));
    for event in events {
        event.insert_missing(TIMESTAMP_FIELD, received_at);
        if let Some(name) = &shipper {
            event.insert_missing(SHIPPER_FIELD, name.as_str());
        }
    }
}

async fn topology_loop(publisher: Publisher, config: TopologyConfig, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(config.refresh_interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !publisher.is_connected() {
            continue;
        }

        let ips = local_ips().await;
        if let Err(e) = publisher.publish_ips(&config.shipper_name, &ips).await {
            warn!(name = %config.shipper_name, error = %e, "Failed to publish topology entry");
        }
        match publisher.refresh_topology().await {
            Ok(entries) => debug!(entries, "Topology refreshed"),
            Err(e) => warn!(error = %e, "Failed to refresh topology"),
        }
    }
}

/// Addresses the local hostname resolves to.
async fn local_ips() -> Vec<String> {
    let Some(host) = hostname::get().ok().and_then(|h| h.into_string().ok()) else {
        return Vec::new();
    };
    match tokio::net::lookup_host((host.as_str(), 0)).await {
        Ok(addrs) => addrs
            .map(|a| a.ip().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        Err(e) => {
            debug!(host = %host, error = %e, "Cannot resolve local hostname");
            Vec::new()
        }
    }
}
