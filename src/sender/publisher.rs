use bytes::Bytes;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::Event;
use crate::sender::classifier::{CONFLICT, RetryDecision, TOO_MANY_REQUESTS};
use crate::sender::connection::{Connection, ConnectionError};
use crate::sender::encoder::{
    ActionKind, BatchEncoder, BulkEncoder, EncodeError, JSON_CONTENT_TYPE, LineEncoder,
    action_for, encode_document, mapping_type,
};
use crate::sender::index::IndexSelector;
use crate::sender::response::{ItemResult, parse_bulk_response};
use crate::sender::stats::PublishStats;
use crate::sender::topology::{TopologyEntry, TopologyMap};

pub const DEFAULT_PUSH_PATH: &str = "/v1/aggregate";
pub const DEFAULT_TOPOLOGY_INDEX: &str = ".rask-topology";
const TOPOLOGY_SEARCH_SIZE: &str = "10000";

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Not connected to {endpoint}; {} events returned", .failed.len())]
    NotConnected { endpoint: String, failed: Vec<Event> },
    #[error("Transport failure: {reason}; {} events returned", .failed.len())]
    Transport { reason: String, failed: Vec<Event> },
    #[error("Publish deadline exceeded; {} events returned", .failed.len())]
    DeadlineExceeded { failed: Vec<Event> },
    #[error("{} events must be retried", .failed.len())]
    Retryable { failed: Vec<Event> },
}

impl PublishError {
    /// Events the caller must redeliver, in their original relative order.
    pub fn failed(&self) -> &[Event] {
        match self {
            PublishError::NotConnected { failed, .. }
            | PublishError::Transport { failed, .. }
            | PublishError::DeadlineExceeded { failed }
            | PublishError::Retryable { failed } => failed,
        }
    }

    pub fn into_failed(self) -> Vec<Event> {
        match self {
            PublishError::NotConnected { failed, .. }
            | PublishError::Transport { failed, .. }
            | PublishError::DeadlineExceeded { failed }
            | PublishError::Retryable { failed } => failed,
        }
    }

    /// Whether the connection was lost while publishing.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PublishError::Transport { .. } | PublishError::DeadlineExceeded { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Not connected to {0}")]
    NotConnected(String),
    #[error("Topology request failed: {0}")]
    Transport(String),
    #[error("Topology request returned HTTP {0}")]
    Status(u16),
    #[error("Invalid topology response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Wire format the store expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Search engine `_bulk` API with per-item statuses.
    #[default]
    Elasticsearch,
    /// Plain NDJSON push; one HTTP status covers the whole request.
    Ndjson,
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub store: StoreKind,
    pub index: IndexSelector,
    /// gzip level for request bodies; 0 disables compression.
    pub compression_level: u32,
    pub push_path: String,
    pub topology_index: String,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            store: StoreKind::Elasticsearch,
            index: IndexSelector::default(),
            compression_level: 0,
            push_path: DEFAULT_PUSH_PATH.to_string(),
            topology_index: DEFAULT_TOPOLOGY_INDEX.to_string(),
        }
    }
}

/// Result of a publish call in which nothing is left to retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub acked: usize,
    /// Permanently rejected or unencodable events.
    pub dropped: usize,
    /// `create` conflicts: the document was already stored.
    pub duplicates: usize,
}

enum SendFailure {
    Transport(String),
    Deadline,
}

/// Ships batches of events to one store over one [`Connection`].
#[derive(Debug, Clone)]
pub struct Publisher {
    connection: Connection,
    settings: Arc<PublisherSettings>,
    stats: Arc<PublishStats>,
    topology: Arc<TopologyMap>,
}

impl Publisher {
    pub fn new(connection: Connection, settings: PublisherSettings) -> Self {
        Self {
            connection,
            settings: Arc::new(settings),
            stats: Arc::new(PublishStats::new()),
            topology: Arc::new(TopologyMap::new()),
        }
    }

    pub fn with_topology(mut self, topology: Arc<TopologyMap>) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_stats(mut self, stats: Arc<PublishStats>) -> Self {
        self.stats = stats;
        self
    }

    /// A publisher on its own connection, sharing settings, stats and topology.
    pub fn independent_clone(&self) -> Result<Self, ConnectionError> {
        Ok(Self {
            connection: self.connection.independent_clone()?,
            settings: Arc::clone(&self.settings),
            stats: Arc::clone(&self.stats),
            topology: Arc::clone(&self.topology),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn stats(&self) -> &Arc<PublishStats> {
        &self.stats
    }

    pub fn topology(&self) -> &Arc<TopologyMap> {
        &self.topology
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.connection.connect().await
    }

    pub fn close(&self) {
        self.connection.close();
    }

    /// Publish `events` in one round trip.
    ///
    /// `Ok` means nothing needs redelivery. On `Err`, the events that must be
    /// retried are carried by the error in their original order. Unencodable
    /// and permanently rejected events are dropped and logged.
    pub async fn bulk_publish(&self, events: Vec<Event>) -> Result<PublishSummary, PublishError> {
        self.publish(events, None).await
    }

    /// As [`bulk_publish`](Self::bulk_publish), failing the whole in-flight
    /// batch if `deadline` passes first.
    pub async fn bulk_publish_until(
        &self,
        events: Vec<Event>,
        deadline: Instant,
    ) -> Result<PublishSummary, PublishError> {
        self.publish(events, Some(deadline)).await
    }

    async fn publish(
        &self,
        events: Vec<Event>,
        deadline: Option<Instant>,
    ) -> Result<PublishSummary, PublishError> {
        if !self.connection.is_connected() {
            return Err(PublishError::NotConnected {
                endpoint: self.connection.endpoint().to_string(),
                failed: events,
            });
        }
        if events.is_empty() {
            return Ok(PublishSummary::default());
        }

        self.stats.record_batch();
        if events.len() == 1 && self.settings.store == StoreKind::Elasticsearch {
            self.publish_single(events, deadline).await
        } else {
            self.publish_bulk(events, deadline).await
        }
    }

    fn encoder(&self) -> Box<dyn BatchEncoder> {
        match self.settings.store {
            StoreKind::Elasticsearch => Box::new(BulkEncoder::new(
                self.settings.index.clone(),
                self.connection.version(),
                self.settings.compression_level,
            )),
            StoreKind::Ndjson => Box::new(LineEncoder::new(self.settings.compression_level)),
        }
    }

    async fn publish_bulk(
        &self,
        events: Vec<Event>,
        deadline: Option<Instant>,
    ) -> Result<PublishSummary, PublishError> {
        let mut encoder = self.encoder();
        let mut results: Vec<Option<ItemResult>> = vec![None; events.len()];
        let mut sent = Vec::with_capacity(events.len());

        for (i, event) in events.iter().enumerate() {
            match encoder.add(event) {
                Ok(()) => sent.push(i),
                Err(e) => self.drop_unencodable(&e),
            }
        }

        let mut summary = PublishSummary {
            dropped: events.len() - sent.len(),
            ..PublishSummary::default()
        };
        if sent.is_empty() {
            return Ok(summary);
        }

        let content_type = encoder.content_type();
        let content_encoding = encoder.content_encoding();
        let item_results = match encoder.finish() {
            Ok(body) => {
                let path = match self.settings.store {
                    StoreKind::Elasticsearch => "_bulk",
                    StoreKind::Ndjson => self.settings.push_path.as_str(),
                };
                let mut request = self
                    .connection
                    .request(Method::POST, path)
                    .header(CONTENT_TYPE, content_type);
                if let Some(encoding) = content_encoding {
                    request = request.header(CONTENT_ENCODING, encoding);
                }

                match self.send(request.body(body), deadline).await {
                    Ok((status, body)) => self.item_results(status, &body, sent.len()),
                    Err(failure) => {
                        let failed = take_indices(events, &sent);
                        return Err(self.transport_failed(failure, failed));
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to finish request body; retrying batch");
                vec![ItemResult::unreadable(); sent.len()]
            }
        };

        for (&i, result) in sent.iter().zip(item_results) {
            results[i] = Some(result);
        }

        let mut failed = Vec::new();
        for (event, result) in events.into_iter().zip(results) {
            if let Some(result) = result {
                self.triage(event, &result, &mut summary, &mut failed);
            }
        }
        self.finish(summary, failed)
    }

    fn item_results(&self, status: StatusCode, body: &[u8], expected: usize) -> Vec<ItemResult> {
        match self.settings.store {
            StoreKind::Elasticsearch if status == StatusCode::OK => {
                match parse_bulk_response(body, expected) {
                    Ok(items) => items,
                    Err(e) => {
                        warn!(error = %e, "Cannot read bulk response; retrying all items");
                        vec![ItemResult::unreadable(); expected]
                    }
                }
            }
            StoreKind::Elasticsearch => {
                warn!(status = status.as_u16(), "Bulk request rejected; retrying all items");
                vec![ItemResult::unreadable(); expected]
            }
            StoreKind::Ndjson => vec![ItemResult::with_status(status.as_u16()); expected],
        }
    }

    async fn publish_single(
        &self,
        mut events: Vec<Event>,
        deadline: Option<Instant>,
    ) -> Result<PublishSummary, PublishError> {
        let Some(event) = events.pop() else {
            return Ok(PublishSummary::default());
        };

        let request = match self.single_request(&event) {
            Ok(request) => request,
            Err(e) => {
                self.drop_unencodable(&e);
                return Ok(PublishSummary {
                    dropped: 1,
                    ..PublishSummary::default()
                });
            }
        };

        let (status, body) = match self.send(request, deadline).await {
            Ok(response) => response,
            Err(failure) => return Err(self.transport_failed(failure, vec![event])),
        };

        let result = single_result(status, &body);
        let mut summary = PublishSummary::default();
        let mut failed = Vec::new();
        self.triage(event, &result, &mut summary, &mut failed);
        self.finish(summary, failed)
    }

    fn single_request(&self, event: &Event) -> Result<RequestBuilder, EncodeError> {
        let body = encode_document(event)?;
        let index = self.settings.index.select(event)?;
        let version = self.connection.version();

        let request = match (event.id(), mapping_type(version)) {
            (Some(id), None) => {
                self.connection
                    .request_segments(Method::PUT, &[&index, "_create", id])
            }
            (Some(id), Some(doc_type)) => self
                .connection
                .request_segments(Method::PUT, &[&index, doc_type, id, "_create"]),
            (None, Some(doc_type)) => self
                .connection
                .request_segments(Method::POST, &[&index, doc_type]),
            (None, None) => {
                let mut request = self
                    .connection
                    .request_segments(Method::POST, &[&index, "_doc"]);
                if action_for(event, version) == ActionKind::Create {
                    request = request.query(&[("op_type", "create")]);
                }
                request
            }
        };
        let request = match event.pipeline() {
            Some(pipeline) => request.query(&[("pipeline", pipeline)]),
            None => request,
        };

        Ok(request.header(CONTENT_TYPE, JSON_CONTENT_TYPE).body(body))
    }

    async fn send(
        &self,
        request: RequestBuilder,
        deadline: Option<Instant>,
    ) -> Result<(StatusCode, Bytes), SendFailure> {
        let round_trip = async {
            let response = request.send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, round_trip)
                .await
                .map_err(|_| SendFailure::Deadline)?,
            None => round_trip.await,
        };
        outcome.map_err(|e| SendFailure::Transport(e.to_string()))
    }

    fn transport_failed(&self, failure: SendFailure, failed: Vec<Event>) -> PublishError {
        self.stats.record_transport_failure();
        self.stats.record_retried(failed.len() as u64);
        self.connection.report_failure();

        match failure {
            SendFailure::Transport(reason) => {
                warn!(endpoint = %self.connection.endpoint(), error = %reason, count = failed.len(), "Transport failure; batch returned for retry");
                PublishError::Transport { reason, failed }
            }
            SendFailure::Deadline => {
                warn!(endpoint = %self.connection.endpoint(), count = failed.len(), "Publish deadline exceeded; batch returned for retry");
                PublishError::DeadlineExceeded { failed }
            }
        }
    }

    fn drop_unencodable(&self, error: &EncodeError) {
        self.stats.record_encode_failure();
        warn!(error = %error, "Dropping event that cannot be encoded");
    }

    fn triage(
        &self,
        event: Event,
        result: &ItemResult,
        summary: &mut PublishSummary,
        failed: &mut Vec<Event>,
    ) {
        match result.decision() {
            RetryDecision::Accepted => summary.acked += 1,
            RetryDecision::Permanent if result.status == Some(CONFLICT) => {
                self.stats.record_duplicate();
                summary.duplicates += 1;
            }
            RetryDecision::Permanent => {
                self.stats.record_non_indexable();
                summary.dropped += 1;
                warn!(
                    status = result.status,
                    error_type = result.error_type.as_deref().unwrap_or(""),
                    reason = result.reason.as_deref().unwrap_or(""),
                    "Cannot index event; dropping it"
                );
            }
            RetryDecision::Retryable => {
                if result.status == Some(TOO_MANY_REQUESTS) {
                    self.stats.record_too_many();
                }
                failed.push(event);
            }
        }
    }

    fn finish(
        &self,
        summary: PublishSummary,
        failed: Vec<Event>,
    ) -> Result<PublishSummary, PublishError> {
        self.stats.record_acked(summary.acked as u64);
        if failed.is_empty() {
            debug!(acked = summary.acked, dropped = summary.dropped, "Batch published");
            Ok(summary)
        } else {
            self.stats.record_retried(failed.len() as u64);
            debug!(acked = summary.acked, retry = failed.len(), "Batch partially published");
            Err(PublishError::Retryable { failed })
        }
    }

    /// Record this shipper's addresses in the topology index.
    pub async fn publish_ips(&self, name: &str, ips: &[String]) -> Result<(), TopologyError> {
        if !self.connection.is_connected() {
            return Err(TopologyError::NotConnected(self.connection.endpoint().to_string()));
        }

        let entry = TopologyEntry {
            name: name.to_string(),
            ips: ips.to_vec(),
        };
        let index = self.settings.topology_index.as_str();
        let segments: Vec<&str> = match mapping_type(self.connection.version()) {
            Some(doc_type) => vec![index, doc_type, name],
            None => vec![index, "_doc", name],
        };
        let request = self
            .connection
            .request_segments(Method::PUT, &segments)
            .json(&entry);

        let (status, _) = self.send_topology(request).await?;
        if !status.is_success() {
            return Err(TopologyError::Status(status.as_u16()));
        }
        debug!(name, count = ips.len(), "Published shipper addresses");
        Ok(())
    }

    /// Reload the topology index and swap it into the shared map.
    ///
    /// Returns the number of shippers found. A missing index counts as empty.
    pub async fn refresh_topology(&self) -> Result<usize, TopologyError> {
        if !self.connection.is_connected() {
            return Err(TopologyError::NotConnected(self.connection.endpoint().to_string()));
        }

        let request = self
            .connection
            .request_segments(Method::GET, &[&self.settings.topology_index, "_search"])
            .query(&[("size", TOPOLOGY_SEARCH_SIZE)]);
        let (status, body) = self.send_topology(request).await?;

        let entries = match status {
            StatusCode::NOT_FOUND => Vec::new(),
            s if s.is_success() => {
                let response: SearchResponse = serde_json::from_slice(&body)?;
                response.hits.hits.into_iter().map(|hit| hit.source).collect()
            }
            s => return Err(TopologyError::Status(s.as_u16())),
        };

        let count = entries.len();
        self.topology.replace_entries(entries);
        debug!(shippers = count, addresses = self.topology.len(), "Topology refreshed");
        Ok(count)
    }

    async fn send_topology(&self, request: RequestBuilder) -> Result<(StatusCode, Bytes), TopologyError> {
        match self.send(request, None).await {
            Ok(response) => Ok(response),
            Err(SendFailure::Transport(reason)) => {
                self.connection.report_failure();
                Err(TopologyError::Transport(reason))
            }
            Err(SendFailure::Deadline) => Err(TopologyError::Transport("deadline exceeded".to_string())),
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    #[serde(rename = "_source")]
    source: TopologyEntry,
}

#[derive(Deserialize)]
struct SingleErrorBody {
    error: Option<serde_json::Value>,
}

/// The HTTP status of a single-document request is the item status.
fn single_result(status: StatusCode, body: &[u8]) -> ItemResult {
    let error = serde_json::from_slice::<SingleErrorBody>(body)
        .ok()
        .and_then(|b| b.error);
    let field = |name: &str| {
        error
            .as_ref()
            .and_then(|e| e.get(name))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    };
    ItemResult {
        status: Some(status.as_u16()),
        error_type: field("type"),
        reason: field("reason"),
    }
}

/// Moves the events at `indices` (ascending) out of `events`.
fn take_indices(events: Vec<Event>, indices: &[usize]) -> Vec<Event> {
    let mut wanted = indices.iter().peekable();
    events
        .into_iter()
        .enumerate()
        .filter_map(|(i, event)| {
            if wanted.peek() == Some(&&i) {
                wanted.next();
                Some(event)
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Value;
    use crate::sender::connection::ConnectionSettings;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event(n: i64) -> Event {
        Event::new(Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(), "app").with_field("n", n)
    }

    async fn connected_publisher(server: &MockServer, settings: PublisherSettings) -> Publisher {
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "version": {"number": "8.12.0"}
            })))
            .mount(server)
            .await;

        let mut conn_settings = ConnectionSettings::new(&server.uri()).unwrap();
        conn_settings.timeout = Duration::from_secs(5);
        conn_settings.reconnect_interval = Duration::from_millis(50);
        let connection = Connection::new(conn_settings, CancellationToken::new()).unwrap();
        connection.connect().await.unwrap();
        Publisher::new(connection, settings)
    }

    #[test]
    fn take_indices_preserves_order() {
        let events: Vec<Event> = (0..6).map(event).collect();
        let taken = take_indices(events, &[1, 3, 4]);
        let ns: Vec<_> = taken.iter().map(|e| e.get("n").cloned()).collect();
        assert_eq!(
            ns,
            vec![Some(Value::Integer(1)), Some(Value::Integer(3)), Some(Value::Integer(4))]
        );
    }

    #[test]
    fn single_result_reads_error_type() {
        let body = br#"{"error":{"type":"es_rejected_execution_exception","reason":"busy"},"status":400}"#;
        let result = single_result(StatusCode::BAD_REQUEST, body);
        assert_eq!(result.decision(), RetryDecision::Retryable);
        assert_eq!(result.reason.as_deref(), Some("busy"));
    }

    #[tokio::test]
    #[traced_test]
    async fn permanent_rejection_is_logged_and_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errors": true,
                "items": [
                    {"create": {"status": 201}},
                    {"create": {"status": 400, "error": {"type": "mapper_parsing_exception", "reason": "failed to parse field [n]"}}}
                ]
            })))
            .mount(&server)
            .await;

        let publisher = connected_publisher(&server, PublisherSettings::default()).await;
        let summary = publisher.bulk_publish(vec![event(0), event(1)]).await.unwrap();

        assert_eq!(summary.acked, 1);
        assert_eq!(summary.dropped, 1);
        assert_eq!(publisher.stats().snapshot().non_indexable, 1);
        assert!(logs_contain("Cannot index event"));
        assert!(logs_contain("failed to parse field"));
    }

    #[tokio::test]
    #[traced_test]
    async fn unencodable_event_is_dropped_without_failing_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"create": {"status": 201}}, {"create": {"status": 201}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let publisher = connected_publisher(&server, PublisherSettings::default()).await;
        let bad = Event::default().with_field("type", "app");
        let summary = publisher
            .bulk_publish(vec![event(0), bad, event(2)])
            .await
            .unwrap();

        assert_eq!(summary.acked, 2);
        assert_eq!(summary.dropped, 1);
        assert_eq!(publisher.stats().snapshot().encode_failures, 1);
        assert!(logs_contain("Dropping event that cannot be encoded"));
    }

    #[tokio::test]
    async fn conflict_counts_as_duplicate() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/rask-app-2024.01.15/_create/abc"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "error": {"type": "version_conflict_engine_exception", "reason": "document already exists"},
                "status": 409
            })))
            .expect(1)
            .mount(&server)
            .await;

        let publisher = connected_publisher(&server, PublisherSettings::default()).await;
        let summary = publisher.bulk_publish(vec![event(0).with_id("abc")]).await.unwrap();

        assert_eq!(summary.duplicates, 1);
        assert_eq!(publisher.stats().snapshot().duplicates, 1);
    }

    #[tokio::test]
    async fn single_event_uses_document_endpoint_with_pipeline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rask-app-2024.01.15/_doc"))
            .and(query_param("pipeline", "geoip"))
            .and(query_param("op_type", "create"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let publisher = connected_publisher(&server, PublisherSettings::default()).await;
        let summary = publisher
            .bulk_publish(vec![event(0).with_pipeline("geoip")])
            .await
            .unwrap();
        assert_eq!(summary.acked, 1);
    }

    #[tokio::test]
    async fn too_many_requests_is_retried_and_counted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rask-app-2024.01.15/_doc"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let publisher = connected_publisher(&server, PublisherSettings::default()).await;
        let err = publisher.bulk_publish(vec![event(0)]).await.unwrap_err();

        assert!(matches!(err, PublishError::Retryable { .. }));
        assert_eq!(err.failed().len(), 1);
        assert_eq!(publisher.stats().snapshot().too_many, 1);
        assert!(publisher.is_connected());
    }

    #[tokio::test]
    async fn bulk_http_error_retries_everything() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(413))
            .mount(&server)
            .await;

        let publisher = connected_publisher(&server, PublisherSettings::default()).await;
        let err = publisher
            .bulk_publish(vec![event(0), event(1), event(2)])
            .await
            .unwrap_err();
        assert_eq!(err.into_failed().len(), 3);
    }

    #[tokio::test]
    async fn ndjson_store_applies_http_status_to_all_items() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/aggregate"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let settings = PublisherSettings {
            store: StoreKind::Ndjson,
            ..PublisherSettings::default()
        };
        let publisher = connected_publisher(&server, settings).await;
        let err = publisher.bulk_publish(vec![event(0), event(1)]).await.unwrap_err();
        assert_eq!(err.failed().len(), 2);
    }

    #[tokio::test]
    async fn topology_is_published_and_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/.rask-topology/_doc/edge-1"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.rask-topology/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "hits": {"hits": [
                    {"_source": {"name": "edge-1", "ips": ["10.1.0.5"]}},
                    {"_source": {"name": "edge-2", "ips": ["10.1.0.6", "10.1.0.7"]}}
                ]}
            })))
            .mount(&server)
            .await;

        let publisher = connected_publisher(&server, PublisherSettings::default()).await;
        publisher
            .publish_ips("edge-1", &["10.1.0.5".to_string()])
            .await
            .unwrap();
        assert_eq!(publisher.refresh_topology().await.unwrap(), 2);
        assert_eq!(publisher.topology().lookup("10.1.0.7").as_deref(), Some("edge-2"));
    }

    #[tokio::test]
    async fn missing_topology_index_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.rask-topology/_search"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let publisher = connected_publisher(&server, PublisherSettings::default()).await;
        publisher.topology().update(|m| {
            m.insert("10.0.0.1".into(), "stale".into());
        });
        assert_eq!(publisher.refresh_topology().await.unwrap(), 0);
        assert!(publisher.topology().is_empty());
    }
}
