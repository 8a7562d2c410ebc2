#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use flate2::{Compression, write::ZlibEncoder};
use rask_shipper::domain::{Event, Value};
use rask_shipper::sender::{Connection, ConnectionSettings, Publisher, PublisherSettings};
use rask_shipper::server::ProtocolVersion;
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const STORE_VERSION: &str = "8.12.0";

pub fn event(n: i64) -> Event {
    Event::new(Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(), "app").with_field("n", n)
}

pub fn events(count: i64) -> Vec<Event> {
    (0..count).map(event).collect()
}

pub fn numbers(events: &[Event]) -> Vec<i64> {
    events
        .iter()
        .map(|e| match e.get("n") {
            Some(Value::Integer(n)) => *n,
            other => panic!("event without n: {other:?}"),
        })
        .collect()
}

pub async fn mount_probe(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "version": {"number": STORE_VERSION}
        })))
        .mount(server)
        .await;
}

pub fn connection_settings(uri: &str) -> ConnectionSettings {
    let mut settings = ConnectionSettings::new(uri).unwrap();
    settings.timeout = Duration::from_secs(5);
    settings.reconnect_interval = Duration::from_millis(20);
    settings
}

/// Publisher against `server`, probed and connected.
pub async fn connected_publisher(server: &MockServer, settings: PublisherSettings) -> Publisher {
    mount_probe(server).await;
    let connection =
        Connection::new(connection_settings(&server.uri()), CancellationToken::new()).unwrap();
    connection.connect().await.unwrap();
    Publisher::new(connection, settings)
}

/// Document lines of an NDJSON bulk body, action lines skipped.
pub fn bulk_documents(body: &[u8]) -> Vec<serde_json::Value> {
    body.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .skip(1)
        .step_by(2)
        .map(|line| serde_json::from_slice(line).unwrap())
        .collect()
}

/// Answers a `_bulk` request with one item per document, its status chosen
/// from the document's `n` field.
pub struct BulkStatuses(pub fn(i64) -> u16);

impl Respond for BulkStatuses {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let items: Vec<serde_json::Value> = bulk_documents(&request.body)
            .iter()
            .map(|doc| {
                let n = doc["n"].as_i64().unwrap_or(-1);
                let status = (self.0)(n);
                if status < 300 {
                    serde_json::json!({"create": {"status": status}})
                } else {
                    serde_json::json!({"create": {
                        "status": status,
                        "error": {"type": "test_exception", "reason": format!("n={n}")}
                    }})
                }
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "took": 1,
            "errors": true,
            "items": items
        }))
    }
}

pub fn bulk_ok(count: usize) -> ResponseTemplate {
    let items: Vec<_> = (0..count)
        .map(|_| serde_json::json!({"create": {"status": 201}}))
        .collect();
    ResponseTemplate::new(200).set_body_json(serde_json::json!({"errors": false, "items": items}))
}

// Inbound frame builders.

pub fn window(v: ProtocolVersion, count: u32) -> Vec<u8> {
    let mut out = vec![v.marker(), b'W'];
    out.extend_from_slice(&count.to_be_bytes());
    out
}

pub fn json_frame(seq: u32, body: &str) -> Vec<u8> {
    let mut out = vec![b'2', b'J'];
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body.as_bytes());
    out
}

pub fn data_frame(seq: u32, pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut out = vec![b'1', b'D'];
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
    for (k, v) in pairs {
        out.extend_from_slice(&(k.len() as u32).to_be_bytes());
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(&(v.len() as u32).to_be_bytes());
        out.extend_from_slice(v.as_bytes());
    }
    out
}

pub fn compressed(v: ProtocolVersion, inner: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(inner).unwrap();
    let payload = encoder.finish().unwrap();
    let mut out = vec![v.marker(), b'C'];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

/// A v2 window of `count` JSON events, each `{"@timestamp":...,"type":"app","n":i}`.
pub fn v2_batch(count: u32) -> Vec<u8> {
    let mut out = window(ProtocolVersion::V2, count);
    for i in 1..=count {
        let body = format!(r#"{{"@timestamp":"2024-01-15T10:30:00.000Z","type":"app","n":{i}}}"#);
        out.extend_from_slice(&json_frame(i, &body));
    }
    out
}

pub fn ack(v: ProtocolVersion, seq: u32) -> [u8; 6] {
    let s = seq.to_be_bytes();
    [v.marker(), b'A', s[0], s[1], s[2], s[3]]
}
