mod common;

use common::{BulkStatuses, bulk_documents, connected_publisher, event, events, numbers};
use rask_shipper::domain::Event;
use rask_shipper::sender::{Connection, PublishError, Publisher, PublisherSettings, classify};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn status_for(n: i64) -> u16 {
    match n % 3 {
        0 => 201,
        1 => 404,
        _ => 503,
    }
}

#[tokio::test]
async fn failed_subset_keeps_submission_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(BulkStatuses(status_for))
        .mount(&server)
        .await;
    let publisher = connected_publisher(&server, PublisherSettings::default()).await;

    let err = publisher.bulk_publish(events(30)).await.unwrap_err();
    let expected: Vec<i64> = (0..30).filter(|n| n % 3 == 2).collect();
    assert!(matches!(err, PublishError::Retryable { .. }));
    assert_eq!(numbers(err.failed()), expected);

    let stats = publisher.stats().snapshot();
    assert_eq!(stats.acked, 10);
    assert_eq!(stats.non_indexable, 10);
    assert_eq!(stats.retried, 10);
}

#[tokio::test]
async fn every_submitted_event_is_accounted_for() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(BulkStatuses(|n| if n == 4 { 409 } else { status_for(n) }))
        .mount(&server)
        .await;
    let publisher = connected_publisher(&server, PublisherSettings::default()).await;

    let err = publisher.bulk_publish(events(9)).await.unwrap_err();
    let stats = publisher.stats().snapshot();
    let retried = err.failed().len() as u64;
    assert_eq!(stats.acked + stats.non_indexable + stats.duplicates + retried, 9);
    assert_eq!(stats.duplicates, 1);

    // The request body carried every event once, in order.
    let requests = server.received_requests().await.unwrap();
    let bulk = requests.iter().find(|r| r.url.path() == "/_bulk").unwrap();
    let sent: Vec<i64> = bulk_documents(&bulk.body)
        .iter()
        .map(|d| d["n"].as_i64().unwrap())
        .collect();
    assert_eq!(sent, (0..9).collect::<Vec<_>>());
}

#[tokio::test]
async fn single_event_matches_bulk_classification() {
    for status in [200_u16, 201, 400, 404, 409, 429, 500, 503] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rask-app-2024.01.15/_doc"))
            .and(query_param("op_type", "create"))
            .respond_with(ResponseTemplate::new(status).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        let publisher = connected_publisher(&server, PublisherSettings::default()).await;

        let result = publisher.bulk_publish(vec![event(7)]).await;
        let retryable = classify(status, false).is_retryable();
        match result {
            Ok(_) => assert!(!retryable, "status {status} should have been retried"),
            Err(e) => {
                assert!(retryable, "status {status} should not have been retried");
                assert_eq!(numbers(e.failed()), vec![7]);
            }
        }
    }
}

#[tokio::test]
async fn disconnected_publisher_returns_everything_untouched() {
    let server = MockServer::start().await;
    let connection = Connection::new(
        common::connection_settings(&server.uri()),
        CancellationToken::new(),
    )
    .unwrap();
    let publisher = Publisher::new(connection, PublisherSettings::default());

    let err = publisher.bulk_publish(events(5)).await.unwrap_err();
    assert!(matches!(err, PublishError::NotConnected { .. }));
    assert_eq!(numbers(&err.into_failed()), vec![0, 1, 2, 3, 4]);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let server = MockServer::start().await;
    let publisher = connected_publisher(&server, PublisherSettings::default()).await;
    let summary = publisher.bulk_publish(Vec::<Event>::new()).await.unwrap();
    assert_eq!(summary.acked, 0);
    assert_eq!(publisher.stats().snapshot().batches, 0);
}

#[tokio::test]
async fn deadline_fails_whole_batch_and_reconnects() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(common::bulk_ok(4).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;
    let publisher = connected_publisher(&server, PublisherSettings::default()).await;
    let attempts_before = publisher.connection().connect_attempts();

    let deadline = Instant::now() + Duration::from_millis(100);
    let err = publisher.bulk_publish_until(events(4), deadline).await.unwrap_err();
    assert!(matches!(err, PublishError::DeadlineExceeded { .. }));
    assert!(err.is_transport());
    assert_eq!(numbers(err.failed()), vec![0, 1, 2, 3]);

    // The background loop probes again and recovers.
    tokio::time::timeout(Duration::from_secs(2), async {
        while !publisher.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(publisher.connection().connect_attempts() > attempts_before);
    assert_eq!(publisher.stats().snapshot().transport_failures, 1);
}

#[tokio::test]
async fn lost_store_is_a_transport_failure() {
    // Pooled servers keep listening after drop; a bare one shuts down.
    let server = MockServer::builder().start().await;
    let publisher = connected_publisher(&server, PublisherSettings::default()).await;
    drop(server);

    let err = publisher.bulk_publish(events(3)).await.unwrap_err();
    assert!(matches!(err, PublishError::Transport { .. }));
    assert_eq!(numbers(err.failed()), vec![0, 1, 2]);
    assert!(!publisher.is_connected());
    assert!(publisher.connection().is_reconnecting());
    publisher.close();
}

#[tokio::test]
async fn independent_clones_share_stats_but_not_state() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(BulkStatuses(|_| 201))
        .mount(&server)
        .await;
    let publisher = connected_publisher(&server, PublisherSettings::default()).await;
    let clone = publisher.independent_clone().unwrap();
    assert!(!clone.is_connected());

    clone.connect().await.unwrap();
    clone.bulk_publish(events(2)).await.unwrap();
    publisher.bulk_publish(events(3)).await.unwrap();
    assert_eq!(publisher.stats().snapshot().acked, 5);

    clone.close();
    assert!(publisher.is_connected());
}
