use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::sender::classifier::{RetryDecision, classify_item};

#[derive(Error, Debug)]
pub enum ResponseError {
    #[error("bulk response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bulk response has no items array")]
    MissingItems,
}

/// Outcome of one bulk item as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemResult {
    /// `None` when the item could not be read.
    pub status: Option<u16>,
    pub error_type: Option<String>,
    pub reason: Option<String>,
}

impl ItemResult {
    pub fn unreadable() -> Self {
        Self::default()
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn decision(&self) -> RetryDecision {
        classify_item(self.status, self.error_type.as_deref())
    }
}

#[derive(Deserialize)]
struct BulkEnvelope {
    items: Option<Vec<JsonValue>>,
}

/// Parse a `_bulk` response into exactly `expected` item results, in request order.
///
/// Individual items that cannot be read, and any missing tail, come back as
/// [`ItemResult::unreadable`]. Only a broken envelope is an error.
pub fn parse_bulk_response(body: &[u8], expected: usize) -> Result<Vec<ItemResult>, ResponseError> {
    let envelope: BulkEnvelope = serde_json::from_slice(body)?;
    let items = envelope.items.ok_or(ResponseError::MissingItems)?;

    let mut results: Vec<ItemResult> = items.iter().take(expected).map(parse_item).collect();
    results.resize_with(expected, ItemResult::unreadable);
    Ok(results)
}

fn parse_item(item: &JsonValue) -> ItemResult {
    // {"<action>": {"status": 201, "error": {...}}}
    let Some(inner) = item
        .as_object()
        .and_then(|obj| obj.values().next())
        .and_then(JsonValue::as_object)
    else {
        return ItemResult::unreadable();
    };

    let status = inner
        .get("status")
        .and_then(JsonValue::as_u64)
        .and_then(|s| u16::try_from(s).ok());

    let (error_type, reason) = match inner.get("error") {
        Some(JsonValue::Object(err)) => (
            err.get("type").and_then(JsonValue::as_str).map(str::to_string),
            err.get("reason").and_then(JsonValue::as_str).map(str::to_string),
        ),
        Some(JsonValue::String(reason)) => (None, Some(reason.clone())),
        _ => (None, None),
    };

    ItemResult {
        status,
        error_type,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_items_in_order() {
        let body = br#"{"took":3,"errors":true,"items":[
            {"create":{"_index":"a","status":201}},
            {"create":{"_index":"a","status":400,"error":{"type":"mapper_parsing_exception","reason":"bad field"}}},
            {"index":{"_index":"a","status":429,"error":{"type":"es_rejected_execution_exception","reason":"queue full"}}}
        ]}"#;
        let results = parse_bulk_response(body, 3).unwrap();

        assert_eq!(results[0].decision(), RetryDecision::Accepted);
        assert_eq!(results[1].decision(), RetryDecision::Permanent);
        assert_eq!(results[1].reason.as_deref(), Some("bad field"));
        assert_eq!(results[2].decision(), RetryDecision::Retryable);
    }

    #[test]
    fn missing_tail_is_retryable() {
        let body = br#"{"items":[{"create":{"status":201}}]}"#;
        let results = parse_bulk_response(body, 3).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].decision(), RetryDecision::Accepted);
        assert!(results[1..].iter().all(|r| r.decision().is_retryable()));
    }

    #[test]
    fn unreadable_item_is_retryable() {
        let body = br#"{"items":[{"create":{"status":"weird"}}, 17, {"create":{"status":200}}]}"#;
        let results = parse_bulk_response(body, 3).unwrap();
        assert_eq!(results[0].decision(), RetryDecision::Retryable);
        assert_eq!(results[1].decision(), RetryDecision::Retryable);
        assert_eq!(results[2].decision(), RetryDecision::Accepted);
    }

    #[test]
    fn broken_envelope_is_an_error() {
        assert!(matches!(
            parse_bulk_response(b"<html>", 1),
            Err(ResponseError::Json(_))
        ));
        assert!(matches!(
            parse_bulk_response(br#"{"took":1}"#, 1),
            Err(ResponseError::MissingItems)
        ));
    }
}
