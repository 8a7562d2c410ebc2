use bytes::Bytes;
use flate2::{Compression, write::GzEncoder};
use serde::Serialize;
use std::io::Write;
use thiserror::Error;

use crate::domain::Event;
use crate::domain::event::FieldError;
use crate::sender::connection::StoreVersion;
use crate::sender::index::{IndexError, IndexSelector};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error during encoding: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid event: {0}")]
    Field(#[from] FieldError),
    #[error("{0}")]
    Index(#[from] IndexError),
}

/// Builds one request body out of an ordered run of events.
///
/// `add` is all-or-nothing: when it fails the body is exactly as it was
/// before the call, so the caller can drop the event and keep going.
pub trait BatchEncoder: Send {
    fn reset(&mut self);
    fn add(&mut self, event: &Event) -> Result<(), EncodeError>;
    /// Number of events successfully added since the last reset.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Returns the finished body, compressed if configured. Leaves the encoder reset.
    fn finish(&mut self) -> Result<Bytes, EncodeError>;
    fn content_type(&self) -> &'static str;
    fn content_encoding(&self) -> Option<&'static str>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Index,
}

/// `create` when the caller fixed the id or the store understands
/// `create` without one; `index` for older stores.
pub fn action_for(event: &Event, version: Option<StoreVersion>) -> ActionKind {
    if event.id().is_some() || version.is_none_or(|v| v.at_least(7, 5)) {
        ActionKind::Create
    } else {
        ActionKind::Index
    }
}

/// Stores before 7.0 still require a mapping type on every action.
pub fn mapping_type(version: Option<StoreVersion>) -> Option<&'static str> {
    match version {
        Some(v) if v.major < 7 => Some("doc"),
        _ => None,
    }
}

#[derive(Serialize)]
struct BulkMeta<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_type", skip_serializing_if = "Option::is_none")]
    doc_type: Option<&'a str>,
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pipeline: Option<&'a str>,
}

#[derive(Serialize)]
enum BulkAction<'a> {
    #[serde(rename = "create")]
    Create(BulkMeta<'a>),
    #[serde(rename = "index")]
    Index(BulkMeta<'a>),
}

/// Interleaved action/document NDJSON for a `_bulk` endpoint.
pub struct BulkEncoder {
    index: IndexSelector,
    version: Option<StoreVersion>,
    compression_level: u32,
    buffer: Vec<u8>,
    items: usize,
}

impl BulkEncoder {
    pub fn new(index: IndexSelector, version: Option<StoreVersion>, compression_level: u32) -> Self {
        Self {
            index,
            version,
            compression_level,
            buffer: Vec::with_capacity(64 * 1024),
            items: 0,
        }
    }

    fn write_item(&mut self, event: &Event) -> Result<(), EncodeError> {
        let index = self.index.select(event)?;
        let meta = BulkMeta {
            index: &index,
            doc_type: mapping_type(self.version),
            id: event.id(),
            pipeline: event.pipeline(),
        };
        let action = match action_for(event, self.version) {
            ActionKind::Create => BulkAction::Create(meta),
            ActionKind::Index => BulkAction::Index(meta),
        };

        serde_json::to_writer(&mut self.buffer, &action)?;
        self.buffer.write_all(b"\n")?;
        serde_json::to_writer(&mut self.buffer, event)?;
        self.buffer.write_all(b"\n")?;
        Ok(())
    }
}

impl BatchEncoder for BulkEncoder {
    fn reset(&mut self) {
        self.buffer.clear();
        self.items = 0;
    }

    fn add(&mut self, event: &Event) -> Result<(), EncodeError> {
        let mark = self.buffer.len();
        match self.write_item(event) {
            Ok(()) => {
                self.items += 1;
                Ok(())
            }
            Err(e) => {
                self.buffer.truncate(mark);
                Err(e)
            }
        }
    }

    fn len(&self) -> usize {
        self.items
    }

    fn finish(&mut self) -> Result<Bytes, EncodeError> {
        let body = compress(std::mem::take(&mut self.buffer), self.compression_level)?;
        self.items = 0;
        Ok(body)
    }

    fn content_type(&self) -> &'static str {
        NDJSON_CONTENT_TYPE
    }

    fn content_encoding(&self) -> Option<&'static str> {
        (self.compression_level > 0).then_some("gzip")
    }
}

/// One document per line, for collectors and queues that take plain NDJSON.
pub struct LineEncoder {
    compression_level: u32,
    buffer: Vec<u8>,
    items: usize,
}

impl LineEncoder {
    pub fn new(compression_level: u32) -> Self {
        Self {
            compression_level,
            buffer: Vec::with_capacity(64 * 1024),
            items: 0,
        }
    }

    fn write_line(&mut self, event: &Event) -> Result<(), EncodeError> {
        event.timestamp()?;
        event.doc_type()?;
        serde_json::to_writer(&mut self.buffer, event)?;
        self.buffer.write_all(b"\n")?;
        Ok(())
    }
}

impl BatchEncoder for LineEncoder {
    fn reset(&mut self) {
        self.buffer.clear();
        self.items = 0;
    }

    fn add(&mut self, event: &Event) -> Result<(), EncodeError> {
        let mark = self.buffer.len();
        match self.write_line(event) {
            Ok(()) => {
                self.items += 1;
                Ok(())
            }
            Err(e) => {
                self.buffer.truncate(mark);
                Err(e)
            }
        }
    }

    fn len(&self) -> usize {
        self.items
    }

    fn finish(&mut self) -> Result<Bytes, EncodeError> {
        let body = compress(std::mem::take(&mut self.buffer), self.compression_level)?;
        self.items = 0;
        Ok(body)
    }

    fn content_type(&self) -> &'static str {
        NDJSON_CONTENT_TYPE
    }

    fn content_encoding(&self) -> Option<&'static str> {
        (self.compression_level > 0).then_some("gzip")
    }
}

/// Serialize a bare document, as sent to single-document endpoints.
pub fn encode_document(event: &Event) -> Result<Vec<u8>, EncodeError> {
    event.timestamp()?;
    event.doc_type()?;
    Ok(serde_json::to_vec(event)?)
}

fn compress(data: Vec<u8>, level: u32) -> Result<Bytes, EncodeError> {
    if level == 0 {
        return Ok(Bytes::from(data));
    }
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::new(level));
    encoder.write_all(&data)?;
    Ok(Bytes::from(encoder.finish()?))
}
