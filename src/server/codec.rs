//! Frame decoding for the inbound batch protocol.
//!
//! Every frame starts with the version byte and a frame-type byte; all
//! integers are big-endian u32.
//!
//! ```text
//! W  count                          open a window of `count` events
//! J  seq len <len bytes JSON>       one event (v2)
//! D  seq pairs (klen key vlen val)* one event of string fields (v1)
//! C  len <len bytes zlib>           more frames of the same version
//! A  seq                            ack, server to client
//! ```

use bytes::{Buf, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};
use thiserror::Error;
use tokio_util::codec::Decoder;

use crate::server::DecodeError;

/// Largest payload accepted in a single frame, compressed or not.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const MAX_COMPRESSION_DEPTH: usize = 4;

pub const FRAME_WINDOW: u8 = b'W';
pub const FRAME_JSON: u8 = b'J';
pub const FRAME_DATA: u8 = b'D';
pub const FRAME_COMPRESSED: u8 = b'C';
pub const FRAME_ACK: u8 = b'A';

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub const ALL: [ProtocolVersion; 2] = [ProtocolVersion::V1, ProtocolVersion::V2];

    pub const fn marker(self) -> u8 {
        match self {
            ProtocolVersion::V1 => b'1',
            ProtocolVersion::V2 => b'2',
        }
    }

    pub const fn from_marker(byte: u8) -> Option<Self> {
        match byte {
            b'1' => Some(ProtocolVersion::V1),
            b'2' => Some(ProtocolVersion::V2),
            _ => None,
        }
    }

    /// v1 has no liveness acks.
    pub const fn supports_keepalive(self) -> bool {
        matches!(self, ProtocolVersion::V2)
    }

    const fn accepts(self, kind: u8) -> bool {
        match kind {
            FRAME_WINDOW | FRAME_COMPRESSED => true,
            FRAME_JSON => matches!(self, ProtocolVersion::V2),
            FRAME_DATA => matches!(self, ProtocolVersion::V1),
            _ => false,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V1 => f.write_str("v1"),
            ProtocolVersion::V2 => f.write_str("v2"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Expected version byte {expected:#04x}, found {found:#04x}")]
    VersionMismatch { expected: u8, found: u8 },
    #[error("Unknown frame type {kind:#04x} for {version}")]
    UnknownFrame { version: ProtocolVersion, kind: u8 },
    #[error("Frame payload of {0} bytes exceeds limit")]
    PayloadTooLarge(usize),
    #[error("Field is not valid UTF-8")]
    InvalidUtf8,
    #[error("Compressed frame is truncated or corrupt")]
    Compressed,
    #[error("Compressed frames nested too deeply")]
    NestingTooDeep,
    #[error("Event frame outside of a window")]
    EventBeforeWindow,
    #[error("Window frame while {remaining} events of the previous window are outstanding")]
    WindowWhileOpen { remaining: u32 },
    #[error("Invalid event payload: {0}")]
    InvalidEvent(#[source] DecodeError),
    #[error("Read timed out inside an open batch")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Window(u32),
    Json { seq: u32, payload: Bytes },
    Data { seq: u32, fields: Vec<(String, String)> },
}

enum RawFrame {
    Frame(Frame),
    Compressed(Bytes),
}

/// Decodes frames for one protocol version, expanding compressed frames in place.
#[derive(Debug)]
pub struct FrameDecoder {
    version: ProtocolVersion,
    pending: std::collections::VecDeque<Frame>,
    scan: Option<DataScan>,
}

/// How far the length prefixes of a partially received data frame have been walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DataScan {
    pairs: u32,
    end: usize,
}

impl FrameDecoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            pending: std::collections::VecDeque::new(),
            scan: None,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            match decode_raw(self.version, src, &mut self.scan)? {
                Some(RawFrame::Frame(frame)) => return Ok(Some(frame)),
                Some(RawFrame::Compressed(payload)) => {
                    self.pending.extend(expand(self.version, &payload, 1)?);
                }
                None => return Ok(None),
            }
        }
    }
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn checked_len(len: u32) -> Result<usize, ProtocolError> {
    let len = len as usize;
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    Ok(len)
}

fn decode_raw(
    version: ProtocolVersion,
    src: &mut BytesMut,
    scan: &mut Option<DataScan>,
) -> Result<Option<RawFrame>, ProtocolError> {
    if src.len() < 2 {
        return Ok(None);
    }
    if src[0] != version.marker() {
        return Err(ProtocolError::VersionMismatch {
            expected: version.marker(),
            found: src[0],
        });
    }
    let kind = src[1];
    if !version.accepts(kind) {
        return Err(ProtocolError::UnknownFrame { version, kind });
    }

    match kind {
        FRAME_WINDOW => {
            let Some(count) = read_u32(src, 2) else {
                return Ok(None);
            };
            src.advance(6);
            Ok(Some(RawFrame::Frame(Frame::Window(count))))
        }
        FRAME_JSON => {
            let (Some(seq), Some(len)) = (read_u32(src, 2), read_u32(src, 6)) else {
                return Ok(None);
            };
            let len = checked_len(len)?;
            if src.len() < 10 + len {
                src.reserve(10 + len - src.len());
                return Ok(None);
            }
            src.advance(10);
            let payload = src.split_to(len).freeze();
            Ok(Some(RawFrame::Frame(Frame::Json { seq, payload })))
        }
        FRAME_DATA => decode_data(src, scan),
        FRAME_COMPRESSED => {
            let Some(len) = read_u32(src, 2) else {
                return Ok(None);
            };
            let len = checked_len(len)?;
            if src.len() < 6 + len {
                src.reserve(6 + len - src.len());
                return Ok(None);
            }
            src.advance(6);
            Ok(Some(RawFrame::Compressed(src.split_to(len).freeze())))
        }
        _ => Err(ProtocolError::UnknownFrame { version, kind }),
    }
}

/// Largest field list reserved up front; longer ones grow as they are read.
const MAX_PREALLOCATED_PAIRS: usize = 1024;

fn decode_data(src: &mut BytesMut, scan: &mut Option<DataScan>) -> Result<Option<RawFrame>, ProtocolError> {
    let (Some(seq), Some(pairs)) = (read_u32(src, 2), read_u32(src, 6)) else {
        return Ok(None);
    };
    // Each pair needs at least its two length prefixes.
    if (pairs as usize).saturating_mul(8) > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(pairs as usize * 8));
    }

    // Find the frame end before consuming anything, resuming where the
    // previous partial read stopped.
    let mut progress = scan.take().unwrap_or(DataScan { pairs: 0, end: 10 });
    while progress.pairs < pairs {
        let Some(klen) = read_u32(src, progress.end) else {
            *scan = Some(progress);
            return Ok(None);
        };
        let key_end = progress.end + 4 + checked_len(klen)?;
        let Some(vlen) = read_u32(src, key_end) else {
            *scan = Some(progress);
            return Ok(None);
        };
        let end = key_end + 4 + checked_len(vlen)?;
        if end - 10 > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(end - 10));
        }
        progress = DataScan {
            pairs: progress.pairs + 1,
            end,
        };
    }
    if src.len() < progress.end {
        src.reserve(progress.end - src.len());
        *scan = Some(progress);
        return Ok(None);
    }

    let frame = src.split_to(progress.end).freeze();
    let mut fields = Vec::with_capacity((pairs as usize).min(MAX_PREALLOCATED_PAIRS));
    let mut at = 10;
    for _ in 0..pairs {
        let (key, next) = read_field(&frame, at)?;
        let (value, next) = read_field(&frame, next)?;
        fields.push((key, value));
        at = next;
    }

    Ok(Some(RawFrame::Frame(Frame::Data { seq, fields })))
}

/// One length-prefixed UTF-8 field of a complete frame, and the offset after it.
fn read_field(frame: &[u8], at: usize) -> Result<(String, usize), ProtocolError> {
    let truncated = || ProtocolError::Io(io::ErrorKind::UnexpectedEof.into());
    let len = read_u32(frame, at).ok_or_else(truncated)? as usize;
    let bytes = frame.get(at + 4..at + 4 + len).ok_or_else(truncated)?;
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok((text.to_string(), at + 4 + len))
}

fn expand(version: ProtocolVersion, payload: &[u8], depth: usize) -> Result<Vec<Frame>, ProtocolError> {
    if depth > MAX_COMPRESSION_DEPTH {
        return Err(ProtocolError::NestingTooDeep);
    }

    let mut inflated = Vec::new();
    ZlibDecoder::new(payload)
        .take(MAX_PAYLOAD as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(|_| ProtocolError::Compressed)?;
    if inflated.len() > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(inflated.len()));
    }

    let mut buf = BytesMut::from(&inflated[..]);
    let mut frames = Vec::new();
    while !buf.is_empty() {
        match decode_raw(version, &mut buf, &mut None)? {
            Some(RawFrame::Frame(frame)) => frames.push(frame),
            Some(RawFrame::Compressed(inner)) => frames.extend(expand(version, &inner, depth + 1)?),
            None => return Err(ProtocolError::Compressed),
        }
    }
    Ok(frames)
}

/// Acknowledge everything up to `seq`. `seq = 0` is a keepalive.
pub fn encode_ack(version: ProtocolVersion, seq: u32) -> [u8; 6] {
    let s = seq.to_be_bytes();
    [version.marker(), FRAME_ACK, s[0], s[1], s[2], s[3]]
}
