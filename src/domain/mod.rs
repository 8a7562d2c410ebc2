//! Domain layer for rask-shipper.
//!
//! Contains the canonical types shared across the client and listener sides:
//! - `Event`: the unit being shipped, a map of tagged `Value`s plus metadata
//! - `ShipperError`: Top-level error type

pub mod error;
pub mod event;

pub use error::ShipperError;
pub use event::{Event, FieldError, Fields, Value};
