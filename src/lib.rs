// Specific pedantic lints enforced (not blanket allow):
#![deny(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate
)]

pub mod app;
pub mod domain;
pub mod reliability;
pub mod sender;
pub mod server;

pub use app::{App, Config};
pub use domain::{Event, ShipperError};
pub use sender::Publisher;
pub use server::{Batch, Server};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
