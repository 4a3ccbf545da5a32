//! UDUP Server
//!
//! Pieces of the `udup` binary that are worth testing on their own: the
//! configuration file loader with its command-line overrides, and the HTTP
//! surface exposing membership and leadership.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;

pub use api::ApiServer;
pub use config::{ConfigError, Overrides, load_config};
