//! udup core types
//!
//! Pure types shared by every udup crate, with no I/O: the job wire model,
//! Lamport clocks used to order cluster queries, protocol versions and the
//! core error type.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod job;
pub mod time;
pub mod version;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use job::{Job, RunQueryParam};
pub use time::{LamportClock, LogicalTime};
pub use version::{Version, VersionError};
