//! Core types, errors, and configuration shared by the artesync crates.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;
pub mod result;

pub use config::{SyncConfig, SynchronizerEntry};
pub use error::Error;
pub use result::{Result, ResultExt};
