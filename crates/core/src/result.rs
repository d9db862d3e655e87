//! Result type definition and extension traits for Railway-Oriented Programming.
//!
//! Provides logging combinators so best-effort paths can drop an error
//! without unwrap/expect/panic and without losing it from the logs.

use std::fmt::Display;

use crate::error::Error;

/// The standard Result type for artesync core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for best-effort handling of any `Result` whose error
/// can be displayed.
pub trait ResultExt<T, E> {
    /// Convert a Result to an Option, logging the error if present.
    fn into_option_logged(self, context: &str) -> Option<T>;

    /// Get the value or a default, logging the error if present.
    fn or_default_logged(self, default: T, context: &str) -> T;

    /// Inspect the error without consuming the Result.
    fn inspect_error<F: FnOnce(&E)>(self, f: F) -> Self;
}

impl<T, E: Display> ResultExt<T, E> for std::result::Result<T, E> {
    fn into_option_logged(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(context, error = %e, "Operation failed");
                None
            }
        }
    }

    fn or_default_logged(self, default: T, context: &str) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(context, error = %e, "Operation failed, using default");
                default
            }
        }
    }

    fn inspect_error<F: FnOnce(&E)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}
