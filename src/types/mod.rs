//! Shared crate-wide types.

mod error;

pub use error::{AqlError, ErrorCategory, ErrorWithCode, Result};
