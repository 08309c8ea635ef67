use serde::Serialize;

use crate::types::{AqlError, Result};

/// One write that failed under `ignore_errors`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WriteError {
    /// Numeric error code.
    pub code: u32,
    /// Error message.
    pub message: String,
}

/// Outcome of the Modify blocks of a query.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    /// Rows written.
    pub written: u64,
    /// Rows whose write failed and was skipped.
    pub ignored: u64,
    /// One entry per ignored row, in the order the failures happened.
    pub errors: Vec<WriteError>,
}

impl WriteSummary {
    pub(crate) fn record_written(&mut self) {
        self.written += 1;
    }

    pub(crate) fn record_ignored(&mut self, err: &AqlError) {
        self.ignored += 1;
        self.errors.push(WriteError {
            code: err.code(),
            message: err.to_string(),
        });
    }

    /// Fails with [`AqlError::PartialWrite`] if any write was ignored.
    pub fn check(&self) -> Result<()> {
        let Some(first) = self.errors.first() else {
            return Ok(());
        };
        Err(AqlError::PartialWrite {
            ignored: self.ignored,
            total: self.written + self.ignored,
            first_code: first.code,
            first_message: first.message.clone(),
        })
    }
}
