//! Error taxonomy shared by the connection managers and notebook tools.

use std::time::Duration;

use crate::backoff;

/// Error type for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Cell index {index} is out of range. Notebook has {len} cells.")]
    CellIndexOutOfRange { index: usize, len: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Kernel error: {0}")]
    Kernel(String),

    #[error("Document error: {0}")]
    Document(String),

    #[error("[TIMEOUT ERROR: Execution exceeded {} seconds]", .timeout.as_secs())]
    ExecutionTimeout { timeout: Duration },

    #[error("Connection failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<RelayError>,
    },
}

impl RelayError {
    /// Wrap a runtime backend failure.
    pub fn kernel(err: anyhow::Error) -> Self {
        Self::Kernel(format!("{:#}", err))
    }

    /// Wrap a document backend failure.
    pub fn document(err: anyhow::Error) -> Self {
        Self::Document(format!("{:#}", err))
    }

    /// Whether the error looks like a dropped connection worth retrying.
    ///
    /// Domain errors, timeouts, and already-exhausted retries never qualify,
    /// whatever their message says.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::CellIndexOutOfRange { .. }
            | Self::InvalidArgument(_)
            | Self::ExecutionTimeout { .. }
            | Self::RetriesExhausted { .. } => false,
            Self::Kernel(message) | Self::Document(message) => {
                backoff::is_transient_message(message)
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ExecutionTimeout { .. })
    }

    /// Validation failures caused by the caller's arguments.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Self::CellIndexOutOfRange { .. } | Self::InvalidArgument(_)
        )
    }
}
