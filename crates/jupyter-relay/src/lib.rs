//! jupyter-relay - Resilient bridge between tool callers, a Jupyter kernel,
//! and a collaboratively edited notebook.
//!
//! The relay keeps two long-lived connections: one to the execution runtime
//! (a kernel behind a Jupyter Server) and one to the shared notebook document
//! (an Automerge room). Both are owned by connection managers that repair
//! them on demand. Every notebook tool runs through a guarded executor that
//! retries dropped connections with linear backoff, and mutations are
//! confirmed by polling the live document until the change is visible.

use std::path::PathBuf;

pub mod backoff;
pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod execution;
pub mod guarded;
pub mod http_server;
pub mod jupyter_kernel;
pub mod kernel;
pub mod notebook_doc;
pub mod output;
pub mod poll;
pub mod relay;
pub mod room_client;
pub mod room_server;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::RelayError;

/// Get the default cache directory for relay state.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("jupyter-relay")
}

/// Get the default directory for persisted room documents.
pub fn default_docs_dir() -> PathBuf {
    default_cache_dir().join("room-docs")
}
