//! Document connection management.
//!
//! `DocumentConnection` owns at most one live [`DocumentHandle`]. The handle
//! is created lazily, probed before reuse by reading the cell count (the
//! cheapest call that fails the same way a real operation would), and
//! replaced as a whole whenever the probe fails or the endpoint changes.
//! Callers never see a handle whose cell sequence cannot be read.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::config::DocumentEndpoint;
use crate::error::RelayError;
use crate::notebook_doc::CellSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Code,
    Markdown,
    Raw,
}

impl CellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellKind::Code => "code",
            CellKind::Markdown => "markdown",
            CellKind::Raw => "raw",
        }
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live, index-addressed view of a shared notebook.
///
/// Every read may reflect concurrent edits by remote peers.
#[async_trait]
pub trait DocumentHandle: Send + Sync {
    async fn cell_count(&self) -> anyhow::Result<usize>;

    async fn cells(&self) -> anyhow::Result<Vec<CellSnapshot>>;

    async fn cell(&self, index: usize) -> anyhow::Result<Option<CellSnapshot>>;

    /// Output list of the cell at `index`; `None` while it does not exist.
    async fn outputs(&self, index: usize) -> anyhow::Result<Option<Vec<String>>>;

    /// Insert a cell and return its generated ID.
    async fn insert_cell(&self, index: usize, kind: CellKind, source: &str) -> anyhow::Result<String>;

    async fn set_source(&self, index: usize, source: &str) -> anyhow::Result<()>;

    async fn delete_cell(&self, index: usize) -> anyhow::Result<()>;

    async fn clear_outputs(&self, index: usize) -> anyhow::Result<()>;

    async fn append_output(&self, index: usize, output: &str) -> anyhow::Result<()>;

    async fn set_execution_count(&self, index: usize, count: Option<i64>) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;
}

/// Opens document handles for an endpoint.
#[async_trait]
pub trait DocumentConnector: Send + Sync {
    async fn connect(&self, endpoint: &DocumentEndpoint) -> anyhow::Result<Arc<dyn DocumentHandle>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentStatus::Connected => write!(f, "connected"),
            DocumentStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Owner of the single document handle.
pub struct DocumentConnection {
    connector: Arc<dyn DocumentConnector>,
    endpoint: RwLock<DocumentEndpoint>,
    handle: Mutex<Option<Arc<dyn DocumentHandle>>>,
}

impl DocumentConnection {
    pub fn new(connector: Arc<dyn DocumentConnector>, endpoint: DocumentEndpoint) -> Self {
        Self {
            connector,
            endpoint: RwLock::new(endpoint),
            handle: Mutex::new(None),
        }
    }

    pub async fn endpoint(&self) -> DocumentEndpoint {
        self.endpoint.read().await.clone()
    }

    /// The current handle, without probing it.
    pub async fn current(&self) -> Option<Arc<dyn DocumentHandle>> {
        self.handle.lock().await.clone()
    }

    pub async fn status(&self) -> DocumentStatus {
        if self.handle.lock().await.is_some() {
            DocumentStatus::Connected
        } else {
            DocumentStatus::Disconnected
        }
    }

    /// Return a usable handle, connecting or repairing as needed.
    pub async fn ensure_connected(&self) -> Result<Arc<dyn DocumentHandle>, RelayError> {
        let mut slot = self.handle.lock().await;

        if let Some(handle) = slot.as_ref() {
            match handle.cell_count().await {
                Ok(_) => return Ok(handle.clone()),
                Err(e) => {
                    warn!(
                        "[document-connection] Liveness probe failed, reconnecting: {:#}",
                        e
                    );
                }
            }
            if let Some(stale) = slot.take() {
                stop_quietly(stale.as_ref()).await;
            }
        }

        let handle = self.open().await?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Drop the current handle (if any) and connect fresh.
    pub async fn reconnect(&self) -> Result<Arc<dyn DocumentHandle>, RelayError> {
        let mut slot = self.handle.lock().await;
        if let Some(old) = slot.take() {
            stop_quietly(old.as_ref()).await;
        }
        let handle = self.open().await?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Point at a different notebook on the same server and reconnect.
    pub async fn switch_path(&self, path: &str) -> Result<Arc<dyn DocumentHandle>, RelayError> {
        {
            let mut endpoint = self.endpoint.write().await;
            info!(
                "[document-connection] Switching notebook {} → {}",
                endpoint.path, path
            );
            *endpoint = endpoint.with_path(path);
        }
        self.reconnect().await
    }

    /// Replace the endpoint. The next `ensure_connected` uses it.
    pub async fn reconfigure(&self, endpoint: DocumentEndpoint) {
        self.stop().await;
        *self.endpoint.write().await = endpoint;
    }

    /// Tear down the current handle. Tolerates having none.
    pub async fn stop(&self) {
        let old = self.handle.lock().await.take();
        if let Some(old) = old {
            stop_quietly(old.as_ref()).await;
            info!("[document-connection] Document connection stopped");
        }
    }

    /// Connect and verify the new handle's cell sequence is readable.
    async fn open(&self) -> Result<Arc<dyn DocumentHandle>, RelayError> {
        let endpoint = self.endpoint().await;
        info!(
            "[document-connection] Connecting to {} ({}) at {}",
            endpoint.path, endpoint.provider, endpoint.base_url
        );

        let handle = self
            .connector
            .connect(&endpoint)
            .await
            .map_err(RelayError::document)?;

        match handle.cell_count().await {
            Ok(count) => {
                info!(
                    "[document-connection] Connected to {} ({} cells)",
                    endpoint.path, count
                );
                Ok(handle)
            }
            Err(e) => {
                stop_quietly(handle.as_ref()).await;
                Err(RelayError::Document(format!(
                    "connected to {} but its cells are unreadable: {:#}",
                    endpoint.path, e
                )))
            }
        }
    }
}

async fn stop_quietly(handle: &dyn DocumentHandle) {
    if let Err(e) = handle.stop().await {
        warn!("[document-connection] Failed to stop document handle: {:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeConnector;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_ensure_connected_is_idempotent() {
        let connector = FakeConnector::with_cells(3);
        let connection = DocumentConnection::new(connector.clone(), DocumentEndpoint::default());

        let first = connection.ensure_connected().await.unwrap();
        let second = connection.ensure_connected().await.unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connection.status().await, DocumentStatus::Connected);
    }

    #[tokio::test]
    async fn test_failed_probe_replaces_handle() {
        let connector = FakeConnector::with_cells(2);
        let connection = DocumentConnection::new(connector.clone(), DocumentEndpoint::default());

        connection.ensure_connected().await.unwrap();
        let broken = connector.last_handle().unwrap();
        broken.break_connection();

        let repaired = connection.ensure_connected().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert!(broken.stopped.load(Ordering::SeqCst));
        assert_eq!(repaired.cell_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_new_handle_is_not_kept() {
        let connector = FakeConnector::with_cells(1);
        connector.connect_broken.store(true, Ordering::SeqCst);
        let connection = DocumentConnection::new(connector.clone(), DocumentEndpoint::default());

        let err = connection.ensure_connected().await.err().unwrap();
        assert!(err.to_string().contains("unreadable"));
        assert_eq!(connection.status().await, DocumentStatus::Disconnected);
        assert!(connector.last_handle().unwrap().stopped.load(Ordering::SeqCst));

        connector.connect_broken.store(false, Ordering::SeqCst);
        connection.ensure_connected().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let connector = FakeConnector::with_cells(0);
        connector.refuse.store(true, Ordering::SeqCst);
        let connection = DocumentConnection::new(connector.clone(), DocumentEndpoint::default());

        let err = connection.ensure_connected().await.err().unwrap();
        assert!(matches!(err, RelayError::Document(_)));
        assert_eq!(connection.status().await, DocumentStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_switch_path_reconnects_with_new_endpoint() {
        let connector = FakeConnector::with_cells(1);
        let connection = DocumentConnection::new(connector.clone(), DocumentEndpoint::default());
        connection.ensure_connected().await.unwrap();
        let old = connector.last_handle().unwrap();

        connection.switch_path("other.ipynb").await.unwrap();

        assert!(old.stopped.load(Ordering::SeqCst));
        assert_eq!(connection.endpoint().await.path, "other.ipynb");
        assert_eq!(
            connector.paths.lock().unwrap().clone(),
            vec!["notebook.ipynb".to_string(), "other.ipynb".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stop_tolerates_absent_handle() {
        let connector = FakeConnector::with_cells(0);
        let connection = DocumentConnection::new(connector.clone(), DocumentEndpoint::default());
        connection.stop().await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }
}
