//! The relay: both connection managers, the execution coordinator, and the
//! notebook tools, wired together behind the admin surface.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

use crate::config::{DocumentEndpoint, RelayConfig, RoomRuntime};
use crate::document::{DocumentConnection, DocumentConnector, DocumentStatus};
use crate::error::RelayError;
use crate::execution::ExecutionCoordinator;
use crate::jupyter_kernel::JupyterServerFactory;
use crate::kernel::{KernelConnection, KernelStatus, RuntimeFactory};
use crate::room_client::RoomConnector;
use crate::tools::NotebookTools;

/// Body of `GET /api/healthz`.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub kernel_status: KernelStatus,
    pub document_status: DocumentStatus,
    pub document: DocumentEndpoint,
}

pub struct Relay {
    kernel: Arc<KernelConnection>,
    document: Arc<DocumentConnection>,
    tools: NotebookTools,
    started_at: DateTime<Utc>,
}

impl Relay {
    pub fn new(
        config: &RelayConfig,
        factory: Arc<dyn RuntimeFactory>,
        connector: Arc<dyn DocumentConnector>,
    ) -> Self {
        let kernel = Arc::new(KernelConnection::new(factory, config.runtime.clone()));
        let document = Arc::new(DocumentConnection::new(
            connector,
            config.document.clone(),
        ));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            kernel.clone(),
            config.execution,
        ));
        let tools = NotebookTools::new(
            kernel.clone(),
            document.clone(),
            coordinator,
            config.retry,
            config.poll,
        );
        Self {
            kernel,
            document,
            tools,
            started_at: Utc::now(),
        }
    }

    /// A relay backed by a Jupyter Server kernel and a room document.
    pub fn from_config(config: &RelayConfig) -> anyhow::Result<Self> {
        let factory = Arc::new(JupyterServerFactory::new()?);
        let connector = Arc::new(RoomConnector::new(Some(config.docs_dir.clone())));
        Ok(Self::new(config, factory, connector))
    }

    pub fn tools(&self) -> &NotebookTools {
        &self.tools
    }

    /// Start both connections eagerly so the first tool call is fast.
    pub async fn start(&self) -> Result<(), RelayError> {
        self.kernel.ensure_alive().await?;
        self.document.ensure_connected().await?;
        Ok(())
    }

    /// Point the relay at a new runtime and notebook.
    ///
    /// The old kernel is stopped before the configuration changes.
    pub async fn connect(&self, target: RoomRuntime) -> Result<(), RelayError> {
        let runtime = target.runtime_endpoint();
        let document = target.document_endpoint();
        info!(
            "[relay] Connecting to runtime {} and notebook {} at {}",
            runtime.base_url, document.path, document.base_url
        );

        self.kernel.reconfigure(runtime).await;
        self.document.reconfigure(document).await;
        self.kernel.ensure_alive().await?;
        self.document.reconnect().await?;
        Ok(())
    }

    /// Stop the kernel and leave the notebook.
    pub async fn stop(&self) {
        self.kernel.stop().await;
        self.document.stop().await;
    }

    pub async fn health(&self) -> Health {
        Health {
            status: "healthy",
            service: "jupyter-relay",
            version: env!("CARGO_PKG_VERSION"),
            started_at: self.started_at,
            kernel_status: self.kernel.status().await,
            document_status: self.document.status().await,
            document: self.document.endpoint().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeConnector, FakeRuntimeFactory};
    use std::sync::atomic::Ordering;

    fn relay() -> (Relay, Arc<FakeRuntimeFactory>, Arc<FakeConnector>) {
        let factory = FakeRuntimeFactory::new();
        let connector = FakeConnector::with_cells(1);
        let relay = Relay::new(&RelayConfig::default(), factory.clone(), connector.clone());
        (relay, factory, connector)
    }

    #[tokio::test]
    async fn test_health_before_start() {
        let (relay, _, _) = relay();
        let health = relay.health().await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.kernel_status, KernelStatus::NotInitialized);
        assert_eq!(health.document_status, DocumentStatus::Disconnected);
        assert_eq!(health.document.path, "notebook.ipynb");
    }

    #[tokio::test]
    async fn test_connect_replaces_both_endpoints() {
        let (relay, factory, connector) = relay();
        relay.start().await.unwrap();

        let target = RoomRuntime {
            runtime_url: "http://10.0.0.5:8888".into(),
            runtime_id: Some("k-1".into()),
            room_id: "other.ipynb".into(),
            ..Default::default()
        };
        relay.connect(target).await.unwrap();

        // The first kernel is stopped before the new one starts
        assert_eq!(factory.counters.stops.load(Ordering::SeqCst), 1);
        assert_eq!(factory.counters.starts.load(Ordering::SeqCst), 2);
        let endpoints = factory.endpoints.lock().unwrap().clone();
        assert_eq!(endpoints.last().unwrap().base_url, "http://10.0.0.5:8888");
        assert_eq!(endpoints.last().unwrap().runtime_id.as_deref(), Some("k-1"));
        assert_eq!(
            connector.paths.lock().unwrap().last().map(String::as_str),
            Some("other.ipynb")
        );

        let health = relay.health().await;
        assert_eq!(health.kernel_status, KernelStatus::Alive);
        assert_eq!(health.document_status, DocumentStatus::Connected);
        assert_eq!(health.document.path, "other.ipynb");
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let (relay, factory, _) = relay();
        factory.counters.fail_start.store(true, Ordering::SeqCst);

        let err = relay.connect(RoomRuntime::default()).await.unwrap_err();
        assert!(matches!(err, RelayError::Kernel(_)));
        assert_eq!(
            relay.health().await.kernel_status,
            KernelStatus::NotInitialized
        );
    }

    #[tokio::test]
    async fn test_stop_tears_down_both() {
        let (relay, factory, connector) = relay();
        relay.start().await.unwrap();

        relay.stop().await;

        let health = relay.health().await;
        assert_eq!(health.kernel_status, KernelStatus::NotInitialized);
        assert_eq!(health.document_status, DocumentStatus::Disconnected);
        assert_eq!(factory.counters.stops.load(Ordering::SeqCst), 1);
        assert!(connector
            .last_handle()
            .unwrap()
            .stopped
            .load(Ordering::SeqCst));
    }
}
