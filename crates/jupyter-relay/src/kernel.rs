//! Kernel connection management.
//!
//! `KernelConnection` owns at most one [`RuntimeHandle`]. Liveness is always
//! queried from the handle, never cached. A dead or missing kernel is
//! replaced on demand, and a failed start leaves the slot empty so the next
//! attempt starts from scratch.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::config::RuntimeEndpoint;
use crate::document::DocumentHandle;
use crate::error::RelayError;
use crate::poll::poll_until;

/// Control surface of a running kernel.
#[async_trait]
pub trait RuntimeHandle: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    async fn is_alive(&self) -> anyhow::Result<bool>;

    /// Whether the kernel reports no execution in progress.
    async fn is_idle(&self) -> anyhow::Result<bool>;

    async fn interrupt(&self) -> anyhow::Result<()>;

    /// Run the cell at `cell_index`, writing its outputs into `document`.
    ///
    /// Implementations that block must move the blocking part onto
    /// `tokio::task::spawn_blocking`.
    async fn execute(&self, cell_index: usize, document: Arc<dyn DocumentHandle>) -> anyhow::Result<()>;
}

/// Builds unstarted runtime handles from configuration.
pub trait RuntimeFactory: Send + Sync {
    fn create(&self, endpoint: &RuntimeEndpoint) -> Arc<dyn RuntimeHandle>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    NotInitialized,
    Alive,
    Dead,
    Error,
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelStatus::NotInitialized => write!(f, "not_initialized"),
            KernelStatus::Alive => write!(f, "alive"),
            KernelStatus::Dead => write!(f, "dead"),
            KernelStatus::Error => write!(f, "error"),
        }
    }
}

/// Owner of the single kernel handle.
pub struct KernelConnection {
    factory: Arc<dyn RuntimeFactory>,
    endpoint: RwLock<RuntimeEndpoint>,
    handle: Mutex<Option<Arc<dyn RuntimeHandle>>>,
}

impl KernelConnection {
    pub fn new(factory: Arc<dyn RuntimeFactory>, endpoint: RuntimeEndpoint) -> Self {
        Self {
            factory,
            endpoint: RwLock::new(endpoint),
            handle: Mutex::new(None),
        }
    }

    pub async fn endpoint(&self) -> RuntimeEndpoint {
        self.endpoint.read().await.clone()
    }

    /// The current handle, without checking it.
    pub async fn current(&self) -> Option<Arc<dyn RuntimeHandle>> {
        self.handle.lock().await.clone()
    }

    /// Return a live kernel, replacing a dead or missing one.
    pub async fn ensure_alive(&self) -> Result<Arc<dyn RuntimeHandle>, RelayError> {
        let mut slot = self.handle.lock().await;

        if let Some(handle) = slot.as_ref() {
            match handle.is_alive().await {
                Ok(true) => return Ok(handle.clone()),
                Ok(false) => warn!("[kernel-connection] Kernel is not alive, restarting"),
                Err(e) => warn!(
                    "[kernel-connection] Liveness check failed, restarting: {:#}",
                    e
                ),
            }
        }
        if let Some(old) = slot.take() {
            stop_quietly(old.as_ref()).await;
        }

        let endpoint = self.endpoint().await;
        info!("[kernel-connection] Starting kernel at {}", endpoint.base_url);
        let handle = self.factory.create(&endpoint);
        match handle.start().await {
            Ok(()) => {
                info!("[kernel-connection] Kernel started");
                *slot = Some(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                error!("[kernel-connection] Failed to start kernel: {:#}", e);
                Err(RelayError::kernel(e))
            }
        }
    }

    /// Best-effort interrupt of the current kernel. Never fails.
    pub async fn interrupt(&self) {
        let Some(handle) = self.current().await else {
            warn!("[kernel-connection] No kernel to interrupt");
            return;
        };
        match handle.interrupt().await {
            Ok(()) => info!("[kernel-connection] Sent interrupt"),
            Err(e) => warn!("[kernel-connection] Failed to interrupt kernel: {:#}", e),
        }
    }

    /// Wait until the kernel reports idle. Returns `false` on timeout or
    /// when there is no kernel; callers proceed either way.
    pub async fn wait_for_idle(&self, interval: Duration, timeout: Duration) -> bool {
        let Some(handle) = self.current().await else {
            return false;
        };
        poll_until(
            || {
                let handle = handle.clone();
                async move { handle.is_idle().await }
            },
            interval,
            timeout,
        )
        .await
    }

    /// Tear down the current kernel. Tolerates having none.
    pub async fn stop(&self) {
        let old = self.handle.lock().await.take();
        if let Some(old) = old {
            stop_quietly(old.as_ref()).await;
            info!("[kernel-connection] Kernel stopped");
        }
    }

    /// Stop the current kernel, then install new configuration.
    pub async fn reconfigure(&self, endpoint: RuntimeEndpoint) {
        self.stop().await;
        *self.endpoint.write().await = endpoint;
    }

    pub async fn status(&self) -> KernelStatus {
        let Some(handle) = self.current().await else {
            return KernelStatus::NotInitialized;
        };
        match handle.is_alive().await {
            Ok(true) => KernelStatus::Alive,
            Ok(false) => KernelStatus::Dead,
            Err(_) => KernelStatus::Error,
        }
    }
}

async fn stop_quietly(handle: &dyn RuntimeHandle) {
    if let Err(e) = handle.stop().await {
        warn!("[kernel-connection] Failed to stop kernel: {:#}", e);
    }
}
