//! Bounded execution of a single cell.
//!
//! Per execution: `Idle → Dispatched → Completed | TimedOut | Failed`.
//!
//! The kernel's execute call runs as its own task so the timeout keeps
//! ticking regardless of what the call does. On timeout the task is aborted
//! and the kernel gets exactly one interrupt; aborting the task alone does
//! not stop code already running in the kernel.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ExecutionSettings;
use crate::document::DocumentHandle;
use crate::error::RelayError;
use crate::kernel::KernelConnection;
use crate::poll::poll_until;

/// Result of an execution that finished within its timeout.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub cell_index: usize,
    pub elapsed: Duration,
    /// Whether the cell's output list was visible when we stopped waiting.
    pub outputs_ready: bool,
    /// Progress lines logged while the cell ran.
    pub progress_reports: usize,
}

pub struct ExecutionCoordinator {
    kernel: Arc<KernelConnection>,
    settings: ExecutionSettings,
}

impl ExecutionCoordinator {
    pub fn new(kernel: Arc<KernelConnection>, settings: ExecutionSettings) -> Self {
        Self { kernel, settings }
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Execute the cell at `cell_index`, bounded by `timeout`.
    ///
    /// Returns [`RelayError::ExecutionTimeout`] when the bound is hit; the
    /// cell may still hold partial outputs that callers should read.
    pub async fn execute(
        &self,
        document: Arc<dyn DocumentHandle>,
        cell_index: usize,
        timeout: Duration,
    ) -> Result<ExecutionReport, RelayError> {
        let runtime = self.kernel.ensure_alive().await?;

        if !self
            .kernel
            .wait_for_idle(self.settings.idle_interval, self.settings.idle_timeout)
            .await
        {
            warn!(
                "[execution] Kernel not idle after {:?}, dispatching cell {} anyway",
                self.settings.idle_timeout, cell_index
            );
        }

        let started = Instant::now();
        info!(
            "[execution] Dispatching cell {} (timeout {:?})",
            cell_index, timeout
        );
        let mut task = tokio::spawn({
            let document = document.clone();
            async move { runtime.execute(cell_index, document).await }
        });

        let deadline = started + timeout;
        let period = self.settings.progress_interval.max(Duration::from_millis(100));
        let mut progress = tokio::time::interval_at(started + period, period);
        let mut progress_reports = 0;
        let finished = loop {
            tokio::select! {
                joined = &mut task => break Ok(joined),
                _ = tokio::time::sleep_until(deadline) => break Err(()),
                _ = progress.tick() => {
                    if log_progress(document.as_ref(), cell_index, started.elapsed()).await {
                        progress_reports += 1;
                    }
                }
            }
        };

        match finished {
            Err(()) => {
                task.abort();
                warn!(
                    "[execution] Cell {} timed out after {:?}, interrupting kernel",
                    cell_index, timeout
                );
                self.kernel.interrupt().await;
                Err(RelayError::ExecutionTimeout { timeout })
            }
            Ok(Err(join_err)) => Err(RelayError::Kernel(format!(
                "execution task for cell {} failed: {}",
                cell_index, join_err
            ))),
            Ok(Ok(Err(e))) => {
                warn!("[execution] Cell {} failed: {:#}", cell_index, e);
                Err(RelayError::kernel(e))
            }
            Ok(Ok(Ok(()))) => {
                let outputs_ready = poll_until(
                    || {
                        let document = document.clone();
                        async move { document.outputs(cell_index).await.map(|o| o.is_some()) }
                    },
                    self.settings.output_interval,
                    self.settings.output_timeout,
                )
                .await;
                if !outputs_ready {
                    warn!(
                        "[execution] Outputs for cell {} not visible after {:?}",
                        cell_index, self.settings.output_timeout
                    );
                }

                let elapsed = started.elapsed();
                info!("[execution] Cell {} completed in {:?}", cell_index, elapsed);
                Ok(ExecutionReport {
                    cell_index,
                    elapsed,
                    outputs_ready,
                    progress_reports,
                })
            }
        }
    }
}

/// Log how many outputs a running cell has produced. Returns whether a
/// line was logged; nothing is logged until the first output appears.
async fn log_progress(document: &dyn DocumentHandle, cell_index: usize, elapsed: Duration) -> bool {
    match document.outputs(cell_index).await {
        Ok(Some(outputs)) if !outputs.is_empty() => {
            info!(
                "[execution] Cell {} executing... ({:.1}s) - {} outputs so far",
                cell_index,
                elapsed.as_secs_f64(),
                outputs.len()
            );
            true
        }
        Ok(_) => false,
        Err(e) => {
            debug!("[execution] Progress read for cell {} failed: {:#}", cell_index, e);
            false
        }
    }
}
