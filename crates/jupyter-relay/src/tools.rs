//! Notebook tools exposed to remote callers.
//!
//! Each tool is a guarded operation: it runs under the retry budget of its
//! [`OperationKind`], obtains a live document handle first, and validates
//! cell indices against the document as it is right before acting. Writes
//! are confirmed by polling the document until the change is visible; an
//! unconfirmed write is logged, not raised, since the edit may still land.
//!
//! A connection can drop after an insert or delete was sent but before the
//! host acknowledged it. Those tools remember what they sent, and a retry
//! first checks whether the host already applied it.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{DocumentEndpoint, PollSettings, RetrySettings, RuntimeEndpoint};
use crate::document::{CellKind, DocumentConnection, DocumentHandle, DocumentStatus};
use crate::error::RelayError;
use crate::execution::ExecutionCoordinator;
use crate::guarded::{run_guarded, OperationKind};
use crate::kernel::{KernelConnection, KernelStatus};
use crate::notebook_doc::CellSnapshot;
use crate::output::{extract_outputs_with_images, ExtractedOutputs, ImageInfo};
use crate::poll::poll_until;

/// A cell as returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct CellInfo {
    pub cell_index: usize,
    pub cell_id: String,
    pub cell_type: String,
    pub content: String,
    pub output: Vec<String>,
    pub images: Vec<ImageInfo>,
}

impl CellInfo {
    fn from_snapshot(cell_index: usize, cell: CellSnapshot, full_output: bool) -> Self {
        let extracted = match (cell.cell_type.as_str(), cell.outputs.as_deref()) {
            ("code", Some(outputs)) => extract_outputs_with_images(outputs, full_output),
            _ => ExtractedOutputs::default(),
        };
        let cell_id = if cell.id.is_empty() {
            format!("cell-{}", cell_index)
        } else {
            cell.id
        };
        Self {
            cell_index,
            cell_id,
            cell_type: cell.cell_type,
            content: cell.source,
            output: extracted.text_outputs,
            images: extracted.images,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotebookInfo {
    pub room_id: String,
    pub total_cells: usize,
    pub cell_types: BTreeMap<String, usize>,
}

/// Diagnostic view of both connections.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub kernel_status: KernelStatus,
    pub document_status: DocumentStatus,
    pub runtime: RuntimeEndpoint,
    pub document: DocumentEndpoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_error: Option<String>,
}

/// A tool invocation, as received over the admin API.
///
/// The tool name travels in the `tool` field next to its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    AppendMarkdownCell {
        cell_source: String,
    },
    InsertMarkdownCell {
        cell_index: usize,
        cell_source: String,
    },
    OverwriteCellSource {
        cell_index: usize,
        cell_source: String,
    },
    DeleteCell {
        cell_index: usize,
    },
    AppendExecuteCodeCell {
        cell_source: String,
        #[serde(default)]
        timeout_seconds: Option<u64>,
        #[serde(default)]
        full_output: bool,
    },
    InsertExecuteCodeCell {
        cell_index: usize,
        cell_source: String,
        #[serde(default)]
        timeout_seconds: Option<u64>,
        #[serde(default)]
        full_output: bool,
    },
    ExecuteCell {
        cell_index: usize,
        #[serde(default)]
        timeout_seconds: Option<u64>,
        #[serde(default)]
        full_output: bool,
    },
    ReadAllCells {
        #[serde(default)]
        full_output: bool,
    },
    ReadCell {
        cell_index: usize,
        #[serde(default)]
        full_output: bool,
    },
    GetNotebookInfo {},
    ConnectionStatus {},
    SwitchNotebook {
        notebook_path: String,
    },
}

impl ToolCall {
    /// Build a call from a tool name and its JSON argument object.
    pub fn parse(name: &str, args: Value) -> Result<Self, RelayError> {
        let mut args = match args {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            _ => {
                return Err(RelayError::InvalidArgument(
                    "tool arguments must be a JSON object".to_string(),
                ))
            }
        };
        args.insert("tool".to_string(), Value::String(name.to_string()));
        serde_json::from_value(Value::Object(args))
            .map_err(|e| RelayError::InvalidArgument(format!("{}: {}", name, e)))
    }
}

fn to_json<T: Serialize>(value: T) -> Result<Value, RelayError> {
    serde_json::to_value(value)
        .map_err(|e| RelayError::InvalidArgument(format!("unserializable tool result: {}", e)))
}

fn document_err(err: anyhow::Error) -> RelayError {
    RelayError::document(err)
}

async fn cell_count(doc: &dyn DocumentHandle) -> Result<usize, RelayError> {
    doc.cell_count().await.map_err(document_err)
}

/// Read the cell at `index`, failing with a domain error when it is gone.
/// Fetch the cell at `index` along with the cell count it was checked against.
async fn existing_cell(
    doc: &dyn DocumentHandle,
    index: usize,
) -> Result<(CellSnapshot, usize), RelayError> {
    let len = cell_count(doc).await?;
    if index >= len {
        return Err(RelayError::CellIndexOutOfRange { index, len });
    }
    let cell = doc
        .cell(index)
        .await
        .map_err(document_err)?
        .ok_or(RelayError::CellIndexOutOfRange { index, len })?;
    Ok((cell, len))
}

pub struct NotebookTools {
    kernel: Arc<KernelConnection>,
    document: Arc<DocumentConnection>,
    coordinator: Arc<ExecutionCoordinator>,
    retry: RetrySettings,
    poll: PollSettings,
}

impl NotebookTools {
    pub fn new(
        kernel: Arc<KernelConnection>,
        document: Arc<DocumentConnection>,
        coordinator: Arc<ExecutionCoordinator>,
        retry: RetrySettings,
        poll: PollSettings,
    ) -> Self {
        Self {
            kernel,
            document,
            coordinator,
            retry,
            poll,
        }
    }

    /// Dispatch a parsed call and serialize its result.
    pub async fn call(&self, call: ToolCall) -> Result<Value, RelayError> {
        match call {
            ToolCall::AppendMarkdownCell { cell_source } => {
                to_json(self.append_markdown_cell(&cell_source).await?)
            }
            ToolCall::InsertMarkdownCell {
                cell_index,
                cell_source,
            } => to_json(self.insert_markdown_cell(cell_index, &cell_source).await?),
            ToolCall::OverwriteCellSource {
                cell_index,
                cell_source,
            } => to_json(self.overwrite_cell_source(cell_index, &cell_source).await?),
            ToolCall::DeleteCell { cell_index } => to_json(self.delete_cell(cell_index).await?),
            ToolCall::AppendExecuteCodeCell {
                cell_source,
                timeout_seconds,
                full_output,
            } => to_json(
                self.append_execute_code_cell(
                    &cell_source,
                    self.timeout(timeout_seconds),
                    full_output,
                )
                .await?,
            ),
            ToolCall::InsertExecuteCodeCell {
                cell_index,
                cell_source,
                timeout_seconds,
                full_output,
            } => to_json(
                self.insert_execute_code_cell(
                    cell_index,
                    &cell_source,
                    self.timeout(timeout_seconds),
                    full_output,
                )
                .await?,
            ),
            ToolCall::ExecuteCell {
                cell_index,
                timeout_seconds,
                full_output,
            } => to_json(
                self.execute_cell(cell_index, self.timeout(timeout_seconds), full_output)
                    .await?,
            ),
            ToolCall::ReadAllCells { full_output } => {
                to_json(self.read_all_cells(full_output).await?)
            }
            ToolCall::ReadCell {
                cell_index,
                full_output,
            } => to_json(self.read_cell(cell_index, full_output).await?),
            ToolCall::GetNotebookInfo {} => to_json(self.get_notebook_info().await?),
            ToolCall::ConnectionStatus {} => to_json(self.connection_status().await),
            ToolCall::SwitchNotebook { notebook_path } => {
                to_json(self.switch_notebook(&notebook_path).await?)
            }
        }
    }

    fn timeout(&self, seconds: Option<u64>) -> Duration {
        seconds.map_or(self.coordinator.settings().default_timeout, Duration::from_secs)
    }

    /// Poll the document until `check` holds, warning when it never does.
    async fn confirm<F, Fut>(&self, what: &str, check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        let confirmed = poll_until(check, self.poll.interval, self.poll.timeout).await;
        if !confirmed {
            warn!(
                "[tools] {} not visible in the document after {:?}",
                what, self.poll.timeout
            );
        }
        confirmed
    }

    /// Wait for the cell at `index` to exist with exactly `source`.
    async fn confirm_source(
        &self,
        what: &str,
        doc: &Arc<dyn DocumentHandle>,
        index: usize,
        source: &str,
    ) -> bool {
        self.confirm(what, || {
            let doc = doc.clone();
            async move {
                let cell = doc.cell(index).await?;
                Ok(cell.is_some_and(|cell| cell.source == source))
            }
        })
        .await
    }

    /// Wait for the document to hold exactly `expected` cells.
    async fn confirm_count(&self, what: &str, doc: &Arc<dyn DocumentHandle>, expected: usize) -> bool {
        self.confirm(what, || {
            let doc = doc.clone();
            async move { Ok(doc.cell_count().await? == expected) }
        })
        .await
    }

    /// Insert a cell at `index` (`None` appends) and wait until it is visible.
    ///
    /// `sent` holds the cell count seen before the first insert was sent and
    /// is shared by every attempt of one tool call.
    async fn insert_confirmed(
        &self,
        doc: &Arc<dyn DocumentHandle>,
        index: Option<usize>,
        kind: CellKind,
        source: &str,
        sent: &OnceLock<usize>,
    ) -> Result<usize, RelayError> {
        let len = cell_count(doc.as_ref()).await?;
        if let Some(&before) = sent.get() {
            let at = index.unwrap_or(before);
            let landed = len == before + 1
                && matches!(doc.cell(at).await, Ok(Some(cell)) if cell.source == source);
            if landed {
                info!("[tools] {} cell {} was applied by an earlier attempt", kind, at);
                return Ok(at);
            }
        }

        let index = match index {
            Some(index) if index > len => {
                return Err(RelayError::CellIndexOutOfRange { index, len });
            }
            Some(index) => index,
            None => len,
        };

        let _ = sent.set(len);
        doc.insert_cell(index, kind, source)
            .await
            .map_err(document_err)?;

        let what = format!("{} cell {}", kind, index);
        if self.confirm_count(&what, doc, len + 1).await {
            self.confirm_source(&what, doc, index, source).await;
        }
        Ok(index)
    }

    pub async fn append_markdown_cell(&self, source: &str) -> Result<String, RelayError> {
        let policy = self.retry.policy(OperationKind::Write);
        let sent = &OnceLock::new();
        run_guarded(&policy, "append_markdown_cell", || async move {
            let doc = self.document.ensure_connected().await?;
            self.insert_confirmed(&doc, None, CellKind::Markdown, source, sent)
                .await?;
            Ok("Jupyter Markdown cell added.".to_string())
        })
        .await
    }

    pub async fn insert_markdown_cell(&self, index: usize, source: &str) -> Result<String, RelayError> {
        let policy = self.retry.policy(OperationKind::Write);
        let sent = &OnceLock::new();
        run_guarded(&policy, "insert_markdown_cell", || async move {
            let doc = self.document.ensure_connected().await?;
            self.insert_confirmed(&doc, Some(index), CellKind::Markdown, source, sent)
                .await?;
            Ok(format!("Jupyter Markdown cell {} inserted.", index))
        })
        .await
    }

    pub async fn overwrite_cell_source(&self, index: usize, source: &str) -> Result<String, RelayError> {
        let policy = self.retry.policy(OperationKind::Write);
        run_guarded(&policy, "overwrite_cell_source", || async move {
            let doc = self.document.ensure_connected().await?;
            existing_cell(doc.as_ref(), index).await?;

            doc.set_source(index, source).await.map_err(document_err)?;
            self.confirm_source(&format!("new source of cell {}", index), &doc, index, source)
                .await;
            Ok(format!(
                "Cell {} overwritten successfully - use execute_cell to execute it if code",
                index
            ))
        })
        .await
    }

    pub async fn delete_cell(&self, index: usize) -> Result<String, RelayError> {
        let policy = self.retry.policy(OperationKind::Write);
        // Id and type of the cell an earlier attempt asked to delete
        let sent: &OnceLock<(String, String)> = &OnceLock::new();
        run_guarded(&policy, "delete_cell", || async move {
            let doc = self.document.ensure_connected().await?;
            if let Some((id, cell_type)) = sent.get() {
                let cells = doc.cells().await.map_err(document_err)?;
                if !cells.iter().any(|cell| &cell.id == id) {
                    info!("[tools] Cell {} was deleted by an earlier attempt", index);
                    return Ok(format!(
                        "Cell {} ({}) deleted successfully.",
                        index, cell_type
                    ));
                }
            }

            let (cell, len) = existing_cell(doc.as_ref(), index).await?;
            let _ = sent.set((cell.id.clone(), cell.cell_type.clone()));
            doc.delete_cell(index).await.map_err(document_err)?;
            self.confirm_count(&format!("deletion of cell {}", index), &doc, len - 1)
                .await;
            Ok(format!(
                "Cell {} ({}) deleted successfully.",
                index, cell.cell_type
            ))
        })
        .await
    }

    pub async fn append_execute_code_cell(
        &self,
        source: &str,
        timeout: Duration,
        full_output: bool,
    ) -> Result<CellInfo, RelayError> {
        let policy = self.retry.policy(OperationKind::Execute);
        let sent = &OnceLock::new();
        run_guarded(&policy, "append_execute_code_cell", || async move {
            let doc = self.document.ensure_connected().await?;
            let index = self
                .insert_confirmed(&doc, None, CellKind::Code, source, sent)
                .await?;
            self.execute_inserted(&doc, index, timeout, full_output).await
        })
        .await
    }

    pub async fn insert_execute_code_cell(
        &self,
        index: usize,
        source: &str,
        timeout: Duration,
        full_output: bool,
    ) -> Result<CellInfo, RelayError> {
        let policy = self.retry.policy(OperationKind::Execute);
        let sent = &OnceLock::new();
        run_guarded(&policy, "insert_execute_code_cell", || async move {
            let doc = self.document.ensure_connected().await?;
            let index = self
                .insert_confirmed(&doc, Some(index), CellKind::Code, source, sent)
                .await?;
            self.execute_inserted(&doc, index, timeout, full_output).await
        })
        .await
    }

    async fn execute_inserted(
        &self,
        doc: &Arc<dyn DocumentHandle>,
        index: usize,
        timeout: Duration,
        full_output: bool,
    ) -> Result<CellInfo, RelayError> {
        let extracted = self.run_cell(doc, index, timeout, full_output).await?;
        let (cell, _) = existing_cell(doc.as_ref(), index).await?;
        Ok(CellInfo {
            output: extracted.text_outputs,
            images: extracted.images,
            ..CellInfo::from_snapshot(index, cell, false)
        })
    }

    /// Execute the cell at `index` and collect its outputs. A timeout is
    /// reported inside the outputs along with whatever the cell produced.
    async fn run_cell(
        &self,
        doc: &Arc<dyn DocumentHandle>,
        index: usize,
        timeout: Duration,
        full_output: bool,
    ) -> Result<ExtractedOutputs, RelayError> {
        let timed_out = match self.coordinator.execute(doc.clone(), index, timeout).await {
            Ok(_) => None,
            Err(e) if e.is_timeout() => Some(e),
            Err(e) => return Err(e),
        };

        let outputs = match doc.outputs(index).await {
            Ok(outputs) => outputs.unwrap_or_default(),
            Err(e) if timed_out.is_some() => {
                warn!(
                    "[tools] Could not read partial outputs of cell {}: {:#}",
                    index, e
                );
                Vec::new()
            }
            Err(e) => return Err(document_err(e)),
        };
        let mut extracted = extract_outputs_with_images(&outputs, full_output);
        if let Some(timeout_err) = timed_out {
            extracted.text_outputs.push(timeout_err.to_string());
        }
        info!(
            "[tools] Cell {} produced {} text outputs and {} images",
            index,
            extracted.text_outputs.len(),
            extracted.images.len()
        );
        Ok(extracted)
    }

    pub async fn execute_cell(
        &self,
        index: usize,
        timeout: Duration,
        full_output: bool,
    ) -> Result<ExtractedOutputs, RelayError> {
        let policy = self.retry.policy(OperationKind::Execute);
        run_guarded(&policy, "execute_cell", || async move {
            let doc = self.document.ensure_connected().await?;
            let (cell, _) = existing_cell(doc.as_ref(), index).await?;
            if cell.cell_type != CellKind::Code.as_str() {
                return Err(RelayError::InvalidArgument(format!(
                    "Cell {} is a {} cell; only code cells can be executed.",
                    index, cell.cell_type
                )));
            }
            self.run_cell(&doc, index, timeout, full_output).await
        })
        .await
    }

    pub async fn read_all_cells(&self, full_output: bool) -> Result<Vec<CellInfo>, RelayError> {
        let policy = self.retry.policy(OperationKind::Read);
        run_guarded(&policy, "read_all_cells", || async move {
            let doc = self.document.ensure_connected().await?;
            let cells = doc.cells().await.map_err(document_err)?;
            Ok(cells
                .into_iter()
                .enumerate()
                .map(|(index, cell)| CellInfo::from_snapshot(index, cell, full_output))
                .collect())
        })
        .await
    }

    pub async fn read_cell(&self, index: usize, full_output: bool) -> Result<CellInfo, RelayError> {
        let policy = self.retry.policy(OperationKind::Read);
        run_guarded(&policy, "read_cell", || async move {
            let doc = self.document.ensure_connected().await?;
            let (cell, _) = existing_cell(doc.as_ref(), index).await?;
            Ok(CellInfo::from_snapshot(index, cell, full_output))
        })
        .await
    }

    pub async fn get_notebook_info(&self) -> Result<NotebookInfo, RelayError> {
        let policy = self.retry.policy(OperationKind::Read);
        run_guarded(&policy, "get_notebook_info", || async move {
            let doc = self.document.ensure_connected().await?;
            let cells = doc.cells().await.map_err(document_err)?;
            let mut cell_types = BTreeMap::new();
            for cell in &cells {
                *cell_types.entry(cell.cell_type.clone()).or_insert(0) += 1;
            }
            Ok(NotebookInfo {
                room_id: self.document.endpoint().await.path,
                total_cells: cells.len(),
                cell_types,
            })
        })
        .await
    }

    /// Report both connections without repairing either.
    pub async fn connection_status(&self) -> ConnectionReport {
        let (cell_count, document_error) = match self.document.current().await {
            Some(doc) => match doc.cell_count().await {
                Ok(count) => (Some(count), None),
                Err(e) => (None, Some(format!("{:#}", e))),
            },
            None => (None, None),
        };
        ConnectionReport {
            kernel_status: self.kernel.status().await,
            document_status: self.document.status().await,
            runtime: self.kernel.endpoint().await,
            document: self.document.endpoint().await,
            cell_count,
            document_error,
        }
    }

    /// Point the document connection at another notebook on the same server.
    pub async fn switch_notebook(&self, path: &str) -> Result<String, RelayError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(RelayError::InvalidArgument(
                "Notebook path must not be empty".to_string(),
            ));
        }
        if !path.ends_with(".ipynb") {
            return Err(RelayError::InvalidArgument(
                "Notebook path must end with '.ipynb'".to_string(),
            ));
        }

        let policy = self.retry.policy(OperationKind::Read);
        let cells = run_guarded(&policy, "switch_notebook", || async move {
            let doc = self.document.switch_path(path).await?;
            cell_count(doc.as_ref()).await
        })
        .await?;
        Ok(format!(
            "Switched to notebook {} ({} cells).",
            path, cells
        ))
    }
}
