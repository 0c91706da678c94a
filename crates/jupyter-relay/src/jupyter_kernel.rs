//! Kernel runtime backed by a Jupyter Server.
//!
//! Lifecycle calls go through the REST API (`/api/kernels`). Execution opens
//! the kernel's websocket channel, sends an `execute_request`, and streams
//! the resulting iopub messages into the document as nbformat outputs until
//! the kernel reports idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use jupyter_protocol::{ExecuteRequest, ExecutionState, JupyterMessage, JupyterMessageContent};
use log::{debug, info, warn};
use reqwest::{header::AUTHORIZATION, Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::config::RuntimeEndpoint;
use crate::document::DocumentHandle;
use crate::kernel::{RuntimeFactory, RuntimeHandle};

const DEFAULT_KERNEL_NAME: &str = "python3";

/// Kernel model as returned by `/api/kernels`.
#[derive(Debug, Clone, Deserialize)]
struct KernelModel {
    id: String,
    #[serde(default)]
    execution_state: Option<String>,
}

/// Convert a JupyterMessageContent to nbformat-style JSON for storage in the document.
fn message_content_to_nbformat(content: &JupyterMessageContent) -> Option<serde_json::Value> {
    use serde_json::json;

    match content {
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout",
                jupyter_protocol::Stdio::Stderr => "stderr",
            };
            Some(json!({
                "output_type": "stream",
                "name": name,
                "text": stream.text
            }))
        }
        JupyterMessageContent::DisplayData(data) => Some(json!({
            "output_type": "display_data",
            "data": data.data,
            "metadata": data.metadata
        })),
        JupyterMessageContent::ExecuteResult(result) => Some(json!({
            "output_type": "execute_result",
            "data": result.data,
            "metadata": result.metadata,
            "execution_count": result.execution_count.0
        })),
        JupyterMessageContent::ErrorOutput(error) => Some(json!({
            "output_type": "error",
            "ename": error.ename,
            "evalue": error.evalue,
            "traceback": error.traceback
        })),
        _ => None,
    }
}

/// Parse a websocket frame, keeping only replies to `msg_id`.
fn parse_reply(text: &str, msg_id: &str) -> Result<Option<JupyterMessageContent>> {
    let raw: serde_json::Value = serde_json::from_str(text).context("decoding kernel message")?;

    let parent_id = raw
        .get("parent_header")
        .and_then(|h| h.get("msg_id"))
        .and_then(|v| v.as_str());
    if parent_id != Some(msg_id) {
        return Ok(None);
    }

    let msg_type = raw
        .pointer("/header/msg_type")
        .and_then(|v| v.as_str())
        .context("kernel message without msg_type")?;
    let content = raw
        .get("content")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    match JupyterMessageContent::from_type_and_content(msg_type, content) {
        Ok(content) => Ok(Some(content)),
        Err(e) => {
            debug!("[jupyter-kernel] Skipping {} message: {}", msg_type, e);
            Ok(None)
        }
    }
}

/// `ws(s)://…/api/kernels/{id}/channels?session_id=…[&token=…]`
fn channels_url(endpoint: &RuntimeEndpoint, kernel_id: &str, session_id: &str) -> Result<Url> {
    let mut url = Url::parse(&endpoint.base_url)
        .with_context(|| format!("invalid runtime URL {:?}", endpoint.base_url))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot derive websocket URL from {}", endpoint.base_url))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("runtime URL {} cannot be a base", endpoint.base_url))?
        .pop_if_empty()
        .extend(["api", "kernels", kernel_id, "channels"]);
    url.query_pairs_mut().append_pair("session_id", session_id);
    if let Some(token) = &endpoint.token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

/// One kernel on a Jupyter Server.
pub struct JupyterServerKernel {
    client: reqwest::Client,
    endpoint: RuntimeEndpoint,
    kernel_id: RwLock<Option<String>>,
    /// Whether we started the kernel (and so may shut it down).
    owned: AtomicBool,
    session_id: String,
}

impl JupyterServerKernel {
    pub fn new(client: reqwest::Client, endpoint: RuntimeEndpoint) -> Self {
        Self {
            client,
            endpoint,
            kernel_id: RwLock::new(None),
            owned: AtomicBool::new(false),
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub async fn kernel_id(&self) -> Option<String> {
        self.kernel_id.read().await.clone()
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.endpoint.base_url.trim_end_matches('/'), path);
        let builder = self.client.request(method, url);
        match &self.endpoint.token {
            Some(token) => builder.header(AUTHORIZATION, format!("token {}", token)),
            None => builder,
        }
    }

    /// Fetch the kernel model. `None` when the server does not know the ID.
    async fn fetch_model(&self, kernel_id: &str) -> Result<Option<KernelModel>> {
        let response = self
            .request(Method::GET, &format!("api/kernels/{}", kernel_id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn current_model(&self) -> Result<Option<KernelModel>> {
        match self.kernel_id().await {
            Some(id) => self.fetch_model(&id).await,
            None => Ok(None),
        }
    }

    async fn require_kernel_id(&self) -> Result<String> {
        self.kernel_id()
            .await
            .context("kernel has not been started")
    }
}

#[async_trait]
impl RuntimeHandle for JupyterServerKernel {
    async fn start(&self) -> Result<()> {
        let model = match &self.endpoint.runtime_id {
            Some(id) => {
                let model = self
                    .fetch_model(id)
                    .await?
                    .with_context(|| format!("kernel {} not found on {}", id, self.endpoint.base_url))?;
                info!("[jupyter-kernel] Attached to existing kernel {}", model.id);
                self.owned.store(false, Ordering::SeqCst);
                model
            }
            None => {
                let model: KernelModel = self
                    .request(Method::POST, "api/kernels")
                    .json(&serde_json::json!({ "name": DEFAULT_KERNEL_NAME }))
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                info!("[jupyter-kernel] Started kernel {}", model.id);
                self.owned.store(true, Ordering::SeqCst);
                model
            }
        };
        *self.kernel_id.write().await = Some(model.id);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(id) = self.kernel_id.write().await.take() else {
            return Ok(());
        };
        if !self.owned.load(Ordering::SeqCst) {
            info!("[jupyter-kernel] Detached from kernel {}", id);
            return Ok(());
        }
        let response = self
            .request(Method::DELETE, &format!("api/kernels/{}", id))
            .send()
            .await?;
        if response.status() != StatusCode::NOT_FOUND {
            response.error_for_status()?;
        }
        info!("[jupyter-kernel] Shut down kernel {}", id);
        Ok(())
    }

    async fn is_alive(&self) -> Result<bool> {
        Ok(self
            .current_model()
            .await?
            .is_some_and(|model| model.execution_state.as_deref() != Some("dead")))
    }

    async fn is_idle(&self) -> Result<bool> {
        Ok(self
            .current_model()
            .await?
            .is_some_and(|model| model.execution_state.as_deref() == Some("idle")))
    }

    async fn interrupt(&self) -> Result<()> {
        let id = self.require_kernel_id().await?;
        self.request(Method::POST, &format!("api/kernels/{}/interrupt", id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn execute(&self, cell_index: usize, document: Arc<dyn DocumentHandle>) -> Result<()> {
        let kernel_id = self.require_kernel_id().await?;
        let cell = document
            .cell(cell_index)
            .await?
            .with_context(|| format!("no cell at index {}", cell_index))?;
        document.clear_outputs(cell_index).await?;

        let url = channels_url(&self.endpoint, &kernel_id, &self.session_id)?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .context("opening kernel websocket")?;
        let (mut sink, mut stream) = ws_stream.split();

        let request = ExecuteRequest::new(cell.source.clone());
        let content = serde_json::to_value(&request)?;
        let message: JupyterMessage = request.into();
        let msg_id = message.header.msg_id.clone();
        let envelope = serde_json::json!({
            "header": message.header,
            "parent_header": {},
            "metadata": {},
            "content": content,
            "buffers": [],
            "channel": "shell"
        });
        sink.send(Message::Text(envelope.to_string().into())).await?;
        debug!(
            "[jupyter-kernel] Sent execute_request msg_id={} for cell {}",
            msg_id, cell_index
        );

        while let Some(frame) = stream.next().await {
            let text = match frame? {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let Some(content) = parse_reply(&text, &msg_id)? else {
                continue;
            };
            match &content {
                JupyterMessageContent::ExecuteInput(input) => {
                    document
                        .set_execution_count(cell_index, Some(input.execution_count.0 as i64))
                        .await?;
                }
                JupyterMessageContent::ClearOutput(_) => {
                    document.clear_outputs(cell_index).await?;
                }
                JupyterMessageContent::Status(status)
                    if status.execution_state == ExecutionState::Idle =>
                {
                    if let Err(e) = sink.close().await {
                        debug!("[jupyter-kernel] Websocket close failed: {}", e);
                    }
                    return Ok(());
                }
                other => {
                    if let Some(output) = message_content_to_nbformat(other) {
                        document.append_output(cell_index, &output.to_string()).await?;
                    }
                }
            }
        }

        warn!(
            "[jupyter-kernel] Websocket for kernel {} ended mid-execution",
            kernel_id
        );
        bail!("Kernel websocket closed before execution finished")
    }
}

/// Builds [`JupyterServerKernel`]s sharing one HTTP client.
pub struct JupyterServerFactory {
    client: reqwest::Client,
}

impl JupyterServerFactory {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

impl RuntimeFactory for JupyterServerFactory {
    fn create(&self, endpoint: &RuntimeEndpoint) -> Arc<dyn RuntimeHandle> {
        Arc::new(JupyterServerKernel::new(self.client.clone(), endpoint.clone()))
    }
}
