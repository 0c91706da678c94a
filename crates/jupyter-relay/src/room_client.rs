//! Client for a notebook room.
//!
//! A `RoomClient` keeps a local Automerge replica of one notebook. Local
//! edits are applied to the replica and synced to the host; changes from
//! other peers arrive as sync messages and are merged in the background.
//!
//! The client uses a split pattern with channels:
//! - `RoomHandle` is a clonable handle for sending commands
//! - A background task owns the connection and the Automerge state
//!
//! Once the host closes the connection the task stops, and every further
//! call on the handle fails with a closed-connection error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use automerge::sync;
use automerge::AutomergeError;
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, OnceCell};

use crate::config::{DocumentEndpoint, ProviderKind};
use crate::connection::{self, FrameReader, Handshake, HandshakeReply};
use crate::document::{CellKind, DocumentConnector, DocumentHandle};
use crate::notebook_doc::{CellSnapshot, NotebookDoc};
use crate::room_server::{RoomServer, RoomServerConfig};

/// Quiet period that ends the initial sync exchange.
const INITIAL_SYNC_QUIET: Duration = Duration::from_millis(100);

/// How long a write waits for the host's acknowledgment.
const ACK_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("Failed to connect: {0}")]
    ConnectionFailed(std::io::Error),

    #[error("Room host rejected the connection: {0}")]
    Rejected(String),

    #[error("Sync protocol error: {0}")]
    SyncError(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection closed by room host")]
    Disconnected,

    #[error("Connection closed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cell index {index} is out of range. Notebook has {len} cells.")]
    CellIndexOutOfRange { index: usize, len: usize },

    #[error("Connection closed: sync task stopped")]
    ChannelClosed,
}

impl RoomError {
    fn is_connection_lost(&self) -> bool {
        matches!(self, RoomError::Disconnected | RoomError::Io(_))
    }
}

/// A single mutation of the replica.
#[derive(Debug)]
enum CellEdit {
    Insert {
        index: usize,
        cell_id: String,
        cell_type: &'static str,
        source: String,
    },
    SetSource { index: usize, source: String },
    Delete { index: usize },
    ClearOutputs { index: usize },
    AppendOutput { index: usize, output: String },
    SetExecutionCount { index: usize, count: String },
}

impl CellEdit {
    /// Apply to `doc`. `Ok(false)` means no cell exists at the index.
    fn apply(&self, doc: &mut NotebookDoc) -> Result<bool, AutomergeError> {
        match self {
            CellEdit::Insert {
                index,
                cell_id,
                cell_type,
                source,
            } => {
                if *index > doc.cell_count() {
                    return Ok(false);
                }
                doc.insert_cell(*index, cell_id, cell_type, source)?;
                Ok(true)
            }
            CellEdit::SetSource { index, source } => doc.update_source(*index, source),
            CellEdit::Delete { index } => doc.delete_cell(*index),
            CellEdit::ClearOutputs { index } => doc.clear_outputs(*index),
            CellEdit::AppendOutput { index, output } => doc.append_output(*index, output),
            CellEdit::SetExecutionCount { index, count } => doc.set_execution_count(*index, count),
        }
    }

    fn index(&self) -> usize {
        match self {
            CellEdit::Insert { index, .. }
            | CellEdit::SetSource { index, .. }
            | CellEdit::Delete { index }
            | CellEdit::ClearOutputs { index }
            | CellEdit::AppendOutput { index, .. }
            | CellEdit::SetExecutionCount { index, .. } => *index,
        }
    }
}

/// Commands sent from handles to the sync task.
#[derive(Debug)]
enum RoomCommand {
    CellCount {
        reply: oneshot::Sender<usize>,
    },
    Cells {
        reply: oneshot::Sender<Vec<CellSnapshot>>,
    },
    Cell {
        index: usize,
        reply: oneshot::Sender<Option<CellSnapshot>>,
    },
    Edit {
        edit: CellEdit,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle for sending commands to the room sync task.
#[derive(Clone)]
pub struct RoomHandle {
    tx: mpsc::Sender<RoomCommand>,
    path: String,
}

impl RoomHandle {
    /// Notebook path this handle is joined to.
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .await
            .map_err(|_| RoomError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RoomError::ChannelClosed)
    }

    async fn edit(&self, edit: CellEdit) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::Edit { edit, reply })
            .await?
    }
}

#[async_trait]
impl DocumentHandle for RoomHandle {
    async fn cell_count(&self) -> anyhow::Result<usize> {
        Ok(self.request(|reply| RoomCommand::CellCount { reply }).await?)
    }

    async fn cells(&self) -> anyhow::Result<Vec<CellSnapshot>> {
        Ok(self.request(|reply| RoomCommand::Cells { reply }).await?)
    }

    async fn cell(&self, index: usize) -> anyhow::Result<Option<CellSnapshot>> {
        Ok(self
            .request(|reply| RoomCommand::Cell { index, reply })
            .await?)
    }

    async fn outputs(&self, index: usize) -> anyhow::Result<Option<Vec<String>>> {
        Ok(self.cell(index).await?.and_then(|cell| cell.outputs))
    }

    async fn insert_cell(&self, index: usize, kind: CellKind, source: &str) -> anyhow::Result<String> {
        let cell_id = uuid::Uuid::new_v4().to_string();
        self.edit(CellEdit::Insert {
            index,
            cell_id: cell_id.clone(),
            cell_type: kind.as_str(),
            source: source.to_string(),
        })
        .await?;
        Ok(cell_id)
    }

    async fn set_source(&self, index: usize, source: &str) -> anyhow::Result<()> {
        Ok(self
            .edit(CellEdit::SetSource {
                index,
                source: source.to_string(),
            })
            .await?)
    }

    async fn delete_cell(&self, index: usize) -> anyhow::Result<()> {
        Ok(self.edit(CellEdit::Delete { index }).await?)
    }

    async fn clear_outputs(&self, index: usize) -> anyhow::Result<()> {
        Ok(self.edit(CellEdit::ClearOutputs { index }).await?)
    }

    async fn append_output(&self, index: usize, output: &str) -> anyhow::Result<()> {
        Ok(self
            .edit(CellEdit::AppendOutput {
                index,
                output: output.to_string(),
            })
            .await?)
    }

    async fn set_execution_count(&self, index: usize, count: Option<i64>) -> anyhow::Result<()> {
        let count = count.map_or_else(|| "null".to_string(), |n| n.to_string());
        Ok(self
            .edit(CellEdit::SetExecutionCount { index, count })
            .await?)
    }

    async fn stop(&self) -> anyhow::Result<()> {
        match self.request(|reply| RoomCommand::Shutdown { reply }).await {
            Ok(()) | Err(RoomError::ChannelClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Client for one notebook room.
///
/// Holds a local replica that stays in sync with the host's canonical copy.
pub struct RoomClient<S> {
    doc: NotebookDoc,
    peer_state: sync::State,
    writer: WriteHalf<S>,
    frames: FrameReader,
    path: String,
}

impl RoomClient<TcpStream> {
    /// Connect to a room host and join the room for `path`.
    pub async fn connect(
        addr: &str,
        path: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RoomError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RoomError::Timeout)?
            .map_err(RoomError::ConnectionFailed)?;

        info!("[room-client] Connected to {} for {}", addr, path);

        Self::init(stream, path.to_string(), token, timeout).await
    }
}

impl<S> RoomClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Send the handshake and run the initial sync exchange.
    async fn init(
        mut stream: S,
        path: String,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RoomError> {
        connection::send_json_frame(
            &mut stream,
            &Handshake {
                path: path.clone(),
                token,
            },
        )
        .await
        .map_err(|e| RoomError::SyncError(format!("handshake: {}", e)))?;

        let reply: HandshakeReply = tokio::time::timeout(timeout, connection::recv_json_frame(&mut stream))
            .await
            .map_err(|_| RoomError::Timeout)?
            .map_err(|e| RoomError::SyncError(format!("handshake reply: {}", e)))?
            .ok_or(RoomError::Disconnected)?;
        if let HandshakeReply::Rejected { reason } = reply {
            return Err(RoomError::Rejected(reason));
        }

        let (reader, writer) = tokio::io::split(stream);
        let mut client = Self {
            doc: NotebookDoc::replica(),
            peer_state: sync::State::new(),
            writer,
            frames: FrameReader::spawn(reader),
            path,
        };

        // The host speaks first; after that, exchange until it goes quiet
        let mut wait = timeout;
        loop {
            match tokio::time::timeout(wait, client.frames.recv()).await {
                Ok(Some(Ok(data))) => client.apply_frame(&data).await?,
                Ok(Some(Err(e))) => return Err(RoomError::Io(e)),
                Ok(None) => return Err(RoomError::Disconnected),
                Err(_) if wait == timeout => return Err(RoomError::Timeout),
                Err(_) => break,
            }
            wait = INITIAL_SYNC_QUIET;
        }

        info!(
            "[room-client] Initial sync complete for {}: {} cells",
            client.path,
            client.doc.cell_count()
        );
        Ok(client)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn get_cells(&self) -> Vec<CellSnapshot> {
        self.doc.get_cells()
    }

    /// Merge a sync message from the host and answer it.
    async fn apply_frame(&mut self, data: &[u8]) -> Result<(), RoomError> {
        self.receive(data)?;
        if let Some(msg) = self.doc.generate_sync_message(&mut self.peer_state) {
            connection::send_frame(&mut self.writer, &msg.encode()).await?;
        }
        Ok(())
    }

    fn receive(&mut self, data: &[u8]) -> Result<(), RoomError> {
        let message = sync::Message::decode(data)
            .map_err(|e| RoomError::SyncError(format!("decode: {}", e)))?;
        self.doc
            .receive_sync_message(&mut self.peer_state, message)
            .map_err(|e| RoomError::SyncError(format!("receive: {}", e)))
    }

    async fn edit(&mut self, edit: CellEdit) -> Result<(), RoomError> {
        let applied = edit
            .apply(&mut self.doc)
            .map_err(|e| RoomError::SyncError(format!("edit: {}", e)))?;
        if !applied {
            return Err(RoomError::CellIndexOutOfRange {
                index: edit.index(),
                len: self.doc.cell_count(),
            });
        }
        self.sync_to_host().await
    }

    /// Send local changes and wait briefly for the host's acknowledgment,
    /// so a returned write has reached the host.
    async fn sync_to_host(&mut self) -> Result<(), RoomError> {
        let Some(msg) = self.doc.generate_sync_message(&mut self.peer_state) else {
            return Ok(());
        };
        connection::send_frame(&mut self.writer, &msg.encode()).await?;

        match tokio::time::timeout(ACK_TIMEOUT, self.frames.recv()).await {
            Ok(Some(Ok(data))) => self.receive(&data),
            Ok(Some(Err(e))) => Err(RoomError::Io(e)),
            Ok(None) => Err(RoomError::Disconnected),
            Err(_) => Ok(()),
        }
    }

    /// Consume the client and run it on a background task.
    pub fn into_handle(self) -> RoomHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel::<RoomCommand>(32);
        let path = self.path.clone();
        tokio::spawn(run_room_task(self, cmd_rx));
        RoomHandle { tx: cmd_tx, path }
    }
}

/// Background task that owns the client and processes commands and changes.
async fn run_room_task<S>(mut client: RoomClient<S>, mut cmd_rx: mpsc::Receiver<RoomCommand>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(RoomCommand::CellCount { reply }) => {
                        let _ = reply.send(client.doc.cell_count());
                    }
                    Some(RoomCommand::Cells { reply }) => {
                        let _ = reply.send(client.get_cells());
                    }
                    Some(RoomCommand::Cell { index, reply }) => {
                        let _ = reply.send(client.doc.get_cell(index));
                    }
                    Some(RoomCommand::Edit { edit, reply }) => {
                        let result = client.edit(edit).await;
                        let lost = result.as_ref().err().is_some_and(RoomError::is_connection_lost);
                        let _ = reply.send(result);
                        if lost {
                            warn!("[room-client] Lost connection to room {} during edit", client.path);
                            break;
                        }
                    }
                    Some(RoomCommand::Shutdown { reply }) => {
                        info!("[room-client] Leaving room {}", client.path);
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                }
            }

            frame = client.frames.recv() => {
                match frame {
                    Some(Ok(data)) => {
                        if let Err(e) = client.apply_frame(&data).await {
                            warn!("[room-client] Sync error in room {}: {}", client.path, e);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("[room-client] Read error in room {}: {}", client.path, e);
                        break;
                    }
                    None => {
                        warn!("[room-client] Room host closed the connection for {}", client.path);
                        break;
                    }
                }
            }
        }
    }
}

/// Opens [`RoomHandle`]s for document endpoints.
///
/// `Room` endpoints connect to the host at `base_url`. `Embedded` endpoints
/// share one in-process host, started on first use.
pub struct RoomConnector {
    docs_dir: Option<PathBuf>,
    connect_timeout: Duration,
    embedded: OnceCell<SocketAddr>,
}

impl RoomConnector {
    pub fn new(docs_dir: Option<PathBuf>) -> Self {
        Self {
            docs_dir,
            connect_timeout: Duration::from_secs(5),
            embedded: OnceCell::new(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn embedded_host(&self) -> anyhow::Result<SocketAddr> {
        let addr = self
            .embedded
            .get_or_try_init(|| async {
                let server = RoomServer::new(RoomServerConfig {
                    token: None,
                    docs_dir: self.docs_dir.clone(),
                });
                let (addr, _task) = server.bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
                info!("[room-client] Started embedded room host on {}", addr);
                Ok::<_, anyhow::Error>(addr)
            })
            .await?;
        Ok(*addr)
    }
}

#[async_trait]
impl DocumentConnector for RoomConnector {
    async fn connect(&self, endpoint: &DocumentEndpoint) -> anyhow::Result<Arc<dyn DocumentHandle>> {
        let addr = match endpoint.provider {
            ProviderKind::Room => room_address(&endpoint.base_url)?,
            ProviderKind::Embedded => self.embedded_host().await?.to_string(),
        };
        let client = RoomClient::connect(
            &addr,
            &endpoint.path,
            endpoint.token.clone(),
            self.connect_timeout,
        )
        .await
        .with_context(|| format!("joining room {} at {}", endpoint.path, addr))?;
        Ok(Arc::new(client.into_handle()))
    }
}

/// `host:port` from a room URL such as `tcp://127.0.0.1:4041`.
pub fn room_address(url: &str) -> anyhow::Result<String> {
    let with_scheme = if url.contains("://") {
        url.to_string()
    } else {
        format!("tcp://{}", url)
    };
    let parsed = reqwest::Url::parse(&with_scheme)
        .with_context(|| format!("invalid room URL {:?}", url))?;
    let host = parsed
        .host_str()
        .with_context(|| format!("room URL {:?} has no host", url))?;
    let port = parsed
        .port()
        .with_context(|| format!("room URL {:?} has no port", url))?;
    Ok(format!("{}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start_host(token: Option<&str>) -> String {
        let server = RoomServer::new(RoomServerConfig {
            token: token.map(String::from),
            docs_dir: None,
        });
        let (addr, _task) = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        addr.to_string()
    }

    async fn join(addr: &str, path: &str) -> RoomHandle {
        RoomClient::connect(addr, path, None, Duration::from_secs(2))
            .await
            .unwrap()
            .into_handle()
    }

    async fn wait_for_cells(handle: &RoomHandle, expected: usize) -> bool {
        for _ in 0..50 {
            if handle.cell_count().await.unwrap() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_room_address() {
        assert_eq!(room_address("tcp://127.0.0.1:4041").unwrap(), "127.0.0.1:4041");
        assert_eq!(room_address("localhost:9000").unwrap(), "localhost:9000");
        assert!(room_address("tcp://localhost").is_err());
    }

    #[test]
    fn test_disconnect_errors_read_as_closed_connections() {
        use crate::backoff::is_transient_message;
        assert!(is_transient_message(&RoomError::Disconnected.to_string()));
        assert!(is_transient_message(&RoomError::ChannelClosed.to_string()));
        assert!(!is_transient_message(
            &RoomError::Rejected("invalid room token".into()).to_string()
        ));
    }

    #[tokio::test]
    async fn test_edits_reach_other_peers() {
        let addr = start_host(None).await;
        let alice = join(&addr, "shared.ipynb").await;
        let bob = join(&addr, "shared.ipynb").await;

        alice
            .insert_cell(0, CellKind::Markdown, "# Title")
            .await
            .unwrap();
        alice.insert_cell(1, CellKind::Code, "1 + 1").await.unwrap();

        assert!(wait_for_cells(&bob, 2).await);
        let cells = bob.cells().await.unwrap();
        assert_eq!(cells[0].source, "# Title");
        assert_eq!(cells[0].cell_type, "markdown");
        assert_eq!(cells[0].outputs, None);
        assert_eq!(cells[1].outputs, Some(vec![]));
    }

    #[tokio::test]
    async fn test_rooms_are_isolated_by_path() {
        let addr = start_host(None).await;
        let a = join(&addr, "a.ipynb").await;
        let b = join(&addr, "b.ipynb").await;

        a.insert_cell(0, CellKind::Code, "x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(b.cell_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_edit_is_rejected() {
        let addr = start_host(None).await;
        let handle = join(&addr, "nb.ipynb").await;

        let err = handle.set_source(3, "nope").await.unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let err = handle
            .insert_cell(2, CellKind::Code, "too far")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert_eq!(handle.cell_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bad_token_is_rejected() {
        let addr = start_host(Some("secret")).await;

        let result = RoomClient::connect(&addr, "nb.ipynb", Some("wrong".into()), Duration::from_secs(2)).await;
        assert!(matches!(result, Err(RoomError::Rejected(_))));

        let ok = RoomClient::connect(&addr, "nb.ipynb", Some("secret".into()), Duration::from_secs(2)).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_stopped_handle_fails_as_closed_connection() {
        let addr = start_host(None).await;
        let handle = join(&addr, "nb.ipynb").await;

        handle.stop().await.unwrap();
        // Stopping twice is harmless
        handle.stop().await.unwrap();

        let err = handle.cell_count().await.unwrap_err();
        assert!(crate::backoff::is_transient_message(&err.to_string()));
    }

    #[tokio::test]
    async fn test_embedded_connector_shares_one_host() {
        let connector = RoomConnector::new(None);
        let endpoint = DocumentEndpoint {
            provider: ProviderKind::Embedded,
            ..DocumentEndpoint::default()
        };

        let first = connector.connect(&endpoint).await.unwrap();
        first.insert_cell(0, CellKind::Code, "shared").await.unwrap();
        let second = connector.connect(&endpoint).await.unwrap();

        assert_eq!(second.cell_count().await.unwrap(), 1);
        assert_eq!(second.cell(0).await.unwrap().unwrap().source, "shared");
    }

    #[tokio::test]
    async fn test_connector_reports_unreachable_host() {
        let connector = RoomConnector::new(None).with_connect_timeout(Duration::from_secs(1));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = DocumentEndpoint {
            base_url: format!("tcp://{}", addr),
            ..DocumentEndpoint::default()
        };
        let err = connector.connect(&endpoint).await.err().unwrap();
        assert!(format!("{:#}", err).contains("joining room notebook.ipynb"));
    }
}
