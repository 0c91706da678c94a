//! Room host for shared notebook documents.
//!
//! Each notebook path gets a "room" holding the canonical Automerge document.
//! Peers (the relay, editors, tests) connect over TCP, send a [`Handshake`]
//! naming the path, and then exchange Automerge sync messages with the room.
//!
//! ## Room lifecycle
//!
//! 1. First peer names a path → the host creates the room, loading the
//!    persisted doc when a docs directory is configured
//! 2. Changes from any peer are broadcast to all others in the room
//! 3. With persistence, the doc is written on every change and the room is
//!    evicted when its last peer leaves. Without persistence the room stays
//!    in memory for the life of the host.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use automerge::sync;
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::connection::{self, FrameReader, Handshake, HandshakeReply};
use crate::notebook_doc::{notebook_doc_filename, NotebookDoc};

/// Host settings.
#[derive(Debug, Clone, Default)]
pub struct RoomServerConfig {
    /// Required handshake token. `None` accepts every peer.
    pub token: Option<String>,
    /// Where room documents are persisted. `None` keeps them in memory.
    pub docs_dir: Option<PathBuf>,
}

/// A notebook room: the canonical document plus change notification.
pub struct Room {
    pub doc: Arc<RwLock<NotebookDoc>>,
    /// Fires whenever any peer changes the document.
    pub changed_tx: broadcast::Sender<()>,
    pub persist_path: Option<PathBuf>,
    pub active_peers: AtomicUsize,
}

impl Room {
    /// Load a persisted document or create a fresh one.
    pub fn load_or_create(path: &str, docs_dir: Option<&Path>) -> Self {
        let persist_path = docs_dir.map(|dir| dir.join(notebook_doc_filename(path)));
        let doc = match &persist_path {
            Some(file) => NotebookDoc::load_or_create(file, path),
            None => NotebookDoc::new(path),
        };
        let (changed_tx, _) = broadcast::channel(16);
        Self {
            doc: Arc::new(RwLock::new(doc)),
            changed_tx,
            persist_path,
            active_peers: AtomicUsize::new(0),
        }
    }
}

/// Thread-safe map of rooms, keyed by notebook path.
pub type Rooms = Arc<Mutex<HashMap<String, Arc<Room>>>>;

/// Get or create the room for a notebook path.
///
/// The caller must hold the rooms mutex.
pub fn get_or_create_room(
    rooms: &mut HashMap<String, Arc<Room>>,
    path: &str,
    docs_dir: Option<&Path>,
) -> Arc<Room> {
    rooms
        .entry(path.to_string())
        .or_insert_with(|| {
            info!("[room-server] Creating room for {}", path);
            Arc::new(Room::load_or_create(path, docs_dir))
        })
        .clone()
}

#[derive(Clone)]
pub struct RoomServer {
    config: Arc<RoomServerConfig>,
    rooms: Rooms,
}

impl RoomServer {
    pub fn new(config: RoomServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            rooms: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn rooms(&self) -> Rooms {
        self.rooms.clone()
    }

    /// Bind `addr` and serve in the background. Returns the bound address.
    pub async fn bind(self, addr: SocketAddr) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("[room-server] Listening on {}", local_addr);
        let task = tokio::spawn(self.serve(listener));
        Ok((local_addr, task))
    }

    /// Accept peers until the task is dropped.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            warn!("[room-server] Connection from {} failed: {:#}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("[room-server] Accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        let Some(handshake) = connection::recv_json_frame::<_, Handshake>(&mut reader).await? else {
            return Ok(());
        };

        if let Some(reason) = self.rejection(&handshake) {
            warn!("[room-server] Rejected peer for {:?}: {}", handshake.path, reason);
            connection::send_json_frame(&mut writer, &HandshakeReply::Rejected { reason }).await?;
            return Ok(());
        }
        connection::send_json_frame(&mut writer, &HandshakeReply::Accepted).await?;

        let room = {
            let mut rooms = self.rooms.lock().await;
            let room = get_or_create_room(&mut rooms, &handshake.path, self.config.docs_dir.as_deref());
            // Counted under the map lock so eviction can't race a join
            room.active_peers.fetch_add(1, Ordering::Relaxed);
            room
        };

        handle_room_connection(reader, writer, room, self.rooms.clone(), handshake.path).await
    }

    fn rejection(&self, handshake: &Handshake) -> Option<String> {
        if handshake.path.is_empty() {
            return Some("notebook path must not be empty".to_string());
        }
        match &self.config.token {
            Some(expected) if handshake.token.as_deref() != Some(expected.as_str()) => {
                Some("invalid room token".to_string())
            }
            _ => None,
        }
    }
}

/// Run the sync protocol for one peer whose join is already counted.
///
/// When the connection closes, the peer count is decremented. A persisted
/// room whose count reaches zero is evicted from the map.
pub async fn handle_room_connection<R, W>(
    reader: R,
    mut writer: W,
    room: Arc<Room>,
    rooms: Rooms,
    path: String,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let peers = room.active_peers.load(Ordering::Relaxed);
    info!(
        "[room-server] Peer joined {} ({} peer{})",
        path,
        peers,
        if peers == 1 { "" } else { "s" }
    );

    let result = run_sync_loop(FrameReader::spawn(reader), &mut writer, &room).await;

    let remaining = room.active_peers.fetch_sub(1, Ordering::Relaxed) - 1;
    if remaining == 0 && room.persist_path.is_some() {
        let mut rooms_guard = rooms.lock().await;
        if room.active_peers.load(Ordering::Relaxed) == 0 {
            rooms_guard.remove(&path);
            info!("[room-server] Evicted room {} (no remaining peers)", path);
        }
    } else {
        info!(
            "[room-server] Peer left {} ({} peer{} remaining)",
            path,
            remaining,
            if remaining == 1 { "" } else { "s" }
        );
    }

    result
}

async fn run_sync_loop<W>(
    mut frames: FrameReader,
    writer: &mut W,
    room: &Room,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut peer_state = sync::State::new();
    let mut changed_rx = room.changed_tx.subscribe();

    // Host speaks first
    {
        let mut doc = room.doc.write().await;
        if let Some(msg) = doc.generate_sync_message(&mut peer_state) {
            connection::send_frame(writer, &msg.encode()).await?;
        }
    }

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let data = match frame {
                    Some(frame) => frame?,
                    None => return Ok(()),
                };
                let message = sync::Message::decode(&data)
                    .map_err(|e| anyhow::anyhow!("decode error: {}", e))?;

                let persist_bytes = {
                    let mut doc = room.doc.write().await;
                    doc.receive_sync_message(&mut peer_state, message)?;

                    if let Some(reply) = doc.generate_sync_message(&mut peer_state) {
                        connection::send_frame(writer, &reply.encode()).await?;
                    }

                    room.persist_path.as_ref().map(|_| doc.save())
                };

                // Written outside the lock, and before other peers are notified
                if let (Some(bytes), Some(path)) = (persist_bytes, &room.persist_path) {
                    persist_room_bytes(&bytes, path);
                }
                let _ = room.changed_tx.send(());
            }

            changed = changed_rx.recv() => {
                match changed {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let mut doc = room.doc.write().await;
                        if let Some(msg) = doc.generate_sync_message(&mut peer_state) {
                            connection::send_frame(writer, &msg.encode()).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

fn persist_room_bytes(data: &[u8], path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("[room-server] Failed to create parent dir for {:?}: {}", path, e);
            return;
        }
    }
    if let Err(e) = std::fs::write(path, data) {
        warn!("[room-server] Failed to save room doc: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_without_docs_dir_is_in_memory() {
        let room = Room::load_or_create("scratch.ipynb", None);
        assert!(room.persist_path.is_none());

        let doc = room.doc.try_read().unwrap();
        assert_eq!(doc.notebook_id(), Some("scratch.ipynb".to_string()));
        assert_eq!(doc.cell_count(), 0);
    }

    #[test]
    fn test_room_persists_and_reloads() {
        let tmp = tempfile::TempDir::new().unwrap();

        {
            let room = Room::load_or_create("persist.ipynb", Some(tmp.path()));
            let mut doc = room.doc.try_write().unwrap();
            doc.insert_cell(0, "c1", "code", "hello").unwrap();
            let bytes = doc.save();
            persist_room_bytes(&bytes, room.persist_path.as_ref().unwrap());
        }

        let room = Room::load_or_create("persist.ipynb", Some(tmp.path()));
        let doc = room.doc.try_read().unwrap();
        assert_eq!(doc.cell_count(), 1);
        assert_eq!(doc.get_cell(0).unwrap().source, "hello");
    }

    #[test]
    fn test_get_or_create_room_reuses_existing() {
        let mut rooms = HashMap::new();

        let a = get_or_create_room(&mut rooms, "nb1", None);
        let b = get_or_create_room(&mut rooms, "nb1", None);
        let c = get_or_create_room(&mut rooms, "nb2", None);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(rooms.len(), 2);
    }

    #[test]
    fn test_rejection_rules() {
        let server = RoomServer::new(RoomServerConfig {
            token: Some("secret".into()),
            docs_dir: None,
        });
        let handshake = |path: &str, token: Option<&str>| Handshake {
            path: path.into(),
            token: token.map(String::from),
        };

        assert!(server.rejection(&handshake("a.ipynb", Some("secret"))).is_none());
        assert_eq!(
            server.rejection(&handshake("a.ipynb", None)).as_deref(),
            Some("invalid room token")
        );
        assert!(server.rejection(&handshake("", Some("secret"))).is_some());
    }

    #[tokio::test]
    async fn test_wrong_token_gets_rejected_reply() {
        let server = RoomServer::new(RoomServerConfig {
            token: Some("secret".into()),
            docs_dir: None,
        });
        let (addr, _task) = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        connection::send_json_frame(
            &mut stream,
            &Handshake {
                path: "nb.ipynb".into(),
                token: Some("wrong".into()),
            },
        )
        .await
        .unwrap();
        let reply: HandshakeReply = connection::recv_json_frame(&mut stream)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            reply,
            HandshakeReply::Rejected {
                reason: "invalid room token".into()
            }
        );
        assert!(connection::recv_frame(&mut stream).await.unwrap().is_none());
    }
    #[tokio::test]
    async fn test_peers_only_see_saved_changes() {
        use crate::config::{DocumentEndpoint, ProviderKind};
        use crate::document::{CellKind, DocumentConnector};
        use crate::room_client::RoomConnector;

        let tmp = tempfile::TempDir::new().unwrap();
        let server = RoomServer::new(RoomServerConfig {
            token: None,
            docs_dir: Some(tmp.path().to_path_buf()),
        });
        let (addr, _task) = server.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let endpoint = DocumentEndpoint {
            base_url: format!("tcp://{}", addr),
            token: None,
            path: "saved.ipynb".into(),
            provider: ProviderKind::Room,
        };
        let connector = RoomConnector::new(None);
        let writer = connector.connect(&endpoint).await.unwrap();
        let watcher = connector.connect(&endpoint).await.unwrap();

        writer.insert_cell(0, CellKind::Code, "x = 1").await.unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while watcher.cell_count().await.unwrap() == 0 {
            assert!(tokio::time::Instant::now() < deadline, "edit never reached the peer");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let path = tmp.path().join(notebook_doc_filename("saved.ipynb"));
        let saved = NotebookDoc::load(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(saved.cell_count(), 1);
        assert_eq!(saved.get_cell(0).unwrap().source, "x = 1");

        writer.stop().await.unwrap();
        watcher.stop().await.unwrap();
    }
}
