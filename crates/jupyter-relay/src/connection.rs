//! Connection framing and handshake for the room sync socket.
//!
//! Every room connection uses length-prefixed binary framing:
//!
//! ```text
//! [4 bytes: payload length (big-endian u32)] [payload bytes]
//! ```
//!
//! The first frame from the client is a JSON [`Handshake`] naming the
//! notebook path; the host answers with a JSON [`HandshakeReply`]. After
//! that, every frame is an encoded Automerge sync message.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Maximum frame size for sync frames: 100 MiB.
const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Maximum frame size for handshake frames: 64 KiB.
const MAX_CONTROL_FRAME_SIZE: usize = 64 * 1024;

/// First frame on every room connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Notebook path identifying the room.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Host's answer to a [`Handshake`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandshakeReply {
    Accepted,
    Rejected { reason: String },
}

/// Send a length-prefixed frame.
pub async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a length-prefixed frame with a caller-specified size limit.
/// Returns `None` on clean disconnect (EOF).
async fn recv_frame_with_limit<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, max_size),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Receive a sync frame (up to 100 MiB).
/// Returns `None` on clean disconnect (EOF).
pub async fn recv_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    recv_frame_with_limit(reader, MAX_FRAME_SIZE).await
}

/// Send a value as a JSON-encoded length-prefixed frame.
pub async fn send_json_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> anyhow::Result<()> {
    let data = serde_json::to_vec(value)?;
    send_frame(writer, &data).await?;
    Ok(())
}

/// Receive and deserialize a JSON handshake frame (up to 64 KiB).
/// Returns `None` on clean disconnect (EOF).
pub async fn recv_json_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> anyhow::Result<Option<T>> {
    match recv_frame_with_limit(reader, MAX_CONTROL_FRAME_SIZE).await? {
        Some(data) => {
            let value = serde_json::from_slice(&data)?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Reads sync frames on a dedicated task.
///
/// `recv_frame` is not cancel-safe: dropping it mid-frame loses bytes. Loops
/// that `select!` over incoming frames read from this channel instead.
pub struct FrameReader {
    rx: mpsc::Receiver<std::io::Result<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl FrameReader {
    pub fn spawn<R>(mut reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(async move {
            loop {
                match recv_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });
        Self { rx, task }
    }

    /// Next frame. `None` once the peer has closed the stream.
    pub async fn recv(&mut self) -> Option<std::io::Result<Vec<u8>>> {
        self.rx.recv().await
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let data = b"hello world";

        let mut buf = Vec::new();
        send_frame(&mut buf, data).await.unwrap();
        assert_eq!(buf.len(), 4 + data.len());

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_frame_eof() {
        let buf: &[u8] = &[];
        let mut cursor = std::io::Cursor::new(buf);
        assert!(recv_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_handshake_rejected() {
        let mut buf = Vec::new();
        send_frame(&mut buf, &vec![b' '; MAX_CONTROL_FRAME_SIZE + 1])
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let result: anyhow::Result<Option<Handshake>> = recv_json_frame(&mut cursor).await;
        assert!(result.unwrap_err().to_string().contains("frame too large"));
    }

    #[tokio::test]
    async fn test_handshake_wire_format() {
        let handshake = Handshake {
            path: "work/analysis.ipynb".into(),
            token: None,
        };
        let mut buf = Vec::new();
        send_json_frame(&mut buf, &handshake).await.unwrap();
        assert_eq!(&buf[4..], br#"{"path":"work/analysis.ipynb"}"#);

        let reply = serde_json::to_string(&HandshakeReply::Rejected {
            reason: "bad token".into(),
        })
        .unwrap();
        assert_eq!(reply, r#"{"status":"rejected","reason":"bad token"}"#);

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Handshake = recv_json_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[tokio::test]
    async fn test_frame_reader_delivers_frames_then_eof() {
        let (client, server) = tokio::io::duplex(1024);
        let mut frames = FrameReader::spawn(server);

        let mut client = client;
        send_frame(&mut client, b"one").await.unwrap();
        send_frame(&mut client, b"two").await.unwrap();
        drop(client);

        assert_eq!(frames.recv().await.unwrap().unwrap(), b"one");
        assert_eq!(frames.recv().await.unwrap().unwrap(), b"two");
        assert!(frames.recv().await.is_none());
    }
}
