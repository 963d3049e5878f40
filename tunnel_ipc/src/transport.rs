//! IPC Transport Layer
//!
//! Length-prefixed bincode framing over any ordered byte stream, plus the
//! Unix Domain Socket listener and connector used by the service and its
//! clients. Frames are a little-endian `u32` length followed by the payload.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// Upper bound on a single frame. Tunnel configurations are small text
/// files, snapshots are a few dozen bytes per tunnel.
pub const MESSAGE_LEN_LIMIT: usize = 1024 * 1024;

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;

/// Error type for IPC operations
#[derive(Error, Debug)]
pub enum IpcError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),
}

fn message_bincode_config() -> impl Options {
    bincode::options()
        .with_limit(MESSAGE_LEN_LIMIT as u64)
        .with_fixint_encoding()
}

/// Serialize `message` and write it as one frame.
pub async fn send_message<W, T>(writer: &mut W, message: &T) -> IpcResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = message_bincode_config().serialize(message)?;
    write_length_prefixed(writer, &payload).await
}

/// Read one frame and deserialize it.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
pub async fn receive_message<R, T>(reader: &mut R) -> IpcResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_length_prefixed(reader).await? {
        Some(payload) => Ok(Some(message_bincode_config().deserialize(&payload)?)),
        None => Ok(None),
    }
}

async fn write_length_prefixed<W>(writer: &mut W, payload: &[u8]) -> IpcResult<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MESSAGE_LEN_LIMIT {
        return Err(IpcError::Protocol(format!(
            "Attempted to send payload larger than limit ({} bytes)",
            payload.len()
        )));
    }

    let len = (payload.len() as u32).to_le_bytes();
    writer.write_all(&len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_length_prefixed<R>(reader: &mut R) -> IpcResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]).await? {
            // Only a close on a frame boundary is clean
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(IpcError::Protocol(format!(
                    "Stream closed after {} of {} length prefix bytes",
                    filled,
                    len_buf.len()
                )))
            }
            n => filled += n,
        }
    }

    let len = u32::from_le_bytes(len_buf) as usize;

    // Sanity check on message size to prevent OOM
    if len > MESSAGE_LEN_LIMIT {
        return Err(IpcError::Protocol(format!(
            "Message too large: {} bytes",
            len
        )));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Some(data))
}

/// Connect to the service socket.
pub async fn connect<P: AsRef<Path>>(path: P) -> IpcResult<UnixStream> {
    UnixStream::connect(path.as_ref()).await.map_err(|e| {
        IpcError::Connection(format!(
            "Failed to connect to {}: {}",
            path.as_ref().display(),
            e
        ))
    })
}

/// Service-side Unix Domain Socket listener
///
/// Access control is delegated to the socket file mode: only principals that
/// can open the file can talk to the service.
pub struct UnixSocketListener {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl UnixSocketListener {
    /// Bind to `path`, replacing a stale socket file, and apply `mode` to it.
    pub fn bind<P: AsRef<Path>>(path: P, mode: u32) -> IpcResult<Self> {
        let socket_path = path.as_ref().to_path_buf();

        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    IpcError::Connection(format!(
                        "Failed to create socket directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| {
                IpcError::Connection(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| IpcError::Connection(format!("Failed to bind to socket: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(mode))
                .map_err(|e| {
                    IpcError::Connection(format!("Failed to set socket permissions: {}", e))
                })?;
        }

        log::debug!(
            "Bound IPC socket at {} with mode {:o}",
            socket_path.display(),
            mode
        );

        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Accept a new connection
    pub async fn accept(&self) -> IpcResult<UnixStream> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| IpcError::Connection(format!("Failed to accept connection: {}", e)))?;
        Ok(stream)
    }

    /// Path of the bound socket file
    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        // Clean up the socket file when the listener is dropped
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Request, RequestEnvelope, ResponseBody, ServiceMessage};

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        send_message(
            &mut client,
            &RequestEnvelope {
                id: 1,
                request: Request::Ping,
            },
        )
        .await
        .unwrap();

        let received: RequestEnvelope = receive_message(&mut server).await.unwrap().unwrap();
        assert_eq!(received.id, 1);
        assert_eq!(received.request, Request::Ping);

        drop(client);
        let eof: Option<RequestEnvelope> = receive_message(&mut server).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_truncated_length_prefix_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client.write_all(&[7, 0]).await.unwrap();
        drop(client);

        let result: IpcResult<Option<RequestEnvelope>> = receive_message(&mut server).await;
        assert!(matches!(result, Err(IpcError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let len = (MESSAGE_LEN_LIMIT as u32 + 1).to_le_bytes();
        client.write_all(&len).await.unwrap();

        let result: IpcResult<Option<RequestEnvelope>> = receive_message(&mut server).await;
        assert!(matches!(result, Err(IpcError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_unix_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("service.sock");

        let listener = UnixSocketListener::bind(&socket_path, 0o600).unwrap();
        assert!(socket_path.exists());

        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let envelope: RequestEnvelope = receive_message(&mut stream).await.unwrap().unwrap();
            send_message(
                &mut stream,
                &ServiceMessage::Response {
                    id: envelope.id,
                    body: ResponseBody::Pong,
                },
            )
            .await
            .unwrap();
            listener
        });

        let mut stream = connect(&socket_path).await.unwrap();
        send_message(
            &mut stream,
            &RequestEnvelope {
                id: 42,
                request: Request::Ping,
            },
        )
        .await
        .unwrap();

        match receive_message::<_, ServiceMessage>(&mut stream).await.unwrap() {
            Some(ServiceMessage::Response {
                id: 42,
                body: ResponseBody::Pong,
            }) => {}
            other => panic!("Unexpected response: {other:?}"),
        }

        drop(server.await.unwrap());
        assert!(!socket_path.exists());
    }
}
