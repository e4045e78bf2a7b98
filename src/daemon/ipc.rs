// Unix domain socket transport with a length-prefixed JSON protocol

use crate::error::{FretError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// Maximum frame size (10MB)
const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

/// Requests sent from the CLI to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcMessage {
    /// Strategy administration, addressed as `METHOD /strategy/...`
    Admin { method: String, path: String },
    /// Cosine search through the current strategy with fallback
    Search {
        vector: Vec<f32>,
        top_k: Option<usize>,
    },
    /// Segment-weighted search under a named preset
    WeightedSearch {
        vector: Vec<f32>,
        preset: String,
        top_k: Option<usize>,
    },
    /// Text lookup: identity match first, then embedded similarity
    Lookup {
        text: String,
        preset: Option<String>,
        top_k: Option<usize>,
    },
    Ingest { path: PathBuf },
    Purge { id: String },
    Status,
    Stop,
}

/// Response sent from the daemon back to the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl IpcResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn success_with_data(data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }

    /// Serialize `value` into a data response
    pub fn from_serializable<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(data) => Self::success_with_data(data),
            Err(e) => Self::error(format!("Failed to serialize response: {}", e)),
        }
    }
}

/// Unix domain socket server
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl IpcServer {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            listener: None,
        }
    }

    /// Bind to the socket path, replacing a stale socket file
    pub async fn bind(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| FretError::Io {
                source: e,
                context: format!("Failed to remove existing socket: {:?}", self.socket_path),
            })?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FretError::Io {
                source: e,
                context: format!("Failed to create socket directory: {:?}", parent),
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| FretError::Io {
            source: e,
            context: format!("Failed to bind to socket: {:?}", self.socket_path),
        })?;
        self.listener = Some(listener);

        tracing::info!("IPC server listening on {:?}", self.socket_path);
        Ok(())
    }

    pub async fn accept(&self) -> Result<UnixStream> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| FretError::Daemon("Server not bound".to_string()))?;

        let (stream, _addr) = listener.accept().await.map_err(|e| FretError::Io {
            source: e,
            context: "Failed to accept connection".to_string(),
        })?;
        Ok(stream)
    }

    /// Remove the socket file
    pub fn shutdown(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| FretError::Io {
                source: e,
                context: format!("Failed to remove socket: {:?}", self.socket_path),
            })?;
        }
        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// Read one length-prefixed JSON frame
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let length = reader.read_u32().await.map_err(|e| FretError::Io {
        source: e,
        context: "Failed to read frame length".to_string(),
    })?;

    if length > MAX_MESSAGE_SIZE {
        return Err(FretError::Daemon(format!(
            "Frame too large: {} bytes (max: {})",
            length, MAX_MESSAGE_SIZE
        )));
    }

    let mut buffer = vec![0u8; length as usize];
    reader
        .read_exact(&mut buffer)
        .await
        .map_err(|e| FretError::Io {
            source: e,
            context: "Failed to read frame payload".to_string(),
        })?;

    serde_json::from_slice(&buffer).map_err(|e| FretError::Json {
        source: e,
        context: "Failed to deserialize IPC frame".to_string(),
    })
}

/// Write one length-prefixed (big-endian u32) JSON frame and flush
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value).map_err(|e| FretError::Json {
        source: e,
        context: "Failed to serialize IPC frame".to_string(),
    })?;

    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(FretError::Daemon(format!(
            "Frame too large: {} bytes (max: {})",
            payload.len(),
            MAX_MESSAGE_SIZE
        )));
    }

    writer
        .write_u32(payload.len() as u32)
        .await
        .map_err(|e| FretError::Io {
            source: e,
            context: "Failed to write frame length".to_string(),
        })?;
    writer.write_all(&payload).await.map_err(|e| FretError::Io {
        source: e,
        context: "Failed to write frame payload".to_string(),
    })?;
    writer.flush().await.map_err(|e| FretError::Io {
        source: e,
        context: "Failed to flush frame".to_string(),
    })?;
    Ok(())
}

/// Client side of the daemon socket
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Connect, send one message and wait for its response
    pub async fn send(&self, message: &IpcMessage) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                    FretError::DaemonNotRunning
                }
                _ => FretError::Io {
                    source: e,
                    context: format!("Failed to connect to daemon at {:?}", self.socket_path),
                },
            })?;

        write_frame(&mut stream, message).await?;
        read_frame(&mut stream).await
    }
}
