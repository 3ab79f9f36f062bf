//! Wire Protocol
//!
//! Every message on the agent socket, in both directions, is framed as:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | JSON payload     |
//! +----------------------------+------------------+
//! ```
//!
//! The length is validated before the payload buffer is allocated, so a
//! misbehaving local peer cannot make the agent allocate an arbitrary
//! amount of memory. Zero-length frames are rejected.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{AgentError, Result};

/// Maximum frame size (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Authorization request sent by the connect-script client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// connect, disconnect or host-update
    #[serde(default)]
    pub reason: String,
    /// From the certificate CN
    #[serde(default)]
    pub username: String,
    /// From the certificate OU
    #[serde(default)]
    pub groupname: String,
    /// Client IP
    #[serde(default)]
    pub ip_real: String,
    /// Assigned VPN IP
    #[serde(default)]
    pub ip_remote: String,
    /// tun/tap device
    #[serde(default)]
    pub device: String,
    /// ocserv session id
    #[serde(default)]
    pub session_id: String,
}

/// Response to an authorization request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Audit tags (source, fallback, fail_mode, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl AuthResponse {
    pub fn allow(message: impl Into<String>) -> Self {
        Self {
            allowed: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn deny(error: impl Into<String>) -> Self {
        Self {
            allowed: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Value of the `source` audit tag, if set
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").map(String::as_str)
    }
}

/// Length-prefixed JSON codec with a configured frame limit
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Read one frame's raw payload.
    ///
    /// Returns `ConnectionClosed` only on a clean EOF before any prefix byte;
    /// a partial prefix is an I/O error.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < prefix.len() {
            match reader.read(&mut prefix[filled..]).await {
                Ok(0) if filled == 0 => return Err(AgentError::ConnectionClosed),
                Ok(0) => {
                    return Err(AgentError::Io(format!(
                        "read message length: truncated after {} of 4 bytes",
                        filled
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(AgentError::Io(format!("read message length: {}", e))),
            }
        }
        let len = u32::from_be_bytes(prefix) as usize;

        self.check_len(len)?;

        let mut data = vec![0u8; len];
        reader
            .read_exact(&mut data)
            .await
            .map_err(|e| AgentError::Io(format!("read message data: {}", e)))?;
        Ok(data)
    }

    /// Read and decode one message
    pub async fn read_message<R, T>(&self, reader: &mut R) -> Result<T>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        let data = self.read_frame(reader).await?;
        serde_json::from_slice(&data)
            .map_err(|e| AgentError::Serialization(format!("unmarshal message: {}", e)))
    }

    /// Encode a message into a complete frame (prefix + payload)
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(value)?;
        self.check_len(payload.len())?;

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Encode and write one message
    pub async fn write_message<W, T>(&self, writer: &mut W, value: &T) -> Result<()>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let frame = self.encode(value)?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| AgentError::Io(format!("write message: {}", e)))?;
        writer.flush().await?;
        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(AgentError::FrameEmpty);
        }
        if len > self.max_frame_size {
            return Err(AgentError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}
