//! Length-prefixed JSON wire protocol for TCP channels.
//!
//! Frame format: [4-byte length (u32 big-endian)][JSON payload]
//! Maximum frame size: 16MB (full snapshots travel in a single frame)

use crate::network::message::SyncMessage;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// First frame on every TCP channel: the dialler's endpoint identifier.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename = "HELLO")]
pub struct Hello {
    pub id: String,
}

/// Serialize a value into a length-prefixed frame.
pub fn serialize_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
    let payload =
        serde_json::to_vec(value).map_err(|e| format!("Failed to serialize message: {}", e))?;

    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(format!(
            "Message too large: {} bytes (max: {})",
            payload.len(),
            MAX_FRAME_SIZE
        ));
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write a single frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> Result<(), String> {
    let frame = serialize_frame(value)?;

    writer
        .write_all(&frame)
        .await
        .map_err(|e| format!("Failed to write frame: {}", e))?;

    writer
        .flush()
        .await
        .map_err(|e| format!("Failed to flush: {}", e))?;

    Ok(())
}

/// Read a length-prefixed frame and deserialize it.
/// Returns Ok(None) on clean EOF (connection closed).
pub async fn read_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>, String> {
    // Read 4-byte length prefix
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(format!("Failed to read frame length: {}", e)),
    }

    let len = u32::from_be_bytes(len_buf);

    if len > MAX_FRAME_SIZE {
        return Err(format!(
            "Frame too large: {} bytes (max: {})",
            len, MAX_FRAME_SIZE
        ));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| format!("Failed to read frame payload: {}", e))?;

    let value = serde_json::from_slice(&payload)
        .map_err(|e| format!("Failed to deserialize message: {}", e))?;

    Ok(Some(value))
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &SyncMessage,
) -> Result<(), String> {
    write_frame(writer, message).await
}

pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<SyncMessage>, String> {
    read_frame(reader).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hello_then_message() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Hello { id: "node-a".into() })
            .await
            .unwrap();
        write_message(&mut buf, &SyncMessage::Ping).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let hello: Hello = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(hello.id, "node-a");
        let msg = read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(msg, SyncMessage::Ping);
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_message(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut cursor = std::io::Cursor::new(len.to_vec());
        let result = read_message(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_garbage_payload_rejected() {
        let mut frame = 3u32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"{{{");
        let mut cursor = std::io::Cursor::new(frame);
        assert!(read_message(&mut cursor).await.is_err());
    }
}
