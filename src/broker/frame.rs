//! Length-prefixed JSON framing: a `u32` big-endian length prefix followed
//! by a UTF-8 JSON body. Shared by the broker server and client.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::BrokerError;
use crate::types::BrokerMessage;

/// Messages larger than this are rejected without tearing down the
/// connection, matching `MessageValidator.MAX_MESSAGE_SIZE` (64 KiB) in
/// the original.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Read one frame. Returns `Ok(None)` if the peer closed the connection
/// cleanly before sending a length prefix.
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<BrokerMessage>, BrokerError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BrokerError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        // Drain and discard rather than disconnecting the peer outright.
        let mut remaining = len;
        let mut sink = [0u8; 4096];
        while remaining > 0 {
            let chunk = remaining.min(sink.len());
            reader
                .read_exact(&mut sink[..chunk])
                .await
                .map_err(BrokerError::Io)?;
            remaining -= chunk;
        }
        return Err(BrokerError::FrameDecode(format!(
            "frame of {len} bytes exceeds {MAX_MESSAGE_SIZE}-byte limit"
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                BrokerError::IncompleteRead
            } else {
                BrokerError::Io(e)
            }
        })?;

    let message: BrokerMessage = serde_json::from_slice(&body)?;
    Ok(Some(message))
}

pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &BrokerMessage,
) -> Result<(), BrokerError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(BrokerError::FrameDecode(format!(
            "outgoing frame of {} bytes exceeds {MAX_MESSAGE_SIZE}-byte limit",
            body.len()
        )));
    }
    let len = (body.len() as u32).to_be_bytes();
    writer.write_all(&len).await.map_err(BrokerError::Io)?;
    writer.write_all(&body).await.map_err(BrokerError::Io)?;
    writer.flush().await.map_err(BrokerError::Io)?;
    Ok(())
}

/// Required-field and size checks applied to every inbound message before
/// it's dispatched, matching `MessageValidator.validate_message`.
pub fn validate_message(message: &BrokerMessage) -> Result<(), BrokerError> {
    if message.content.len() > MAX_MESSAGE_SIZE {
        return Err(BrokerError::FrameDecode("content exceeds size limit".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageType;
    use std::io::Cursor;

    #[tokio::test]
    async fn frame_round_trips() {
        let msg = BrokerMessage::new(MessageType::Chat, "hi").with_sender("a");
        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded.content, "hi");
        assert_eq!(decoded.sender.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn empty_stream_reads_as_closed() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn oversize_length_prefix_errors_without_panicking() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes());
        buf.extend(std::iter::repeat(0u8).take(MAX_MESSAGE_SIZE + 1));
        let mut cursor = Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(BrokerError::FrameDecode(_))));
    }
}
