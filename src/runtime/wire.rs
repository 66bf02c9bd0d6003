//! Multipart message framing
//!
//! Every socket carries a stream of multipart messages:
//!
//! ```text
//! u16 part count (big endian)
//! repeated: u32 part length (big endian) + part bytes
//! ```
//!
//! Broadcasts are `[topic, payload]`, commands are `[payload]`, and a
//! subscription handshake lists the requested topics (no parts = every topic).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{WireError, WireResult};

/// Largest accepted part
pub const MAX_PART_SIZE: usize = 16 * 1024 * 1024;

/// Largest accepted part count
pub const MAX_PARTS: usize = u16::MAX as usize;

/// Encode a multipart message into one contiguous buffer
pub fn encode<P: AsRef<[u8]>>(parts: &[P]) -> WireResult<Vec<u8>> {
    if parts.len() > MAX_PARTS {
        return Err(WireError::TooManyParts(parts.len()));
    }

    let body: usize = parts.iter().map(|part| 4 + part.as_ref().len()).sum();
    let mut buf = Vec::with_capacity(2 + body);
    buf.extend_from_slice(&(parts.len() as u16).to_be_bytes());

    for part in parts {
        let part = part.as_ref();
        if part.len() > MAX_PART_SIZE {
            return Err(WireError::PartTooLarge(part.len()));
        }
        buf.extend_from_slice(&(part.len() as u32).to_be_bytes());
        buf.extend_from_slice(part);
    }

    Ok(buf)
}

/// Read one multipart message
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between messages.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> WireResult<Option<Vec<Vec<u8>>>> {
    let count = match reader.read_u16().await {
        Ok(count) => count as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if len > MAX_PART_SIZE {
            return Err(WireError::PartTooLarge(len));
        }
        let mut part = vec![0u8; len];
        reader.read_exact(&mut part).await?;
        parts.push(part);
    }

    Ok(Some(parts))
}

/// Encode and write one multipart message
pub async fn write_message<W, P>(writer: &mut W, parts: &[P]) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
    P: AsRef<[u8]>,
{
    let buf = encode(parts)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode a UTF-8 part (topics, handshake entries)
pub fn utf8(part: Vec<u8>) -> WireResult<String> {
    String::from_utf8(part).map_err(|err| WireError::Malformed(format!("non UTF-8 text part: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_frame_layout() {
        let buf = encode(&[b"04".as_slice(), b"{}".as_slice()]).unwrap();
        assert_eq!(&buf[..2], &[0, 2]);
        assert_eq!(&buf[2..6], &[0, 0, 0, 2]);
        assert_eq!(&buf[6..8], b"04");

        let mut reader = buf.as_slice();
        let parts = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(parts, vec![b"04".to_vec(), b"{}".to_vec()]);
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_handshake_has_no_parts() {
        let empty: [&[u8]; 0] = [];
        let buf = encode(&empty).unwrap();
        let mut reader = buf.as_slice();
        let parts = read_message(&mut reader).await.unwrap().unwrap();
        assert!(parts.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_message_is_an_error() {
        let buf = encode(&[b"payload".as_slice()]).unwrap();
        let mut reader = &buf[..buf.len() - 2];
        assert!(matches!(read_message(&mut reader).await, Err(WireError::Io(_))));
    }

    #[tokio::test]
    async fn test_oversized_part_rejected_on_read() {
        let mut buf = vec![0, 1];
        buf.extend_from_slice(&((MAX_PART_SIZE as u32) + 1).to_be_bytes());
        let mut reader = buf.as_slice();
        assert!(matches!(read_message(&mut reader).await, Err(WireError::PartTooLarge(_))));
    }
}
