//! Length-prefix framing shared by RFCOMM transports and the RFCOMM
//! out-of-band channel: a 4-byte little-endian unsigned payload length,
//! followed by the payload bytes.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const LENGTH_PREFIX_BYTES: usize = 4;

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let length = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame payload exceeds u32"))?;

    writer.write_all(&length.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one frame, rejecting payloads larger than `max_length` before
/// allocating for them.
pub async fn read_frame<R>(reader: &mut R, max_length: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut length_bytes = [0u8; LENGTH_PREFIX_BYTES];
    reader.read_exact(&mut length_bytes).await?;

    let length = u32::from_le_bytes(length_bytes) as usize;
    if length > max_length {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {length} bytes exceeds maximum of {max_length}"),
        ));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(256);

        write_frame(&mut client, b"frame payload").await.unwrap();
        let payload = read_frame(&mut server, 1024).await.unwrap();

        assert_eq!(payload, b"frame payload");
    }

    #[tokio::test]
    async fn test_empty_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64);

        write_frame(&mut client, &[]).await.unwrap();
        let payload = read_frame(&mut server, 16).await.unwrap();

        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(256);

        write_frame(&mut client, &[0u8; 64]).await.unwrap();
        let error = read_frame(&mut server, 16).await.unwrap_err();

        assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_frame_reports_eof() {
        let (mut client, mut server) = tokio::io::duplex(256);

        // Announce 8 bytes but deliver only 3 before hanging up.
        client.write_all(&8u32.to_le_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let error = read_frame(&mut server, 16).await.unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
