use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::transport::{BoxReader, BoxWriter};

/// Largest frame accepted from a peer (100MB).
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Reads length-prefixed frames
///
/// Each frame is a 4-byte big-endian length followed by the payload
pub struct FrameReader {
    inner: BoxReader,
}

impl FrameReader {
    pub fn new(inner: BoxReader) -> Self {
        Self { inner }
    }

    /// Read the next frame
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let len = self.inner.read_u32().await.map_err(closed_on_eof)? as usize;

        // Validate length to prevent DOS
        if len > MAX_FRAME_LEN {
            return Err(Error::InvalidFrame(format!(
                "Message too large: {} bytes",
                len
            )));
        }

        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .await
            .map_err(closed_on_eof)?;
        Ok(buf)
    }
}

/// Writes length-prefixed frames
pub struct FrameWriter {
    inner: BoxWriter,
}

impl FrameWriter {
    pub fn new(inner: BoxWriter) -> Self {
        Self { inner }
    }

    /// Write a single frame and flush it
    pub async fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(Error::InvalidFrame(format!(
                "Message too large: {} bytes",
                bytes.len()
            )));
        }
        self.inner.write_u32(bytes.len() as u32).await?;
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write direction
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

fn closed_on_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        e.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_keep_their_boundaries() {
        let (a, b) = tokio::io::duplex(1024);
        let (_, a_write) = tokio::io::split(a);
        let (b_read, _) = tokio::io::split(b);
        let mut writer = FrameWriter::new(Box::new(a_write));
        let mut reader = FrameReader::new(Box::new(b_read));

        writer.write_frame(b"first").await.unwrap();
        writer.write_frame(b"").await.unwrap();
        writer.write_frame(b"third").await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap(), b"first");
        assert_eq!(reader.read_frame().await.unwrap(), b"");
        assert_eq!(reader.read_frame().await.unwrap(), b"third");
    }

    #[tokio::test]
    async fn eof_maps_to_connection_closed() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let (b_read, _) = tokio::io::split(b);
        let mut reader = FrameReader::new(Box::new(b_read));
        assert!(matches!(
            reader.read_frame().await,
            Err(Error::ConnectionClosed)
        ));
    }
}
