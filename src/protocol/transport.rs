use std::io;

use log::trace;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::wire::{HEADER_SIZE, MAX_MESSAGE_SIZE};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid frame length {0}")]
    FrameLength(i32),
    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),
}

/// Moves whole length-prefixed frames over a byte stream.
///
/// Either half of a split socket can be wrapped: reads need `AsyncRead`,
/// writes need `AsyncWrite`.
pub struct ProtocolTransport<T> {
    stream: T,
}

impl<T> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}

impl<T: AsyncRead + Unpin> ProtocolTransport<T> {
    /// Read the next complete frame, length prefix included.
    ///
    /// Returns `Ok(None)` when the peer closed the stream between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut prefix = [0u8; 4];
        match self.stream.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let length = i32::from_le_bytes(prefix);
        if length < HEADER_SIZE as i32 || length as usize > MAX_MESSAGE_SIZE {
            return Err(TransportError::FrameLength(length));
        }

        let mut frame = vec![0u8; length as usize];
        frame[..4].copy_from_slice(&prefix);
        self.stream.read_exact(&mut frame[4..]).await?;
        trace!("read frame of {length} bytes");
        Ok(Some(frame))
    }
}

impl<T: AsyncWrite + Unpin> ProtocolTransport<T> {
    pub async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;
        trace!("wrote frame of {} bytes", frame.len());
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bson::doc;

    use super::*;
    use crate::protocol::{Operation, Reply};

    #[tokio::test]
    async fn read_write_request() {
        let frame = Operation::query("test.c", doc! { "a": 1 }).encode(3).unwrap();
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));

        transport.write_frame(&frame).await.unwrap();
        let mut transport = ProtocolTransport::new(Cursor::new(transport.into_inner().into_inner()));

        assert_eq!(transport.read_frame().await.unwrap(), Some(frame));
        assert_eq!(transport.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn reads_back_to_back_frames() {
        let first = Reply::new(vec![doc! { "n": 1 }]).encode(1, 10).unwrap();
        let second = Reply::default().encode(2, 11).unwrap();
        let bytes = [first.clone(), second.clone()].concat();
        let mut transport = ProtocolTransport::new(&bytes[..]);

        assert_eq!(transport.read_frame().await.unwrap(), Some(first));
        assert_eq!(transport.read_frame().await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn rejects_impossible_lengths() {
        let bytes = 8i32.to_le_bytes();
        let mut transport = ProtocolTransport::new(&bytes[..]);

        assert!(matches!(
            transport.read_frame().await,
            Err(TransportError::FrameLength(8))
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_io_error() {
        let frame = Reply::default().encode(1, 1).unwrap();
        let mut transport = ProtocolTransport::new(&frame[..frame.len() - 2]);

        assert!(matches!(
            transport.read_frame().await,
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
    }
}
