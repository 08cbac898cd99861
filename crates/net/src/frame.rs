//! Envelope framing over a byte stream
//!
//! Each envelope is a big-endian `u32` length followed by that many bytes
//! of JSON. Lengths of zero or above `MAX_FRAME_SIZE` are protocol errors.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::Envelope;

const MAX_FRAME_SIZE: u32 = 1024 * 1024;

fn closed_on_eof(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
        _ => Error::Io(e),
    }
}

fn check_len(len: usize) -> Result<u32> {
    match u32::try_from(len) {
        Ok(0) => Err(Error::Protocol("Empty frame".into())),
        Ok(n) if n <= MAX_FRAME_SIZE => Ok(n),
        _ => Err(Error::Protocol(format!(
            "Envelope too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        ))),
    }
}

/// Read one envelope; a peer hanging up between frames is `ConnectionClosed`
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope> {
    let len = reader.read_u32().await.map_err(closed_on_eof)?;
    let len = check_len(len as usize)?;

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(closed_on_eof)?;

    Envelope::from_bytes(&payload).map_err(|e| Error::Protocol(format!("Invalid envelope: {}", e)))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, env: &Envelope) -> Result<()> {
    let payload = env
        .to_bytes()
        .map_err(|e| Error::Protocol(format!("Serialization failed: {}", e)))?;
    let len = check_len(payload.len())?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Envelopes decoded on their own task
///
/// `next` is cancel safe, unlike `read_frame`, so it can sit in a `select!`
/// next to other branches without losing half-read frames.
pub struct FrameReader {
    frames: mpsc::Receiver<Result<Envelope>>,
    task: JoinHandle<()>,
}

impl FrameReader {
    pub fn spawn<R>(mut reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, frames) = mpsc::channel(32);
        let task = tokio::spawn(async move {
            loop {
                let result = read_frame(&mut reader).await;
                let failed = result.is_err();
                if tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });
        Self { frames, task }
    }

    /// Next envelope; `ConnectionClosed` once the stream has ended
    pub async fn next(&mut self) -> Result<Envelope> {
        self.frames
            .recv()
            .await
            .unwrap_or(Err(Error::ConnectionClosed))
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}
