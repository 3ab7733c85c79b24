//! Fixed-size frame reassembly from a byte stream

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::error::{Error, Result};

/// Reads frames of a size both peers agreed on out of band
pub struct FrameReceiver<R> {
    reader: R,
    buf: BytesMut,
    frames: u64,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::new(),
            frames: 0,
        }
    }

    pub fn frames_received(&self) -> u64 {
        self.frames
    }

    /// Bytes read past the last complete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Accumulate exactly `expected` bytes, however the stream splits them
    pub async fn recv_frame(&mut self, expected: usize) -> Result<Bytes> {
        self.buf.reserve(expected.saturating_sub(self.buf.len()));
        while self.buf.len() < expected {
            let remaining = (expected - self.buf.len()) as u64;
            let n = (&mut self.reader)
                .take(remaining)
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| Error::ConnectionLost(format!("receive failed: {}", e)))?;
            if n == 0 {
                return Err(Error::ConnectionLost(format!(
                    "peer closed with {} of {} frame bytes received",
                    self.buf.len(),
                    expected
                )));
            }
            trace!("Received {} of {} bytes", self.buf.len(), expected);
        }

        self.frames += 1;
        metrics::counter!("transport_frames_received_total").increment(1);
        Ok(self.buf.split_to(expected).freeze())
    }
}
