//! Frame transmission over a byte stream

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::capture::frame::Frame;
use crate::error::{Error, Result};
use crate::transport::control::StreamControl;

/// Counters of one sender
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SenderStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub bytes_sent: u64,
}

/// Writes whole frames, with no header, to a connection
pub struct FrameSender<W> {
    writer: W,
    stats: SenderStats,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            stats: SenderStats::default(),
        }
    }

    pub fn stats(&self) -> SenderStats {
        self.stats
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Write `frame` completely, looping over partial writes
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < frame.len() {
            let n = self
                .writer
                .write(&frame[written..])
                .await
                .map_err(|e| Error::ConnectionLost(format!("send failed: {}", e)))?;
            if n == 0 {
                return Err(Error::ConnectionLost("peer stopped accepting data".into()));
            }
            trace!("Wrote {} of {} bytes", written + n, frame.len());
            written += n;
        }
        self.writer
            .flush()
            .await
            .map_err(|e| Error::ConnectionLost(format!("flush failed: {}", e)))?;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        metrics::counter!("transport_frames_sent_total").increment(1);
        metrics::counter!("transport_bytes_sent_total").increment(frame.len() as u64);
        Ok(())
    }

    /// Send `frame` if streaming is enabled, otherwise drop it.
    ///
    /// The flag is read once before the first byte, so a frame that has
    /// started always finishes. Returns whether the frame was sent.
    pub async fn offer(&mut self, frame: &[u8], control: &StreamControl) -> Result<bool> {
        if !control.is_enabled() {
            self.stats.frames_dropped += 1;
            metrics::counter!("transport_frames_dropped_total").increment(1);
            return Ok(false);
        }
        self.send_frame(frame).await?;
        Ok(true)
    }

    /// Forward frames from `frames` until the channel closes, a write fails,
    /// or `hangup` is notified. A hangup is only noticed between frames.
    pub async fn forward(
        &mut self,
        frames: &flume::Receiver<Frame>,
        control: &StreamControl,
        hangup: &Notify,
    ) -> Result<SenderStats> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = hangup.notified() => {
                    debug!("Peer hung up after {} frames", self.stats.frames_sent);
                    break;
                }
                frame = frames.recv_async() => match frame {
                    Ok(frame) => frame,
                    Err(_) => {
                        debug!("Frame channel closed after {} frames", self.stats.frames_sent);
                        break;
                    }
                },
            };
            self.offer(&frame.data, control).await?;
        }
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::capture::frame::{FrameMetadata, PixelFormat};
    use crate::transport::control::ControlCommand;

    fn frame(n: u8, size: usize) -> Frame {
        Frame {
            data: Bytes::from(vec![n; size]),
            meta: Arc::new(FrameMetadata {
                sequence: n as u64,
                width: size as u32 / 2,
                height: 1,
                stride: size as u32,
                format: PixelFormat::Yuyv,
                bytes_used: size,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_partial_writes_complete_the_frame() {
        let frame: Vec<u8> = (0..100u8).collect();
        let writer = tokio_test::io::Builder::new()
            .write(&frame[..10])
            .write(&frame[10..11])
            .write(&frame[11..])
            .build();
        let mut sender = FrameSender::new(writer);
        sender.send_frame(&frame).await.unwrap();
        assert_eq!(sender.stats().frames_sent, 1);
        assert_eq!(sender.stats().bytes_sent, 100);
    }

    #[tokio::test]
    async fn test_write_error_is_connection_lost() {
        let writer = tokio_test::io::Builder::new()
            .write(b"abc")
            .write_error(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            .build();
        let mut sender = FrameSender::new(writer);
        let err = sender.send_frame(b"abcdef").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
        assert_eq!(sender.stats().frames_sent, 0);
    }

    #[tokio::test]
    async fn test_stop_after_five_frames() {
        const SIZE: usize = 64;
        let control = StreamControl::new();
        control.apply(ControlCommand::Start);

        let mut sender = FrameSender::new(Vec::new());
        for n in 1..=10u8 {
            if n == 6 {
                control.apply(ControlCommand::Stop);
            }
            sender.offer(&[n; SIZE], &control).await.unwrap();
        }

        let stats = sender.stats();
        assert_eq!(stats.frames_sent, 5);
        assert_eq!(stats.frames_dropped, 5);
        let wire = sender.into_inner();
        assert_eq!(wire.len(), 5 * SIZE);
        for (i, frame) in wire.chunks(SIZE).enumerate() {
            assert!(frame.iter().all(|&b| b == i as u8 + 1));
        }
    }

    #[tokio::test]
    async fn test_hangup_lets_the_frame_in_flight_finish() {
        const SIZE: usize = 32;
        let (mut peer, local) = tokio::io::duplex(8);
        let (tx, rx) = flume::bounded::<Frame>(2);
        let control = StreamControl::new();
        control.apply(ControlCommand::Start);
        let hangup = Arc::new(Notify::new());

        let forward_hangup = hangup.clone();
        let frames = rx.clone();
        let forwarding = tokio::spawn(async move {
            let mut sender = FrameSender::new(local);
            sender.forward(&frames, &control, &forward_hangup).await
        });

        tx.send_async(frame(1, SIZE)).await.unwrap();
        let mut head = [0u8; 8];
        peer.read_exact(&mut head).await.unwrap();
        hangup.notify_one();
        tx.send_async(frame(2, SIZE)).await.unwrap();

        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert_eq!(head.len() + rest.len(), SIZE);
        assert!(head.iter().chain(&rest).all(|&b| b == 1));

        let stats = forwarding.await.unwrap().unwrap();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(rx.try_recv().unwrap().meta.sequence, 2);
    }
}
