//! Decode an H.264 elementary stream onto a display

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::capture::FramePacer;
use crate::codec::{DecoderOutput, VideoDecoder};
use crate::convert::SourceLayout;
use crate::display::{Display, DisplaySink};
use crate::error::Result;
use crate::FrameGeometry;

const READ_CHUNK: usize = 64 * 1024;

/// Feed `reader` through `decoder` and show each frame, one per `interval`.
/// Returns the number of frames shown.
#[instrument(skip_all, fields(width = geometry.width, height = geometry.height))]
pub fn play_stream<R, C, D>(
    mut reader: R,
    mut decoder: C,
    sink: &mut DisplaySink<D>,
    geometry: FrameGeometry,
    interval: Duration,
    stop: &AtomicBool,
) -> Result<u64>
where
    R: Read,
    C: VideoDecoder,
    D: Display,
{
    let source = SourceLayout::packed(geometry.width, geometry.height, geometry.format);
    let mut pacer = FramePacer::new((!interval.is_zero()).then_some(interval));
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut input_done = false;
    let mut shown = 0u64;

    while !stop.load(Ordering::Relaxed) {
        if !input_done {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                debug!("End of input, flushing decoder");
                decoder.finish()?;
                input_done = true;
            } else {
                decoder.push_packet(&chunk[..n])?;
            }
        }

        loop {
            match decoder.pull_frame()? {
                DecoderOutput::Frame(frame) => {
                    pacer.begin();
                    sink.show(&frame, source)?;
                    shown += 1;
                    metrics::counter!("playback_frames_total").increment(1);
                    pacer.wait();
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                }
                DecoderOutput::NeedMoreInput if !input_done => break,
                DecoderOutput::NeedMoreInput | DecoderOutput::EndOfStream => {
                    info!("Playback finished after {} frames", shown);
                    return Ok(shown);
                }
            }
        }
    }
    info!("Playback stopped after {} frames", shown);
    Ok(shown)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Instant;

    use bytes::Bytes;

    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::display::testing::MemoryDisplay;
    use crate::DisplayConfig;

    /// Treats every `frame_size` bytes of input as one decoded frame
    struct SplittingDecoder {
        frame_size: usize,
        pending: Vec<u8>,
        finished: bool,
    }

    impl SplittingDecoder {
        fn new(frame_size: usize) -> Self {
            Self {
                frame_size,
                pending: Vec::new(),
                finished: false,
            }
        }
    }

    impl VideoDecoder for SplittingDecoder {
        fn push_packet(&mut self, data: &[u8]) -> Result<()> {
            self.pending.extend_from_slice(data);
            Ok(())
        }

        fn pull_frame(&mut self) -> Result<DecoderOutput> {
            if self.pending.len() >= self.frame_size {
                let rest = self.pending.split_off(self.frame_size);
                let frame = std::mem::replace(&mut self.pending, rest);
                return Ok(DecoderOutput::Frame(Bytes::from(frame)));
            }
            if self.finished {
                return Ok(DecoderOutput::EndOfStream);
            }
            Ok(DecoderOutput::NeedMoreInput)
        }

        fn finish(&mut self) -> Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    fn sink() -> DisplaySink<MemoryDisplay> {
        DisplaySink::new(
            MemoryDisplay::new(PixelFormat::Rgb565, 2, 2, 0),
            &DisplayConfig::default(),
        )
    }

    #[test]
    fn test_every_decoded_frame_is_shown() {
        let geometry = FrameGeometry::new(2, 2, PixelFormat::Yuyv);
        let stream = vec![128u8; geometry.frame_size() * 4];
        let mut sink = sink();
        let stop = AtomicBool::new(false);

        let shown = play_stream(
            Cursor::new(stream),
            SplittingDecoder::new(geometry.frame_size()),
            &mut sink,
            geometry,
            Duration::ZERO,
            &stop,
        )
        .unwrap();
        assert_eq!(shown, 4);
        assert_eq!(sink.display().presents, 4);
    }

    #[test]
    fn test_frames_are_paced() {
        let geometry = FrameGeometry::new(2, 2, PixelFormat::Yuyv);
        let stream = vec![128u8; geometry.frame_size() * 3];
        let mut sink = sink();
        let stop = AtomicBool::new(false);

        let started = Instant::now();
        play_stream(
            Cursor::new(stream),
            SplittingDecoder::new(geometry.frame_size()),
            &mut sink,
            geometry,
            Duration::from_millis(20),
            &stop,
        )
        .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_stop_flag_ends_playback() {
        let geometry = FrameGeometry::new(2, 2, PixelFormat::Yuyv);
        let stream = vec![128u8; geometry.frame_size() * 4];
        let mut sink = sink();
        let stop = AtomicBool::new(true);

        let shown = play_stream(
            Cursor::new(stream),
            SplittingDecoder::new(geometry.frame_size()),
            &mut sink,
            geometry,
            Duration::ZERO,
            &stop,
        )
        .unwrap();
        assert_eq!(shown, 0);
    }

    #[test]
    fn test_trailing_partial_frame_is_dropped() {
        let geometry = FrameGeometry::new(2, 2, PixelFormat::Yuyv);
        let stream = vec![128u8; geometry.frame_size() * 2 + 3];
        let mut sink = sink();
        let stop = AtomicBool::new(false);

        let shown = play_stream(
            Cursor::new(stream),
            SplittingDecoder::new(geometry.frame_size()),
            &mut sink,
            geometry,
            Duration::ZERO,
            &stop,
        )
        .unwrap();
        assert_eq!(shown, 2);
    }
}
