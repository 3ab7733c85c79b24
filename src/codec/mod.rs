//! Video encoder/decoder seam and the H.264 recording sink

#[cfg(feature = "gstreamer-codec")]
pub mod gst;

use std::io::Write;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::capture::capture_loop::FrameSink;
use crate::capture::frame::{FrameGeometry, FrameView, PixelFormat};
use crate::convert::{ConvertOptions, ConverterCache, DestinationLayout, SourceLayout};
use crate::error::{Error, Result};
use crate::CodecConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
}

/// Stream parameters fixed when a codec is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Bits per second
    pub bitrate: u32,
    /// Frames between keyframes
    pub gop: u32,
}

impl CodecParams {
    pub fn new(geometry: FrameGeometry, config: &CodecConfig) -> Self {
        Self {
            width: geometry.width,
            height: geometry.height,
            fps: config.fps,
            bitrate: config.bitrate,
            gop: config.gop,
        }
    }

    /// Duration of one frame at the configured rate
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    /// Raw frame the encoder consumes: tightly packed 4:2:0 planes
    pub fn input_layout(&self) -> DestinationLayout {
        DestinationLayout::new(PixelFormat::Yuv420p, self.width, self.height)
    }

    /// Raw frame the decoder produces: packed 4:2:2, the capture format
    pub fn output_geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.width, self.height, PixelFormat::Yuyv)
    }
}

/// One unit of encoded data
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub pts: Option<Duration>,
    pub keyframe: bool,
}

#[derive(Debug)]
pub enum EncoderOutput {
    Packet(Packet),
    NeedMoreInput,
    EndOfStream,
}

#[derive(Debug)]
pub enum DecoderOutput {
    Frame(Bytes),
    NeedMoreInput,
    EndOfStream,
}

pub trait VideoEncoder {
    /// Queue one raw frame laid out as `CodecParams::input_layout`
    fn push_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Next encoded packet, without blocking before `finish`
    fn pull_packet(&mut self) -> Result<EncoderOutput>;

    /// Signal end of input; remaining packets become available to `pull_packet`
    fn finish(&mut self) -> Result<()>;
}

pub trait VideoDecoder {
    /// Queue a chunk of the elementary stream; chunks need not align to frames
    fn push_packet(&mut self, data: &[u8]) -> Result<()>;

    fn pull_frame(&mut self) -> Result<DecoderOutput>;

    fn finish(&mut self) -> Result<()>;
}

impl<T: VideoEncoder + ?Sized> VideoEncoder for Box<T> {
    fn push_frame(&mut self, frame: &[u8]) -> Result<()> {
        (**self).push_frame(frame)
    }

    fn pull_packet(&mut self) -> Result<EncoderOutput> {
        (**self).pull_packet()
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

impl<T: VideoDecoder + ?Sized> VideoDecoder for Box<T> {
    fn push_packet(&mut self, data: &[u8]) -> Result<()> {
        (**self).push_packet(data)
    }

    fn pull_frame(&mut self) -> Result<DecoderOutput> {
        (**self).pull_frame()
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

#[cfg(feature = "gstreamer-codec")]
pub fn open_encoder(codec: Codec, params: CodecParams) -> Result<Box<dyn VideoEncoder + Send>> {
    Ok(Box::new(gst::GstEncoder::new(codec, params)?))
}

#[cfg(not(feature = "gstreamer-codec"))]
pub fn open_encoder(codec: Codec, _params: CodecParams) -> Result<Box<dyn VideoEncoder + Send>> {
    Err(Error::Codec(format!(
        "no {:?} encoder: built without the gstreamer-codec feature",
        codec
    )))
}

#[cfg(feature = "gstreamer-codec")]
pub fn open_decoder(codec: Codec, params: CodecParams) -> Result<Box<dyn VideoDecoder + Send>> {
    Ok(Box::new(gst::GstDecoder::new(codec, params)?))
}

#[cfg(not(feature = "gstreamer-codec"))]
pub fn open_decoder(codec: Codec, _params: CodecParams) -> Result<Box<dyn VideoDecoder + Send>> {
    Err(Error::Codec(format!(
        "no {:?} decoder: built without the gstreamer-codec feature",
        codec
    )))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordingStats {
    pub frames: u64,
    pub packets: u64,
    pub keyframes: u64,
    pub bytes: u64,
}

/// Converts captured frames to encoder input and appends every packet to `writer`
pub struct RecordingSink<E, W> {
    encoder: E,
    writer: W,
    params: CodecParams,
    options: ConvertOptions,
    cache: ConverterCache,
    scratch: Vec<u8>,
    stats: RecordingStats,
    ended: bool,
}

impl<E: VideoEncoder, W: Write> RecordingSink<E, W> {
    pub fn new(encoder: E, writer: W, params: CodecParams, options: ConvertOptions) -> Self {
        Self {
            encoder,
            writer,
            params,
            options,
            cache: ConverterCache::new(),
            scratch: vec![0; params.input_layout().required_len()],
            stats: RecordingStats::default(),
            ended: false,
        }
    }

    pub fn stats(&self) -> RecordingStats {
        self.stats
    }

    /// Encode one frame and write out whatever the encoder has ready
    pub fn record(&mut self, data: &[u8], source: SourceLayout) -> Result<()> {
        if self.ended {
            return Err(Error::InvalidState("encoder already reached end of stream"));
        }
        let started = Instant::now();
        let ctx = self.cache.get(source, self.params.input_layout(), self.options)?;
        ctx.convert(data, &mut self.scratch)?;
        self.encoder.push_frame(&self.scratch)?;
        self.stats.frames += 1;
        self.drain()?;
        metrics::histogram!("encode_time_us").record(started.elapsed().as_micros() as f64);
        Ok(())
    }

    /// Flush the encoder, write the tail of the stream and hand back the writer
    pub fn finish(mut self) -> Result<(W, RecordingStats)> {
        self.encoder.finish()?;
        while !self.ended {
            let before = self.stats.packets;
            self.drain()?;
            if !self.ended && self.stats.packets == before {
                warn!("Encoder stopped producing without signalling end of stream");
                break;
            }
        }
        self.writer.flush()?;
        info!(
            "Recorded {} frames into {} packets ({} bytes, {} keyframes)",
            self.stats.frames, self.stats.packets, self.stats.bytes, self.stats.keyframes
        );
        Ok((self.writer, self.stats))
    }

    fn drain(&mut self) -> Result<()> {
        loop {
            match self.encoder.pull_packet()? {
                EncoderOutput::Packet(packet) => {
                    self.writer.write_all(&packet.data)?;
                    self.stats.packets += 1;
                    self.stats.bytes += packet.data.len() as u64;
                    if packet.keyframe {
                        self.stats.keyframes += 1;
                    }
                    metrics::counter!("encoder_bytes_total").increment(packet.data.len() as u64);
                }
                EncoderOutput::NeedMoreInput => return Ok(()),
                EncoderOutput::EndOfStream => {
                    debug!("Encoder reached end of stream");
                    self.ended = true;
                    return Ok(());
                }
            }
        }
    }
}

impl<E: VideoEncoder, W: Write> FrameSink for RecordingSink<E, W> {
    fn deliver(&mut self, frame: &FrameView<'_>) -> Result<()> {
        self.record(frame.data, SourceLayout::from(&frame.meta))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Emits one packet per frame, holding the last one back until `finish`
    #[derive(Default)]
    struct FakeEncoder {
        pushed: Vec<usize>,
        ready: VecDeque<Packet>,
        held: Option<Packet>,
        finished: bool,
    }

    impl VideoEncoder for FakeEncoder {
        fn push_frame(&mut self, frame: &[u8]) -> Result<()> {
            let n = self.pushed.len() as u8;
            self.pushed.push(frame.len());
            let packet = Packet {
                data: Bytes::from(vec![n; 3]),
                pts: None,
                keyframe: n % 2 == 0,
            };
            if let Some(previous) = self.held.replace(packet) {
                self.ready.push_back(previous);
            }
            Ok(())
        }

        fn pull_packet(&mut self) -> Result<EncoderOutput> {
            Ok(match self.ready.pop_front() {
                Some(packet) => EncoderOutput::Packet(packet),
                None if self.finished => EncoderOutput::EndOfStream,
                None => EncoderOutput::NeedMoreInput,
            })
        }

        fn finish(&mut self) -> Result<()> {
            self.finished = true;
            self.ready.extend(self.held.take());
            Ok(())
        }
    }

    fn params() -> CodecParams {
        CodecParams::new(FrameGeometry::new(4, 2, PixelFormat::Yuyv), &CodecConfig::default())
    }

    #[test]
    fn test_params_from_config() {
        let p = params();
        assert_eq!((p.width, p.height, p.fps, p.gop), (4, 2, 25, 10));
        assert_eq!(p.frame_interval(), Duration::from_millis(40));
        assert_eq!(p.input_layout().required_len(), 4 * 2 + 2 * 2 * 1);
    }

    #[test]
    fn test_recording_writes_every_packet() {
        let mut sink = RecordingSink::new(FakeEncoder::default(), Vec::new(), params(), ConvertOptions::default());
        let frame = [128u8; 4 * 2 * 2];
        for _ in 0..3 {
            sink.record(&frame, SourceLayout::packed(4, 2, PixelFormat::Yuyv))
                .unwrap();
        }
        assert_eq!(sink.stats().packets, 2);

        let (written, stats) = sink.finish().unwrap();
        assert_eq!(written, vec![0, 0, 0, 1, 1, 1, 2, 2, 2]);
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.keyframes, 2);
        assert_eq!(stats.bytes, 9);
    }

    #[test]
    fn test_encoder_receives_planar_frames() {
        let mut sink = RecordingSink::new(FakeEncoder::default(), Vec::new(), params(), ConvertOptions::default());
        sink.record(&[16u8; 16], SourceLayout::packed(4, 2, PixelFormat::Yuyv))
            .unwrap();
        assert_eq!(sink.encoder.pushed, vec![12]);
    }

    #[test]
    fn test_short_frame_is_not_encoded() {
        let mut sink = RecordingSink::new(FakeEncoder::default(), Vec::new(), params(), ConvertOptions::default());
        let err = sink
            .record(&[0u8; 10], SourceLayout::packed(4, 2, PixelFormat::Yuyv))
            .unwrap_err();
        assert!(matches!(err, Error::ConversionGeometryMismatch(_)));
        assert!(sink.encoder.pushed.is_empty());
    }

    #[cfg(not(feature = "gstreamer-codec"))]
    #[test]
    fn test_codec_needs_the_feature() {
        assert!(matches!(open_encoder(Codec::H264, params()), Err(Error::Codec(_))));
        assert!(matches!(open_decoder(Codec::H264, params()), Err(Error::Codec(_))));
    }
}
