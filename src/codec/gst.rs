//! GStreamer-backed H.264 encoder and decoder

use std::time::Duration;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::codec::{Codec, CodecParams, DecoderOutput, EncoderOutput, Packet, VideoDecoder, VideoEncoder};
use crate::error::{Error, Result};

/// appsrc → element chain → appsink, driven from Rust
struct AppPipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    pushed: u64,
    interval: Duration,
    finished: bool,
}

impl AppPipeline {
    fn launch(description: &str, interval: Duration) -> Result<Self> {
        gst::init().map_err(|e| Error::Codec(format!("failed to initialize GStreamer: {}", e)))?;
        info!("Pipeline: {}", description);

        let pipeline = gst::parse::launch(description)
            .map_err(|e| Error::Codec(format!("invalid pipeline: {}", e)))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::Codec("failed to create pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| Error::Codec("failed to find appsrc".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| Error::Codec("failed to cast to AppSrc".into()))?;
        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| Error::Codec("failed to find appsink".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| Error::Codec("failed to cast to AppSink".into()))?;

        appsrc.set_property("format", gst::Format::Time);
        appsink.set_property("emit-signals", false);
        appsink.set_property("sync", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| Error::Codec(format!("failed to start pipeline: {:?}", e)))?;

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            pushed: 0,
            interval,
            finished: false,
        })
    }

    fn push(&mut self, data: &[u8], timed: bool) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidState("push after end of stream"));
        }
        self.check_bus()?;

        let mut buffer = gst::Buffer::with_size(data.len())
            .map_err(|_| Error::Codec("failed to allocate buffer".into()))?;
        {
            let buffer_ref = buffer.make_mut();
            buffer_ref
                .copy_from_slice(0, data)
                .map_err(|_| Error::Codec("failed to copy data to buffer".into()))?;
            if timed {
                let pts = self.interval * self.pushed as u32;
                buffer_ref.set_pts(gst::ClockTime::from_nseconds(pts.as_nanos() as u64));
                buffer_ref.set_duration(gst::ClockTime::from_nseconds(self.interval.as_nanos() as u64));
            }
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| Error::Codec(format!("failed to push buffer: {:?}", e)))?;
        self.pushed += 1;
        Ok(())
    }

    /// Next output sample; blocks only once input has ended
    fn pull(&mut self) -> Result<Option<gst::Sample>> {
        self.check_bus()?;
        if self.finished {
            return Ok(self.appsink.pull_sample().ok());
        }
        Ok(self.appsink.try_pull_sample(gst::ClockTime::ZERO))
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.appsrc
            .end_of_stream()
            .map_err(|e| Error::Codec(format!("failed to signal end of stream: {:?}", e)))?;
        debug!("End of stream after {} buffers", self.pushed);
        Ok(())
    }

    fn is_eos(&self) -> bool {
        self.finished || self.appsink.is_eos()
    }

    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Warning]) {
            use gst::MessageView;

            match msg.view() {
                MessageView::Error(err) => {
                    return Err(Error::Codec(format!(
                        "pipeline error: {} ({})",
                        err.error(),
                        err.debug().unwrap_or_default()
                    )));
                }
                MessageView::Warning(w) => warn!("Pipeline warning: {}", w.error()),
                _ => {}
            }
        }
        Ok(())
    }
}

impl Drop for AppPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            debug!("Failed to stop pipeline: {:?}", e);
        }
    }
}

/// H.264 encoder: I420 frames in, Annex B access units out
pub struct GstEncoder {
    inner: AppPipeline,
}

impl GstEncoder {
    pub fn new(codec: Codec, params: CodecParams) -> Result<Self> {
        let Codec::H264 = codec;
        let encoder = detect_element(&["v4l2h264enc", "x264enc"])
            .ok_or_else(|| Error::Codec("no H.264 encoder element available".into()))?;
        let settings = match encoder {
            "x264enc" => format!(
                "x264enc bitrate={} key-int-max={} tune=zerolatency speed-preset=ultrafast",
                (params.bitrate / 1000).max(1),
                params.gop
            ),
            _ => format!(
                "v4l2h264enc extra-controls=\"controls,video_bitrate={},h264_i_frame_period={}\"",
                params.bitrate, params.gop
            ),
        };
        let description = format!(
            "appsrc name=src caps=video/x-raw,format=I420,width={w},height={h},framerate={fps}/1 ! \
             videoconvert ! \
             {settings} ! \
             h264parse config-interval=-1 ! \
             video/x-h264,stream-format=byte-stream,alignment=au ! \
             appsink name=sink",
            w = params.width,
            h = params.height,
            fps = params.fps,
            settings = settings,
        );
        Ok(Self {
            inner: AppPipeline::launch(&description, params.frame_interval())?,
        })
    }
}

impl VideoEncoder for GstEncoder {
    fn push_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.inner.push(frame, true)
    }

    fn pull_packet(&mut self) -> Result<EncoderOutput> {
        let Some(sample) = self.inner.pull()? else {
            if self.inner.is_eos() {
                return Ok(EncoderOutput::EndOfStream);
            }
            return Ok(EncoderOutput::NeedMoreInput);
        };
        let buffer = sample
            .buffer()
            .ok_or_else(|| Error::Codec("sample contains no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| Error::Codec("failed to map buffer".into()))?;

        Ok(EncoderOutput::Packet(Packet {
            data: Bytes::copy_from_slice(map.as_slice()),
            pts: buffer.pts().map(|pts| Duration::from_nanos(pts.nseconds())),
            keyframe: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
        }))
    }

    fn finish(&mut self) -> Result<()> {
        self.inner.finish()
    }
}

/// H.264 decoder: elementary stream in, packed YUYV frames of the configured size out
pub struct GstDecoder {
    inner: AppPipeline,
    width: u32,
    height: u32,
}

impl GstDecoder {
    pub fn new(codec: Codec, params: CodecParams) -> Result<Self> {
        let Codec::H264 = codec;
        let decoder = detect_element(&["v4l2h264dec", "avdec_h264", "openh264dec"])
            .ok_or_else(|| Error::Codec("no H.264 decoder element available".into()))?;
        let description = format!(
            "appsrc name=src caps=video/x-h264,stream-format=byte-stream ! \
             h264parse ! \
             {decoder} ! \
             videoconvert ! \
             videoscale ! \
             video/x-raw,format=YUY2,width={w},height={h} ! \
             appsink name=sink",
            decoder = decoder,
            w = params.width,
            h = params.height,
        );
        let inner = AppPipeline::launch(&description, params.frame_interval())?;
        inner.appsrc.set_property("format", gst::Format::Bytes);
        Ok(Self {
            inner,
            width: params.width,
            height: params.height,
        })
    }
}

impl VideoDecoder for GstDecoder {
    fn push_packet(&mut self, data: &[u8]) -> Result<()> {
        self.inner.push(data, false)
    }

    fn pull_frame(&mut self) -> Result<DecoderOutput> {
        let Some(sample) = self.inner.pull()? else {
            if self.inner.is_eos() {
                return Ok(DecoderOutput::EndOfStream);
            }
            return Ok(DecoderOutput::NeedMoreInput);
        };
        let buffer = sample
            .buffer()
            .ok_or_else(|| Error::Codec("sample contains no buffer".into()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| Error::Codec("sample has no caps".into()))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| Error::Codec("failed to parse video info from caps".into()))?;
        if video_info.width() != self.width || video_info.height() != self.height {
            return Err(Error::ConversionGeometryMismatch(format!(
                "decoder produced {}x{}, expected {}x{}",
                video_info.width(),
                video_info.height(),
                self.width,
                self.height
            )));
        }
        let map = buffer
            .map_readable()
            .map_err(|_| Error::Codec("failed to map buffer".into()))?;

        let row = self.width as usize * 2;
        let stride = video_info.stride()[0] as usize;
        let rows = self.height as usize;
        if stride < row || map.size() < stride * (rows - 1) + row {
            return Err(Error::ConversionGeometryMismatch(format!(
                "decoded buffer holds {} bytes with stride {}",
                map.size(),
                stride
            )));
        }
        let data = if stride == row {
            Bytes::copy_from_slice(&map.as_slice()[..row * rows])
        } else {
            let mut packed = Vec::with_capacity(row * rows);
            for line in map.as_slice().chunks(stride).take(rows) {
                packed.extend_from_slice(&line[..row]);
            }
            Bytes::from(packed)
        };
        Ok(DecoderOutput::Frame(data))
    }

    fn finish(&mut self) -> Result<()> {
        self.inner.finish()
    }
}

/// First element factory present on this system, in order of preference
fn detect_element(candidates: &[&'static str]) -> Option<&'static str> {
    for name in candidates {
        if let Some(factory) = gst::ElementFactory::find(name) {
            debug!("Found {} - {}", name, factory.metadata("long-name").unwrap_or(""));
            return Some(*name);
        }
    }
    None
}
