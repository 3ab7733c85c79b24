//! Dequeue → deliver → requeue cycle over a buffer pool

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use crate::capture::device::{CaptureDevice, DeviceFormat};
use crate::capture::frame::{Frame, FrameGeometry, FrameMetadata, FrameView};
use crate::capture::pacer::FramePacer;
use crate::capture::pool::{BufferLease, BufferPool};
use crate::error::{Error, Result};
use crate::CaptureConfig;

/// Consumer of captured frames.
///
/// `deliver` runs while the buffer is still leased from the driver; the
/// buffer is requeued as soon as it returns, whether it succeeded or not.
pub trait FrameSink {
    fn deliver(&mut self, frame: &FrameView<'_>) -> Result<()>;

    /// Called once capture has ended, successfully or not; after this the
    /// consumer sees no more frames
    fn close(&mut self) {}
}

impl<F> FrameSink for F
where
    F: FnMut(&FrameView<'_>) -> Result<()>,
{
    fn deliver(&mut self, frame: &FrameView<'_>) -> Result<()> {
        self(frame)
    }
}

/// Copies each frame out of the pool and forwards it over a bounded channel.
///
/// A full channel blocks the capture thread, so a slow consumer shows up as
/// buffer-pool starvation at the device rather than as dropped frames.
/// Closing the sink drops its sender, which disconnects the receiving side.
pub struct ChannelSink {
    tx: Option<flume::Sender<Frame>>,
}

impl ChannelSink {
    pub fn new(tx: flume::Sender<Frame>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

impl FrameSink for ChannelSink {
    fn deliver(&mut self, frame: &FrameView<'_>) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(Error::ConnectionLost("frame channel closed".into()));
        };
        tx.send(frame.to_frame())
            .map_err(|_| Error::ConnectionLost("frame channel closed".into()))
    }

    fn close(&mut self) {
        if self.tx.take().is_some() {
            debug!("Frame channel closed by capture");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Uninitialized,
    Streaming,
    Stopped,
}

/// Timing and retry policy of the loop
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Bound on each wait-for-readable
    pub timeout: Duration,
    /// "No data yet" retries absorbed within one cycle
    pub max_transient_retries: u32,
    /// Consecutive timeouts tolerated by [`CaptureLoop::run`], 0 retries forever
    pub max_consecutive_timeouts: u32,
    /// Pacing rate overriding the device's frame interval, `Some(0)` disables pacing
    pub fps_override: Option<u32>,
    /// Geometry the device has to deliver, `None` accepts whatever it negotiated
    pub geometry: Option<FrameGeometry>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_transient_retries: 5,
            max_consecutive_timeouts: 3,
            fps_override: None,
            geometry: None,
        }
    }
}

impl From<&CaptureConfig> for LoopSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            max_transient_retries: config.max_transient_retries,
            max_consecutive_timeouts: config.max_consecutive_timeouts,
            fps_override: config.pace_fps,
            geometry: config.strict_geometry.then(|| config.geometry()),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub timeouts: u64,
    pub transient_retries: u64,
    pub short_frames: u64,
}

/// Single-threaded capture driver; the only user of its buffer pool
pub struct CaptureLoop<D: CaptureDevice> {
    pool: BufferPool<D>,
    format: DeviceFormat,
    settings: LoopSettings,
    pacer: FramePacer,
    state: LoopState,
    sequence: u64,
    stats: CaptureStats,
}

impl<D: CaptureDevice> CaptureLoop<D> {
    pub fn new(pool: BufferPool<D>, settings: LoopSettings) -> Self {
        let format = pool.device().format();
        let pacer = FramePacer::for_device(&format, settings.fps_override);
        Self {
            pool,
            format,
            settings,
            pacer,
            state: LoopState::Uninitialized,
            sequence: 0,
            stats: CaptureStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn format(&self) -> &DeviceFormat {
        &self.format
    }

    pub fn pool(&self) -> &BufferPool<D> {
        &self.pool
    }

    /// Queue every buffer and turn the stream on
    pub fn start(&mut self) -> Result<()> {
        if self.state == LoopState::Streaming {
            return Err(Error::InvalidState("capture loop is already streaming"));
        }
        self.pool.enqueue_all()?;
        self.pool.start_streaming()?;
        self.state = LoopState::Streaming;
        info!(
            "Capturing {}x{} {:?}",
            self.format.width, self.format.height, self.format.format
        );
        Ok(())
    }

    /// Run one wait → dequeue → deliver → requeue cycle, then pace
    pub fn cycle<S: FrameSink + ?Sized>(&mut self, sink: &mut S) -> Result<()> {
        if self.state != LoopState::Streaming {
            return Err(Error::InvalidState("capture loop is not streaming"));
        }
        self.pacer.begin();
        let lease = self.dequeue_with_retry()?;

        let expected = self.format.frame_len();
        if lease.bytes_used() < expected {
            warn!(
                "Short frame from buffer {}: {} of {} bytes",
                lease.index(),
                lease.bytes_used(),
                expected
            );
            self.stats.short_frames += 1;
            metrics::counter!("capture_short_frames_total").increment(1);
            return self.pool.requeue(lease);
        }

        self.sequence += 1;
        let started = Instant::now();
        let delivered = {
            let view = FrameView {
                data: &self.pool.bytes(&lease)[..expected],
                meta: self.metadata(&lease),
                timestamp: started,
            };
            sink.deliver(&view)
        };
        let requeued = self.pool.requeue(lease);
        metrics::histogram!("capture_deliver_time_us").record(started.elapsed().as_micros() as f64);
        delivered?;
        requeued?;

        self.stats.frames += 1;
        metrics::counter!("capture_frames_total").increment(1);
        self.pacer.wait();
        Ok(())
    }

    /// Cycle until `stop` is raised, `max_frames` are delivered, or a fatal
    /// error occurs. Returns the number of frames delivered by this call.
    #[instrument(skip(self, sink, stop))]
    pub fn run<S: FrameSink + ?Sized>(
        &mut self,
        sink: &mut S,
        stop: &AtomicBool,
        max_frames: Option<u64>,
    ) -> Result<u64> {
        let first = self.stats.frames;
        let mut timeouts = 0u32;
        while !stop.load(Ordering::Relaxed) {
            if max_frames.is_some_and(|max| self.stats.frames - first >= max) {
                break;
            }
            match self.cycle(sink) {
                Ok(()) => timeouts = 0,
                Err(Error::Timeout(after)) => {
                    timeouts += 1;
                    let limit = self.settings.max_consecutive_timeouts;
                    if limit != 0 && timeouts >= limit {
                        error!("Device stalled: {} consecutive timeouts", timeouts);
                        return Err(Error::Timeout(after));
                    }
                    warn!("Select timeout after {:?}, retrying", after);
                }
                Err(e) => {
                    error!("Capture failed: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(self.stats.frames - first)
    }

    /// Cease dequeuing and issue a single stream-off
    pub fn stop(&mut self) -> Result<()> {
        if self.state != LoopState::Streaming {
            return Ok(());
        }
        self.state = LoopState::Stopped;
        self.pool.stop_streaming()
    }

    /// Stop if streaming, then unmap and release every buffer
    pub fn shutdown(mut self) -> Result<CaptureStats> {
        let stopped = self.stop();
        let released = self.pool.teardown();
        stopped?;
        released?;
        info!("Capture loop finished: {:?}", self.stats);
        Ok(self.stats.clone())
    }

    fn dequeue_with_retry(&mut self) -> Result<BufferLease> {
        let mut retries = 0;
        loop {
            match self.pool.dequeue_next(self.settings.timeout) {
                Err(Error::TransientUnavailable) if retries < self.settings.max_transient_retries => {
                    retries += 1;
                    self.stats.transient_retries += 1;
                    metrics::counter!("capture_transient_retries_total").increment(1);
                    debug!("No data ready, retry {}", retries);
                }
                Err(Error::Timeout(after)) => {
                    self.stats.timeouts += 1;
                    metrics::counter!("capture_timeouts_total").increment(1);
                    return Err(Error::Timeout(after));
                }
                other => return other,
            }
        }
    }

    fn metadata(&self, lease: &BufferLease) -> FrameMetadata {
        FrameMetadata {
            sequence: self.sequence,
            width: self.format.width,
            height: self.format.height,
            stride: self.format.stride() as u32,
            format: self.format.format,
            bytes_used: lease.bytes_used(),
            device_timestamp: lease.timestamp(),
        }
    }
}
