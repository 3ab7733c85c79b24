//! Dedicated capture thread feeding a frame sink

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use crate::capture::{BufferPool, CaptureDevice, CaptureLoop, CaptureStats, FrameSink, LoopSettings, V4l2Device};
use crate::error::{Error, Result};
use crate::utils;
use crate::CaptureConfig;

/// Open the configured node, or the first one offering the configured format
pub fn open_device(config: &CaptureConfig) -> Result<V4l2Device> {
    if !config.device.is_empty() {
        return V4l2Device::open(config);
    }
    let found = utils::auto_detect_device(config.format)?;
    info!("Using capture device {} ({})", found.path, found.card);
    V4l2Device::open(&CaptureConfig {
        device: found.path,
        ..config.clone()
    })
}

/// Set up the pool, then cycle frames into `sink` until stopped or limited.
///
/// A sink that reports its consumer gone after `stop` was raised ends the run
/// normally. With `settings.geometry` set, a device that negotiated anything
/// else is refused before a buffer is requested.
pub fn drive<D: CaptureDevice, S: FrameSink + ?Sized>(
    device: D,
    buffer_count: u32,
    settings: LoopSettings,
    sink: &mut S,
    stop: &AtomicBool,
    max_frames: Option<u64>,
) -> Result<CaptureStats> {
    if let Some(expected) = settings.geometry {
        let negotiated = device.format().geometry();
        if negotiated != expected {
            return Err(Error::DeviceUnsupported(format!(
                "device negotiated {}x{} {:?} but {}x{} {:?} is configured",
                negotiated.width,
                negotiated.height,
                negotiated.format,
                expected.width,
                expected.height,
                expected.format
            )));
        }
    }
    let pool = BufferPool::initialize(device, buffer_count)?;
    let mut capture = CaptureLoop::new(pool, settings);
    capture.start()?;

    let ran = match capture.run(sink, stop, max_frames) {
        Err(Error::ConnectionLost(reason)) if stop.load(Ordering::Relaxed) => {
            debug!("Consumer left during shutdown: {}", reason);
            Ok(())
        }
        ran => ran.map(|_| ()),
    };
    let stats = capture.shutdown();
    ran?;
    stats
}

/// Capture running on its own OS thread; it hands back the sink when done
pub struct CaptureThread<S> {
    handle: JoinHandle<(S, Result<CaptureStats>)>,
    stop: Arc<AtomicBool>,
}

impl<S: FrameSink + Send + 'static> CaptureThread<S> {
    pub fn spawn(config: CaptureConfig, max_frames: Option<u64>, mut sink: S) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                if let Some(id) = config.cpu_core {
                    if core_affinity::set_for_current(core_affinity::CoreId { id }) {
                        debug!("Capture thread pinned to core {}", id);
                    } else {
                        warn!("Failed to pin capture thread to core {}", id);
                    }
                }
                let result = open_device(&config).and_then(|device| {
                    drive(
                        device,
                        config.buffer_count,
                        LoopSettings::from(&config),
                        &mut sink,
                        &flag,
                        max_frames,
                    )
                });
                if let Err(e) = &result {
                    error!("Capture thread ending: {}", e);
                }
                // the handle keeps the sink alive until joined, so close it here
                sink.close();
                (sink, result)
            })?;
        Ok(Self { handle, stop })
    }
}

impl<S> CaptureThread<S> {
    /// Flag that ends the capture loop after its current cycle
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Wait for the thread; blocks
    pub fn join(self) -> Result<(S, CaptureStats)> {
        let (sink, result) = self
            .handle
            .join()
            .map_err(|_| Error::InvalidState("capture thread panicked"))?;
        Ok((sink, result?))
    }
}
