//! Run modes wiring capture, conversion, transport and codecs together

pub mod capture;
pub mod playback;

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::capture::{CaptureStats, ChannelSink, FrameSink};
use crate::codec::{self, Codec, CodecParams, RecordingSink};
use crate::display::{DisplaySink, FramebufferDisplay};
use crate::error::{Error, Result};
use crate::transport::{run_server, run_viewer};
use crate::{CaptureConfig, Config, DisplayConfig};

pub use capture::{drive, open_device, CaptureThread};
pub use playback::play_stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Capture and stream to one viewer at a time
    Serve,
    /// Connect to a server and show what it streams
    View,
    /// Capture straight to the local display
    Local,
    /// Capture into an H.264 file
    Record,
    /// Decode an H.264 file onto the display
    Play,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "serve" | "server" => Ok(Mode::Serve),
            "view" | "client" => Ok(Mode::View),
            "local" => Ok(Mode::Local),
            "record" => Ok(Mode::Record),
            "play" => Ok(Mode::Play),
            other => Err(Error::InvalidConfig(format!(
                "unknown mode {:?}; expected serve, view, local, record or play",
                other
            ))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Serve => "serve",
            Mode::View => "view",
            Mode::Local => "local",
            Mode::Record => "record",
            Mode::Play => "play",
        };
        f.write_str(name)
    }
}

pub async fn run(mode: Mode, config: Config) -> Result<()> {
    info!("Starting {} mode", mode);
    let started = Instant::now();
    match mode {
        Mode::Serve => serve(config).await?,
        Mode::View => view(config).await?,
        Mode::Local => local(config).await?,
        Mode::Record => record(config).await?,
        Mode::Play => play(config).await?,
    }
    info!("{} mode finished after {:?}", mode, started.elapsed());
    Ok(())
}

fn open_display(config: &DisplayConfig) -> Result<FramebufferDisplay> {
    let mut display = FramebufferDisplay::open(&config.device)?;
    if config.clear_on_open {
        display.clear();
    }
    Ok(display)
}

/// Wait for the capture thread, stopping it on Ctrl-C
async fn supervise<S: FrameSink + Send + 'static>(capture: CaptureThread<S>) -> Result<(S, CaptureStats)> {
    let stop = capture.stop_flag();
    let mut joined = tokio::task::spawn_blocking(move || capture.join());
    tokio::select! {
        result = &mut joined => {
            return result.map_err(|_| Error::InvalidState("capture join task failed"))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping capture");
            stop.store(true, Ordering::Relaxed);
        }
    }
    joined
        .await
        .map_err(|_| Error::InvalidState("capture join task failed"))?
}

/// Capture settings for modes whose consumer sizes frames from the
/// configuration rather than from the device
fn fixed_geometry(config: &CaptureConfig) -> CaptureConfig {
    CaptureConfig {
        strict_geometry: true,
        ..config.clone()
    }
}

fn report(stats: &CaptureStats) {
    info!(
        "Captured {} frames ({} timeouts, {} retries, {} short)",
        stats.frames, stats.timeouts, stats.transient_retries, stats.short_frames
    );
}

async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.transport.listen).await?;
    let (tx, rx) = flume::bounded(config.pipeline.channel_capacity);
    let capture = CaptureThread::spawn(
        fixed_geometry(&config.capture),
        config.pipeline.max_frames,
        ChannelSink::new(tx),
    )?;
    let stop = capture.stop_flag();

    // the capture thread closes the channel when it ends, which ends the server too
    let served = tokio::select! {
        served = run_server(listener, rx.clone(), config.transport.nodelay) => served,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing the server");
            Ok(())
        }
    };
    // raise the flag before the last receiver goes so capture ends cleanly
    stop.store(true, Ordering::Relaxed);
    drop(rx);

    let (_, stats) = tokio::task::spawn_blocking(move || capture.join())
        .await
        .map_err(|_| Error::InvalidState("capture join task failed"))??;
    report(&stats);
    served
}

async fn view(config: Config) -> Result<()> {
    let geometry = config.capture.geometry();
    let display = open_display(&config.display)?;
    let display_config = config.display.clone();
    let (tx, rx) = flume::bounded::<Bytes>(1);
    let display_thread = std::thread::Builder::new()
        .name("display".into())
        .spawn(move || DisplaySink::new(display, &display_config).run(rx, geometry))?;

    let server = config.transport.server;
    let stream = TcpStream::connect(server)
        .await
        .map_err(|e| Error::ConnectionLost(format!("cannot connect to {}: {}", server, e)))?;
    if let Err(e) = stream.set_nodelay(config.transport.nodelay) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    info!("Connected to {}", server);

    let input = tokio::io::BufReader::new(tokio::io::stdin());
    let received = tokio::select! {
        received = run_viewer(stream, input, geometry, tx, config.transport.autostart) => received?,
        _ = tokio::signal::ctrl_c() => {
            // the display thread ends with the process
            info!("Interrupted");
            return Ok(());
        }
    };

    let shown = tokio::task::spawn_blocking(move || display_thread.join())
        .await
        .map_err(|_| Error::InvalidState("display join task failed"))?
        .map_err(|_| Error::InvalidState("display thread panicked"))??;
    info!("Received {} frames, displayed {}", received, shown);
    Ok(())
}

async fn local(config: Config) -> Result<()> {
    let sink = DisplaySink::new(open_display(&config.display)?, &config.display);
    let capture = CaptureThread::spawn(config.capture.clone(), config.pipeline.max_frames, sink)?;
    let (sink, stats) = supervise(capture).await?;
    report(&stats);
    info!("Displayed {} frames", sink.presented());
    Ok(())
}

async fn record(config: Config) -> Result<()> {
    let params = CodecParams::new(config.capture.geometry(), &config.codec);
    let encoder = codec::open_encoder(Codec::H264, params)?;
    let output = &config.codec.output;
    let file = File::create(output)
        .map_err(|e| Error::InvalidConfig(format!("cannot create {}: {}", output.display(), e)))?;
    let sink = RecordingSink::new(encoder, BufWriter::new(file), params, config.display.convert);

    let limit = config.pipeline.max_frames.or(Some(config.codec.frames)).filter(|&n| n > 0);
    info!("Recording {:?} frames to {}", limit, output.display());
    let capture = CaptureThread::spawn(fixed_geometry(&config.capture), limit, sink)?;
    let (sink, stats) = supervise(capture).await?;
    report(&stats);

    let (_, recorded) = tokio::task::spawn_blocking(move || sink.finish())
        .await
        .map_err(|_| Error::InvalidState("encoder flush task failed"))??;
    info!(
        "Wrote {} bytes of H.264 to {}",
        recorded.bytes,
        output.display()
    );
    Ok(())
}

async fn play(config: Config) -> Result<()> {
    let params = CodecParams::new(config.capture.geometry(), &config.codec);
    let decoder = codec::open_decoder(Codec::H264, params)?;
    let input = &config.codec.output;
    let file = File::open(input)
        .map_err(|e| Error::InvalidConfig(format!("cannot open {}: {}", input.display(), e)))?;
    let mut sink = DisplaySink::new(open_display(&config.display)?, &config.display);

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let mut playing = tokio::task::spawn_blocking(move || {
        play_stream(
            BufReader::new(file),
            decoder,
            &mut sink,
            params.output_geometry(),
            params.frame_interval(),
            &flag,
        )
    });

    let shown = tokio::select! {
        result = &mut playing => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping playback");
            stop.store(true, Ordering::Relaxed);
            playing.await
        }
    }
    .map_err(|_| Error::InvalidState("playback task failed"))??;
    info!("Played {} frames from {}", shown, input.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streamed_capture_requires_configured_geometry() {
        let relaxed = CaptureConfig {
            strict_geometry: false,
            ..CaptureConfig::default()
        };
        let fixed = fixed_geometry(&relaxed);
        assert!(fixed.strict_geometry);
        assert_eq!(fixed.geometry(), relaxed.geometry());
    }

    #[test]
    fn test_mode_names() {
        for mode in [Mode::Serve, Mode::View, Mode::Local, Mode::Record, Mode::Play] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
        assert_eq!("server".parse::<Mode>().unwrap(), Mode::Serve);
        assert_eq!("client".parse::<Mode>().unwrap(), Mode::View);
        assert!(matches!("stream".parse::<Mode>(), Err(Error::InvalidConfig(_))));
    }
}
