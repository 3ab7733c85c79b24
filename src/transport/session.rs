//! Server and viewer ends of a streaming session

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::capture::frame::{Frame, FrameGeometry};
use crate::error::{Error, Result};
use crate::transport::control::{listen_for_commands, ControlCommand, StreamControl};
use crate::transport::receiver::FrameReceiver;
use crate::transport::sender::{FrameSender, SenderStats};

/// Serve one viewer: a spawned task applies its control bytes while this task
/// forwards frames. Ends when the viewer disconnects, a write fails, or the
/// frame channel closes. A frame already on the wire is always finished first.
pub async fn serve_session<S>(
    stream: S,
    frames: &flume::Receiver<Frame>,
    control: StreamControl,
) -> Result<SenderStats>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let hangup = Arc::new(Notify::new());
    let control_task = tokio::spawn({
        let control = control.clone();
        let hangup = hangup.clone();
        async move {
            let listened = listen_for_commands(reader, control.clone()).await;
            control.disable();
            hangup.notify_one();
            listened
        }
    });
    let mut sender = FrameSender::new(writer);

    let forwarded = sender.forward(frames, &control, &hangup).await;
    // a listener that already returned keeps its result
    control_task.abort();
    let result = match control_task.await {
        Ok(Ok(())) => {
            info!("Viewer disconnected");
            forwarded
        }
        Ok(Err(e)) => forwarded.and(Err(e)),
        Err(e) if e.is_cancelled() => forwarded,
        Err(e) => forwarded.and(Err(Error::ConnectionLost(format!("control task failed: {}", e)))),
    };

    control.disable();
    let mut writer = sender.into_inner();
    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown after session: {}", e);
    }
    result
}

/// Accept viewers one at a time until the frame channel closes.
///
/// Frames captured while no viewer is connected are drained and discarded.
#[instrument(skip(listener, frames, nodelay))]
pub async fn run_server(listener: TcpListener, frames: flume::Receiver<Frame>, nodelay: bool) -> Result<()> {
    info!("Waiting for viewers on {}", listener.local_addr()?);
    let mut drained = 0u64;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                if let Err(e) = stream.set_nodelay(nodelay) {
                    warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                }
                info!("Viewer {} connected", peer);
                let started = Instant::now();
                match serve_session(stream, &frames, StreamControl::new()).await {
                    Ok(stats) => info!(
                        "Session with {} ended after {:?}: {} frames sent, {} dropped",
                        peer, started.elapsed(), stats.frames_sent, stats.frames_dropped
                    ),
                    Err(e) => warn!("Session with {} failed: {}", peer, e),
                }
                if frames.is_disconnected() && frames.is_empty() {
                    break;
                }
            }
            frame = frames.recv_async() => match frame {
                Ok(_) => {
                    drained += 1;
                    metrics::counter!("transport_frames_drained_total").increment(1);
                }
                Err(_) => break,
            },
        }
    }
    info!("Capture ended; {} frames drained without a viewer", drained);
    Ok(())
}

/// What the operator typed on the viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorInput {
    Command(ControlCommand),
    Quit,
}

impl OperatorInput {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "1" => Some(OperatorInput::Command(ControlCommand::Start)),
            "2" => Some(OperatorInput::Command(ControlCommand::Stop)),
            "q" | "quit" => Some(OperatorInput::Quit),
            _ => None,
        }
    }
}

/// Run the viewer end: operator lines from `input` become control bytes while a
/// spawned task reassembles frames of `geometry` and hands them to `frames`.
/// Returns the number of frames received.
pub async fn run_viewer<S, I>(
    stream: S,
    mut input: I,
    geometry: FrameGeometry,
    frames: flume::Sender<Bytes>,
    autostart: bool,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    I: AsyncBufRead + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let frame_size = geometry.frame_size();
    let received = Arc::new(AtomicU64::new(0));
    let counter = received.clone();
    let mut receive_task = tokio::spawn(async move {
        let mut receiver = FrameReceiver::new(reader);
        loop {
            let frame = receiver.recv_frame(frame_size).await?;
            if frames.send_async(frame).await.is_err() {
                return Ok::<(), Error>(());
            }
            counter.fetch_add(1, Ordering::Relaxed);
        }
    });

    if autostart {
        send_command(&mut writer, ControlCommand::Start).await?;
    }
    info!("Enter 1 to stream, 2 to pause, q to quit");

    let mut line = String::new();
    let outcome = loop {
        line.clear();
        tokio::select! {
            read = input.read_line(&mut line) => {
                match read {
                    Ok(0) => break Ok(()),
                    Ok(_) => {}
                    Err(e) => break Err(Error::Io(e)),
                }
                match OperatorInput::parse(&line) {
                    Some(OperatorInput::Command(command)) => {
                        if let Err(e) = send_command(&mut writer, command).await {
                            break Err(e);
                        }
                    }
                    Some(OperatorInput::Quit) => break Ok(()),
                    None => warn!("Unknown input {:?}; enter 1, 2 or q", line.trim()),
                }
            }
            finished = &mut receive_task => {
                let count = received.load(Ordering::Relaxed);
                return match finished {
                    Ok(Ok(())) => Ok(count),
                    Ok(Err(Error::ConnectionLost(reason))) => {
                        info!("Server closed the stream after {} frames: {}", count, reason);
                        Ok(count)
                    }
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(Error::ConnectionLost(format!("receive task failed: {}", e))),
                };
            }
        }
    };

    // tell the server to stop before hanging up
    if let Err(e) = send_command(&mut writer, ControlCommand::Stop).await {
        debug!("Stop on exit not delivered: {}", e);
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown on exit: {}", e);
    }
    receive_task.abort();
    outcome.map(|()| received.load(Ordering::Relaxed))
}

async fn send_command<W: AsyncWrite + Unpin>(writer: &mut W, command: ControlCommand) -> Result<()> {
    writer
        .write_all(&[command.as_byte()])
        .await
        .map_err(|e| Error::ConnectionLost(format!("control write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::ConnectionLost(format!("control flush failed: {}", e)))?;
    debug!("Sent {:?}", command);
    Ok(())
}
