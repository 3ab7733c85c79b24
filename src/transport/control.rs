//! Start/stop flow control

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A command travelling from viewer to server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
}

impl ControlCommand {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'1' => Some(ControlCommand::Start),
            b'2' => Some(ControlCommand::Stop),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            ControlCommand::Start => b'1',
            ControlCommand::Stop => b'2',
        }
    }
}

/// Commands in a chunk of control bytes, in order.
///
/// ASCII whitespace is ignored; anything else unrecognised is logged and skipped.
pub fn parse_commands(bytes: &[u8]) -> impl Iterator<Item = ControlCommand> + '_ {
    bytes.iter().filter_map(|&byte| {
        if byte.is_ascii_whitespace() {
            return None;
        }
        let command = ControlCommand::from_byte(byte);
        if command.is_none() {
            warn!("Ignoring unknown control byte 0x{:02x}", byte);
        }
        command
    })
}

/// Streaming-enabled flag shared by a session's control and data paths
#[derive(Debug, Clone, Default)]
pub struct StreamControl {
    enabled: Arc<AtomicBool>,
}

impl StreamControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Apply a command, returning whether the flag changed
    pub fn apply(&self, command: ControlCommand) -> bool {
        let enable = command == ControlCommand::Start;
        self.enabled.swap(enable, Ordering::AcqRel) != enable
    }
}

/// Apply control bytes from `reader` until the peer closes its side
pub async fn listen_for_commands<R>(mut reader: R, control: StreamControl) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 64];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| Error::ConnectionLost(format!("control read failed: {}", e)))?;
        if n == 0 {
            debug!("Control stream closed by peer");
            return Ok(());
        }
        for command in parse_commands(&buf[..n]) {
            if control.apply(command) {
                info!("Streaming {}", if control.is_enabled() { "started" } else { "stopped" });
            }
            metrics::counter!("transport_control_commands_total").increment(1);
        }
    }
}
