use std::time::Duration;

use thiserror::Error;

/// Errors raised by the capture, conversion and transport layers
#[derive(Error, Debug)]
pub enum Error {
    #[error("device does not support memory-mapped streaming: {0}")]
    DeviceUnsupported(String),

    #[error("insufficient buffer memory: driver granted {granted} buffers, need at least {required}")]
    AllocationFailure { granted: u32, required: u32 },

    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("no data ready yet")]
    TransientUnavailable,

    #[error("device error during {op}: {source}")]
    DeviceError {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("conversion geometry mismatch: {0}")]
    ConversionGeometryMismatch(String),

    #[error("buffer {index} ownership violation: {reason}")]
    BufferOwnership { index: u32, reason: &'static str },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("display error: {0}")]
    Display(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps an OS error raised by a device operation
    pub fn device(op: &'static str, source: std::io::Error) -> Self {
        Error::DeviceError { op, source }
    }

    /// Retryable conditions the capture loop absorbs before escalating
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::TransientUnavailable)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout(Duration::from_secs(2)).is_retryable());
        assert!(Error::TransientUnavailable.is_retryable());
        assert!(!Error::ConnectionLost("reset".into()).is_retryable());
        assert!(!Error::device("VIDIOC_DQBUF", std::io::Error::from_raw_os_error(libc::EIO)).is_retryable());
    }
}
