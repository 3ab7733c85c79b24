pub mod capture;
pub mod codec;
pub mod convert;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod transport;
pub mod utils;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use capture::frame::{Frame, FrameGeometry, FrameMetadata, PixelFormat};
pub use error::{Error, Result};

use crate::convert::{ConvertOptions, ExcessColumns, RowOrder};

/// Prefix of environment overrides, e.g. `FRAMECAST__CAPTURE__WIDTH=640`
pub const ENV_PREFIX: &str = "FRAMECAST";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
    pub transport: TransportConfig,
    pub pipeline: PipelineConfig,
    pub codec: CodecConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node, empty to auto-detect
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Frame rate requested from the driver, `None` keeps its default
    pub fps: Option<u32>,
    pub buffer_count: u32,
    /// Bound on each wait for a filled buffer
    pub timeout_ms: u64,
    pub max_transient_retries: u32,
    pub max_consecutive_timeouts: u32,
    /// Pacing override; `Some(0)` turns pacing off
    pub pace_fps: Option<u32>,
    /// Pin the capture thread to this core
    pub cpu_core: Option<usize>,
    /// Refuse to capture when the driver adjusts width or height
    pub strict_geometry: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Framebuffer device
    pub device: String,
    pub excess_columns: ExcessColumns,
    pub row_order: RowOrder,
    pub convert: ConvertOptions,
    /// Blank the screen when the display opens
    pub clear_on_open: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address the server listens on
    pub listen: SocketAddr,
    /// Server the viewer connects to
    pub server: SocketAddr,
    pub nodelay: bool,
    /// Send "1" as soon as the viewer connects
    pub autostart: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames buffered between capture and its consumer
    pub channel_capacity: usize,
    /// Stop after this many frames
    pub max_frames: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Bits per second
    pub bitrate: u32,
    /// Keyframe interval in frames
    pub gop: u32,
    pub fps: u32,
    /// H.264 elementary stream written by `record`
    pub output: PathBuf,
    /// Frames `record` captures before finishing
    pub frames: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 800,
            height: 600,
            format: PixelFormat::Yuyv,
            fps: None,
            buffer_count: 4,
            timeout_ms: 2000,
            max_transient_retries: 5,
            max_consecutive_timeouts: 3,
            pace_fps: None,
            cpu_core: None,
            strict_geometry: true,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            device: "/dev/fb0".into(),
            excess_columns: ExcessColumns::Skip,
            row_order: RowOrder::TopDown,
            convert: ConvertOptions::default(),
            clear_on_open: true,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5100)),
            server: SocketAddr::from(([127, 0, 0, 1], 5100)),
            nodelay: true,
            autostart: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 4,
            max_frames: None,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            bitrate: 400_000,
            gop: 10,
            fps: 25,
            output: PathBuf::from("output.h264"),
            frames: 500,
        }
    }
}

impl CaptureConfig {
    /// Geometry of one captured frame as sent on the wire
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.width, self.height, self.format)
    }
}

impl Config {
    /// Defaults, overlaid with `path` (if given) and then `FRAMECAST__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        debug!("Configuration: {:?}", config);
        Ok(config)
    }

    /// Reject settings no component can run with
    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "capture geometry {}x{} is empty",
                capture.width, capture.height
            )));
        }
        if capture.format == PixelFormat::Yuyv && capture.width % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "packed 4:2:2 capture needs an even width, got {}",
                capture.width
            )));
        }
        if capture.buffer_count < capture::pool::MIN_BUFFERS {
            return Err(Error::InvalidConfig(format!(
                "buffer_count must be at least {}",
                capture::pool::MIN_BUFFERS
            )));
        }
        if capture.timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeout_ms must be positive".into()));
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "channel_capacity must be positive".into(),
            ));
        }
        let codec = &self.codec;
        if codec.fps == 0 || codec.gop == 0 || codec.bitrate == 0 {
            return Err(Error::InvalidConfig(
                "codec fps, gop and bitrate must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.capture.geometry().frame_size(), 800 * 600 * 2);
        assert_eq!(config.transport.listen.port(), 5100);
        assert_eq!(config.capture.timeout_ms, 2000);
        assert!(config.capture.strict_geometry);
        assert_eq!(config.codec.gop, 10);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[capture]
device = "/dev/video2"
width = 640
height = 480
pace_fps = 0
strict_geometry = false

[display]
excess_columns = "clear"
row_order = "bottom-up"

[display.convert]
coefficients = "bt601-full"

[transport]
server = "192.168.0.7:5100"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.capture.device, "/dev/video2");
        assert_eq!(config.capture.width, 640);
        assert_eq!(config.capture.pace_fps, Some(0));
        assert!(!config.capture.strict_geometry);
        assert_eq!(config.capture.buffer_count, 4);
        assert_eq!(config.display.excess_columns, ExcessColumns::Clear);
        assert_eq!(config.display.row_order, RowOrder::BottomUp);
        assert_eq!(
            config.display.convert.coefficients,
            convert::Coefficients::Bt601Full
        );
        assert_eq!(config.transport.server, SocketAddr::from(([192, 168, 0, 7], 5100)));
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[capture]\nwidth = 801").unwrap();
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(Error::InvalidConfig(_))
        ));

        let missing = Path::new("/nonexistent/framecast.toml");
        assert!(matches!(Config::load(Some(missing)), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_single_buffer() {
        let mut config = Config::default();
        config.capture.buffer_count = 1;
        assert!(config.validate().is_err());
    }
}
