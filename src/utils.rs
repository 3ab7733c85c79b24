use std::path::Path;

use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;
use crate::error::{Error, Result};

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    pub format: PixelFormat,
}

/// Find the first streaming capture node offering `format`
pub fn auto_detect_device(format: PixelFormat) -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");
    let wanted = FourCC::new(&format.fourcc());

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            debug!("Skipping {}: cannot open", path);
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE | Flags::STREAMING) {
            continue;
        }
        if let Ok(formats) = dev.enum_formats() {
            if formats.iter().any(|fmt| fmt.fourcc == wanted) {
                info!("Found {:?} device: {} - {}", format, path, caps.card);
                return Ok(FoundDevice {
                    path,
                    card: caps.card,
                    format,
                });
            }
        }
    }

    Err(Error::DeviceUnsupported(format!(
        "no capture device offers {:?}",
        format
    )))
}
