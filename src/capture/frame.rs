use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.meta.width, self.meta.height, self.meta.format)
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane
    pub stride: u32,
    pub format: PixelFormat,
    /// Bytes the driver reported as valid in the capture buffer
    pub bytes_used: usize,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// A dequeued capture buffer seen in place, valid for a single capture cycle.
///
/// The slice points into driver-shared memory that is handed back to the device
/// as soon as the sink returns, so anything kept past `deliver` must be copied
/// out with [`FrameView::to_frame`].
pub struct FrameView<'a> {
    pub data: &'a [u8],
    pub meta: FrameMetadata,
    pub timestamp: Instant,
}

impl FrameView<'_> {
    /// Copy the view into an owned frame, dropping any row padding
    pub fn to_frame(&self) -> Frame {
        let mut meta = self.meta.clone();
        let row = self.meta.format.bytes_per_pixel().map(|bpp| self.meta.width as usize * bpp);
        let data = match row {
            Some(row) if (self.meta.stride as usize) > row => {
                let mut packed = BytesMut::with_capacity(row * self.meta.height as usize);
                for line in self
                    .data
                    .chunks(self.meta.stride as usize)
                    .take(self.meta.height as usize)
                {
                    packed.extend_from_slice(&line[..row.min(line.len())]);
                }
                meta.stride = row as u32;
                meta.bytes_used = packed.len();
                packed.freeze()
            }
            _ => Bytes::copy_from_slice(self.data),
        };
        Frame {
            data,
            meta: Arc::new(meta),
            timestamp: self.timestamp,
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.meta.width, self.meta.height, self.meta.format)
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 4:2:2, Y0 U Y1 V
    Yuyv,
    /// Packed 16-bit RGB, little endian
    Rgb565,
    Rgb24,
    Bgr24,
    /// Planar 4:2:0, Y then U then V
    Yuv420p,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `None` for planar ones
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Yuyv | PixelFormat::Rgb565 => Some(2),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Yuv420p => None,
        }
    }

    /// Tightly packed size of one frame
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self.bytes_per_pixel() {
            Some(bpp) => w * h * bpp,
            None => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
        }
    }

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Rgb565 => *b"RGBP",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Yuv420p => *b"YU12",
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"RGBP" => Some(PixelFormat::Rgb565),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"YU12" => Some(PixelFormat::Yuv420p),
            _ => None,
        }
    }
}

/// Width, height and layout of a frame as agreed out-of-band by both peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// Payload size of one frame on the wire
    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        assert_eq!(PixelFormat::Yuyv.frame_size(800, 600), 800 * 600 * 2);
        assert_eq!(PixelFormat::Rgb24.frame_size(640, 480), 640 * 480 * 3);
        assert_eq!(PixelFormat::Yuv420p.frame_size(4, 4), 16 + 4 + 4);
        // odd dimensions round the chroma planes up
        assert_eq!(PixelFormat::Yuv420p.frame_size(3, 3), 9 + 4 + 4);
    }

    #[test]
    fn test_fourcc_roundtrip() {
        for format in [
            PixelFormat::Yuyv,
            PixelFormat::Rgb565,
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Yuv420p,
        ] {
            assert_eq!(PixelFormat::from_fourcc(&format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(b"MJPG"), None);
    }

    #[test]
    fn test_view_copies_out() {
        let raw = vec![7u8; 8];
        let view = FrameView {
            data: &raw,
            meta: FrameMetadata {
                sequence: 3,
                width: 2,
                height: 2,
                stride: 4,
                format: PixelFormat::Yuyv,
                bytes_used: 8,
                device_timestamp: None,
            },
            timestamp: Instant::now(),
        };
        let frame = view.to_frame();
        drop(raw);
        assert_eq!(&frame.data[..], &[7u8; 8]);
        assert_eq!(frame.meta.sequence, 3);
        assert_eq!(frame.geometry().frame_size(), 8);
    }

    #[test]
    fn test_view_drops_row_padding() {
        // 2x2 YUYV with 2 bytes of padding per row
        let raw = [1, 2, 3, 4, 0, 0, 5, 6, 7, 8, 0, 0];
        let view = FrameView {
            data: &raw,
            meta: FrameMetadata {
                sequence: 1,
                width: 2,
                height: 2,
                stride: 6,
                format: PixelFormat::Yuyv,
                bytes_used: 12,
                device_timestamp: None,
            },
            timestamp: Instant::now(),
        };
        let frame = view.to_frame();
        assert_eq!(&frame.data[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frame.meta.stride, 4);
        assert_eq!(frame.meta.bytes_used, 8);
    }
}
