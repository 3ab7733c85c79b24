//! Pixel format conversion
//!
//! A [`ConverterContext`] is built once per (source, destination, geometry)
//! and reused for every frame of that geometry. It holds the lookup tables
//! for the chosen coefficient set and the destination layout; conversion
//! itself allocates nothing.

pub mod planar;
pub mod yuv;

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::device::DeviceFormat;
use crate::capture::frame::{FrameMetadata, PixelFormat};
use crate::error::{Error, Result};

pub use planar::{ChromaSampling, PlaneLayout, Planes};
pub use yuv::{pack_rgb565, rgb_to_luma, unpack_rgb565, yuv_to_rgb, Coefficients, YuvTables};

/// Vertical placement of source rows in the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RowOrder {
    #[default]
    TopDown,
    /// Source row `y` lands on destination row `height - 1 - y`
    BottomUp,
}

impl RowOrder {
    #[inline]
    pub fn target(self, row: usize, height: usize) -> usize {
        match self {
            RowOrder::TopDown => row,
            RowOrder::BottomUp => height - 1 - row,
        }
    }
}

/// What happens to destination pixels the source does not cover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExcessColumns {
    /// Leave whatever the surface already shows
    #[default]
    Skip,
    /// Paint black
    Clear,
}

/// Geometry of the raw samples handed to the converter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceLayout {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Bytes from one row to the next
    pub stride: usize,
}

impl SourceLayout {
    pub fn packed(width: u32, height: u32, format: PixelFormat) -> Self {
        let bpp = format.bytes_per_pixel().unwrap_or(1);
        Self {
            width,
            height,
            format,
            stride: width as usize * bpp,
        }
    }

    fn min_len(&self) -> usize {
        let row = self.width as usize * self.format.bytes_per_pixel().unwrap_or(1);
        match self.height {
            0 => 0,
            h => self.stride * (h as usize - 1) + row,
        }
    }
}

impl From<&DeviceFormat> for SourceLayout {
    fn from(format: &DeviceFormat) -> Self {
        let tight = Self::packed(format.width, format.height, format.format);
        Self {
            stride: (format.bytes_per_line as usize).max(tight.stride),
            ..tight
        }
    }
}

impl From<&FrameMetadata> for SourceLayout {
    fn from(meta: &FrameMetadata) -> Self {
        Self {
            width: meta.width,
            height: meta.height,
            format: meta.format,
            stride: meta.stride as usize,
        }
    }
}

/// Shape of the surface conversion writes into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestinationLayout {
    pub format: PixelFormat,
    /// Surface size in pixels; may exceed the source
    pub width: u32,
    pub height: u32,
    /// Bytes per row, or per luma row for planar formats
    pub stride: usize,
    /// Bytes per chroma row, planar formats only
    pub chroma_stride: usize,
    pub row_order: RowOrder,
    pub excess: ExcessColumns,
}

impl DestinationLayout {
    /// Tightly packed surface of `width`×`height`
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        let (stride, chroma_stride) = match format.bytes_per_pixel() {
            Some(bpp) => (width as usize * bpp, 0),
            None => (width as usize, (width as usize).div_ceil(2)),
        };
        Self {
            format,
            width,
            height,
            stride,
            chroma_stride,
            row_order: RowOrder::TopDown,
            excess: ExcessColumns::Skip,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_chroma_stride(mut self, chroma_stride: usize) -> Self {
        self.chroma_stride = chroma_stride;
        self
    }

    pub fn with_row_order(mut self, row_order: RowOrder) -> Self {
        self.row_order = row_order;
        self
    }

    pub fn with_excess(mut self, excess: ExcessColumns) -> Self {
        self.excess = excess;
        self
    }

    pub fn planes(&self) -> PlaneLayout {
        PlaneLayout::new(self.stride, self.chroma_stride, self.height as usize)
    }

    /// Bytes the destination buffer must hold
    pub fn required_len(&self) -> usize {
        match self.format {
            PixelFormat::Yuv420p => self.planes().len,
            _ => self.stride * self.height as usize,
        }
    }
}

/// Numeric options of a conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertOptions {
    pub coefficients: Coefficients,
    pub chroma: ChromaSampling,
}

/// Identity of a converter context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConverterKey {
    pub source: PixelFormat,
    pub destination: PixelFormat,
    pub width: u32,
    pub height: u32,
}

/// Reusable scratch state for one conversion
pub struct ConverterContext {
    source: SourceLayout,
    layout: DestinationLayout,
    options: ConvertOptions,
    tables: YuvTables,
}

impl ConverterContext {
    pub fn new(source: SourceLayout, layout: DestinationLayout, options: ConvertOptions) -> Result<Self> {
        if source.format != PixelFormat::Yuyv {
            return Err(Error::InvalidConfig(format!(
                "no conversion from {:?} to {:?}",
                source.format, layout.format
            )));
        }
        if source.width == 0 || source.height == 0 || source.width % 2 != 0 {
            return Err(Error::ConversionGeometryMismatch(format!(
                "packed 4:2:2 source must have an even, non-zero width (got {}x{})",
                source.width, source.height
            )));
        }
        if source.stride < source.width as usize * 2 {
            return Err(Error::ConversionGeometryMismatch(format!(
                "source stride {} is shorter than a {} pixel row",
                source.stride, source.width
            )));
        }
        if layout.width < source.width || layout.height < source.height {
            return Err(Error::ConversionGeometryMismatch(format!(
                "{}x{} destination cannot hold a {}x{} source",
                layout.width, layout.height, source.width, source.height
            )));
        }
        match layout.format {
            PixelFormat::Rgb565 | PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
                let bpp = layout.format.bytes_per_pixel().unwrap_or(0);
                if layout.stride < layout.width as usize * bpp {
                    return Err(Error::ConversionGeometryMismatch(format!(
                        "destination stride {} is shorter than a {} pixel row",
                        layout.stride, layout.width
                    )));
                }
            }
            PixelFormat::Yuv420p => {
                if layout.stride < layout.width as usize
                    || layout.chroma_stride < (layout.width as usize).div_ceil(2)
                {
                    return Err(Error::ConversionGeometryMismatch(format!(
                        "plane strides {}/{} are too short for width {}",
                        layout.stride, layout.chroma_stride, layout.width
                    )));
                }
            }
            PixelFormat::Yuyv => {
                return Err(Error::InvalidConfig(
                    "packed 4:2:2 is not a conversion target".into(),
                ))
            }
        }

        debug!(
            "Converter {:?} -> {:?} {}x{} ({:?})",
            source.format, layout.format, source.width, source.height, options.coefficients
        );
        Ok(Self {
            source,
            layout,
            options,
            tables: YuvTables::new(options.coefficients),
        })
    }

    pub fn key(&self) -> ConverterKey {
        ConverterKey {
            source: self.source.format,
            destination: self.layout.format,
            width: self.source.width,
            height: self.source.height,
        }
    }

    pub fn source(&self) -> &SourceLayout {
        &self.source
    }

    pub fn layout(&self) -> &DestinationLayout {
        &self.layout
    }

    pub fn options(&self) -> ConvertOptions {
        self.options
    }

    /// Bytes `convert` writes into
    pub fn output_len(&self) -> usize {
        self.layout.required_len()
    }

    /// Convert one frame into `dst`
    pub fn convert(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        if src.len() < self.source.min_len() {
            return Err(Error::ConversionGeometryMismatch(format!(
                "source holds {} bytes, {} needed",
                src.len(),
                self.source.min_len()
            )));
        }
        if dst.len() < self.output_len() {
            return Err(Error::ConversionGeometryMismatch(format!(
                "destination holds {} bytes, {} needed",
                dst.len(),
                self.output_len()
            )));
        }

        let started = Instant::now();
        match self.layout.format {
            PixelFormat::Yuv420p => {
                let planes = self.layout.planes();
                planar::PlanarJob {
                    src,
                    src_stride: self.source.stride,
                    width: self.source.width as usize,
                    height: self.source.height as usize,
                    surface_width: self.layout.width as usize,
                    row_order: self.layout.row_order,
                    excess: self.layout.excess,
                    chroma: self.options.chroma,
                }
                .run(Planes::split(dst, &planes), &planes);
            }
            _ => self.packed(src, dst),
        }
        metrics::histogram!("convert_time_us").record(started.elapsed().as_micros() as f64);
        Ok(())
    }

    fn packed(&self, src: &[u8], dst: &mut [u8]) {
        let width = self.source.width as usize;
        let height = self.source.height as usize;
        let bpp = self.layout.format.bytes_per_pixel().unwrap_or(0);
        let stride = self.layout.stride;

        for row in 0..height {
            let line = &src[row * self.source.stride..][..width * 2];
            let out = self.layout.row_order.target(row, height) * stride;
            let out = &mut dst[out..out + stride];
            for (pair, yuyv) in line.chunks_exact(4).enumerate() {
                let (y0, u, y1, v) = (yuyv[0], yuyv[1], yuyv[2], yuyv[3]);
                let at = pair * 2 * bpp;
                self.put(&mut out[at..at + bpp], self.tables.rgb(y0, u, v));
                self.put(&mut out[at + bpp..at + 2 * bpp], self.tables.rgb(y1, u, v));
            }
            if self.layout.excess == ExcessColumns::Clear {
                out[width * bpp..self.layout.width as usize * bpp].fill(0);
            }
        }

        if self.layout.excess == ExcessColumns::Clear {
            dst[height * stride..self.output_len()].fill(0);
        }
    }

    #[inline]
    fn put(&self, out: &mut [u8], [r, g, b]: [u8; 3]) {
        match self.layout.format {
            PixelFormat::Rgb565 => out.copy_from_slice(&pack_rgb565(r, g, b).to_le_bytes()),
            PixelFormat::Rgb24 => out.copy_from_slice(&[r, g, b]),
            PixelFormat::Bgr24 => out.copy_from_slice(&[b, g, r]),
            _ => {}
        }
    }
}

/// Keeps the context for the most recent geometry, rebuilding on change
#[derive(Default)]
pub struct ConverterCache {
    context: Option<ConverterContext>,
    builds: u64,
}

impl ConverterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for this conversion, reusing the cached one when nothing changed
    pub fn get(
        &mut self,
        source: SourceLayout,
        layout: DestinationLayout,
        options: ConvertOptions,
    ) -> Result<&ConverterContext> {
        let reusable = self
            .context
            .as_ref()
            .is_some_and(|ctx| ctx.source == source && ctx.layout == layout && ctx.options == options);
        if !reusable {
            if self.context.is_some() {
                debug!("Rebuilding converter for {}x{}", source.width, source.height);
            }
            self.context = Some(ConverterContext::new(source, layout, options)?);
            self.builds += 1;
        }
        self.context
            .as_ref()
            .ok_or(Error::InvalidState("converter cache is empty"))
    }

    /// Contexts built so far
    pub fn builds(&self) -> u64 {
        self.builds
    }
}
