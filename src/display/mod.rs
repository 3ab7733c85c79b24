//! Presentation surfaces and the converting display sink

pub mod framebuffer;

use bytes::Bytes;
use tracing::{debug, info, instrument};

use crate::capture::capture_loop::FrameSink;
use crate::capture::frame::{FrameGeometry, FrameView, PixelFormat};
use crate::convert::{ConvertOptions, ConverterCache, DestinationLayout, ExcessColumns, SourceLayout};
use crate::error::Result;
use crate::DisplayConfig;

pub use framebuffer::FramebufferDisplay;

/// A decoded image ready for a surface
#[derive(Debug, Clone, Copy)]
pub struct Image<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub format: PixelFormat,
}

/// Something that shows images
pub trait Display {
    /// Format and geometry of the surface
    fn layout(&self) -> DestinationLayout;

    fn present(&mut self, image: &Image<'_>) -> Result<()>;
}

/// Converts captured or received frames to the surface format and presents them
pub struct DisplaySink<D> {
    display: D,
    layout: DestinationLayout,
    options: ConvertOptions,
    cache: ConverterCache,
    scratch: Vec<u8>,
    presented: u64,
}

impl<D: Display> DisplaySink<D> {
    pub fn new(display: D, config: &DisplayConfig) -> Self {
        let layout = display
            .layout()
            .with_excess(config.excess_columns)
            .with_row_order(config.row_order);
        Self {
            display,
            layout,
            options: config.convert,
            cache: ConverterCache::new(),
            scratch: Vec::new(),
            presented: 0,
        }
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    /// Convert one frame and put it on the surface
    pub fn show(&mut self, data: &[u8], source: SourceLayout) -> Result<()> {
        let ctx = self.cache.get(source, self.layout, self.options)?;
        if self.scratch.len() < ctx.output_len() {
            self.scratch.resize(ctx.output_len(), 0);
        }
        ctx.convert(data, &mut self.scratch)?;

        // only the covered region goes out unless uncovered pixels are cleared
        let (width, height) = match self.layout.excess {
            ExcessColumns::Clear => (self.layout.width, self.layout.height),
            ExcessColumns::Skip => (source.width, source.height),
        };
        self.display.present(&Image {
            data: &self.scratch,
            width,
            height,
            stride: self.layout.stride,
            format: self.layout.format,
        })?;
        self.presented += 1;
        Ok(())
    }

    /// Show every frame from `frames` until the channel closes
    #[instrument(skip(self, frames))]
    pub fn run(&mut self, frames: flume::Receiver<Bytes>, geometry: FrameGeometry) -> Result<u64> {
        let source = SourceLayout::packed(geometry.width, geometry.height, geometry.format);
        info!("Displaying {}x{} {:?} frames", geometry.width, geometry.height, geometry.format);
        for frame in frames.iter() {
            self.show(&frame, source)?;
        }
        debug!("Frame channel closed after {} frames", self.presented);
        Ok(self.presented)
    }
}

impl<D: Display> FrameSink for DisplaySink<D> {
    fn deliver(&mut self, frame: &FrameView<'_>) -> Result<()> {
        self.show(frame.data, SourceLayout::from(&frame.meta))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::display::framebuffer::blit;

    /// In-memory surface
    pub(crate) struct MemoryDisplay {
        pub layout: DestinationLayout,
        pub surface: Vec<u8>,
        pub presents: usize,
    }

    impl MemoryDisplay {
        pub fn new(format: PixelFormat, width: u32, height: u32, fill: u8) -> Self {
            let layout = DestinationLayout::new(format, width, height);
            Self {
                surface: vec![fill; layout.required_len()],
                layout,
                presents: 0,
            }
        }
    }

    impl Display for MemoryDisplay {
        fn layout(&self) -> DestinationLayout {
            self.layout
        }

        fn present(&mut self, image: &Image<'_>) -> Result<()> {
            self.presents += 1;
            blit(&mut self.surface, &self.layout, image)
        }
    }
}
