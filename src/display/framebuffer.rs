//! Linux framebuffer (`/dev/fbN`) output

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::time::Instant;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info, instrument};

use crate::capture::frame::PixelFormat;
use crate::convert::DestinationLayout;
use crate::display::{Display, Image};
use crate::error::{Error, Result};

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FbBitfield {
    pub offset: u32,
    pub length: u32,
    pub msb_right: u32,
}

/// `struct fb_var_screeninfo`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FbVarScreenInfo {
    pub xres: u32,
    pub yres: u32,
    pub xres_virtual: u32,
    pub yres_virtual: u32,
    pub xoffset: u32,
    pub yoffset: u32,
    pub bits_per_pixel: u32,
    pub grayscale: u32,
    pub red: FbBitfield,
    pub green: FbBitfield,
    pub blue: FbBitfield,
    pub transp: FbBitfield,
    pub nonstd: u32,
    pub activate: u32,
    pub height: u32,
    pub width: u32,
    pub accel_flags: u32,
    pub pixclock: u32,
    pub left_margin: u32,
    pub right_margin: u32,
    pub upper_margin: u32,
    pub lower_margin: u32,
    pub hsync_len: u32,
    pub vsync_len: u32,
    pub sync: u32,
    pub vmode: u32,
    pub rotate: u32,
    pub colorspace: u32,
    pub reserved: [u32; 4],
}

/// `struct fb_fix_screeninfo`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FbFixScreenInfo {
    pub id: [u8; 16],
    pub smem_start: libc::c_ulong,
    pub smem_len: u32,
    pub type_: u32,
    pub type_aux: u32,
    pub visual: u32,
    pub xpanstep: u16,
    pub ypanstep: u16,
    pub ywrapstep: u16,
    pub line_length: u32,
    pub mmio_start: libc::c_ulong,
    pub mmio_len: u32,
    pub accel: u32,
    pub capabilities: u16,
    pub reserved: [u16; 2],
}

nix::ioctl_read_bad!(fbioget_vscreeninfo, 0x4600, FbVarScreenInfo);
nix::ioctl_read_bad!(fbioget_fscreeninfo, 0x4602, FbFixScreenInfo);

/// Pixel format of a framebuffer mode
pub fn format_for(var: &FbVarScreenInfo) -> Result<PixelFormat> {
    match var.bits_per_pixel {
        16 => Ok(PixelFormat::Rgb565),
        24 if var.red.offset == 16 => Ok(PixelFormat::Bgr24),
        24 => Ok(PixelFormat::Rgb24),
        bpp => Err(Error::Display(format!("unsupported framebuffer depth {} bpp", bpp))),
    }
}

/// Memory-mapped framebuffer surface
pub struct FramebufferDisplay {
    _file: File,
    memory: MmapMut,
    layout: DestinationLayout,
    path: String,
}

impl FramebufferDisplay {
    #[instrument]
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Display(format!("cannot open {}: {}", path, e)))?;

        let mut var = FbVarScreenInfo::default();
        let mut fix = FbFixScreenInfo::default();
        unsafe {
            fbioget_vscreeninfo(file.as_raw_fd(), &mut var)
                .map_err(|e| Error::Display(format!("FBIOGET_VSCREENINFO: {}", e)))?;
            fbioget_fscreeninfo(file.as_raw_fd(), &mut fix)
                .map_err(|e| Error::Display(format!("FBIOGET_FSCREENINFO: {}", e)))?;
        }

        let format = format_for(&var)?;
        let bpp = var.bits_per_pixel as usize / 8;
        let stride = match fix.line_length as usize {
            0 => var.xres as usize * bpp,
            line => line,
        };
        let len = stride * var.yres as usize;
        let memory = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .map_err(|e| Error::Display(format!("cannot map {}: {}", path, e)))?;

        let layout = DestinationLayout::new(format, var.xres, var.yres).with_stride(stride);
        info!(
            "Framebuffer {}: {}x{} {} bpp, {} bytes per line",
            path, var.xres, var.yres, var.bits_per_pixel, stride
        );
        Ok(Self {
            _file: file,
            memory,
            layout,
            path: path.to_string(),
        })
    }

    /// Paint the whole surface black
    pub fn clear(&mut self) {
        self.memory.fill(0);
    }
}

impl Display for FramebufferDisplay {
    fn layout(&self) -> DestinationLayout {
        self.layout
    }

    fn present(&mut self, image: &Image<'_>) -> Result<()> {
        let started = Instant::now();
        blit(&mut self.memory, &self.layout, image)?;
        metrics::histogram!("render_time_us").record(started.elapsed().as_micros() as f64);
        Ok(())
    }
}

impl Drop for FramebufferDisplay {
    fn drop(&mut self) {
        if let Err(e) = self.memory.flush() {
            debug!("Flushing {} failed: {}", self.path, e);
        }
    }
}

/// Copy `image` row by row into a surface laid out as `layout`
pub(crate) fn blit(surface: &mut [u8], layout: &DestinationLayout, image: &Image<'_>) -> Result<()> {
    if image.format != layout.format {
        return Err(Error::Display(format!(
            "{:?} image on a {:?} surface",
            image.format, layout.format
        )));
    }
    if image.width > layout.width || image.height > layout.height {
        return Err(Error::Display(format!(
            "{}x{} image exceeds the {}x{} surface",
            image.width, image.height, layout.width, layout.height
        )));
    }
    let row = image.width as usize * image.format.bytes_per_pixel().unwrap_or(1);
    let rows = image.height as usize;
    if rows > 0 && image.data.len() < image.stride * (rows - 1) + row {
        return Err(Error::Display(format!(
            "image holds {} bytes, too few for {} rows",
            image.data.len(),
            rows
        )));
    }
    for y in 0..rows {
        let src = &image.data[y * image.stride..][..row];
        surface[y * layout.stride..][..row].copy_from_slice(src);
    }
    Ok(())
}
