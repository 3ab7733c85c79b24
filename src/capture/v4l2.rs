//! V4L2 memory-mapped streaming capture

use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;
use std::{io, mem};

use memmap2::{Mmap, MmapOptions};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, instrument, warn};
use v4l::capability::Flags as CapFlags;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2_buffer, v4l2_requestbuffers};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::device::{CaptureDevice, Dequeued, DeviceFormat};
use crate::capture::frame::PixelFormat;
use crate::error::{Error, Result};
use crate::CaptureConfig;

/// Capture device backed by a `/dev/videoN` node
pub struct V4l2Device {
    device: Device,
    fd: RawFd,
    path: String,
    format: DeviceFormat,
    requested: bool,
}

impl V4l2Device {
    /// Open the configured device and negotiate geometry, pixel format and rate
    #[instrument(skip(config), fields(path = %config.device))]
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        info!("Opening V4L2 device {}", config.device);
        let device = Device::with_path(&config.device).map_err(|e| Error::device("open", e))?;

        let caps = device
            .query_caps()
            .map_err(|e| Error::device("VIDIOC_QUERYCAP", e))?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::DeviceUnsupported(format!(
                "{} is not a video capture device",
                config.device
            )));
        }
        if !caps.capabilities.contains(CapFlags::STREAMING) {
            return Err(Error::DeviceUnsupported(format!(
                "{} does not support streaming I/O",
                config.device
            )));
        }

        let mut fmt = device
            .format()
            .map_err(|e| Error::device("VIDIOC_G_FMT", e))?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = FourCC::new(&config.format.fourcc());
        let fmt = device
            .set_format(&fmt)
            .map_err(|e| Error::device("VIDIOC_S_FMT", e))?;

        let format = PixelFormat::from_fourcc(&fmt.fourcc.repr).ok_or_else(|| {
            Error::DeviceUnsupported(format!("driver chose unsupported format {}", fmt.fourcc))
        })?;
        if format != config.format {
            return Err(Error::DeviceUnsupported(format!(
                "driver substituted {} for {:?}",
                fmt.fourcc, config.format
            )));
        }
        if fmt.width != config.width || fmt.height != config.height {
            warn!(
                "Driver adjusted geometry to {}x{} (asked for {}x{})",
                fmt.width, fmt.height, config.width, config.height
            );
        }

        if let Some(fps) = config.fps {
            if let Err(e) = device.set_params(&Parameters::with_fps(fps)) {
                warn!("Device rejected {} fps: {}", fps, e);
            }
        }
        let frame_interval = match device.params() {
            Ok(params) => Some((params.interval.numerator, params.interval.denominator)),
            Err(e) => {
                debug!("No frame interval reported: {}", e);
                None
            }
        };

        let format = DeviceFormat {
            width: fmt.width,
            height: fmt.height,
            format,
            bytes_per_line: fmt.stride,
            size_image: fmt.size,
            frame_interval,
        };
        info!("Negotiated {:?}", format);

        let fd = device.handle().fd();
        Ok(Self {
            device,
            fd,
            path: config.device.clone(),
            format,
            requested: false,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn buffer(&self, index: u32) -> v4l2_buffer {
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = Memory::Mmap as u32;
        buf.index = index;
        buf
    }

    fn reqbufs(&mut self, count: u32) -> io::Result<u32> {
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        req.memory = Memory::Mmap as u32;
        req.count = count;
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_REQBUFS,
                &mut req as *mut _ as *mut std::os::raw::c_void,
            )?;
        }
        Ok(req.count)
    }

    fn stream_ioctl(&mut self, request: v4l2::vidioc::_IOC_TYPE) -> io::Result<()> {
        let mut typ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe {
            v4l2::ioctl(
                self.fd,
                request,
                &mut typ as *mut _ as *mut std::os::raw::c_void,
            )
        }
    }
}

impl CaptureDevice for V4l2Device {
    type Memory = Mmap;

    fn format(&self) -> DeviceFormat {
        self.format
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let granted = self.reqbufs(count).map_err(|e| match e.raw_os_error() {
            Some(libc::EINVAL) => {
                Error::DeviceUnsupported(format!("{} does not support mmap streaming", self.path))
            }
            _ => Error::device("VIDIOC_REQBUFS", e),
        })?;
        self.requested = true;
        debug!("Requested {} buffers, granted {}", count, granted);
        Ok(granted)
    }

    fn map(&mut self, index: u32) -> Result<Mmap> {
        let mut buf = self.buffer(index);
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_QUERYBUF,
                &mut buf as *mut _ as *mut std::os::raw::c_void,
            )
            .map_err(|e| Error::device("VIDIOC_QUERYBUF", e))?;
        }

        let offset = unsafe { buf.m.offset } as u64;
        // the driver owns this memory; we only read it while holding a lease
        let memory = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(buf.length as usize)
                .map(self.fd)
        }
        .map_err(|e| Error::device("mmap", e))?;
        debug!(index, len = buf.length, "mapped buffer");
        Ok(memory)
    }

    fn enqueue(&mut self, index: u32) -> Result<()> {
        let mut buf = self.buffer(index);
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_QBUF,
                &mut buf as *mut _ as *mut std::os::raw::c_void,
            )
        }
        .map_err(|e| Error::device("VIDIOC_QBUF", e))
    }

    fn dequeue(&mut self) -> Result<Dequeued> {
        let mut buf = self.buffer(0);
        let result = unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_DQBUF,
                &mut buf as *mut _ as *mut std::os::raw::c_void,
            )
        };
        match result {
            Ok(()) => {}
            Err(e) if matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EINTR)) => {
                return Err(Error::TransientUnavailable)
            }
            Err(e) => return Err(Error::device("VIDIOC_DQBUF", e)),
        }

        let timestamp = (buf.timestamp.tv_sec > 0 || buf.timestamp.tv_usec > 0).then(|| {
            Duration::from_secs(buf.timestamp.tv_sec as u64)
                + Duration::from_micros(buf.timestamp.tv_usec as u64)
        });
        Ok(Dequeued {
            index: buf.index,
            bytes_used: buf.bytesused as usize,
            sequence: buf.sequence,
            timestamp,
        })
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool> {
        // the fd stays open for as long as `self.device` lives
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(Errno::EINTR) => Err(Error::TransientUnavailable),
            Err(errno) => Err(Error::device("poll", io::Error::from(errno))),
        }
    }

    fn stream_on(&mut self) -> Result<()> {
        self.stream_ioctl(v4l2::vidioc::VIDIOC_STREAMON)
            .map_err(|e| Error::device("VIDIOC_STREAMON", e))
    }

    fn stream_off(&mut self) -> Result<()> {
        self.stream_ioctl(v4l2::vidioc::VIDIOC_STREAMOFF)
            .map_err(|e| Error::device("VIDIOC_STREAMOFF", e))
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        if self.requested {
            // free the driver's buffers by requesting zero
            if let Err(e) = self.reqbufs(0) {
                warn!("Failed to release driver buffers: {}", e);
            }
        }
        debug!("Closed {}", self.path);
    }
}
