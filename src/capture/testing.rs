//! Scripted capture device for unit tests

use std::collections::VecDeque;
use std::time::Duration;

use crate::capture::device::{CaptureDevice, Dequeued, DeviceFormat};
use crate::capture::frame::PixelFormat;
use crate::error::{Error, Result};

/// What the driver does on the next dequeue
#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
    /// Surface the oldest queued buffer
    Frame,
    /// Report "no data yet" once
    Transient,
    /// Report a fatal I/O error
    Fail,
    /// Surface `index` regardless of who owns it
    Rogue(u32),
    /// Never become readable for one wait
    Stall,
}

pub(crate) struct ScriptedDevice {
    pub granted: u32,
    pub mmap_supported: bool,
    pub format: DeviceFormat,
    pub script: VecDeque<Step>,
    pub queued: VecDeque<u32>,
    pub streaming: bool,
    pub stream_on_calls: usize,
    pub stream_off_calls: usize,
    pub unmapped: Vec<u32>,
    sequence: u32,
}

impl ScriptedDevice {
    pub fn new(width: u32, height: u32, granted: u32) -> Self {
        Self {
            granted,
            mmap_supported: true,
            format: DeviceFormat {
                width,
                height,
                format: PixelFormat::Yuyv,
                bytes_per_line: width * 2,
                size_image: width * height * 2,
                frame_interval: None,
            },
            script: VecDeque::new(),
            queued: VecDeque::new(),
            streaming: false,
            stream_on_calls: 0,
            stream_off_calls: 0,
            unmapped: Vec::new(),
            sequence: 0,
        }
    }

    pub fn with_script(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.extend(steps);
        self
    }

    pub fn with_interval(mut self, num: u32, den: u32) -> Self {
        self.format.frame_interval = Some((num, den));
        self
    }
}

impl CaptureDevice for ScriptedDevice {
    type Memory = Vec<u8>;

    fn format(&self) -> DeviceFormat {
        self.format
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        if !self.mmap_supported {
            return Err(Error::DeviceUnsupported("scripted device".into()));
        }
        Ok(count.min(self.granted))
    }

    // every buffer is pre-filled with its own index so tests can tell them apart
    fn map(&mut self, index: u32) -> Result<Vec<u8>> {
        Ok(vec![index as u8; self.format.size_image as usize])
    }

    fn unmap(&mut self, index: u32, _memory: Vec<u8>) -> Result<()> {
        self.unmapped.push(index);
        Ok(())
    }

    fn enqueue(&mut self, index: u32) -> Result<()> {
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Dequeued> {
        match self.script.pop_front() {
            Some(Step::Frame) => {
                let index = self.queued.pop_front().ok_or(Error::TransientUnavailable)?;
                self.sequence += 1;
                Ok(Dequeued {
                    index,
                    bytes_used: self.format.size_image as usize,
                    sequence: self.sequence,
                    timestamp: None,
                })
            }
            Some(Step::Rogue(index)) => {
                self.queued.retain(|&queued| queued != index);
                self.sequence += 1;
                Ok(Dequeued {
                    index,
                    bytes_used: self.format.size_image as usize,
                    sequence: self.sequence,
                    timestamp: None,
                })
            }
            Some(Step::Fail) => Err(Error::device(
                "VIDIOC_DQBUF",
                std::io::Error::from_raw_os_error(libc::EIO),
            )),
            Some(Step::Transient) | Some(Step::Stall) | None => Err(Error::TransientUnavailable),
        }
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool> {
        let ready = match self.script.front() {
            Some(Step::Frame) => !self.queued.is_empty(),
            Some(Step::Stall) => {
                self.script.pop_front();
                false
            }
            Some(_) => true,
            None => false,
        };
        if !ready {
            std::thread::sleep(timeout);
        }
        Ok(ready)
    }

    fn stream_on(&mut self) -> Result<()> {
        self.streaming = true;
        self.stream_on_calls += 1;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.streaming = false;
        self.stream_off_calls += 1;
        // the driver drops every queued buffer on stream-off
        self.queued.clear();
        Ok(())
    }
}
