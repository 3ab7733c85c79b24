//! Ownership-tagged arena of driver-shared capture buffers

use std::time::Duration;

use tracing::{debug, info, instrument, trace, warn};

use crate::capture::device::CaptureDevice;
use crate::error::{Error, Result};

/// Fewest buffers that still allow the driver to fill one while we read another
pub const MIN_BUFFERS: u32 = 2;

/// Which side currently owns a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Driver,
    Process,
}

struct Slot<M> {
    memory: M,
    len: usize,
    state: SlotState,
}

/// Proof of process ownership of one dequeued buffer.
///
/// Not `Clone`: [`BufferPool::requeue`] consumes it, so a buffer cannot be handed
/// back twice. A lease is only meaningful for the pool that issued it.
#[derive(Debug)]
pub struct BufferLease {
    index: u32,
    bytes_used: usize,
    sequence: u32,
    timestamp: Option<Duration>,
}

impl BufferLease {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Driver frame sequence number
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn timestamp(&self) -> Option<Duration> {
        self.timestamp
    }
}

/// Fixed set of mapped capture buffers cycled between driver and process
pub struct BufferPool<D: CaptureDevice> {
    // mappings drop before the device that backs them
    slots: Vec<Slot<D::Memory>>,
    device: D,
    enqueued: bool,
    streaming: bool,
    released: bool,
}

impl<D: CaptureDevice> BufferPool<D> {
    /// Request `count` buffers from the device and map each of them
    #[instrument(skip(device))]
    pub fn initialize(mut device: D, count: u32) -> Result<Self> {
        let granted = device.request_buffers(count)?;
        if granted < MIN_BUFFERS {
            return Err(Error::AllocationFailure {
                granted,
                required: MIN_BUFFERS,
            });
        }
        if granted != count {
            warn!("Driver granted {} buffers instead of {}", granted, count);
        }

        let mut slots = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let memory = device.map(index)?;
            let len = memory.as_ref().len();
            slots.push(Slot {
                memory,
                len,
                state: SlotState::Process,
            });
        }

        info!("Buffer pool ready: {} buffers mapped", granted);
        Ok(Self {
            device,
            slots,
            enqueued: false,
            streaming: false,
            released: false,
        })
    }

    /// Hand every buffer to the driver ahead of stream-on
    pub fn enqueue_all(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.enqueued {
            return Err(Error::InvalidState("buffers are already enqueued"));
        }
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == SlotState::Process {
                self.device.enqueue(index as u32)?;
                slot.state = SlotState::Driver;
            }
        }
        self.enqueued = true;
        debug!("Enqueued {} buffers", self.slots.len());
        Ok(())
    }

    pub fn start_streaming(&mut self) -> Result<()> {
        self.ensure_live()?;
        if !self.enqueued {
            return Err(Error::InvalidState("enqueue_all must precede start_streaming"));
        }
        if self.streaming {
            return Ok(());
        }
        self.device.stream_on()?;
        self.streaming = true;
        info!("Streaming started");
        Ok(())
    }

    /// Issue stream-off; the driver gives up every buffer it held
    pub fn stop_streaming(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;
        self.enqueued = false;
        for slot in &mut self.slots {
            slot.state = SlotState::Process;
        }
        self.device.stream_off()?;
        info!("Streaming stopped");
        Ok(())
    }

    /// Wait up to `timeout` for the driver to surface a filled buffer
    pub fn dequeue_next(&mut self, timeout: Duration) -> Result<BufferLease> {
        self.ensure_live()?;
        if !self.streaming {
            return Err(Error::InvalidState("dequeue on a pool that is not streaming"));
        }
        if !self.device.wait_readable(timeout)? {
            return Err(Error::Timeout(timeout));
        }

        let dequeued = self.device.dequeue()?;
        let slot = self
            .slots
            .get_mut(dequeued.index as usize)
            .ok_or(Error::BufferOwnership {
                index: dequeued.index,
                reason: "driver returned an index outside the pool",
            })?;
        if slot.state != SlotState::Driver {
            return Err(Error::BufferOwnership {
                index: dequeued.index,
                reason: "driver surfaced a buffer the process already owns",
            });
        }
        slot.state = SlotState::Process;
        trace!(index = dequeued.index, bytes = dequeued.bytes_used, "dequeued");

        Ok(BufferLease {
            index: dequeued.index,
            bytes_used: dequeued.bytes_used.min(slot.len),
            sequence: dequeued.sequence,
            timestamp: dequeued.timestamp,
        })
    }

    /// Valid bytes of a leased buffer
    pub fn bytes(&self, lease: &BufferLease) -> &[u8] {
        self.slots
            .get(lease.index as usize)
            .map(|slot| &slot.memory.as_ref()[..lease.bytes_used])
            .unwrap_or(&[])
    }

    /// Give a leased buffer back to the driver.
    ///
    /// Once streaming has stopped the buffer is simply released to the process.
    pub fn requeue(&mut self, lease: BufferLease) -> Result<()> {
        self.ensure_live()?;
        let slot = self
            .slots
            .get_mut(lease.index as usize)
            .ok_or(Error::BufferOwnership {
                index: lease.index,
                reason: "lease does not belong to this pool",
            })?;
        if slot.state != SlotState::Process {
            return Err(Error::BufferOwnership {
                index: lease.index,
                reason: "requeue of a buffer the driver already owns",
            });
        }
        if !self.streaming {
            debug!(index = lease.index, "released after stream-off");
            return Ok(());
        }
        self.device.enqueue(lease.index)?;
        slot.state = SlotState::Driver;
        Ok(())
    }

    /// Stop streaming if needed and unmap every buffer
    #[instrument(skip(self))]
    pub fn teardown(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        let mut first_error = self.stop_streaming().err();
        for (index, slot) in self.slots.drain(..).enumerate() {
            if let Err(e) = self.device.unmap(index as u32, slot.memory) {
                warn!("Failed to unmap buffer {}: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        self.released = true;
        info!("Buffer pool released");
        first_error.map_or(Ok(()), Err)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, index: u32) -> Option<SlotState> {
        self.slots.get(index as usize).map(|slot| slot.state)
    }

    pub fn process_owned(&self) -> usize {
        self.count(SlotState::Process)
    }

    pub fn driver_owned(&self) -> usize {
        self.count(SlotState::Driver)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released {
            Err(Error::InvalidState("buffer pool has been torn down"))
        } else {
            Ok(())
        }
    }
}

impl<D: CaptureDevice> Drop for BufferPool<D> {
    fn drop(&mut self) {
        if self.streaming {
            if let Err(e) = self.device.stream_off() {
                warn!("Stream-off during drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::capture::testing::{ScriptedDevice, Step};

    fn streaming_pool(device: ScriptedDevice, count: u32) -> BufferPool<ScriptedDevice> {
        let mut pool = BufferPool::initialize(device, count).unwrap();
        pool.enqueue_all().unwrap();
        pool.start_streaming().unwrap();
        pool
    }

    #[test]
    fn test_enqueue_all_leaves_nothing_process_owned() {
        for n in MIN_BUFFERS..=8 {
            let mut pool = BufferPool::initialize(ScriptedDevice::new(4, 2, 8), n).unwrap();
            assert_eq!(pool.len(), n as usize);
            assert_eq!(pool.process_owned(), n as usize);

            pool.enqueue_all().unwrap();
            assert_eq!(pool.process_owned(), 0);
            assert_eq!(pool.driver_owned(), n as usize);
        }
    }

    #[test]
    fn test_too_few_buffers_is_allocation_failure() {
        let err = BufferPool::initialize(ScriptedDevice::new(4, 2, 1), 4).err().unwrap();
        assert!(matches!(
            err,
            Error::AllocationFailure {
                granted: 1,
                required: 2
            }
        ));
    }

    #[test]
    fn test_unsupported_device() {
        let mut device = ScriptedDevice::new(4, 2, 4);
        device.mmap_supported = false;
        let err = BufferPool::initialize(device, 4).err().unwrap();
        assert!(matches!(err, Error::DeviceUnsupported(_)));
    }

    #[test]
    fn test_enqueue_all_exactly_once_before_streaming() {
        let mut pool = BufferPool::initialize(ScriptedDevice::new(4, 2, 4), 4).unwrap();
        assert!(matches!(pool.start_streaming(), Err(Error::InvalidState(_))));
        pool.enqueue_all().unwrap();
        assert!(matches!(pool.enqueue_all(), Err(Error::InvalidState(_))));
        pool.start_streaming().unwrap();
        assert_eq!(pool.device().stream_on_calls, 1);
    }

    #[test]
    fn test_no_double_dequeue_without_requeue() {
        let device = ScriptedDevice::new(4, 2, 4).with_script([Step::Frame; 12]);
        let mut pool = streaming_pool(device, 4);
        let timeout = Duration::from_millis(5);

        let mut held = Vec::new();
        for _ in 0..4 {
            let lease = pool.dequeue_next(timeout).unwrap();
            assert!(held.iter().all(|l: &BufferLease| l.index() != lease.index()));
            assert_eq!(pool.state(lease.index()), Some(SlotState::Process));
            held.push(lease);
        }
        assert_eq!(pool.process_owned(), 4);

        // every buffer is ours, the driver has nothing to fill
        assert!(matches!(pool.dequeue_next(timeout), Err(Error::Timeout(_))));

        let first = held.remove(0);
        let index = first.index();
        pool.requeue(first).unwrap();
        assert_eq!(pool.state(index), Some(SlotState::Driver));

        let again = pool.dequeue_next(timeout).unwrap();
        assert_eq!(again.index(), index);
    }

    #[test]
    fn test_driver_surfacing_owned_buffer_is_rejected() {
        let device = ScriptedDevice::new(4, 2, 4).with_script([Step::Frame, Step::Rogue(0)]);
        let mut pool = streaming_pool(device, 4);
        let lease = pool.dequeue_next(Duration::from_millis(5)).unwrap();
        assert_eq!(lease.index(), 0);

        let err = pool.dequeue_next(Duration::from_millis(5)).err().unwrap();
        assert!(matches!(err, Error::BufferOwnership { index: 0, .. }));
        assert_eq!(pool.process_owned(), 1);
    }

    #[test]
    fn test_lease_exposes_buffer_bytes() {
        let device = ScriptedDevice::new(4, 2, 3).with_script([Step::Frame, Step::Frame]);
        let mut pool = streaming_pool(device, 3);
        let _first = pool.dequeue_next(Duration::from_millis(5)).unwrap();
        let second = pool.dequeue_next(Duration::from_millis(5)).unwrap();
        assert_eq!(second.index(), 1);
        assert_eq!(pool.bytes(&second), &[1u8; 16][..]);
    }

    #[test]
    fn test_transient_and_fatal_dequeue_errors() {
        let device = ScriptedDevice::new(4, 2, 4).with_script([Step::Transient, Step::Fail]);
        let mut pool = streaming_pool(device, 4);
        let timeout = Duration::from_millis(5);
        assert!(matches!(pool.dequeue_next(timeout), Err(Error::TransientUnavailable)));
        assert!(matches!(pool.dequeue_next(timeout), Err(Error::DeviceError { .. })));
        assert_eq!(pool.process_owned(), 0);
    }

    #[test]
    fn test_dequeue_timeout_is_bounded() {
        let mut pool = streaming_pool(ScriptedDevice::new(4, 2, 4), 4);
        let start = Instant::now();
        let err = pool.dequeue_next(Duration::from_secs(2)).err().unwrap();
        let elapsed = start.elapsed();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(elapsed >= Duration::from_secs(2), "returned early: {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(2500), "returned late: {:?}", elapsed);
    }

    #[test]
    fn test_teardown_stops_once_and_unmaps_everything() {
        let device = ScriptedDevice::new(4, 2, 4).with_script([Step::Frame]);
        let mut pool = streaming_pool(device, 4);
        let held = pool.dequeue_next(Duration::from_millis(5)).unwrap();

        pool.stop_streaming().unwrap();
        assert_eq!(pool.process_owned(), 4);
        // a lease returned after stream-off is released, not queued
        pool.requeue(held).unwrap();
        assert!(pool.device().queued.is_empty());

        pool.teardown().unwrap();
        assert_eq!(pool.device().stream_off_calls, 1);
        assert_eq!(pool.device().unmapped, vec![0, 1, 2, 3]);
        assert!(pool.is_empty());
        assert!(matches!(pool.enqueue_all(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_teardown_while_streaming_issues_stream_off() {
        let mut pool = streaming_pool(ScriptedDevice::new(4, 2, 2), 2);
        pool.teardown().unwrap();
        assert_eq!(pool.device().stream_off_calls, 1);
        assert!(!pool.device().streaming);
    }
}
