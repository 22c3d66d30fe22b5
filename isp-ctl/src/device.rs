//! Capture/output V4L2 device I/O (spec §2 component "i", §4.4.5 step 2,
//! §4.5.3 step 2: "opens raw-capture and ISP-input devices, queues initial
//! capture buffers").
//!
//! A real backend wraps `VIDIOC_QBUF`/`VIDIOC_DQBUF` against a DMABUF-backed
//! `v4l2_buffer`; [`FakeVideoDevice`] loops a fixed-size ring in-process so
//! the pre-ISP and HDR engines can be exercised without hardware.

use crate::error::{Error, Result};
use dma_frame::Frame;
use std::collections::VecDeque;
use std::time::Duration;

/// Direction a device node is opened for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceDirection {
    /// Raw sensor / YUV capture (`V4L2_BUF_TYPE_VIDEO_CAPTURE`).
    Capture,
    /// ISP-input injection (`V4L2_BUF_TYPE_VIDEO_OUTPUT`).
    Output,
}

/// One V4L2-style capture or output device.
pub trait VideoDevice: Send {
    fn direction(&self) -> DeviceDirection;

    /// Queue a buffer for capture (empty buffer handed to the driver to
    /// fill) or output (filled buffer handed to the driver to consume).
    fn queue_buffer(&self, frame: Frame) -> Result<()>;

    /// Dequeue one completed buffer, blocking up to `timeout`.
    fn dequeue_buffer(&self, timeout: Duration) -> Result<Frame>;

    /// Start streaming (`VIDIOC_STREAMON`).
    fn stream_on(&self) -> Result<()>;

    /// Stop streaming (`VIDIOC_STREAMOFF`).
    fn stream_off(&self) -> Result<()>;
}

/// In-process reference [`VideoDevice`]: `queue_buffer` immediately becomes
/// available to `dequeue_buffer`, i.e. it models a loopback device rather
/// than a real sensor or ISP pipe.
pub struct FakeVideoDevice {
    direction: DeviceDirection,
    ring: parking_lot::Mutex<VecDeque<Frame>>,
    streaming: std::sync::atomic::AtomicBool,
}

impl FakeVideoDevice {
    pub fn new(direction: DeviceDirection) -> Self {
        FakeVideoDevice {
            direction,
            ring: parking_lot::Mutex::new(VecDeque::new()),
            streaming: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl VideoDevice for FakeVideoDevice {
    fn direction(&self) -> DeviceDirection {
        self.direction
    }

    fn queue_buffer(&self, frame: Frame) -> Result<()> {
        if !self.streaming.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Io("device is not streaming".into()));
        }
        self.ring.lock().push_back(frame);
        Ok(())
    }

    fn dequeue_buffer(&self, timeout: Duration) -> Result<Frame> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.ring.lock().pop_front() {
                return Ok(frame);
            }
            if std::time::Instant::now() >= deadline {
                return Err(Error::Io("dequeue timed out".into()));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn stream_on(&self) -> Result<()> {
        self.streaming.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        self.streaming.store(false, std::sync::atomic::Ordering::SeqCst);
        self.ring.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dma_frame::{BufferPool, HeapDmaAllocator, MemoryKind, PixFmt, Resolution};
    use std::sync::Arc;

    #[test]
    fn queue_then_dequeue_round_trips_a_frame() {
        let pool = BufferPool::new(
            "test",
            Resolution::new(16, 16),
            PixFmt::Gray8,
            2,
            MemoryKind::DmaBuf,
            Arc::new(HeapDmaAllocator::new("/tmp")),
        );
        pool.init().unwrap();
        let frame = pool.acquire().unwrap();

        let device = FakeVideoDevice::new(DeviceDirection::Output);
        device.stream_on().unwrap();
        device.queue_buffer(frame).unwrap();
        let out = device.dequeue_buffer(Duration::from_millis(100)).unwrap();
        assert_eq!(out.width, 16);
    }

    #[test]
    fn queue_before_streaming_fails() {
        let pool = BufferPool::new(
            "test",
            Resolution::new(16, 16),
            PixFmt::Gray8,
            1,
            MemoryKind::DmaBuf,
            Arc::new(HeapDmaAllocator::new("/tmp")),
        );
        pool.init().unwrap();
        let frame = pool.acquire().unwrap();
        let device = FakeVideoDevice::new(DeviceDirection::Capture);
        assert!(device.queue_buffer(frame).is_err());
    }
}
