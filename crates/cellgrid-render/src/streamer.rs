//! Per-frame upload of instance records.
//!
//! The GPU may still be reading last frame's instances while this frame's are
//! written. Each [`StreamStrategy`] avoids overwriting in-flight data its own
//! way; the choice is made once from the device's
//! [`FeatureSet`](cellgrid_gpu::FeatureSet) and never changes for the lifetime
//! of a backend.

use std::time::Duration;

use cellgrid_gpu::{BufferDesc, BufferId, BufferUsage, FenceId, FenceStatus, GraphicsDevice};

use crate::capability::StreamStrategyKind;
use crate::error::{RenderError, RenderResult};
use crate::instance::InstanceRecord;

/// Where an upload landed; valid for the next draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSlice {
    pub buffer: BufferId,
    pub offset: u64,
    pub len: u64,
}

/// One way of getting instance bytes to the GPU without racing in-flight draws.
pub trait StreamStrategy: Send {
    fn kind(&self) -> StreamStrategyKind;

    /// Copy `bytes` (at most one batch) somewhere the next draw can read.
    fn upload(&mut self, device: &mut dyn GraphicsDevice, bytes: &[u8])
    -> RenderResult<StreamSlice>;

    /// The draw consuming the last upload has been issued.
    fn submitted(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()>;

    /// The frame has been presented.
    fn end_frame(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()>;

    /// The frame failed before `end_frame`. Draws already issued from it may
    /// still be in flight.
    fn abandon_frame(&mut self) {}

    /// Destroy every buffer. Safe to call more than once.
    fn release(&mut self, device: &mut dyn GraphicsDevice);
}

/// N per-frame slots, cycled at frame end. A slot holds as many batch-sized
/// buffers as its busiest frame needed.
struct RotatingStrategy {
    batch_bytes: u64,
    slots: Vec<RotatingSlot>,
    current: usize,
}

#[derive(Default)]
struct RotatingSlot {
    buffers: Vec<BufferId>,
    used: usize,
}

impl RotatingStrategy {
    fn new(batch_bytes: u64, frames: usize) -> Self {
        Self {
            batch_bytes,
            slots: (0..frames.max(2)).map(|_| RotatingSlot::default()).collect(),
            current: 0,
        }
    }

    fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
        self.slots[self.current].used = 0;
    }
}

impl StreamStrategy for RotatingStrategy {
    fn kind(&self) -> StreamStrategyKind {
        StreamStrategyKind::Rotating
    }

    fn upload(
        &mut self,
        device: &mut dyn GraphicsDevice,
        bytes: &[u8],
    ) -> RenderResult<StreamSlice> {
        let slot = &mut self.slots[self.current];
        if slot.used == slot.buffers.len() {
            let buffer = device.create_buffer(&BufferDesc::new(
                "Instance Buffer (rotating)",
                self.batch_bytes,
                BufferUsage::INSTANCE | BufferUsage::COPY_DST,
            ))?;
            tracing::trace!(
                "Rotating slot {} grew to {} buffers",
                self.current,
                slot.buffers.len() + 1
            );
            slot.buffers.push(buffer);
        }
        let buffer = slot.buffers[slot.used];
        device.write_buffer(buffer, 0, bytes)?;
        slot.used += 1;
        Ok(StreamSlice {
            buffer,
            offset: 0,
            len: bytes.len() as u64,
        })
    }

    fn submitted(&mut self, _device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        Ok(())
    }

    fn end_frame(&mut self, _device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        self.advance();
        Ok(())
    }

    fn abandon_frame(&mut self) {
        // A partly used slot retires like a finished frame; its draws may
        // still be in flight.
        if self.slots[self.current].used > 0 {
            self.advance();
        }
    }

    fn release(&mut self, device: &mut dyn GraphicsDevice) {
        for slot in &mut self.slots {
            for buffer in slot.buffers.drain(..) {
                device.destroy_buffer(buffer);
            }
            slot.used = 0;
        }
        self.current = 0;
    }
}

/// One buffer whose storage is replaced before every write.
struct OrphanStrategy {
    batch_bytes: u64,
    buffer: Option<BufferId>,
}

impl StreamStrategy for OrphanStrategy {
    fn kind(&self) -> StreamStrategyKind {
        StreamStrategyKind::Orphan
    }

    fn upload(
        &mut self,
        device: &mut dyn GraphicsDevice,
        bytes: &[u8],
    ) -> RenderResult<StreamSlice> {
        let buffer = match self.buffer {
            Some(buffer) => {
                device.orphan_buffer(buffer)?;
                buffer
            }
            None => {
                let buffer = device.create_buffer(&BufferDesc::new(
                    "Instance Buffer (orphan)",
                    self.batch_bytes,
                    BufferUsage::INSTANCE | BufferUsage::COPY_DST,
                ))?;
                self.buffer = Some(buffer);
                buffer
            }
        };
        device.write_buffer(buffer, 0, bytes)?;
        Ok(StreamSlice {
            buffer,
            offset: 0,
            len: bytes.len() as u64,
        })
    }

    fn submitted(&mut self, _device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        Ok(())
    }

    fn end_frame(&mut self, _device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        Ok(())
    }

    fn release(&mut self, device: &mut dyn GraphicsDevice) {
        if let Some(buffer) = self.buffer.take() {
            device.destroy_buffer(buffer);
        }
    }
}

/// One allocation mapped for the backend lifetime, split into fenced regions.
struct PersistentStrategy {
    batch_bytes: u64,
    regions: usize,
    fence_timeout: Duration,
    buffer: Option<BufferId>,
    fences: Vec<Option<FenceId>>,
    next_region: usize,
    pending: Option<usize>,
}

impl PersistentStrategy {
    fn new(batch_bytes: u64, regions: usize, fence_timeout: Duration) -> Self {
        let regions = regions.max(1);
        Self {
            batch_bytes,
            regions,
            fence_timeout,
            buffer: None,
            fences: vec![None; regions],
            next_region: 0,
            pending: None,
        }
    }

    fn mapped_buffer(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<BufferId> {
        if let Some(buffer) = self.buffer {
            return Ok(buffer);
        }
        let buffer = device.create_buffer(&BufferDesc::new(
            "Instance Buffer (persistent)",
            self.batch_bytes * self.regions as u64,
            BufferUsage::INSTANCE | BufferUsage::PERSISTENT,
        ))?;
        if let Err(err) = device.map_persistent(buffer) {
            device.destroy_buffer(buffer);
            return Err(err.into());
        }
        self.buffer = Some(buffer);
        Ok(buffer)
    }
}

impl StreamStrategy for PersistentStrategy {
    fn kind(&self) -> StreamStrategyKind {
        StreamStrategyKind::Persistent
    }

    fn upload(
        &mut self,
        device: &mut dyn GraphicsDevice,
        bytes: &[u8],
    ) -> RenderResult<StreamSlice> {
        let buffer = self.mapped_buffer(device)?;
        let region = self.next_region;

        if let Some(fence) = self.fences[region].take() {
            match device.wait_fence(fence, self.fence_timeout)? {
                FenceStatus::Signaled => {}
                FenceStatus::TimedOut => {
                    tracing::error!(
                        "Instance region {} still in use after {:?}",
                        region,
                        self.fence_timeout
                    );
                    return Err(RenderError::ResourceTimeout {
                        waited: self.fence_timeout,
                    });
                }
            }
        }

        let offset = region as u64 * self.batch_bytes;
        device.write_mapped(buffer, offset, bytes)?;
        self.pending = Some(region);
        self.next_region = (region + 1) % self.regions;
        Ok(StreamSlice {
            buffer,
            offset,
            len: bytes.len() as u64,
        })
    }

    fn submitted(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        if let Some(region) = self.pending.take() {
            self.fences[region] = Some(device.insert_fence()?);
        }
        Ok(())
    }

    fn end_frame(&mut self, _device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        Ok(())
    }

    fn abandon_frame(&mut self) {
        // No draw reads the pending region; it needs no fence.
        self.pending = None;
    }

    fn release(&mut self, device: &mut dyn GraphicsDevice) {
        if let Some(buffer) = self.buffer.take() {
            device.destroy_buffer(buffer);
        }
        self.fences.iter_mut().for_each(|f| *f = None);
        self.next_region = 0;
        self.pending = None;
    }
}

/// Instance upload front-end over the selected [`StreamStrategy`].
pub struct BufferStreamer {
    strategy: Box<dyn StreamStrategy>,
    batch_bytes: u64,
    uploads: u32,
}

impl BufferStreamer {
    /// Buffers are created lazily on first upload.
    pub fn new(
        kind: StreamStrategyKind,
        batch_capacity: usize,
        frames_in_flight: usize,
        fence_timeout: Duration,
    ) -> Self {
        let batch_bytes = (batch_capacity.max(1) * InstanceRecord::SIZE) as u64;
        let strategy: Box<dyn StreamStrategy> = match kind {
            StreamStrategyKind::Rotating => {
                Box::new(RotatingStrategy::new(batch_bytes, frames_in_flight))
            }
            StreamStrategyKind::Orphan => Box::new(OrphanStrategy {
                batch_bytes,
                buffer: None,
            }),
            StreamStrategyKind::Persistent => Box::new(PersistentStrategy::new(
                batch_bytes,
                frames_in_flight,
                fence_timeout,
            )),
        };
        Self {
            strategy,
            batch_bytes,
            uploads: 0,
        }
    }

    pub fn kind(&self) -> StreamStrategyKind {
        self.strategy.kind()
    }

    pub fn upload(
        &mut self,
        device: &mut dyn GraphicsDevice,
        bytes: &[u8],
    ) -> RenderResult<StreamSlice> {
        if bytes.len() as u64 > self.batch_bytes {
            return Err(RenderError::ResourceExhausted(format!(
                "upload of {} bytes exceeds the {} byte batch buffer",
                bytes.len(),
                self.batch_bytes
            )));
        }
        self.uploads += 1;
        self.strategy.upload(device, bytes)
    }

    pub fn submitted(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        self.strategy.submitted(device)
    }

    pub fn end_frame(&mut self, device: &mut dyn GraphicsDevice) -> RenderResult<()> {
        self.uploads = 0;
        self.strategy.end_frame(device)
    }

    /// Forget a frame that will not reach `end_frame`.
    pub fn abandon_frame(&mut self) {
        self.uploads = 0;
        self.strategy.abandon_frame();
    }

    pub fn release(&mut self, device: &mut dyn GraphicsDevice) {
        self.strategy.release(device);
    }

    /// Uploads since the last `end_frame`.
    pub fn uploads(&self) -> u32 {
        self.uploads
    }
}
